//! SDP dissector
//!
//! Walks the session description line by line keyed on the leading
//! character: `c=` sets the session or per-media connection address, `m=`
//! opens a new media descriptor and `a=` fills rtpmap names, the RTCP port
//! and MRCP channel tags. Unknown payload-type codes get an id-only format
//! so later RTP frames still match.

use std::fmt;

use crate::core::address::Address;
use crate::core::packet::{Packet, ProtoData, ProtoId};
use super::{DissectOutput, Dissector};

/// Well-known static RTP payload types (RFC 3551)
const STANDARD_FORMATS: [(u32, &str, &str); 24] = [
    (0, "PCMU/8000", "g711u"),
    (3, "GSM/8000", "gsm"),
    (4, "G723/8000", "g723"),
    (5, "DVI4/8000", "dvi"),
    (6, "DVI4/16000", "dvi"),
    (7, "LPC/8000", "lpc"),
    (8, "PCMA/8000", "g711a"),
    (9, "G722/8000", "g722"),
    (10, "L16/44100", "l16"),
    (11, "L16/44100", "l16"),
    (12, "QCELP/8000", "qcelp"),
    (13, "CN/8000", "cn"),
    (14, "MPA/90000", "mpa"),
    (15, "G728/8000", "g728"),
    (16, "DVI4/11025", "dvi"),
    (17, "DVI4/22050", "dvi"),
    (18, "G729/8000", "g729"),
    (25, "CelB/90000", "celb"),
    (26, "JPEG/90000", "jpeg"),
    (28, "nv/90000", "nv"),
    (31, "H261/90000", "h261"),
    (32, "MPV/90000", "mpv"),
    (33, "MP2T/90000", "mp2t"),
    (34, "H263/90000", "h263"),
];

/// Media type from the m= line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpMediaType {
    Audio,
    Video,
    Text,
    Application,
    Message,
    Image,
    Unknown,
}

impl SdpMediaType {
    fn from_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "audio" => SdpMediaType::Audio,
            "video" => SdpMediaType::Video,
            "text" => SdpMediaType::Text,
            "application" => SdpMediaType::Application,
            "message" => SdpMediaType::Message,
            "image" => SdpMediaType::Image,
            _ => SdpMediaType::Unknown,
        }
    }
}

impl fmt::Display for SdpMediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SdpMediaType::Audio => "audio",
            SdpMediaType::Video => "video",
            SdpMediaType::Text => "text",
            SdpMediaType::Application => "application",
            SdpMediaType::Message => "message",
            SdpMediaType::Image => "image",
            SdpMediaType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One payload format from an m= line format list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpFormat {
    pub id: u32,
    pub name: Option<String>,
    pub alias: Option<String>,
}

impl SdpFormat {
    fn standard(code: u32) -> Option<Self> {
        STANDARD_FORMATS
            .iter()
            .find(|(id, _, _)| *id == code)
            .map(|(id, name, alias)| Self {
                id: *id,
                name: Some(name.to_string()),
                alias: Some(alias.to_string()),
            })
    }
}

/// One media descriptor from an m= line
#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub mtype: SdpMediaType,
    pub rtp_port: u16,
    pub rtcp_port: Option<u16>,
    pub transport: String,
    pub formats: Vec<SdpFormat>,
    /// MRCP channel tag from a=channel
    pub channel: Option<String>,
    /// Destination address resolved from the connection line
    pub address: Option<Address>,
}

impl SdpMedia {
    /// Name of the preferred (first) format, e.g. "PCMU/8000"
    pub fn first_format(&self) -> Option<&str> {
        self.formats.first().and_then(|f| f.name.as_deref())
    }
}

/// Decoded SDP record
#[derive(Debug, Clone, Default)]
pub struct SdpData {
    /// Session-level connection address from c=
    pub sconn: Option<String>,
    pub medias: Vec<SdpMedia>,
}

pub struct SdpDissector;

impl SdpDissector {
    pub fn new() -> Self {
        Self
    }

    // c=<nettype> <addrtype> <connection-address>
    fn dissect_connection(sdp: &mut SdpData, media_idx: Option<usize>, line: &str) {
        let mut parts = line.split(' ');
        let (net, addr_type, address) = match (parts.next(), parts.next(), parts.next()) {
            (Some(n), Some(t), Some(a)) => (n, t, a),
            _ => return,
        };
        if net != "IN" || !(addr_type == "IP4" || addr_type == "IP6") {
            return;
        }

        match media_idx {
            None => sdp.sconn = Some(address.to_string()),
            Some(idx) => {
                let media = &mut sdp.medias[idx];
                if let Ok(ip) = address.parse() {
                    media.address = Some(Address::udp(ip, media.rtp_port));
                }
            }
        }
    }

    // m=<media> <port> <proto> <fmt> ...
    fn dissect_media(sdp: &mut SdpData, line: &str) -> Option<usize> {
        let mut parts = line.splitn(4, ' ');
        let mtype = SdpMediaType::from_token(parts.next()?);
        let rtp_port: u16 = parts.next()?.parse().ok()?;
        let transport = parts.next()?.to_string();
        let format_list = parts.next()?;

        let mut formats = Vec::new();
        for token in format_list.split(' ').filter(|t| !t.is_empty()) {
            // Non-numeric formats (e.g. t38) carry no payload-type code
            if let Ok(code) = token.parse::<u32>() {
                formats.push(SdpFormat::standard(code).unwrap_or(SdpFormat {
                    id: code,
                    name: None,
                    alias: None,
                }));
            }
        }

        // Session connection line doubles as the media destination
        let address = sdp
            .sconn
            .as_deref()
            .and_then(|a| a.parse().ok())
            .map(|ip| Address::udp(ip, rtp_port));

        sdp.medias.push(SdpMedia {
            mtype,
            rtp_port,
            rtcp_port: None,
            transport,
            formats,
            channel: None,
            address,
        });
        Some(sdp.medias.len() - 1)
    }

    // a=<attribute> or a=<attribute>:<value>
    fn dissect_attribute(sdp: &mut SdpData, media_idx: Option<usize>, line: &str) {
        let media = match media_idx {
            Some(idx) => &mut sdp.medias[idx],
            None => return,
        };
        let parts: Vec<&str> = line.split(|c| c == ' ' || c == ':' || c == '/').collect();
        if parts.len() < 2 {
            return;
        }

        if parts[0].eq_ignore_ascii_case("rtpmap") {
            if parts.len() < 3 {
                return;
            }
            let code: u32 = match parts[1].parse() {
                Ok(c) => c,
                Err(_) => return,
            };
            // Only fill names the static table did not already provide
            if SdpFormat::standard(code).is_none() {
                if let Some(format) = media.formats.iter_mut().find(|f| f.id == code) {
                    let mut name = parts[2].to_string();
                    if let Some(rate) = parts.get(3) {
                        name = format!("{}/{}", name, rate);
                    }
                    format.alias = Some(parts[2].to_string());
                    format.name = Some(name);
                }
            }
        } else if parts[0].eq_ignore_ascii_case("rtcp") {
            if let Ok(port) = parts[1].parse() {
                media.rtcp_port = Some(port);
            }
        } else if parts[0].eq_ignore_ascii_case("channel") {
            media.channel = Some(parts[1].to_string());
        }
    }
}

impl Dissector for SdpDissector {
    fn id(&self) -> ProtoId {
        ProtoId::Sdp
    }

    fn dissect(&mut self, packet: &mut Packet, data: &[u8]) -> Option<DissectOutput> {
        if data.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(data);

        let mut sdp = SdpData::default();
        let mut media_idx = None;

        for line in text.split("\r\n").flat_map(|l| l.split('\n')) {
            if line.len() < 2 || line.as_bytes()[1] != b'=' {
                continue;
            }
            let value = &line[2..];
            match line.as_bytes()[0] {
                b'c' => Self::dissect_connection(&mut sdp, media_idx, value),
                b'm' => {
                    if let Some(idx) = Self::dissect_media(&mut sdp, value) {
                        media_idx = Some(idx);
                    }
                }
                b'a' => Self::dissect_attribute(&mut sdp, media_idx, value),
                _ => {}
            }
        }

        packet.set_proto(ProtoData::Sdp(sdp));
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dissect(body: &str) -> SdpData {
        let mut packet = Packet::new(0, 1, Vec::new());
        SdpDissector::new().dissect(&mut packet, body.as_bytes());
        packet.sdp().unwrap().clone()
    }

    #[test]
    fn test_basic_audio_media() {
        let sdp = dissect(
            "v=0\r\nc=IN IP4 10.0.0.1\r\nm=audio 4000 RTP/AVP 0 8\r\na=rtpmap:0 PCMU/8000\r\n",
        );
        assert_eq!(sdp.sconn.as_deref(), Some("10.0.0.1"));
        assert_eq!(sdp.medias.len(), 1);

        let media = &sdp.medias[0];
        assert_eq!(media.mtype, SdpMediaType::Audio);
        assert_eq!(media.rtp_port, 4000);
        assert_eq!(media.formats.len(), 2);
        assert_eq!(media.first_format(), Some("PCMU/8000"));
        assert_eq!(media.formats[1].name.as_deref(), Some("PCMA/8000"));
        assert_eq!(media.address.unwrap().to_string(), "10.0.0.1:4000");
    }

    #[test]
    fn test_dynamic_payload_rtpmap() {
        let sdp = dissect(
            "v=0\r\nm=audio 5004 RTP/AVP 96\r\na=rtpmap:96 opus/48000/2\r\n",
        );
        let format = &sdp.medias[0].formats[0];
        assert_eq!(format.id, 96);
        assert_eq!(format.name.as_deref(), Some("opus/48000"));
        assert_eq!(format.alias.as_deref(), Some("opus"));
    }

    #[test]
    fn test_unknown_code_kept_id_only() {
        let sdp = dissect("v=0\r\nm=audio 5004 RTP/AVP 97\r\n");
        let format = &sdp.medias[0].formats[0];
        assert_eq!(format.id, 97);
        assert!(format.name.is_none());
    }

    #[test]
    fn test_media_level_connection_overrides() {
        let sdp = dissect(
            "v=0\r\nc=IN IP4 10.0.0.1\r\nm=video 6000 RTP/AVP 31\r\nc=IN IP4 10.0.0.9\r\n",
        );
        assert_eq!(sdp.medias[0].address.unwrap().to_string(), "10.0.0.9:6000");
    }

    #[test]
    fn test_rtcp_and_channel_attributes() {
        let sdp = dissect(
            "v=0\r\nm=application 9 TCP/MRCPv2 1\r\na=rtcp:6001\r\na=channel:32AECB234338@speechrecog\r\n",
        );
        let media = &sdp.medias[0];
        assert_eq!(media.rtcp_port, Some(6001));
        assert_eq!(media.channel.as_deref(), Some("32AECB234338@speechrecog"));
    }
}
