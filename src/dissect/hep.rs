//! HEP (Homer Encapsulation Protocol) dissector
//!
//! Decapsulates frames received over the remote encapsulation channel. Both
//! envelope versions in common use are accepted on input: the chunked v3
//! format ("HEP3" magic) and the fixed-header v2 format. The capture output
//! side always emits v3 via [`encode_v3`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::trace;

use crate::core::address::Address;
use crate::core::packet::{Packet, ProtoData, ProtoId};
use super::{DissectOutput, Dissector};

const HEP3_MAGIC: &[u8; 4] = b"HEP3";

const CHUNK_IP_FAMILY: u16 = 0x0001;
const CHUNK_IP_PROTO: u16 = 0x0002;
const CHUNK_IP4_SRC: u16 = 0x0003;
const CHUNK_IP4_DST: u16 = 0x0004;
const CHUNK_IP6_SRC: u16 = 0x0005;
const CHUNK_IP6_DST: u16 = 0x0006;
const CHUNK_SRC_PORT: u16 = 0x0007;
const CHUNK_DST_PORT: u16 = 0x0008;
const CHUNK_TS_SEC: u16 = 0x0009;
const CHUNK_TS_USEC: u16 = 0x000a;
const CHUNK_PROTO_TYPE: u16 = 0x000b;
const CHUNK_CAPTURE_ID: u16 = 0x000c;
const CHUNK_AUTH_KEY: u16 = 0x000e;
const CHUNK_PAYLOAD: u16 = 0x000f;

const FAMILY_IP4: u8 = 2;
const FAMILY_IP6: u8 = 10;

/// Payload carried is SIP
pub const PROTO_TYPE_SIP: u8 = 1;

/// Decoded encapsulation envelope
#[derive(Debug, Clone, Copy)]
pub struct HepData {
    pub version: u8,
    pub src: Address,
    pub dst: Address,
    /// Original capture timestamp carried in the envelope
    pub ts_usec: u64,
    pub proto_type: u8,
    pub capture_id: u32,
}

pub struct HepDissector;

impl HepDissector {
    pub fn new() -> Self {
        Self
    }

    fn parse_v3(data: &[u8]) -> Option<(HepData, Vec<u8>)> {
        if data.len() < 6 || &data[0..4] != HEP3_MAGIC {
            return None;
        }
        let total = u16::from_be_bytes([data[4], data[5]]) as usize;
        let end = total.min(data.len());

        let mut src_ip: Option<IpAddr> = None;
        let mut dst_ip: Option<IpAddr> = None;
        let mut sport = 0u16;
        let mut dport = 0u16;
        let mut ts_sec = 0u32;
        let mut ts_usec = 0u32;
        let mut proto_type = 0u8;
        let mut capture_id = 0u32;
        let mut payload = Vec::new();

        let mut pos = 6;
        while pos + 6 <= end {
            let chunk_type = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);
            let chunk_len = u16::from_be_bytes([data[pos + 4], data[pos + 5]]) as usize;
            if chunk_len < 6 || pos + chunk_len > end {
                return None;
            }
            let value = &data[pos + 6..pos + chunk_len];

            match chunk_type {
                // the address chunks pin down the family
                CHUNK_IP_FAMILY | CHUNK_IP_PROTO => {}
                CHUNK_IP4_SRC if value.len() == 4 => {
                    src_ip = Some(IpAddr::V4(Ipv4Addr::new(value[0], value[1], value[2], value[3])));
                }
                CHUNK_IP4_DST if value.len() == 4 => {
                    dst_ip = Some(IpAddr::V4(Ipv4Addr::new(value[0], value[1], value[2], value[3])));
                }
                CHUNK_IP6_SRC if value.len() == 16 => {
                    let mut b = [0u8; 16];
                    b.copy_from_slice(value);
                    src_ip = Some(IpAddr::V6(Ipv6Addr::from(b)));
                }
                CHUNK_IP6_DST if value.len() == 16 => {
                    let mut b = [0u8; 16];
                    b.copy_from_slice(value);
                    dst_ip = Some(IpAddr::V6(Ipv6Addr::from(b)));
                }
                CHUNK_SRC_PORT if value.len() == 2 => {
                    sport = u16::from_be_bytes([value[0], value[1]]);
                }
                CHUNK_DST_PORT if value.len() == 2 => {
                    dport = u16::from_be_bytes([value[0], value[1]]);
                }
                CHUNK_TS_SEC if value.len() == 4 => {
                    ts_sec = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                }
                CHUNK_TS_USEC if value.len() == 4 => {
                    ts_usec = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                }
                CHUNK_PROTO_TYPE if !value.is_empty() => proto_type = value[0],
                CHUNK_CAPTURE_ID if value.len() == 4 => {
                    capture_id = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                }
                CHUNK_AUTH_KEY => {}
                CHUNK_PAYLOAD => payload = value.to_vec(),
                _ => {}
            }
            pos += chunk_len;
        }

        let hep = HepData {
            version: 3,
            src: Address::udp(src_ip?, sport),
            dst: Address::udp(dst_ip?, dport),
            ts_usec: ts_sec as u64 * 1_000_000 + ts_usec as u64,
            proto_type,
            capture_id,
        };
        Some((hep, payload))
    }

    fn parse_v2(data: &[u8]) -> Option<(HepData, Vec<u8>)> {
        // u8 version, u8 header len, u8 family, u8 protocol, u16 sport,
        // u16 dport, addresses, then time header {sec, usec, capture id}
        if data.len() < 8 || data[0] != 2 {
            return None;
        }
        let header_len = data[1] as usize;
        let family = data[2];
        let sport = u16::from_be_bytes([data[4], data[5]]);
        let dport = u16::from_be_bytes([data[6], data[7]]);

        let (src_ip, dst_ip): (IpAddr, IpAddr) = match family {
            FAMILY_IP4 if header_len >= 16 && data.len() >= 16 => (
                IpAddr::V4(Ipv4Addr::new(data[8], data[9], data[10], data[11])),
                IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15])),
            ),
            FAMILY_IP6 if header_len >= 40 && data.len() >= 40 => {
                let mut s = [0u8; 16];
                let mut d = [0u8; 16];
                s.copy_from_slice(&data[8..24]);
                d.copy_from_slice(&data[24..40]);
                (IpAddr::V6(Ipv6Addr::from(s)), IpAddr::V6(Ipv6Addr::from(d)))
            }
            _ => return None,
        };

        // v2 time header follows the address block
        if data.len() < header_len + 10 {
            return None;
        }
        let t = &data[header_len..];
        let ts_sec = u32::from_be_bytes([t[0], t[1], t[2], t[3]]);
        let ts_usec = u32::from_be_bytes([t[4], t[5], t[6], t[7]]);
        let capture_id = u16::from_be_bytes([t[8], t[9]]) as u32;

        let hep = HepData {
            version: 2,
            src: Address::udp(src_ip, sport),
            dst: Address::udp(dst_ip, dport),
            ts_usec: ts_sec as u64 * 1_000_000 + ts_usec as u64,
            proto_type: PROTO_TYPE_SIP,
            capture_id,
        };
        Some((hep, data[header_len + 10..].to_vec()))
    }
}

impl Dissector for HepDissector {
    fn id(&self) -> ProtoId {
        ProtoId::Hep
    }

    fn dissect(&mut self, packet: &mut Packet, data: &[u8]) -> Option<DissectOutput> {
        let (hep, payload) = Self::parse_v3(data).or_else(|| Self::parse_v2(data))?;
        trace!(version = hep.version, src = %hep.src, "hep frame decapsulated");

        if hep.ts_usec > 0 {
            packet.ts_usec = hep.ts_usec;
        }
        let sip = hep.proto_type == PROTO_TYPE_SIP;
        packet.set_proto(ProtoData::Hep(hep));

        (sip && !payload.is_empty()).then(|| DissectOutput::new(ProtoId::Sip, payload))
    }
}

fn push_chunk(buf: &mut Vec<u8>, chunk_type: u16, value: &[u8]) {
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&chunk_type.to_be_bytes());
    buf.extend_from_slice(&((6 + value.len()) as u16).to_be_bytes());
    buf.extend_from_slice(value);
}

/// Build a HEP v3 envelope for a dissected SIP packet
pub fn encode_v3(packet: &Packet, capture_id: u32, auth_key: Option<&str>) -> Option<Vec<u8>> {
    let sip = packet.sip()?;
    let src = packet.src();
    let dst = packet.dst();

    let mut chunks = Vec::new();
    let family = match src.ip {
        IpAddr::V4(_) => FAMILY_IP4,
        IpAddr::V6(_) => FAMILY_IP6,
    };
    push_chunk(&mut chunks, CHUNK_IP_FAMILY, &[family]);
    push_chunk(&mut chunks, CHUNK_IP_PROTO, &[17]);
    match (src.ip, dst.ip) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            push_chunk(&mut chunks, CHUNK_IP4_SRC, &s.octets());
            push_chunk(&mut chunks, CHUNK_IP4_DST, &d.octets());
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            push_chunk(&mut chunks, CHUNK_IP6_SRC, &s.octets());
            push_chunk(&mut chunks, CHUNK_IP6_DST, &d.octets());
        }
        _ => return None,
    }
    push_chunk(&mut chunks, CHUNK_SRC_PORT, &src.port.to_be_bytes());
    push_chunk(&mut chunks, CHUNK_DST_PORT, &dst.port.to_be_bytes());
    push_chunk(&mut chunks, CHUNK_TS_SEC, &((packet.ts_usec / 1_000_000) as u32).to_be_bytes());
    push_chunk(&mut chunks, CHUNK_TS_USEC, &((packet.ts_usec % 1_000_000) as u32).to_be_bytes());
    push_chunk(&mut chunks, CHUNK_PROTO_TYPE, &[PROTO_TYPE_SIP]);
    push_chunk(&mut chunks, CHUNK_CAPTURE_ID, &capture_id.to_be_bytes());
    if let Some(key) = auth_key {
        push_chunk(&mut chunks, CHUNK_AUTH_KEY, key.as_bytes());
    }
    push_chunk(&mut chunks, CHUNK_PAYLOAD, sip.payload.as_bytes());

    let mut out = Vec::with_capacity(6 + chunks.len());
    out.extend_from_slice(HEP3_MAGIC);
    out.extend_from_slice(&((6 + chunks.len()) as u16).to_be_bytes());
    out.extend_from_slice(&chunks);
    Some(out)
}
