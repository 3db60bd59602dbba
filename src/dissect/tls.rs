//! TLS record-layer dissector
//!
//! Parses the record framing and extracts the server name from ClientHello
//! handshakes. Without usable session key material there is no plaintext to
//! hand to the SIP dissector, so every record yields none; a configured key
//! file is accepted and a warning is logged once.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::core::packet::{Packet, ProtoData, ProtoId};
use super::{DissectOutput, Dissector};

const RECORD_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const EXTENSION_SNI: u16 = 0;

/// Decoded TLS record-layer summary
#[derive(Debug, Clone, Default)]
pub struct TlsData {
    /// Records seen in this segment
    pub records: u16,
    /// TLS version from the first record header
    pub version: u16,
    /// Server name from a ClientHello, when present
    pub sni: Option<String>,
}

pub struct TlsDissector {
    keyfile: Option<PathBuf>,
    warned: bool,
}

impl TlsDissector {
    pub fn new(keyfile: Option<PathBuf>) -> Self {
        Self { keyfile, warned: false }
    }

    fn parse_sni(hello: &[u8]) -> Option<String> {
        // ClientHello: 2 version + 32 random
        let mut pos = 34;
        let session_len = *hello.get(pos)? as usize;
        pos += 1 + session_len;

        let cipher_len =
            u16::from_be_bytes([*hello.get(pos)?, *hello.get(pos + 1)?]) as usize;
        pos += 2 + cipher_len;

        let compression_len = *hello.get(pos)? as usize;
        pos += 1 + compression_len;

        let ext_total =
            u16::from_be_bytes([*hello.get(pos)?, *hello.get(pos + 1)?]) as usize;
        pos += 2;
        let end = (pos + ext_total).min(hello.len());

        while pos + 4 <= end {
            let ext_type = u16::from_be_bytes([hello[pos], hello[pos + 1]]);
            let ext_len = u16::from_be_bytes([hello[pos + 2], hello[pos + 3]]) as usize;
            pos += 4;
            if ext_type == EXTENSION_SNI && ext_len >= 5 && pos + ext_len <= end {
                // server_name_list: 2 list len + 1 type + 2 name len + name
                let name_len =
                    u16::from_be_bytes([hello[pos + 3], hello[pos + 4]]) as usize;
                let name = hello.get(pos + 5..pos + 5 + name_len)?;
                return String::from_utf8(name.to_vec()).ok();
            }
            pos += ext_len;
        }
        None
    }
}

impl Dissector for TlsDissector {
    fn id(&self) -> ProtoId {
        ProtoId::Tls
    }

    fn dissect(&mut self, packet: &mut Packet, data: &[u8]) -> Option<DissectOutput> {
        let mut tls = TlsData::default();
        let mut pos = 0;

        while pos + 5 <= data.len() {
            let record_type = data[pos];
            let version = u16::from_be_bytes([data[pos + 1], data[pos + 2]]);
            let length = u16::from_be_bytes([data[pos + 3], data[pos + 4]]) as usize;
            // Record types are 20..=23 across every TLS version
            if !(20..=23).contains(&record_type) || !(0x0300..=0x0304).contains(&version) {
                break;
            }
            let body_end = (pos + 5 + length).min(data.len());
            let body = &data[pos + 5..body_end];

            if tls.records == 0 {
                tls.version = version;
            }
            tls.records += 1;

            if record_type == RECORD_HANDSHAKE
                && body.first() == Some(&HANDSHAKE_CLIENT_HELLO)
                && body.len() > 4
            {
                tls.sni = Self::parse_sni(&body[4..]);
                debug!(sni = ?tls.sni, "tls client hello");
            }

            if body_end == data.len() {
                break;
            }
            pos = body_end;
        }

        if tls.records == 0 {
            return None;
        }

        if self.keyfile.is_some() && !self.warned {
            warn!("tls key file configured but record decryption is not available; encrypted SIP will not be decoded");
            self.warned = true;
        }

        packet.set_proto(ProtoData::Tls(tls));
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello_with_sni(host: &str) -> Vec<u8> {
        let name = host.as_bytes();
        // extension: sni
        let mut ext = Vec::new();
        ext.extend_from_slice(&EXTENSION_SNI.to_be_bytes());
        ext.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
        ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        ext.push(0); // host_name
        ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
        ext.extend_from_slice(name);

        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x03, 0x03]); // version
        hello.extend_from_slice(&[0u8; 32]); // random
        hello.push(0); // session id
        hello.extend_from_slice(&2u16.to_be_bytes()); // one cipher suite
        hello.extend_from_slice(&[0x13, 0x01]);
        hello.push(1); // compression methods
        hello.push(0);
        hello.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        hello.extend_from_slice(&ext);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO, 0, 0, hello.len() as u8];
        handshake.extend_from_slice(&hello);

        let mut record = vec![RECORD_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_client_hello_sni() {
        let data = client_hello_with_sni("sip.example.com");
        let mut packet = Packet::new(0, 1, data.clone());
        let out = TlsDissector::new(None).dissect(&mut packet, &data);

        assert!(out.is_none());
        let tls = packet.tls().unwrap();
        assert_eq!(tls.records, 1);
        assert_eq!(tls.sni.as_deref(), Some("sip.example.com"));
    }

    #[test]
    fn test_application_data_yields_none() {
        let data = vec![23, 0x03, 0x03, 0x00, 0x02, 0xaa, 0xbb];
        let mut packet = Packet::new(0, 1, data.clone());
        assert!(TlsDissector::new(None).dissect(&mut packet, &data).is_none());
        assert_eq!(packet.tls().unwrap().records, 1);
    }

    #[test]
    fn test_garbage_not_tls() {
        let data = vec![0x99; 16];
        let mut packet = Packet::new(0, 1, data.clone());
        assert!(TlsDissector::new(None).dissect(&mut packet, &data).is_none());
        assert!(packet.tls().is_none());
    }
}
