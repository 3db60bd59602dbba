//! UDP dissector
//!
//! Records the port pair and routes the datagram payload: a configured HEP
//! port goes to the HEP decapsulator, SIP is recognized by port or content
//! probe, and remaining media traffic is classified as RTP or RTCP by
//! heuristics. STUN keep-alives sharing the media ports are recognized and
//! dropped.

use crate::core::packet::{Packet, ProtoData, ProtoId};
use super::{rtp, sip, DissectOutput, Dissector};

const SIP_PORTS: [u16; 2] = [5060, 5061];

/// Decoded UDP record
#[derive(Debug, Clone, Copy)]
pub struct UdpData {
    pub sport: u16,
    pub dport: u16,
}

pub struct UdpDissector {
    hep_port: Option<u16>,
}

impl UdpDissector {
    pub fn new(hep_port: Option<u16>) -> Self {
        Self { hep_port }
    }

    fn is_stun(payload: &[u8]) -> bool {
        // First two bits zero and the magic cookie at offset 4
        payload.len() >= 20
            && payload[0] & 0xc0 == 0
            && payload[4..8] == [0x21, 0x12, 0xa4, 0x42]
    }
}

impl Dissector for UdpDissector {
    fn id(&self) -> ProtoId {
        ProtoId::Udp
    }

    fn dissect(&mut self, packet: &mut Packet, data: &[u8]) -> Option<DissectOutput> {
        if data.len() < 8 {
            return None;
        }
        let sport = u16::from_be_bytes([data[0], data[1]]);
        let dport = u16::from_be_bytes([data[2], data[3]]);
        let length = u16::from_be_bytes([data[4], data[5]]) as usize;
        if length < 8 {
            return None;
        }
        let end = length.min(data.len());
        let payload = data[8..end].to_vec();

        packet.set_proto(ProtoData::Udp(UdpData { sport, dport }));

        if payload.is_empty() {
            return None;
        }

        if let Some(hep_port) = self.hep_port {
            if sport == hep_port || dport == hep_port {
                return Some(DissectOutput::new(ProtoId::Hep, payload));
            }
        }

        let on_sip_port = SIP_PORTS.contains(&sport) || SIP_PORTS.contains(&dport);
        if on_sip_port || sip::probe(&payload) {
            return Some(DissectOutput::new(ProtoId::Sip, payload));
        }

        if Self::is_stun(&payload) {
            return None;
        }

        if rtp::probe_rtcp(&payload, dport) {
            return Some(DissectOutput::new(ProtoId::Rtcp, payload));
        }
        if rtp::probe_rtp(&payload, dport) {
            return Some(DissectOutput::new(ProtoId::Rtp, payload));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&sport.to_be_bytes());
        data.extend_from_slice(&dport.to_be_bytes());
        data.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        data.extend_from_slice(&[0, 0]);
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn test_sip_by_port() {
        let data = datagram(49152, 5060, b"OPTIONS sip:x SIP/2.0\r\n\r\n");
        let mut packet = Packet::new(0, 1, data.clone());
        let out = UdpDissector::new(None).dissect(&mut packet, &data).unwrap();
        assert_eq!(out.next, ProtoId::Sip);
        assert_eq!(packet.udp().unwrap().dport, 5060);
    }

    #[test]
    fn test_sip_by_content_on_odd_port() {
        let data = datagram(7000, 7001, b"SIP/2.0 200 OK\r\n\r\n");
        let mut packet = Packet::new(0, 1, data.clone());
        let out = UdpDissector::new(None).dissect(&mut packet, &data).unwrap();
        assert_eq!(out.next, ProtoId::Sip);
    }

    #[test]
    fn test_hep_port_takes_precedence() {
        let data = datagram(33000, 9060, b"HEP3\x00\x08");
        let mut packet = Packet::new(0, 1, data.clone());
        let out = UdpDissector::new(Some(9060)).dissect(&mut packet, &data).unwrap();
        assert_eq!(out.next, ProtoId::Hep);
    }

    #[test]
    fn test_stun_dropped() {
        let mut stun = vec![0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42];
        stun.extend_from_slice(&[0u8; 12]);
        let data = datagram(4000, 4001, &stun);
        let mut packet = Packet::new(0, 1, data.clone());
        assert!(UdpDissector::new(None).dissect(&mut packet, &data).is_none());
    }

    #[test]
    fn test_rtp_classified() {
        // v=2, pt=0 (PCMU), even port
        let mut media = vec![0x80, 0x00, 0x00, 0x01];
        media.extend_from_slice(&[0, 0, 0, 1]); // ts
        media.extend_from_slice(&[0, 0, 0, 42]); // ssrc
        media.extend_from_slice(&[0u8; 16]);
        let data = datagram(4000, 4002, &media);
        let mut packet = Packet::new(0, 1, data.clone());
        let out = UdpDissector::new(None).dissect(&mut packet, &data).unwrap();
        assert_eq!(out.next, ProtoId::Rtp);
    }
}
