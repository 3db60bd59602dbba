//! A parsed SIP message retained by storage
//!
//! A [`Message`] owns the packet it was decoded from and copies out the
//! dialog-identifying fields for cheap access. It lives for the lifetime of
//! its call.

use crate::core::address::Address;
use crate::core::packet::Packet;
use crate::dissect::sdp::SdpMedia;
use crate::dissect::sip::{SipKind, SipMethod, SipParty};

/// Fixed per-message accounting overhead on top of the raw frame bytes
pub const MESSAGE_OVERHEAD: usize = 128;

#[derive(Debug, Clone)]
pub struct Message {
    packet: Packet,
    /// Global arrival sequence assigned by storage
    pub seq: u64,
    pub kind: SipKind,
    pub cseq: u32,
    pub cseq_method: SipMethod,
    pub from: SipParty,
    pub to: SipParty,
    pub src: Address,
    pub dst: Address,
}

impl Message {
    /// Build from a dissected packet; None when the packet carries no SIP
    pub fn from_packet(packet: Packet, seq: u64) -> Option<Self> {
        let sip = packet.sip()?;
        let (kind, cseq, cseq_method) = (sip.kind.clone(), sip.cseq, sip.cseq_method);
        let (from, to) = (sip.from.clone(), sip.to.clone());
        let (src, dst) = (packet.src(), packet.dst());
        Some(Self {
            packet,
            seq,
            kind,
            cseq,
            cseq_method,
            from,
            to,
            src,
            dst,
        })
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn ts_usec(&self) -> u64 {
        self.packet.ts_usec
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, SipKind::Request { .. })
    }

    pub fn method(&self) -> Option<SipMethod> {
        self.kind.method()
    }

    pub fn response_code(&self) -> Option<u16> {
        self.kind.response_code()
    }

    /// Method name or "code reason" for display
    pub fn summary(&self) -> String {
        match &self.kind {
            SipKind::Request { method, .. } => method.to_string(),
            SipKind::Response { code, reason } => format!("{} {}", code, reason),
        }
    }

    /// Full message text as captured
    pub fn payload(&self) -> &str {
        self.packet.sip().map(|s| s.payload.as_str()).unwrap_or("")
    }

    /// Call-ID of a dialog this message replaces or refers to
    pub fn refers(&self) -> Option<&str> {
        self.packet.sip().and_then(|s| s.refers.as_deref())
    }

    /// Media descriptors from an attached SDP body
    pub fn medias(&self) -> &[SdpMedia] {
        self.packet.sdp().map(|s| s.medias.as_slice()).unwrap_or(&[])
    }

    /// Approximate retained size for memory accounting
    pub fn approx_size(&self) -> usize {
        self.packet.raw.len() + MESSAGE_OVERHEAD
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_message_from_packet() {
        let packet = testing::sip_packet(
            10,
            "10.0.0.1", 5060,
            "10.0.0.2", 5060,
            &testing::sip_invite("msg@x", "alice", "bob", 7, None),
        );
        let raw_len = packet.raw.len();
        let msg = Message::from_packet(packet, 1).unwrap();

        assert_eq!(msg.cseq, 7);
        assert_eq!(msg.from.user, "alice");
        assert_eq!(msg.summary(), "INVITE");
        assert_eq!(msg.approx_size(), raw_len + MESSAGE_OVERHEAD);
        assert!(msg.medias().is_empty());
    }

    #[test]
    fn test_non_sip_packet_rejected() {
        let packet = Packet::new(0, 1, vec![0u8; 32]);
        assert!(Message::from_packet(packet, 0).is_none());
    }
}
