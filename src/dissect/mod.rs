//! Protocol dissector chain
//!
//! Turns raw link-layer bytes into protocol records attached to a [`Packet`].
//! The chain is a tree: the link dissector picks the network layer from the
//! EtherType, the IP dissector picks the transport from the protocol number,
//! and the transport dissectors route to SIP, RTP/RTCP, WebSocket or HEP by
//! port and content sniff. Each dissector consumes a byte slice, attaches its
//! record to the packet and hands the residual bytes to the next one.
//!
//! Dissection errors are never fatal: a malformed layer ends the walk, the
//! packet keeps whatever records were attached so far, and a counter is
//! incremented.

pub mod hep;
pub mod ip;
pub mod link;
pub mod rtp;
pub mod sdp;
pub mod sip;
pub mod tcp;
pub mod tls;
pub mod udp;
pub mod ws;

use std::path::PathBuf;

use tracing::trace;

use crate::core::address::Address;
use crate::core::packet::{Packet, ProtoId};

/// Residual bytes plus the dissector that should consume them next
#[derive(Debug)]
pub struct DissectOutput {
    pub next: ProtoId,
    pub payload: Vec<u8>,
}

impl DissectOutput {
    pub fn new(next: ProtoId, payload: Vec<u8>) -> Self {
        Self { next, payload }
    }
}

/// A single protocol dissector
///
/// `dissect` attaches this protocol's record to the packet and returns the
/// residual bytes for the next layer, or `None` when the walk terminates here
/// (fully consumed, or malformed input).
pub trait Dissector {
    fn id(&self) -> ProtoId;

    fn dissect(&mut self, packet: &mut Packet, data: &[u8]) -> Option<DissectOutput>;
}

/// Chain configuration derived from the application config
#[derive(Debug, Clone, Default)]
pub struct DissectConfig {
    /// UDP port carrying HEP-encapsulated traffic, if any
    pub hep_port: Option<u16>,
    /// TLS key file supplied by the user (record decryption hint)
    pub tls_keyfile: Option<PathBuf>,
    /// Endpoint known to speak SIP over TLS
    pub tls_server: Option<Address>,
}

/// Chain counters, reported alongside capture status
#[derive(Debug, Clone, Default)]
pub struct DissectStats {
    /// Frames entering the chain
    pub frames: u64,
    /// Frames dropped because a layer was malformed
    pub skipped: u64,
    /// Complete SIP messages decoded
    pub sip_messages: u64,
    /// IPv4 datagrams rebuilt from fragments
    pub reassembled: u64,
}

/// The full dissector tree, thread-confined to the capture worker
pub struct DissectorChain {
    link: link::LinkDissector,
    ip: ip::IpDissector,
    udp: udp::UdpDissector,
    tcp: tcp::TcpDissector,
    tls: tls::TlsDissector,
    ws: ws::WsDissector,
    hep: hep::HepDissector,
    sip: sip::SipDissector,
    sdp: sdp::SdpDissector,
    rtp: rtp::RtpDissector,
    pub stats: DissectStats,
}

impl DissectorChain {
    pub fn new(config: DissectConfig) -> Self {
        Self {
            link: link::LinkDissector::new(),
            ip: ip::IpDissector::new(),
            udp: udp::UdpDissector::new(config.hep_port),
            tcp: tcp::TcpDissector::new(config.tls_server),
            tls: tls::TlsDissector::new(config.tls_keyfile.clone()),
            ws: ws::WsDissector::new(),
            hep: hep::HepDissector::new(),
            sip: sip::SipDissector::new(),
            sdp: sdp::SdpDissector::new(),
            rtp: rtp::RtpDissector::new(),
            stats: DissectStats::default(),
        }
    }

    /// Run the chain over a packet's raw bytes, starting at `start`
    ///
    /// Live and file inputs start at [`ProtoId::Link`]; frames from a HEP
    /// listener start at [`ProtoId::Hep`]. A TCP segment can carry several
    /// pipelined messages; each message beyond the first is returned as a
    /// packet of its own, sharing the frame's transport records.
    pub fn dissect(&mut self, packet: &mut Packet, start: ProtoId) -> Vec<Packet> {
        self.stats.frames += 1;

        let data = packet.raw.clone();
        self.walk(packet, start, data);

        let mut extras = Vec::new();
        for out in self.tcp.take_ready() {
            let mut extra = packet.clone_transport();
            self.walk(&mut extra, out.next, out.payload);
            if extra.sip().is_some() {
                extras.push(extra);
            }
        }

        if packet.sip().is_some() {
            self.stats.sip_messages += 1;
        }
        self.stats.sip_messages += extras.len() as u64;
        self.stats.reassembled = self.ip.reassembled();

        trace!(
            ts = packet.ts_usec,
            sip = packet.sip().is_some(),
            rtp = packet.rtp().is_some(),
            extras = extras.len(),
            "frame dissected"
        );
        extras
    }

    fn walk(&mut self, packet: &mut Packet, start: ProtoId, mut data: Vec<u8>) {
        let mut current = start;
        loop {
            let out = self.run_one(current, packet, &data);
            match out {
                Some(out) if !out.payload.is_empty() => {
                    current = out.next;
                    data = out.payload;
                }
                _ => break,
            }
        }
    }

    fn run_one(&mut self, id: ProtoId, packet: &mut Packet, data: &[u8]) -> Option<DissectOutput> {
        let out = match id {
            ProtoId::Link => self.link.dissect(packet, data),
            ProtoId::Ip => self.ip.dissect(packet, data),
            ProtoId::Udp => self.udp.dissect(packet, data),
            ProtoId::Tcp => self.tcp.dissect(packet, data),
            ProtoId::Tls => self.tls.dissect(packet, data),
            ProtoId::Ws => self.ws.dissect(packet, data),
            ProtoId::Hep => self.hep.dissect(packet, data),
            ProtoId::Sip => self.sip.dissect(packet, data),
            ProtoId::Sdp => self.sdp.dissect(packet, data),
            ProtoId::Rtp => self.rtp.dissect(packet, data),
            ProtoId::Rtcp => self.rtp.dissect_rtcp(packet, data),
        };
        // Walk ended at the bottom of the stack: not our traffic. Parked
        // IPv4 fragments are not skips, their record is already attached.
        let skipped = match id {
            ProtoId::Link => out.is_none(),
            ProtoId::Ip => out.is_none() && packet.ip().is_none(),
            _ => false,
        };
        if skipped {
            self.stats.skipped += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_chain_udp_sip_frame() {
        let mut chain = DissectorChain::new(DissectConfig::default());
        let raw = testing::udp_frame(
            "10.0.0.1", 5060,
            "10.0.0.2", 5060,
            testing::sip_invite("abc@x", "alice", "bob", 1, None).as_bytes(),
        );

        let mut packet = Packet::new(1_000, 1, raw);
        chain.dissect(&mut packet, ProtoId::Link);

        let sip = packet.sip().expect("sip record");
        assert_eq!(sip.call_id, "abc@x");
        assert_eq!(chain.stats.sip_messages, 1);
        assert_eq!(packet.src().to_string(), "10.0.0.1:5060");
    }

    #[test]
    fn test_chain_pipelined_tcp_messages() {
        let mut chain = DissectorChain::new(DissectConfig::default());
        let invite = testing::sip_invite("pipe-chain@x", "alice", "bob", 1, None);
        let bye = testing::sip_request("BYE", "pipe-chain@x", "alice", "bob", 2, "");
        let mut both = invite.clone().into_bytes();
        both.extend_from_slice(bye.as_bytes());

        // both messages in one segment that also closes the flow
        let raw = testing::tcp_frame("10.0.0.1", 49152, "10.0.0.2", 5060, 1, true, &both);
        let mut packet = Packet::new(5_000, 1, raw);
        let extras = chain.dissect(&mut packet, ProtoId::Link);

        assert_eq!(packet.sip().unwrap().summary(), "INVITE");
        assert_eq!(extras.len(), 1);
        let second = extras[0].sip().unwrap();
        assert_eq!(second.summary(), "BYE");
        assert_eq!(extras[0].src().to_string(), packet.src().to_string());
        assert_eq!(chain.stats.sip_messages, 2);
    }

    #[test]
    fn test_chain_skips_non_ip() {
        let mut chain = DissectorChain::new(DissectConfig::default());
        // ARP ethertype
        let mut raw = vec![0u8; 12];
        raw.extend_from_slice(&[0x08, 0x06]);
        raw.extend_from_slice(&[0u8; 28]);

        let mut packet = Packet::new(0, 1, raw);
        chain.dissect(&mut packet, ProtoId::Link);

        assert!(packet.ip().is_none());
        assert_eq!(chain.stats.skipped, 1);
    }
}
