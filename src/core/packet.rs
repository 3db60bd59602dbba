//! Decoded packet representation
//!
//! A [`Packet`] owns the raw captured bytes plus a fixed, enum-keyed table of
//! per-protocol records filled in by the dissector chain. Each protocol that
//! successfully decoded part of the frame stores exactly one typed record;
//! unknown protocols are not stored.

use std::net::IpAddr;

use crate::core::address::{Address, Transport};
use crate::dissect::hep::HepData;
use crate::dissect::ip::IpData;
use crate::dissect::link::LinkData;
use crate::dissect::rtp::{RtcpData, RtpData};
use crate::dissect::sdp::SdpData;
use crate::dissect::sip::SipData;
use crate::dissect::tcp::TcpData;
use crate::dissect::tls::TlsData;
use crate::dissect::udp::UdpData;
use crate::dissect::ws::WsData;

/// Identifier of every protocol the dissector chain understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum ProtoId {
    Link = 0,
    Ip,
    Udp,
    Tcp,
    Tls,
    Ws,
    Hep,
    Sip,
    Sdp,
    Rtp,
    Rtcp,
}

impl ProtoId {
    pub const COUNT: usize = 11;

    fn index(self) -> usize {
        self as usize
    }
}

/// Typed per-protocol record attached to a packet
#[derive(Debug, Clone)]
pub enum ProtoData {
    Link(LinkData),
    Ip(IpData),
    Udp(UdpData),
    Tcp(TcpData),
    Tls(TlsData),
    Ws(WsData),
    Hep(HepData),
    Sip(SipData),
    Sdp(SdpData),
    Rtp(RtpData),
    Rtcp(RtcpData),
}

impl ProtoData {
    pub fn id(&self) -> ProtoId {
        match self {
            ProtoData::Link(_) => ProtoId::Link,
            ProtoData::Ip(_) => ProtoId::Ip,
            ProtoData::Udp(_) => ProtoId::Udp,
            ProtoData::Tcp(_) => ProtoId::Tcp,
            ProtoData::Tls(_) => ProtoId::Tls,
            ProtoData::Ws(_) => ProtoId::Ws,
            ProtoData::Hep(_) => ProtoId::Hep,
            ProtoData::Sip(_) => ProtoId::Sip,
            ProtoData::Sdp(_) => ProtoId::Sdp,
            ProtoData::Rtp(_) => ProtoId::Rtp,
            ProtoData::Rtcp(_) => ProtoId::Rtcp,
        }
    }
}

/// One captured frame with all decoded layers
#[derive(Debug, Clone)]
pub struct Packet {
    /// Capture timestamp, microseconds since the epoch
    pub ts_usec: u64,
    /// pcap link-layer type of the raw bytes
    pub link_type: i32,
    /// Raw frame bytes as captured
    pub raw: Vec<u8>,
    /// Original wire length (>= raw.len() when the snaplen truncated)
    pub wire_len: u32,
    slots: [Option<ProtoData>; ProtoId::COUNT],
}

impl Packet {
    pub fn new(ts_usec: u64, link_type: i32, raw: Vec<u8>) -> Self {
        let wire_len = raw.len() as u32;
        Self {
            ts_usec,
            link_type,
            raw,
            wire_len,
            slots: Default::default(),
        }
    }

    /// Attach a decoded protocol record, replacing any previous one
    pub fn set_proto(&mut self, data: ProtoData) {
        let idx = data.id().index();
        self.slots[idx] = Some(data);
    }

    /// Copy of this packet carrying only the link, network and transport
    /// records, for additional messages framed from the same segment
    pub fn clone_transport(&self) -> Packet {
        let mut copy = Packet::new(self.ts_usec, self.link_type, self.raw.clone());
        copy.wire_len = self.wire_len;
        for id in [
            ProtoId::Link,
            ProtoId::Ip,
            ProtoId::Udp,
            ProtoId::Tcp,
            ProtoId::Tls,
            ProtoId::Ws,
            ProtoId::Hep,
        ] {
            copy.slots[id.index()] = self.slots[id.index()].clone();
        }
        copy
    }

    pub fn has_proto(&self, id: ProtoId) -> bool {
        self.slots[id.index()].is_some()
    }

    pub fn link(&self) -> Option<&LinkData> {
        match &self.slots[ProtoId::Link.index()] {
            Some(ProtoData::Link(d)) => Some(d),
            _ => None,
        }
    }

    pub fn ip(&self) -> Option<&IpData> {
        match &self.slots[ProtoId::Ip.index()] {
            Some(ProtoData::Ip(d)) => Some(d),
            _ => None,
        }
    }

    pub fn udp(&self) -> Option<&UdpData> {
        match &self.slots[ProtoId::Udp.index()] {
            Some(ProtoData::Udp(d)) => Some(d),
            _ => None,
        }
    }

    pub fn tcp(&self) -> Option<&TcpData> {
        match &self.slots[ProtoId::Tcp.index()] {
            Some(ProtoData::Tcp(d)) => Some(d),
            _ => None,
        }
    }

    pub fn tls(&self) -> Option<&TlsData> {
        match &self.slots[ProtoId::Tls.index()] {
            Some(ProtoData::Tls(d)) => Some(d),
            _ => None,
        }
    }

    pub fn ws(&self) -> Option<&WsData> {
        match &self.slots[ProtoId::Ws.index()] {
            Some(ProtoData::Ws(d)) => Some(d),
            _ => None,
        }
    }

    pub fn hep(&self) -> Option<&HepData> {
        match &self.slots[ProtoId::Hep.index()] {
            Some(ProtoData::Hep(d)) => Some(d),
            _ => None,
        }
    }

    pub fn sip(&self) -> Option<&SipData> {
        match &self.slots[ProtoId::Sip.index()] {
            Some(ProtoData::Sip(d)) => Some(d),
            _ => None,
        }
    }

    pub fn sdp(&self) -> Option<&SdpData> {
        match &self.slots[ProtoId::Sdp.index()] {
            Some(ProtoData::Sdp(d)) => Some(d),
            _ => None,
        }
    }

    pub fn rtp(&self) -> Option<&RtpData> {
        match &self.slots[ProtoId::Rtp.index()] {
            Some(ProtoData::Rtp(d)) => Some(d),
            _ => None,
        }
    }

    pub fn rtcp(&self) -> Option<&RtcpData> {
        match &self.slots[ProtoId::Rtcp.index()] {
            Some(ProtoData::Rtcp(d)) => Some(d),
            _ => None,
        }
    }

    /// Transport the innermost payload travelled on
    pub fn transport(&self) -> Transport {
        if self.has_proto(ProtoId::Ws) {
            Transport::Ws
        } else if self.has_proto(ProtoId::Tls) {
            Transport::Tls
        } else if self.has_proto(ProtoId::Tcp) {
            Transport::Tcp
        } else {
            Transport::Udp
        }
    }

    fn endpoint(&self, ip: Option<IpAddr>, port: u16) -> Address {
        match ip {
            Some(ip) => Address::new(ip, port, self.transport()),
            None => Address::unspecified(),
        }
    }

    /// Source endpoint of the innermost transport layer
    pub fn src(&self) -> Address {
        // HEP envelopes carry the original endpoints of the inner frame
        if let Some(hep) = self.hep() {
            return hep.src;
        }
        let ip = self.ip().map(|i| i.src);
        let port = self
            .udp()
            .map(|u| u.sport)
            .or_else(|| self.tcp().map(|t| t.sport))
            .unwrap_or(0);
        self.endpoint(ip, port)
    }

    /// Destination endpoint of the innermost transport layer
    pub fn dst(&self) -> Address {
        if let Some(hep) = self.hep() {
            return hep.dst;
        }
        let ip = self.ip().map(|i| i.dst);
        let port = self
            .udp()
            .map(|u| u.dport)
            .or_else(|| self.tcp().map(|t| t.dport))
            .unwrap_or(0);
        self.endpoint(ip, port)
    }
}
