//! IP dissector: IPv4/IPv6 headers and IPv4 fragment reassembly
//!
//! Records source and destination addresses on the packet and selects the
//! transport dissector from the IP protocol number. IPv4 fragments are held
//! in a cache keyed by (src, dst, id, proto) until the datagram is complete;
//! partial datagrams are discarded after [`FRAGMENT_TIMEOUT`].

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use etherparse::{Ipv4HeaderSlice, Ipv6HeaderSlice};
use tracing::debug;

use crate::core::packet::{Packet, ProtoData, ProtoId};
use super::{DissectOutput, Dissector};

/// How long incomplete fragment sets are kept
pub const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(30);

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Decoded network-layer record
#[derive(Debug, Clone)]
pub struct IpData {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: u8,
    pub version: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FragKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    id: u16,
    proto: u8,
}

struct FragEntry {
    parts: Vec<(u16, Vec<u8>)>,
    have_last: bool,
    created: Instant,
}

impl FragEntry {
    /// Stitch the datagram together if every byte from offset 0 to the last
    /// fragment is present
    fn assemble(&mut self) -> Option<Vec<u8>> {
        if !self.have_last {
            return None;
        }
        self.parts.sort_by_key(|(off, _)| *off);

        let mut payload = Vec::new();
        for (off, part) in &self.parts {
            let off = *off as usize;
            if off > payload.len() {
                return None; // hole
            }
            if off + part.len() > payload.len() {
                payload.truncate(off);
                payload.extend_from_slice(part);
            }
        }
        Some(payload)
    }
}

pub struct IpDissector {
    fragments: HashMap<FragKey, FragEntry>,
    reassembled: u64,
}

impl IpDissector {
    pub fn new() -> Self {
        Self {
            fragments: HashMap::new(),
            reassembled: 0,
        }
    }

    pub fn reassembled(&self) -> u64 {
        self.reassembled
    }

    fn expire_fragments(&mut self) {
        let now = Instant::now();
        self.fragments.retain(|_, e| now.duration_since(e.created) < FRAGMENT_TIMEOUT);
    }

    fn next_for(proto: u8, payload: Vec<u8>) -> Option<DissectOutput> {
        match proto {
            IPPROTO_UDP => Some(DissectOutput::new(ProtoId::Udp, payload)),
            IPPROTO_TCP => Some(DissectOutput::new(ProtoId::Tcp, payload)),
            _ => None,
        }
    }

    fn dissect_v4(&mut self, packet: &mut Packet, data: &[u8]) -> Option<DissectOutput> {
        let header = Ipv4HeaderSlice::from_slice(data).ok()?;
        let header_len = header.ihl() as usize * 4;
        let total_len = (header.total_len() as usize).min(data.len());
        if header_len > total_len {
            return None;
        }

        let proto = header.protocol().0;
        packet.set_proto(ProtoData::Ip(IpData {
            src: IpAddr::V4(header.source_addr()),
            dst: IpAddr::V4(header.destination_addr()),
            proto,
            version: 4,
        }));

        let payload = data[header_len..total_len].to_vec();

        if !header.is_fragmenting_payload() {
            return Self::next_for(proto, payload);
        }

        // Fragmented datagram: park the piece and try to assemble
        self.expire_fragments();

        let key = FragKey {
            src: header.source_addr(),
            dst: header.destination_addr(),
            id: header.identification(),
            proto,
        };
        let offset = header.fragments_offset().value() * 8;
        let last = !header.more_fragments();

        let entry = self.fragments.entry(key.clone()).or_insert_with(|| FragEntry {
            parts: Vec::new(),
            have_last: false,
            created: Instant::now(),
        });
        entry.parts.push((offset, payload));
        entry.have_last |= last;

        if let Some(full) = entry.assemble() {
            self.fragments.remove(&key);
            self.reassembled += 1;
            debug!(id = key.id, len = full.len(), "ipv4 datagram reassembled");
            return Self::next_for(proto, full);
        }
        None
    }

    fn dissect_v6(&mut self, packet: &mut Packet, data: &[u8]) -> Option<DissectOutput> {
        let header = Ipv6HeaderSlice::from_slice(data).ok()?;
        let proto = header.next_header().0;
        packet.set_proto(ProtoData::Ip(IpData {
            src: IpAddr::V6(header.source_addr()),
            dst: IpAddr::V6(header.destination_addr()),
            proto,
            version: 6,
        }));

        let payload_len = (header.payload_length() as usize).min(data.len().saturating_sub(40));
        Self::next_for(proto, data[40..40 + payload_len].to_vec())
    }
}

impl Dissector for IpDissector {
    fn id(&self) -> ProtoId {
        ProtoId::Ip
    }

    fn dissect(&mut self, packet: &mut Packet, data: &[u8]) -> Option<DissectOutput> {
        match data.first().map(|b| b >> 4) {
            Some(4) => self.dissect_v4(packet, data),
            Some(6) => self.dissect_v6(packet, data),
            _ => None,
        }
    }
}
