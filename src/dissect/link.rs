//! Link-layer dissector: Ethernet, Linux cooked (SLL) and loopback framing
//!
//! Strips the link header, records MAC addresses when present and routes to
//! the IP dissector from the EtherType / next-protocol tag.

use crate::core::packet::{Packet, ProtoData, ProtoId};
use super::{DissectOutput, Dissector};

/// pcap DLT values this dissector understands
pub const LINKTYPE_NULL: i32 = 0;
pub const LINKTYPE_ETHERNET: i32 = 1;
pub const LINKTYPE_RAW: i32 = 101;
pub const LINKTYPE_LOOP: i32 = 108;
pub const LINKTYPE_LINUX_SLL: i32 = 113;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;

/// Decoded link-layer record
#[derive(Debug, Clone, Default)]
pub struct LinkData {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub ethertype: u16,
    pub vlan: Option<u16>,
}

pub struct LinkDissector;

impl LinkDissector {
    pub fn new() -> Self {
        Self
    }

    fn dissect_ethernet(&self, packet: &mut Packet, data: &[u8]) -> Option<DissectOutput> {
        if data.len() < 14 {
            return None;
        }

        let mut link = LinkData::default();
        link.dst_mac.copy_from_slice(&data[0..6]);
        link.src_mac.copy_from_slice(&data[6..12]);

        let mut ethertype = u16::from_be_bytes([data[12], data[13]]);
        let mut offset = 14;

        // 802.1Q tag: skip to the encapsulated type
        if ethertype == ETHERTYPE_VLAN {
            if data.len() < 18 {
                return None;
            }
            link.vlan = Some(u16::from_be_bytes([data[14], data[15]]) & 0x0fff);
            ethertype = u16::from_be_bytes([data[16], data[17]]);
            offset = 18;
        }

        link.ethertype = ethertype;
        packet.set_proto(ProtoData::Link(link));

        match ethertype {
            ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => {
                Some(DissectOutput::new(ProtoId::Ip, data[offset..].to_vec()))
            }
            _ => None,
        }
    }

    fn dissect_sll(&self, packet: &mut Packet, data: &[u8]) -> Option<DissectOutput> {
        // SLL: 2 pkttype + 2 hatype + 2 halen + 8 addr + 2 protocol
        if data.len() < 16 {
            return None;
        }
        let ethertype = u16::from_be_bytes([data[14], data[15]]);
        packet.set_proto(ProtoData::Link(LinkData { ethertype, ..Default::default() }));

        match ethertype {
            ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => {
                Some(DissectOutput::new(ProtoId::Ip, data[16..].to_vec()))
            }
            _ => None,
        }
    }

    fn dissect_loopback(&self, packet: &mut Packet, data: &[u8]) -> Option<DissectOutput> {
        // BSD null/loop: 4-byte host-order family
        if data.len() < 4 {
            return None;
        }
        packet.set_proto(ProtoData::Link(LinkData::default()));
        Some(DissectOutput::new(ProtoId::Ip, data[4..].to_vec()))
    }
}

impl Dissector for LinkDissector {
    fn id(&self) -> ProtoId {
        ProtoId::Link
    }

    fn dissect(&mut self, packet: &mut Packet, data: &[u8]) -> Option<DissectOutput> {
        match packet.link_type {
            LINKTYPE_ETHERNET => self.dissect_ethernet(packet, data),
            LINKTYPE_LINUX_SLL => self.dissect_sll(packet, data),
            LINKTYPE_NULL | LINKTYPE_LOOP => self.dissect_loopback(packet, data),
            LINKTYPE_RAW => Some(DissectOutput::new(ProtoId::Ip, data.to_vec())),
            _ => None,
        }
    }
}
