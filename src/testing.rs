//! Synthetic traffic generation for tests
//!
//! Builders for Ethernet/IPv4/UDP/TCP frames and canned SIP messages used by
//! unit and integration tests. Checksums are left zeroed; the dissectors do
//! not verify them.

use std::net::Ipv4Addr;

use crate::core::packet::{Packet, ProtoId};
use crate::dissect::{DissectConfig, DissectorChain};

fn ipv4_header(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: u8,
    payload_len: usize,
    id: u16,
    frag_offset_words: u16,
    more_fragments: bool,
) -> Vec<u8> {
    let total_len = (20 + payload_len) as u16;
    let flags_frag = (if more_fragments { 0x2000 } else { 0 }) | (frag_offset_words & 0x1fff);
    let mut header = vec![0x45, 0x00];
    header.extend_from_slice(&total_len.to_be_bytes());
    header.extend_from_slice(&id.to_be_bytes());
    header.extend_from_slice(&flags_frag.to_be_bytes());
    header.push(64); // ttl
    header.push(proto);
    header.extend_from_slice(&[0, 0]); // checksum
    header.extend_from_slice(&src.octets());
    header.extend_from_slice(&dst.octets());
    header
}

fn ethernet(payload: Vec<u8>) -> Vec<u8> {
    let mut frame = vec![
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, // dst mac
        0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, // src mac
        0x08, 0x00, // IPv4
    ];
    frame.extend_from_slice(&payload);
    frame
}

/// Complete Ethernet/IPv4/UDP frame
pub fn udp_frame(src: &str, sport: u16, dst: &str, dport: u16, payload: &[u8]) -> Vec<u8> {
    let src: Ipv4Addr = src.parse().unwrap();
    let dst: Ipv4Addr = dst.parse().unwrap();

    let mut udp = Vec::new();
    udp.extend_from_slice(&sport.to_be_bytes());
    udp.extend_from_slice(&dport.to_be_bytes());
    udp.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);

    let mut packet = ipv4_header(src, dst, 17, udp.len(), 1, 0, false);
    packet.extend_from_slice(&udp);
    ethernet(packet)
}

/// IPv4 packet carrying one fragment of a datagram (no link header)
pub fn ipv4_fragment(
    src: &str,
    dst: &str,
    id: u16,
    offset_words: u16,
    more: bool,
    payload: &[u8],
) -> Vec<u8> {
    let mut packet = ipv4_header(
        src.parse().unwrap(),
        dst.parse().unwrap(),
        17,
        payload.len(),
        id,
        offset_words,
        more,
    );
    packet.extend_from_slice(payload);
    packet
}

/// Raw TCP segment (no IP header)
pub fn tcp_segment(
    sport: u16,
    dport: u16,
    seq: u32,
    fin: bool,
    rst: bool,
    payload: &[u8],
) -> Vec<u8> {
    let mut flags = 0x10u8; // ack
    if fin {
        flags |= 0x01;
    }
    if rst {
        flags |= 0x04;
    }
    let mut seg = Vec::new();
    seg.extend_from_slice(&sport.to_be_bytes());
    seg.extend_from_slice(&dport.to_be_bytes());
    seg.extend_from_slice(&seq.to_be_bytes());
    seg.extend_from_slice(&0u32.to_be_bytes()); // ack number
    seg.push(0x50); // data offset 5
    seg.push(flags);
    seg.extend_from_slice(&0xffffu16.to_be_bytes()); // window
    seg.extend_from_slice(&[0, 0, 0, 0]); // checksum + urgent
    seg.extend_from_slice(payload);
    seg
}

/// Complete Ethernet/IPv4/TCP frame
pub fn tcp_frame(
    src: &str,
    sport: u16,
    dst: &str,
    dport: u16,
    seq: u32,
    fin: bool,
    payload: &[u8],
) -> Vec<u8> {
    let seg = tcp_segment(sport, dport, seq, fin, false, payload);
    let mut packet = ipv4_header(src.parse().unwrap(), dst.parse().unwrap(), 6, seg.len(), 1, 0, false);
    packet.extend_from_slice(&seg);
    ethernet(packet)
}

/// Canned INVITE, optionally carrying an SDP body
pub fn sip_invite(
    call_id: &str,
    from_user: &str,
    to_user: &str,
    cseq: u32,
    sdp: Option<&str>,
) -> String {
    let body = sdp.unwrap_or("");
    let content_type = if sdp.is_some() {
        "Content-Type: application/sdp\r\n"
    } else {
        ""
    };
    format!(
        "INVITE sip:{to}@example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP host.example.com;branch=z9hG4bK{cid}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:{from}@example.com>;tag=tag-{from}\r\n\
         To: <sip:{to}@example.com>\r\n\
         Call-ID: {cid}\r\n\
         CSeq: {cseq} INVITE\r\n\
         Contact: <sip:{from}@host.example.com>\r\n\
         {ct}Content-Length: {len}\r\n\r\n{body}",
        to = to_user,
        from = from_user,
        cid = call_id,
        cseq = cseq,
        ct = content_type,
        len = body.len(),
        body = body,
    )
}

/// Canned non-INVITE request
pub fn sip_request(
    method: &str,
    call_id: &str,
    from_user: &str,
    to_user: &str,
    cseq: u32,
    extra_headers: &str,
) -> String {
    format!(
        "{method} sip:{to}@example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP host.example.com;branch=z9hG4bK{cid}-{cseq}\r\n\
         From: <sip:{from}@example.com>;tag=tag-{from}\r\n\
         To: <sip:{to}@example.com>;tag=tag-{to}\r\n\
         Call-ID: {cid}\r\n\
         CSeq: {cseq} {method}\r\n\
         {extra}Content-Length: 0\r\n\r\n",
        method = method,
        to = to_user,
        from = from_user,
        cid = call_id,
        cseq = cseq,
        extra = extra_headers,
    )
}

/// Canned response
pub fn sip_response(
    code: u16,
    reason: &str,
    call_id: &str,
    from_user: &str,
    to_user: &str,
    cseq: u32,
    cseq_method: &str,
) -> String {
    format!(
        "SIP/2.0 {code} {reason}\r\n\
         Via: SIP/2.0/UDP host.example.com;branch=z9hG4bK{cid}-{cseq}\r\n\
         From: <sip:{from}@example.com>;tag=tag-{from}\r\n\
         To: <sip:{to}@example.com>;tag=tag-{to}\r\n\
         Call-ID: {cid}\r\n\
         CSeq: {cseq} {cseq_method}\r\n\
         Content-Length: 0\r\n\r\n",
        code = code,
        reason = reason,
        cid = call_id,
        from = from_user,
        to = to_user,
        cseq = cseq,
        cseq_method = cseq_method,
    )
}

/// Build and fully dissect a UDP SIP packet
pub fn sip_packet(ts_usec: u64, src: &str, sport: u16, dst: &str, dport: u16, text: &str) -> Packet {
    let raw = udp_frame(src, sport, dst, dport, text.as_bytes());
    let mut packet = Packet::new(ts_usec, 1, raw);
    let mut chain = DissectorChain::new(DissectConfig::default());
    chain.dissect(&mut packet, ProtoId::Link);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sip_packet_builder_dissects() {
        let packet = sip_packet(
            42,
            "10.0.0.1", 5060,
            "10.0.0.2", 5060,
            &sip_invite("builder@x", "alice", "bob", 1, None),
        );
        assert!(packet.sip().is_some());
        assert_eq!(packet.ts_usec, 42);
    }
}
