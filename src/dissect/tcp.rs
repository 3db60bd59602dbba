//! TCP dissector with per-flow SIP reassembly
//!
//! Keeps one reassembly buffer per 4-tuple and feeds it to the SIP framer:
//! headers end at CRLFCRLF and the body length comes from Content-Length.
//! Flow state is discarded on FIN/RST and after [`FLOW_TIMEOUT`] idle. Flows
//! towards a known TLS endpoint bypass framing and go to the TLS dissector;
//! flows that upgraded to WebSocket are framed by the WebSocket dissector.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::core::address::Address;
use crate::core::packet::{Packet, ProtoData, ProtoId};
use super::{sip, ws, DissectOutput, Dissector};

/// Idle time after which a flow's reassembly state is dropped
pub const FLOW_TIMEOUT: Duration = Duration::from_secs(60);

/// Reassembly buffer cap per flow
const MAX_FLOW_BUFFER: usize = 64 * 1024;

const TLS_PORT: u16 = 5061;

/// Decoded TCP record
#[derive(Debug, Clone, Copy)]
pub struct TcpData {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub ack: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlowKey {
    src: IpAddr,
    sport: u16,
    dst: IpAddr,
    dport: u16,
}

struct TcpFlow {
    buf: Vec<u8>,
    last_seen: Instant,
    ws_upgraded: bool,
}

impl TcpFlow {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            last_seen: Instant::now(),
            ws_upgraded: false,
        }
    }
}

pub struct TcpDissector {
    flows: HashMap<FlowKey, TcpFlow>,
    tls_server: Option<Address>,
    seen: u64,
    /// Messages beyond the first framed from the current segment
    ready: Vec<DissectOutput>,
}

impl TcpDissector {
    pub fn new(tls_server: Option<Address>) -> Self {
        Self {
            flows: HashMap::new(),
            tls_server,
            seen: 0,
            ready: Vec::new(),
        }
    }

    /// Drain the pipelined messages left over from the last segment
    pub fn take_ready(&mut self) -> Vec<DissectOutput> {
        std::mem::take(&mut self.ready)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    fn cleanup_idle(&mut self) {
        let now = Instant::now();
        self.flows.retain(|_, f| now.duration_since(f.last_seen) < FLOW_TIMEOUT);
    }

    fn is_tls_flow(&self, packet: &Packet, sport: u16, dport: u16) -> bool {
        if sport == TLS_PORT || dport == TLS_PORT {
            return true;
        }
        if let Some(server) = &self.tls_server {
            let src = packet.src();
            let dst = packet.dst();
            return server.same_endpoint(&src) || server.same_endpoint(&dst);
        }
        false
    }

    /// Consume the HTTP upgrade handshake when present, marking the flow
    fn check_ws_upgrade(flow: &mut TcpFlow) {
        let head_end = match find_crlfcrlf(&flow.buf) {
            Some(end) => end,
            None => return,
        };
        let head = String::from_utf8_lossy(&flow.buf[..head_end]).to_ascii_lowercase();
        if (head.starts_with("get ") && head.contains("upgrade: websocket"))
            || head.starts_with("http/1.1 101")
        {
            flow.buf.drain(..head_end);
            flow.ws_upgraded = true;
        }
    }
}

impl Dissector for TcpDissector {
    fn id(&self) -> ProtoId {
        ProtoId::Tcp
    }

    fn dissect(&mut self, packet: &mut Packet, data: &[u8]) -> Option<DissectOutput> {
        if data.len() < 20 {
            return None;
        }
        let sport = u16::from_be_bytes([data[0], data[1]]);
        let dport = u16::from_be_bytes([data[2], data[3]]);
        let seq = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let data_offset = ((data[12] >> 4) as usize) * 4;
        if data_offset < 20 || data_offset > data.len() {
            return None;
        }
        let flags = data[13];
        let (fin, syn, rst, ack) = (
            flags & 0x01 != 0,
            flags & 0x02 != 0,
            flags & 0x04 != 0,
            flags & 0x10 != 0,
        );

        packet.set_proto(ProtoData::Tcp(TcpData { sport, dport, seq, fin, syn, rst, ack }));

        let payload = &data[data_offset..];

        self.seen += 1;
        if self.seen % 256 == 0 {
            self.cleanup_idle();
        }

        if self.is_tls_flow(packet, sport, dport) {
            if payload.is_empty() {
                return None;
            }
            return Some(DissectOutput::new(ProtoId::Tls, payload.to_vec()));
        }

        let ip = packet.ip()?;
        let key = FlowKey { src: ip.src, sport, dst: ip.dst, dport };

        if rst || (fin && payload.is_empty()) {
            self.flows.remove(&key);
            trace!(%key.src, sport, "tcp flow closed");
            return None;
        }
        if payload.is_empty() {
            return None;
        }

        let flow = self.flows.entry(key.clone()).or_insert_with(TcpFlow::new);
        flow.last_seen = Instant::now();
        flow.buf.extend_from_slice(payload);
        if flow.buf.len() > MAX_FLOW_BUFFER {
            // Runaway non-SIP flow: stop tracking it
            self.flows.remove(&key);
            return None;
        }

        if !flow.ws_upgraded {
            Self::check_ws_upgrade(flow);
        }

        // Drain every complete message; a segment may carry several
        // pipelined ones, and a FIN teardown must not lose the tail
        let mut outs: Vec<DissectOutput> = Vec::new();
        if flow.ws_upgraded {
            while let Some(len) = ws::complete_frame_len(&flow.buf) {
                let frame: Vec<u8> = flow.buf.drain(..len).collect();
                outs.push(DissectOutput::new(ProtoId::Ws, frame));
            }
        } else if sip::probe(&flow.buf) {
            while sip::probe(&flow.buf) {
                match sip_message_len(&flow.buf) {
                    Some(len) => {
                        let msg: Vec<u8> = flow.buf.drain(..len).collect();
                        outs.push(DissectOutput::new(ProtoId::Sip, msg));
                    }
                    None => break,
                }
            }
        } else if find_crlfcrlf(&flow.buf).is_some() {
            // Complete non-SIP header block: this flow is not for us
            self.flows.remove(&key);
        }

        if fin {
            self.flows.remove(&key);
        }

        let mut outs = outs.into_iter();
        let first = outs.next();
        self.ready.extend(outs);
        first
    }
}

fn find_crlfcrlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Byte length of the first complete SIP message in `buf`, if any
///
/// Headers end at CRLFCRLF; the body length is taken from Content-Length
/// (long or compact `l` form). Without the header the message is headers
/// only.
pub fn sip_message_len(buf: &[u8]) -> Option<usize> {
    let head_end = find_crlfcrlf(buf)?;
    let head = std::str::from_utf8(&buf[..head_end]).ok()?;

    let mut content_length = 0usize;
    for line in head.split("\r\n").skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
                content_length = value.trim().parse().ok()?;
                break;
            }
        }
    }

    let total = head_end + content_length;
    (buf.len() >= total).then_some(total)
}
