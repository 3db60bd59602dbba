//! Call storage and indexing
//!
//! Interns dissected SIP messages into calls keyed by Call-ID, cross-links
//! related dialogs, applies the configured filters, keeps a sort-ordered
//! view for presentation and enforces the memory cap by evicting the oldest
//! terminal calls. The store is serialized by a mutex owned by the caller;
//! the presentation thread snapshots under that lock and compares the
//! [`Storage::calls_changed`] generation counter to decide redraws.

pub mod call;
pub mod filter;
pub mod group;
pub mod message;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info};

use crate::core::address::Address;
use crate::core::packet::Packet;
use crate::dissect::sip::{SipKind, SipMethod};

pub use call::{Call, CallState, RtpStream};
pub use filter::{CompiledFilter, FilterError};
pub use group::CallGroup;
pub use message::Message;

use call::CALL_OVERHEAD;
use message::MESSAGE_OVERHEAD;

/// Behaviour knobs consumed from the configuration record
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Retained memory cap in bytes, 0 = unbounded
    pub memory_limit: usize,
    /// Retained call cap, 0 = unbounded
    pub call_limit: usize,
    /// Accepted request methods, empty = all
    pub methods: Vec<SipMethod>,
    /// Payload pre-filter: messages not matching are dropped
    pub payload_regex: Option<Regex>,
    /// Only track dialogs opened by INVITE
    pub invite_only: bool,
    /// Only terminal calls are written by the save exporters
    pub complete_only: bool,
}

/// Counters exposed to the presentation layer
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageStats {
    /// Calls ever seen since startup
    pub total: u64,
    /// Calls currently retained
    pub retained: usize,
    /// Retained calls matching the active display filter
    pub displayed: usize,
    /// Approximate retained bytes
    pub mem_bytes: usize,
    /// Configured memory cap, 0 = unbounded
    pub mem_limit: usize,
}

/// Sortable call attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortAttr {
    /// First-timestamp / arrival order
    Index,
    SrcUser,
    DstUser,
    State,
    Method,
    MsgCnt,
}

/// Active sort key
#[derive(Debug, Clone, Copy)]
pub struct SortConfig {
    pub attr: SortAttr,
    pub asc: bool,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self { attr: SortAttr::Index, asc: true }
    }
}

/// The call table and its indexes
pub struct Storage {
    opts: StorageOptions,
    calls: HashMap<String, Call>,
    /// Call-IDs in presentation order under the active sort
    order: Vec<String>,
    sort: SortConfig,
    /// Call-IDs referenced before their dialog was seen → referrers
    pending_links: HashMap<String, Vec<String>>,
    /// Advertised media endpoint → owning Call-ID
    stream_index: HashMap<Address, String>,
    display_filter: Option<Arc<CompiledFilter>>,
    filter_cache: HashMap<String, Arc<CompiledFilter>>,
    paused: bool,
    changed: u64,
    mem_bytes: usize,
    total_calls: u64,
    /// Packets dropped because the memory cap had no terminal call to evict
    pub dropped_nomem: u64,
    next_call_seq: u64,
    next_msg_seq: u64,
}

impl Storage {
    pub fn new(opts: StorageOptions) -> Self {
        Self {
            opts,
            calls: HashMap::new(),
            order: Vec::new(),
            sort: SortConfig::default(),
            pending_links: HashMap::new(),
            stream_index: HashMap::new(),
            display_filter: None,
            filter_cache: HashMap::new(),
            paused: false,
            changed: 0,
            mem_bytes: 0,
            total_calls: 0,
            dropped_nomem: 0,
            next_call_seq: 0,
            next_msg_seq: 0,
        }
    }

    pub fn options(&self) -> &StorageOptions {
        &self.opts
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Generation counter, bumped on every visible mutation
    pub fn calls_changed(&self) -> u64 {
        self.changed
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            total: self.total_calls,
            retained: self.calls.len(),
            displayed: self.calls.values().filter(|c| c.displayed).count(),
            mem_bytes: self.mem_bytes,
            mem_limit: self.opts.memory_limit,
        }
    }

    pub fn call(&self, call_id: &str) -> Option<&Call> {
        self.calls.get(call_id)
    }

    /// All retained calls in presentation order
    pub fn calls(&self) -> impl Iterator<Item = &Call> {
        self.order.iter().filter_map(|id| self.calls.get(id))
    }

    /// Calls matching the active display filter, in presentation order
    pub fn displayed_calls(&self) -> Vec<&Call> {
        self.calls().filter(|c| c.displayed).collect()
    }

    /// Packets of retained calls for the save exporters, in capture order,
    /// honoring the complete-only matching option
    pub fn export_packets(&self) -> Vec<&Packet> {
        let mut packets: Vec<&Packet> = self
            .calls()
            .filter(|c| !self.opts.complete_only || c.is_terminal())
            .flat_map(|c| c.messages().iter().map(|m| m.packet()))
            .collect();
        packets.sort_by_key(|p| p.ts_usec);
        packets
    }

    /// Sole ingestion entry point: intern a dissected packet
    pub fn append(&mut self, packet: Packet) {
        if self.paused {
            return;
        }
        // media frames update their stream's counters, then drop; any other
        // packet without a SIP record is dropped outright
        if packet.rtp().is_some() || packet.rtcp().is_some() {
            self.append_media(&packet);
            return;
        }
        let sip = match packet.sip() {
            Some(sip) => sip,
            None => return,
        };

        if let Some(re) = &self.opts.payload_regex {
            if !re.is_match(&sip.payload) {
                return;
            }
        }
        let is_new = !self.calls.contains_key(&sip.call_id);
        if let SipKind::Request { method, .. } = &sip.kind {
            if !self.opts.methods.is_empty() && !self.opts.methods.contains(method) {
                return;
            }
            if is_new && self.opts.invite_only && *method != SipMethod::Invite {
                return;
            }
        } else if is_new && self.opts.invite_only {
            return;
        }

        let call_id = sip.call_id.clone();
        let refers = sip.refers.clone();

        // Memory cap: make room by evicting terminal calls, oldest first
        let add = packet.raw.len()
            + MESSAGE_OVERHEAD
            + if is_new { CALL_OVERHEAD } else { 0 };
        if self.opts.memory_limit > 0 {
            while self.mem_bytes + add > self.opts.memory_limit {
                if !self.evict_oldest_terminal() {
                    self.dropped_nomem += 1;
                    debug!(call_id = %call_id, "memory limit reached, packet dropped");
                    return;
                }
            }
        }
        if is_new && self.opts.call_limit > 0 && self.calls.len() >= self.opts.call_limit {
            if !self.evict_oldest_terminal() {
                self.dropped_nomem += 1;
                return;
            }
        }

        // eviction may have taken this message's own (terminal) call with it
        let is_new = !self.calls.contains_key(&call_id);
        let add = packet.raw.len()
            + MESSAGE_OVERHEAD
            + if is_new { CALL_OVERHEAD } else { 0 };

        let msg = match Message::from_packet(packet, self.next_msg_seq) {
            Some(msg) => msg,
            None => return,
        };
        self.next_msg_seq += 1;

        if is_new {
            self.total_calls += 1;
            let call = Call::new(call_id.clone(), self.next_call_seq);
            self.next_call_seq += 1;
            self.calls.insert(call_id.clone(), call);

            // Dialogs that referenced this Call-ID before it existed
            if let Some(referrers) = self.pending_links.remove(&call_id) {
                for referrer in referrers {
                    self.link_calls(&call_id, &referrer);
                }
            }
        }

        let call = self.calls.get_mut(&call_id).expect("call just ensured");
        call.push_message(msg);
        self.mem_bytes += add;

        self.register_streams(&call_id);

        if let Some(referenced) = refers {
            if self.calls.contains_key(&referenced) {
                self.link_calls(&call_id, &referenced);
            } else {
                self.pending_links
                    .entry(referenced)
                    .or_default()
                    .push(call_id.clone());
            }
        }

        let filter = self.display_filter.clone();
        let call = self.calls.get_mut(&call_id).expect("call present");
        call.displayed = filter.map(|f| f.matches_call(call)).unwrap_or(true);

        if is_new {
            self.order_insert(&call_id);
        } else if matches!(self.sort.attr, SortAttr::State | SortAttr::MsgCnt) {
            self.order_reposition(&call_id);
        }

        self.changed += 1;
    }

    /// Count an RTP/RTCP frame against the stream its SDP advertised
    fn append_media(&mut self, packet: &Packet) {
        let dst = packet.dst();
        let key = Address::udp(dst.ip, dst.port);
        if let Some(call_id) = self.stream_index.get(&key) {
            if let Some(call) = self.calls.get_mut(call_id) {
                if let Some(stream) = call
                    .streams
                    .iter_mut()
                    .find(|s| s.addr.same_endpoint(&dst))
                {
                    stream.packets += 1;
                    self.changed += 1;
                }
            }
        }
    }

    /// Index media endpoints announced by the call's latest message
    fn register_streams(&mut self, call_id: &str) {
        let call = match self.calls.get_mut(call_id) {
            Some(call) => call,
            None => return,
        };
        let msg = match call.messages().last() {
            Some(msg) => msg,
            None => return,
        };

        let mut new_streams = Vec::new();
        for media in msg.medias() {
            let addr = match media.address {
                Some(addr) => addr,
                None => continue,
            };
            if !call.streams.iter().any(|s| s.addr.same_endpoint(&addr)) {
                new_streams.push(RtpStream {
                    addr,
                    mtype: media.mtype,
                    format: media.first_format().map(|f| f.to_string()),
                    packets: 0,
                });
            }
        }
        for stream in new_streams {
            self.stream_index
                .insert(Address::udp(stream.addr.ip, stream.addr.port), call_id.to_string());
            if let Some(call) = self.calls.get_mut(call_id) {
                call.streams.push(stream);
            }
        }
    }

    /// Symmetric cross-link between two dialogs
    fn link_calls(&mut self, a: &str, b: &str) {
        if a == b {
            return;
        }
        if let Some(call) = self.calls.get_mut(a) {
            call.xcalls.insert(b.to_string());
        }
        if let Some(call) = self.calls.get_mut(b) {
            call.xcalls.insert(a.to_string());
        }
    }

    /// Evict the terminal call with the oldest first-timestamp
    fn evict_oldest_terminal(&mut self) -> bool {
        let victim = self
            .calls
            .values()
            .filter(|c| c.is_terminal())
            .min_by_key(|c| (c.first_ts, c.seq))
            .map(|c| c.call_id.clone());

        match victim {
            Some(call_id) => {
                info!(call_id = %call_id, "evicting terminal call");
                self.remove_call(&call_id);
                true
            }
            None => false,
        }
    }

    /// Remove a call and purge every reference to it
    fn remove_call(&mut self, call_id: &str) {
        let call = match self.calls.remove(call_id) {
            Some(call) => call,
            None => return,
        };
        self.mem_bytes = self.mem_bytes.saturating_sub(call.mem_bytes());

        for peer in &call.xcalls {
            if let Some(other) = self.calls.get_mut(peer) {
                other.xcalls.remove(call_id);
            }
        }
        self.stream_index.retain(|_, owner| owner != call_id);
        for referrers in self.pending_links.values_mut() {
            referrers.retain(|r| r != call_id);
        }
        self.pending_links.retain(|_, v| !v.is_empty());
        if let Some(pos) = self.order.iter().position(|id| id == call_id) {
            self.order.remove(pos);
        }
        self.changed += 1;
    }

    /// Remove calls hidden by the active filter
    pub fn soft_clear(&mut self) {
        let hidden: Vec<String> = self
            .calls
            .values()
            .filter(|c| !c.displayed)
            .map(|c| c.call_id.clone())
            .collect();
        for call_id in hidden {
            self.remove_call(&call_id);
        }
    }

    /// Remove every retained call
    pub fn hard_clear(&mut self) {
        self.calls.clear();
        self.order.clear();
        self.stream_index.clear();
        self.pending_links.clear();
        self.mem_bytes = 0;
        self.changed += 1;
    }

    /// Install a display filter; empty expression clears it
    pub fn set_display_filter(&mut self, expr: &str) -> Result<(), FilterError> {
        let normalized = filter::normalize(expr);
        if normalized.is_empty() {
            self.display_filter = None;
        } else {
            let compiled = match self.filter_cache.get(&normalized) {
                Some(cached) => cached.clone(),
                None => {
                    let compiled = Arc::new(CompiledFilter::compile(&normalized)?);
                    if self.filter_cache.len() >= 32 {
                        self.filter_cache.clear();
                    }
                    self.filter_cache.insert(normalized, compiled.clone());
                    compiled
                }
            };
            self.display_filter = Some(compiled);
        }

        let filter = self.display_filter.clone();
        for call in self.calls.values_mut() {
            call.displayed = filter.as_ref().map(|f| f.matches_call(call)).unwrap_or(true);
        }
        self.changed += 1;
        Ok(())
    }

    /// Change the sort key; the view is re-sorted stably
    pub fn set_sort(&mut self, sort: SortConfig) {
        self.sort = sort;
        let calls = &self.calls;
        self.order
            .sort_by(|a, b| cmp_ids(calls, sort, a.as_str(), b.as_str()));
        self.changed += 1;
    }

    pub fn sort(&self) -> SortConfig {
        self.sort
    }

    fn order_insert(&mut self, call_id: &str) {
        let calls = &self.calls;
        let sort = self.sort;
        let pos = self
            .order
            .binary_search_by(|probe| cmp_ids(calls, sort, probe.as_str(), call_id))
            .unwrap_or_else(|p| p);
        self.order.insert(pos, call_id.to_string());
    }

    fn order_reposition(&mut self, call_id: &str) {
        if let Some(pos) = self.order.iter().position(|id| id == call_id) {
            self.order.remove(pos);
            self.order_insert(call_id);
        }
    }
}

fn attr_key(call: &Call, attr: SortAttr) -> (u64, String) {
    match attr {
        SortAttr::Index => (call.seq, String::new()),
        SortAttr::SrcUser => (0, call.src_user().to_string()),
        SortAttr::DstUser => (0, call.dst_user().to_string()),
        SortAttr::State => (0, call.state.as_str().to_string()),
        SortAttr::Method => (0, call.method().to_string()),
        SortAttr::MsgCnt => (call.msgcnt() as u64, String::new()),
    }
}

fn cmp_ids(calls: &HashMap<String, Call>, sort: SortConfig, a: &str, b: &str) -> Ordering {
    let (ca, cb) = match (calls.get(a), calls.get(b)) {
        (Some(ca), Some(cb)) => (ca, cb),
        _ => return Ordering::Equal,
    };
    let ordering = attr_key(ca, sort.attr)
        .cmp(&attr_key(cb, sort.attr))
        .then(ca.seq.cmp(&cb.seq));
    if sort.asc {
        ordering
    } else {
        ordering.reverse()
    }
}
