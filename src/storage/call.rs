//! Call dialogs and their state machine
//!
//! A [`Call`] is the set of messages sharing a Call-ID plus derived state:
//! the dialog state machine, first/last/answer/end timestamps, the media
//! streams advertised in SDP and the Call-IDs of related dialogs (attended
//! transfers).

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::core::address::{Address, Transport};
use crate::dissect::sdp::SdpMediaType;
use crate::dissect::sip::{SipKind, SipMethod};
use super::message::Message;

/// Fixed per-call accounting overhead
pub const CALL_OVERHEAD: usize = 256;

/// Dialog state derived from the SIP method/status sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Calling,
    Incoming,
    Outgoing,
    InCall,
    Completed,
    Cancelled,
    Rejected,
    BusyLine,
    Diverted,
    RecvBye,
    SendBye,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Completed
                | CallState::Cancelled
                | CallState::Rejected
                | CallState::BusyLine
                | CallState::Diverted
                | CallState::RecvBye
                | CallState::SendBye
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Calling => "CALLING",
            CallState::Incoming => "INCOMING",
            CallState::Outgoing => "OUTGOING",
            CallState::InCall => "IN CALL",
            CallState::Completed => "COMPLETED",
            CallState::Cancelled => "CANCELLED",
            CallState::Rejected => "REJECTED",
            CallState::BusyLine => "BUSY",
            CallState::Diverted => "DIVERTED",
            CallState::RecvBye => "RECV BYE",
            CallState::SendBye => "SEND BYE",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A media stream advertised by a call's SDP
#[derive(Debug, Clone)]
pub struct RtpStream {
    pub addr: Address,
    pub mtype: SdpMediaType,
    /// Preferred format name, e.g. "PCMU/8000"
    pub format: Option<String>,
    /// RTP frames matched against this stream so far
    pub packets: u64,
}

/// One SIP dialog: all messages sharing a Call-ID plus derived state
#[derive(Debug, Clone)]
pub struct Call {
    pub call_id: String,
    messages: Vec<Message>,
    pub state: CallState,
    pub first_ts: u64,
    pub last_ts: u64,
    pub answer_ts: Option<u64>,
    pub end_ts: Option<u64>,
    /// Call-IDs of related dialogs (Replaces / Refer-To peers)
    pub xcalls: BTreeSet<String>,
    /// Media streams announced in this dialog's SDP bodies
    pub streams: Vec<RtpStream>,
    /// Matches the active display filter
    pub displayed: bool,
    /// Insertion sequence, used for ordering tie-breaks
    pub seq: u64,
    caller: Address,
    mem_bytes: usize,
}

impl Call {
    pub fn new(call_id: String, seq: u64) -> Self {
        Self {
            call_id,
            messages: Vec::new(),
            state: CallState::Calling,
            first_ts: 0,
            last_ts: 0,
            answer_ts: None,
            end_ts: None,
            xcalls: BTreeSet::new(),
            streams: Vec::new(),
            displayed: true,
            seq,
            caller: Address::unspecified(),
            mem_bytes: CALL_OVERHEAD,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn msgcnt(&self) -> usize {
        self.messages.len()
    }

    pub fn mem_bytes(&self) -> usize {
        self.mem_bytes
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// User part of the initial From header
    pub fn src_user(&self) -> &str {
        self.messages.first().map(|m| m.from.user.as_str()).unwrap_or("")
    }

    /// User part of the initial To header
    pub fn dst_user(&self) -> &str {
        self.messages.first().map(|m| m.to.user.as_str()).unwrap_or("")
    }

    /// Method that opened the dialog
    pub fn method(&self) -> SipMethod {
        self.messages
            .first()
            .map(|m| m.method().unwrap_or(m.cseq_method))
            .unwrap_or(SipMethod::Invite)
    }

    pub fn transport(&self) -> Transport {
        self.messages
            .first()
            .map(|m| m.packet().transport())
            .unwrap_or_default()
    }

    /// Wall-clock start of the dialog
    pub fn start_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.first_ts as i64).unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Total dialog duration: last message minus first message
    pub fn totaldur_usec(&self) -> u64 {
        self.last_ts.saturating_sub(self.first_ts)
    }

    /// Conversation duration: end of call minus answer
    pub fn convdur_usec(&self) -> u64 {
        match (self.answer_ts, self.end_ts) {
            (Some(answer), Some(end)) => end.saturating_sub(answer),
            _ => 0,
        }
    }

    /// True when an identical message (same CSeq, same kind) was already seen
    fn is_retransmission(&self, msg: &Message) -> bool {
        self.messages.iter().any(|m| {
            m.cseq == msg.cseq && m.cseq_method == msg.cseq_method && m.kind == msg.kind
        })
    }

    /// Append a message, keeping timestamps and the state machine current
    ///
    /// Messages arrive in capture order; timestamps are non-decreasing within
    /// a flow, ties keep arrival order.
    pub fn push_message(&mut self, msg: Message) {
        let retransmission = self.is_retransmission(&msg);

        if self.messages.is_empty() {
            self.first_ts = msg.ts_usec();
            self.caller = msg.src;
        }
        self.last_ts = self.last_ts.max(msg.ts_usec());
        self.mem_bytes += msg.approx_size();

        if !retransmission {
            self.update_state(&msg);
        }
        self.messages.push(msg);
    }

    fn update_state(&mut self, msg: &Message) {
        let from_caller = msg.src.same_endpoint(&self.caller);

        match &msg.kind {
            SipKind::Request { method, .. } => match method {
                SipMethod::Invite if self.messages.is_empty() => {
                    self.state = CallState::Calling;
                }
                SipMethod::Cancel if !self.state.is_terminal() => {
                    self.state = CallState::Cancelled;
                    self.end_ts = Some(msg.ts_usec());
                }
                SipMethod::Bye if !self.state.is_terminal() => {
                    self.state = if from_caller {
                        CallState::SendBye
                    } else {
                        CallState::RecvBye
                    };
                    self.end_ts = Some(msg.ts_usec());
                }
                _ => {}
            },
            SipKind::Response { code, .. } => {
                let code = *code;
                if msg.cseq_method == SipMethod::Bye {
                    if (200..300).contains(&code)
                        && matches!(self.state, CallState::SendBye | CallState::RecvBye)
                    {
                        self.state = CallState::Completed;
                    }
                    return;
                }
                if msg.cseq_method != SipMethod::Invite || self.state.is_terminal() {
                    return;
                }
                match code {
                    101..=199 => {
                        self.state = if from_caller {
                            CallState::Incoming
                        } else {
                            CallState::Outgoing
                        };
                    }
                    200..=299 => {
                        self.state = CallState::InCall;
                        self.answer_ts = Some(msg.ts_usec());
                    }
                    300..=399 => {
                        self.state = CallState::Diverted;
                        self.end_ts = Some(msg.ts_usec());
                    }
                    486 | 600 => {
                        self.state = CallState::BusyLine;
                        self.end_ts = Some(msg.ts_usec());
                    }
                    487 => {
                        self.state = CallState::Cancelled;
                        self.end_ts = Some(msg.ts_usec());
                    }
                    400..=699 => {
                        self.state = CallState::Rejected;
                        self.end_ts = Some(msg.ts_usec());
                    }
                    _ => {}
                }
            }
        }
    }
}
