//! SIP dissector
//!
//! Parses the start line, the dialog-identifying headers (Call-ID, From, To,
//! CSeq) and the body envelope. Bodies advertised as `application/sdp` are
//! handed to the SDP dissector. Replaces and Refer-To headers yield the
//! Call-ID of a related dialog, which storage uses to cross-link calls.

use tracing::trace;

use crate::core::packet::{Packet, ProtoData, ProtoId};
use super::{DissectOutput, Dissector};

/// SIP request methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Register,
    Subscribe,
    Notify,
    Publish,
    Message,
    Info,
    Refer,
    Update,
    Prack,
}

impl SipMethod {
    pub const ALL: [SipMethod; 14] = [
        SipMethod::Invite,
        SipMethod::Ack,
        SipMethod::Bye,
        SipMethod::Cancel,
        SipMethod::Options,
        SipMethod::Register,
        SipMethod::Subscribe,
        SipMethod::Notify,
        SipMethod::Publish,
        SipMethod::Message,
        SipMethod::Info,
        SipMethod::Refer,
        SipMethod::Update,
        SipMethod::Prack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Options => "OPTIONS",
            SipMethod::Register => "REGISTER",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Publish => "PUBLISH",
            SipMethod::Message => "MESSAGE",
            SipMethod::Info => "INFO",
            SipMethod::Refer => "REFER",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.as_str() == token)
    }
}

impl std::fmt::Display for SipMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request or response discriminator of a parsed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipKind {
    Request { method: SipMethod, uri: String },
    Response { code: u16, reason: String },
}

impl SipKind {
    pub fn method(&self) -> Option<SipMethod> {
        match self {
            SipKind::Request { method, .. } => Some(*method),
            SipKind::Response { .. } => None,
        }
    }

    pub fn response_code(&self) -> Option<u16> {
        match self {
            SipKind::Response { code, .. } => Some(*code),
            SipKind::Request { .. } => None,
        }
    }
}

/// One side of a dialog as carried in a From/To header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SipParty {
    pub uri: String,
    pub user: String,
    pub tag: Option<String>,
}

/// Decoded SIP record
#[derive(Debug, Clone)]
pub struct SipData {
    pub kind: SipKind,
    pub call_id: String,
    pub from: SipParty,
    pub to: SipParty,
    pub cseq: u32,
    pub cseq_method: SipMethod,
    pub content_type: Option<String>,
    /// Call-ID of a dialog this message replaces or refers to
    pub refers: Option<String>,
    /// Complete message text as it appeared on the wire
    pub payload: String,
}

impl SipData {
    pub fn is_request(&self) -> bool {
        matches!(self.kind, SipKind::Request { .. })
    }

    pub fn has_sdp(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().contains("application/sdp"))
            .unwrap_or(false)
    }

    /// Method of a request, or "code reason" summary of a response
    pub fn summary(&self) -> String {
        match &self.kind {
            SipKind::Request { method, .. } => method.to_string(),
            SipKind::Response { code, reason } => format!("{} {}", code, reason),
        }
    }
}

/// Quick check that a payload starts like a SIP message
pub fn probe(payload: &[u8]) -> bool {
    let head = match std::str::from_utf8(payload.get(..24).unwrap_or(payload)) {
        Ok(s) => s,
        Err(_) => return false,
    };
    if head.starts_with("SIP/2.0 ") {
        return true;
    }
    match head.split_once(' ') {
        Some((token, _)) => SipMethod::from_token(token).is_some(),
        None => false,
    }
}

/// Parse a complete SIP message
pub fn parse(text: &str) -> Option<SipData> {
    let head = match text.split_once("\r\n\r\n") {
        Some((h, _)) => h,
        None => text,
    };
    let mut lines = head.split("\r\n");
    let start = lines.next()?;

    let kind = if let Some(rest) = start.strip_prefix("SIP/2.0 ") {
        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        SipKind::Response {
            code: code.parse().ok().filter(|c| (100..700).contains(c))?,
            reason: reason.to_string(),
        }
    } else {
        let mut parts = start.split_whitespace();
        let method = SipMethod::from_token(parts.next()?)?;
        let uri = parts.next()?.to_string();
        if parts.next() != Some("SIP/2.0") {
            return None;
        }
        SipKind::Request { method, uri }
    };

    let mut call_id = None;
    let mut from = SipParty::default();
    let mut to = SipParty::default();
    let mut cseq = None;
    let mut content_type = None;
    let mut refers = None;

    for line in lines {
        let (name, value) = match line.split_once(':') {
            Some((n, v)) => (n.trim(), v.trim()),
            None => continue,
        };
        if eq_header(name, "Call-ID", "i") {
            call_id = Some(value.to_string());
        } else if eq_header(name, "From", "f") {
            from = parse_party(value);
        } else if eq_header(name, "To", "t") {
            to = parse_party(value);
        } else if name.eq_ignore_ascii_case("CSeq") {
            let (num, method) = value.split_once(' ')?;
            cseq = Some((num.trim().parse::<u32>().ok()?, SipMethod::from_token(method.trim())?));
        } else if eq_header(name, "Content-Type", "c") {
            content_type = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("Replaces") {
            refers = refers.or_else(|| Some(replaces_call_id(value)));
        } else if eq_header(name, "Refer-To", "r") || eq_header(name, "Contact", "m") {
            refers = refers.or_else(|| embedded_replaces(value));
        }
    }

    let (cseq, cseq_method) = cseq?;

    Some(SipData {
        kind,
        call_id: call_id?,
        from,
        to,
        cseq,
        cseq_method,
        content_type,
        refers,
        payload: text.to_string(),
    })
}

fn eq_header(name: &str, long: &str, compact: &str) -> bool {
    name.eq_ignore_ascii_case(long) || name.eq_ignore_ascii_case(compact)
}

/// Parse a From/To header value into uri, user and tag
fn parse_party(value: &str) -> SipParty {
    let (uri, params) = match (value.find('<'), value.find('>')) {
        (Some(open), Some(close)) if open < close => {
            (&value[open + 1..close], &value[close + 1..])
        }
        _ => match value.split_once(';') {
            Some((uri, params)) => (uri, params),
            None => (value, ""),
        },
    };

    let bare = uri
        .trim_start_matches("sips:")
        .trim_start_matches("sip:")
        .trim_start_matches("tel:");
    let user = match bare.split_once('@') {
        Some((user, _)) => user,
        None => bare.split(|c| c == ';' || c == '>').next().unwrap_or(bare),
    };

    let tag = params
        .split(';')
        .filter_map(|p| p.trim().strip_prefix("tag="))
        .next()
        .map(|t| t.to_string());

    SipParty {
        uri: uri.trim().to_string(),
        user: user.trim().to_string(),
        tag,
    }
}

/// Call-ID portion of a Replaces header value
fn replaces_call_id(value: &str) -> String {
    value.split(';').next().unwrap_or(value).trim().to_string()
}

/// Call-ID from a `Replaces=` URI header embedded in Refer-To or a 3xx Contact
fn embedded_replaces(value: &str) -> Option<String> {
    let lower = value.to_ascii_lowercase();
    let start = lower.find("replaces=")? + "replaces=".len();
    let rest = &value[start..];
    let end = rest
        .find(|c| c == '&' || c == '>' || c == ';')
        .unwrap_or(rest.len());
    let decoded = percent_decode(&rest[..end]);
    Some(replaces_call_id(&decoded))
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(b) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub struct SipDissector;

impl SipDissector {
    pub fn new() -> Self {
        Self
    }
}

impl Dissector for SipDissector {
    fn id(&self) -> ProtoId {
        ProtoId::Sip
    }

    fn dissect(&mut self, packet: &mut Packet, data: &[u8]) -> Option<DissectOutput> {
        let text = std::str::from_utf8(data).ok()?;
        let sip = parse(text)?;
        trace!(call_id = %sip.call_id, msg = %sip.summary(), "sip message");

        let body = text
            .split_once("\r\n\r\n")
            .map(|(_, b)| b.as_bytes().to_vec())
            .unwrap_or_default();
        let wants_sdp = sip.has_sdp() && !body.is_empty();

        packet.set_proto(ProtoData::Sip(sip));

        wants_sdp.then(|| DissectOutput::new(ProtoId::Sdp, body))
    }
}
