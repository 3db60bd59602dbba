//! Display filter engine
//!
//! Compiles a user expression into a predicate tree over call and message
//! attributes. The display language is one or more whitespace-separated
//! terms combined with AND: each term is `[-][column:][~]value`, where `-`
//! negates, `~` switches the match from case-insensitive substring to regex,
//! and the column is one of callid, from, to, src, dst, method, state or
//! duration. A bare value matches any column. Duration terms compare
//! numerically with a `>`, `<` or `=` prefix on the value.
//!
//! Evaluation is pure; compiled filters are hashable by their normalized
//! source and cached by storage.

use std::hash::{Hash, Hasher};

use regex::{Regex, RegexBuilder};
use thiserror::Error;

use super::call::Call;
use super::message::Message;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("empty filter expression")]
    Empty,
    #[error("unknown filter column: {0}")]
    UnknownColumn(String),
    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("invalid numeric comparison: {0}")]
    BadNumber(String),
}

/// Attribute a predicate reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAttr {
    CallId,
    From,
    To,
    Src,
    Dst,
    Method,
    State,
    Duration,
    Payload,
    /// Any of the display columns
    Any,
}

impl FilterAttr {
    fn from_column(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "callid" | "call-id" => Some(FilterAttr::CallId),
            "from" => Some(FilterAttr::From),
            "to" => Some(FilterAttr::To),
            "src" => Some(FilterAttr::Src),
            "dst" => Some(FilterAttr::Dst),
            "method" => Some(FilterAttr::Method),
            "state" => Some(FilterAttr::State),
            "duration" => Some(FilterAttr::Duration),
            "payload" => Some(FilterAttr::Payload),
            _ => None,
        }
    }

    fn value(&self, call: &Call, msg: &Message) -> String {
        match self {
            FilterAttr::CallId => call.call_id.clone(),
            FilterAttr::From => msg.from.user.clone(),
            FilterAttr::To => msg.to.user.clone(),
            FilterAttr::Src => msg.src.to_string(),
            FilterAttr::Dst => msg.dst.to_string(),
            FilterAttr::Method => call.method().to_string(),
            FilterAttr::State => call.state.as_str().to_string(),
            FilterAttr::Duration => (call.totaldur_usec() / 1_000_000).to_string(),
            FilterAttr::Payload => msg.payload().to_string(),
            FilterAttr::Any => String::new(),
        }
    }
}

const ANY_COLUMNS: [FilterAttr; 7] = [
    FilterAttr::CallId,
    FilterAttr::From,
    FilterAttr::To,
    FilterAttr::Src,
    FilterAttr::Dst,
    FilterAttr::Method,
    FilterAttr::State,
];

/// Comparison applied to an attribute value
#[derive(Debug, Clone)]
pub enum MatchOp {
    /// Case-insensitive substring
    Contains(String),
    /// Case-insensitive equality
    Equals(String),
    Regex(Regex),
    NumGt(i64),
    NumLt(i64),
    NumEq(i64),
}

impl MatchOp {
    fn eval(&self, value: &str) -> bool {
        match self {
            MatchOp::Contains(needle) => {
                value.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
            }
            MatchOp::Equals(expect) => value.eq_ignore_ascii_case(expect),
            MatchOp::Regex(re) => re.is_match(value),
            MatchOp::NumGt(n) => value.parse::<i64>().map(|v| v > *n).unwrap_or(false),
            MatchOp::NumLt(n) => value.parse::<i64>().map(|v| v < *n).unwrap_or(false),
            MatchOp::NumEq(n) => value.parse::<i64>().map(|v| v == *n).unwrap_or(false),
        }
    }
}

/// Predicate tree node
#[derive(Debug, Clone)]
pub enum FilterExpr {
    Pred { attr: FilterAttr, op: MatchOp },
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    /// Evaluate against one message of a call
    pub fn eval(&self, call: &Call, msg: &Message) -> bool {
        match self {
            FilterExpr::Pred { attr: FilterAttr::Any, op } => ANY_COLUMNS
                .iter()
                .any(|attr| op.eval(&attr.value(call, msg))),
            FilterExpr::Pred { attr, op } => op.eval(&attr.value(call, msg)),
            FilterExpr::And(children) => children.iter().all(|c| c.eval(call, msg)),
            FilterExpr::Or(children) => children.iter().any(|c| c.eval(call, msg)),
            FilterExpr::Not(child) => !child.eval(call, msg),
        }
    }
}

/// A compiled display filter, hashable by its normalized source
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    source: String,
    expr: FilterExpr,
}

impl CompiledFilter {
    /// Compile a display filter expression
    pub fn compile(input: &str) -> Result<Self, FilterError> {
        let source = normalize(input);
        if source.is_empty() {
            return Err(FilterError::Empty);
        }

        let mut terms = Vec::new();
        for token in source.split(' ') {
            terms.push(parse_term(token)?);
        }
        let expr = if terms.len() == 1 {
            terms.remove(0)
        } else {
            FilterExpr::And(terms)
        };

        Ok(Self { source, expr })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// A call is displayed iff at least one of its messages matches
    pub fn matches_call(&self, call: &Call) -> bool {
        call.messages().iter().any(|msg| self.expr.eval(call, msg))
    }

    pub fn matches(&self, call: &Call, msg: &Message) -> bool {
        self.expr.eval(call, msg)
    }
}

impl PartialEq for CompiledFilter {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for CompiledFilter {}

impl Hash for CompiledFilter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

/// Collapse whitespace runs so equivalent expressions share a cache entry
pub fn normalize(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_term(token: &str) -> Result<FilterExpr, FilterError> {
    let (negated, rest) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    if rest.is_empty() {
        return Err(FilterError::Empty);
    }

    let (attr, value) = match rest.split_once(':') {
        Some((column, value)) => (
            FilterAttr::from_column(column)
                .ok_or_else(|| FilterError::UnknownColumn(column.to_string()))?,
            value,
        ),
        None => (FilterAttr::Any, rest),
    };

    let op = if attr == FilterAttr::Duration {
        parse_numeric(value)?
    } else if let Some(pattern) = value.strip_prefix('~') {
        MatchOp::Regex(RegexBuilder::new(pattern).case_insensitive(true).build()?)
    } else {
        MatchOp::Contains(value.to_string())
    };

    let pred = FilterExpr::Pred { attr, op };
    Ok(if negated {
        FilterExpr::Not(Box::new(pred))
    } else {
        pred
    })
}

fn parse_numeric(value: &str) -> Result<MatchOp, FilterError> {
    let bad = || FilterError::BadNumber(value.to_string());
    if let Some(n) = value.strip_prefix('>') {
        return Ok(MatchOp::NumGt(n.parse().map_err(|_| bad())?));
    }
    if let Some(n) = value.strip_prefix('<') {
        return Ok(MatchOp::NumLt(n.parse().map_err(|_| bad())?));
    }
    let n = value.strip_prefix('=').unwrap_or(value);
    Ok(MatchOp::NumEq(n.parse().map_err(|_| bad())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::message::Message;
    use crate::testing;

    fn call_with_invite(call_id: &str, from: &str, to: &str) -> Call {
        let mut call = Call::new(call_id.to_string(), 0);
        let packet = testing::sip_packet(
            1_000_000,
            "10.0.0.1", 5060,
            "10.0.0.2", 5060,
            &testing::sip_invite(call_id, from, to, 1, None),
        );
        call.push_message(Message::from_packet(packet, 0).unwrap());
        call
    }

    #[test]
    fn test_substring_any_column() {
        let call = call_with_invite("abc@x", "alice", "bob");
        let filter = CompiledFilter::compile("ALICE").unwrap();
        assert!(filter.matches_call(&call));

        let filter = CompiledFilter::compile("carol").unwrap();
        assert!(!filter.matches_call(&call));
    }

    #[test]
    fn test_column_scoping() {
        let call = call_with_invite("abc@x", "alice", "bob");
        assert!(CompiledFilter::compile("from:alice").unwrap().matches_call(&call));
        assert!(!CompiledFilter::compile("to:alice").unwrap().matches_call(&call));
        assert!(CompiledFilter::compile("callid:abc").unwrap().matches_call(&call));
        assert!(CompiledFilter::compile("src:10.0.0.1").unwrap().matches_call(&call));
    }

    #[test]
    fn test_negation() {
        let call = call_with_invite("abc@x", "alice", "bob");
        assert!(!CompiledFilter::compile("-from:alice").unwrap().matches_call(&call));
        assert!(CompiledFilter::compile("-from:carol").unwrap().matches_call(&call));
    }

    #[test]
    fn test_regex() {
        let call = call_with_invite("abc@x", "alice", "bob");
        assert!(CompiledFilter::compile("from:~^al.ce$").unwrap().matches_call(&call));
        assert!(!CompiledFilter::compile("from:~^ob$").unwrap().matches_call(&call));
        assert!(CompiledFilter::compile("from:~[").is_err());
    }

    #[test]
    fn test_and_of_terms() {
        let call = call_with_invite("abc@x", "alice", "bob");
        assert!(CompiledFilter::compile("from:alice to:bob").unwrap().matches_call(&call));
        assert!(!CompiledFilter::compile("from:alice to:carol").unwrap().matches_call(&call));
    }

    #[test]
    fn test_duration_comparison() {
        let call = call_with_invite("abc@x", "alice", "bob");
        // single message: duration 0s
        assert!(CompiledFilter::compile("duration:<5").unwrap().matches_call(&call));
        assert!(!CompiledFilter::compile("duration:>5").unwrap().matches_call(&call));
        assert!(CompiledFilter::compile("duration:=0").unwrap().matches_call(&call));
        assert!(CompiledFilter::compile("duration:>x").is_err());
    }

    #[test]
    fn test_normalized_source_and_hash() {
        let a = CompiledFilter::compile("  from:alice    to:bob ").unwrap();
        let b = CompiledFilter::compile("from:alice to:bob").unwrap();
        assert_eq!(a.source(), b.source());
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_column() {
        assert!(matches!(
            CompiledFilter::compile("bogus:x"),
            Err(FilterError::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_combinators() {
        let call = call_with_invite("abc@x", "alice", "bob");
        let msg = &call.messages()[0];

        let expr = FilterExpr::Or(vec![
            FilterExpr::Pred {
                attr: FilterAttr::From,
                op: MatchOp::Equals("carol".into()),
            },
            FilterExpr::Not(Box::new(FilterExpr::Pred {
                attr: FilterAttr::State,
                op: MatchOp::Contains("COMPLETED".into()),
            })),
        ]);
        assert!(expr.eval(&call, msg));
    }
}
