//! Record scanning over the per-channel text buffer.
//!
//! Records on the wire have the literal shape `[[[null, <payload>]],
//! "model"]`, concatenated back to back with arbitrary junk between them.
//! The scanner finds candidate starts, performs a string-aware balanced
//! bracket walk to isolate one complete record, parses it as JSON, and
//! dispatches on payload arity. Unmatched trailing bytes stay in the
//! buffer for the next call; a malformed record is skipped, never fatal.

use serde_json::Value;
use tracing::warn;

use chatbridge_core::FunctionCall;

use crate::args::decode_tagged;
use crate::error::{DecodeError, Result};

/// A dispatched record payload.
#[derive(Debug, Clone, PartialEq)]
pub enum WirePayload {
    /// Answer body text.
    Body(String),
    /// Reasoning ("thinking") text.
    Reason(String),
    /// Decoded function calls.
    Function(Vec<FunctionCall>),
}

const RECORD_START: &str = "[[[";

/// Payload arity carrying a function-call list.
const FUNCTION_ARITY: usize = 11;
/// Index of the function-call list within a function payload.
const FUNCTION_LIST_INDEX: usize = 10;

/// Scans `buf` for complete records, consuming matched bytes.
///
/// Returns the dispatched payloads in order. Bytes belonging to an
/// incomplete trailing record are left in place; junk before a candidate
/// start is discarded so the buffer cannot fill with noise.
pub fn scan_records(buf: &mut String) -> Vec<WirePayload> {
    let mut out = Vec::new();
    let mut consumed = 0;

    loop {
        let Some(rel_start) = buf[consumed..].find(RECORD_START) else {
            // No candidate: drop everything except a possible partial
            // record-start suffix.
            let keep = partial_start_len(&buf[consumed..]);
            let cut = buf.len() - keep;
            buf.drain(..cut);
            return out;
        };
        let start = consumed + rel_start;

        match balanced_end(&buf[start..]) {
            Some(len) => {
                let raw = &buf[start..start + len];
                match parse_record(raw) {
                    Ok(Some(payload)) => out.push(payload),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "skipped malformed wire record");
                    }
                }
                consumed = start + len;
            }
            None => {
                // Incomplete record: keep it (and nothing before it).
                buf.drain(..start);
                return out;
            }
        }
    }
}

/// Length of the longest suffix of `tail` that is a prefix of a record
/// start marker.
fn partial_start_len(tail: &str) -> usize {
    for keep in (1..RECORD_START.len()).rev() {
        if tail.ends_with(&RECORD_START[..keep]) {
            return keep;
        }
    }
    0
}

/// Walks a balanced JSON array starting at the first byte of `text`,
/// respecting strings and escapes. Returns the record length if complete.
fn balanced_end(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    debug_assert_eq!(bytes.first(), Some(&b'['));

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' | b'{' => depth += 1,
            b']' | b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parses and validates one record, dispatching its payloads.
///
/// Returns `Ok(None)` for records that are well-formed JSON but not for us
/// (wrong sentinel, unknown payload arity).
fn parse_record(raw: &str) -> Result<Option<WirePayload>> {
    let value: Value = serde_json::from_str(raw)?;

    let outer = value
        .as_array()
        .filter(|a| a.len() == 2)
        .ok_or_else(|| DecodeError::Shape("outer is not a 2-array".into()))?;
    if outer[1].as_str() != Some("model") {
        return Ok(None);
    }
    let wrappers = outer[0]
        .as_array()
        .ok_or_else(|| DecodeError::Shape("wrapper list is not an array".into()))?;

    // Each wrapper is [null, payload]; in practice one per record.
    for wrapper in wrappers {
        let pair = wrapper
            .as_array()
            .filter(|p| p.len() == 2 && p[0].is_null())
            .ok_or_else(|| DecodeError::Shape("wrapper is not [null, payload]".into()))?;
        let payload = pair[1]
            .as_array()
            .ok_or_else(|| DecodeError::Shape("payload is not an array".into()))?;

        if let Some(dispatched) = dispatch_payload(payload)? {
            return Ok(Some(dispatched));
        }
    }
    Ok(None)
}

/// Payload arity selects the record kind:
/// - length 2 → body text;
/// - length 11 with `[1]` null and `[10]` a list → function calls;
/// - length > 2 with a scalar tail → reasoning text.
fn dispatch_payload(payload: &[Value]) -> Result<Option<WirePayload>> {
    if payload.len() == 2 {
        let text = payload_text(payload)?;
        return Ok(Some(WirePayload::Body(text)));
    }

    if payload.len() == FUNCTION_ARITY && payload[1].is_null() {
        if let Some(entries) = payload[FUNCTION_LIST_INDEX].as_array() {
            let mut calls = Vec::new();
            for entry in entries {
                let pair = entry.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
                    DecodeError::Shape("function entry is not [name, args]".into())
                })?;
                let name = pair[0]
                    .as_str()
                    .ok_or_else(|| DecodeError::Shape("function name is not a string".into()))?;
                calls.push(FunctionCall {
                    name: name.to_string(),
                    params: decode_tagged(&pair[1])?,
                });
            }
            return Ok(Some(WirePayload::Function(calls)));
        }
    }

    if payload.len() > 2 {
        if let Some(tail) = payload.last() {
            if !tail.is_array() && !tail.is_object() {
                let text = payload_text(payload)?;
                return Ok(Some(WirePayload::Reason(text)));
            }
        }
    }

    Ok(None)
}

fn payload_text(payload: &[Value]) -> Result<String> {
    payload
        .first()
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DecodeError::Shape("payload text is not a string".into()))
}
