//! Per-channel wire decoding.
//!
//! The decoder lives inside whatever callback receives intercepted network
//! traffic. It must never block and never crash that channel: every
//! internal failure degrades to an empty result, and per-channel state
//! (de-chunker, inflater, text buffer) persists across calls so input may
//! be split at any byte offset.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use chatbridge_core::{CoordinationContext, EventSink, GenerationEvent, QuotaSignal};

use crate::chunked::ChunkDecoder;
use crate::inflate::Inflater;
use crate::record::{scan_records, WirePayload};

/// Buffer ceiling per channel. Overflow clears the buffer rather than
/// growing unbounded.
pub const MAX_CHANNEL_BUFFER: usize = 10 * 1024 * 1024;

/// Which hosts and paths the decoder cares about.
#[derive(Debug, Clone)]
pub struct InterceptRules {
    /// Host substrings to match; empty means any host.
    pub hosts: Vec<String>,
    /// Path substrings identifying generation endpoints.
    pub generation_markers: Vec<String>,
    /// Path substrings identifying the client-error telemetry endpoint.
    pub telemetry_markers: Vec<String>,
    /// Substrings in telemetry payloads that signal quota exhaustion.
    pub quota_markers: Vec<String>,
}

impl Default for InterceptRules {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            generation_markers: vec!["GenerateContent".into(), "StreamGenerate".into()],
            telemetry_markers: vec!["ClientError".into(), "/log".into()],
            quota_markers: vec![
                "RESOURCE_EXHAUSTED".into(),
                "quota exceeded".into(),
                "rate limit".into(),
                "reached your limit".into(),
            ],
        }
    }
}

impl InterceptRules {
    fn host_matches(&self, host: &str) -> bool {
        self.hosts.is_empty() || self.hosts.iter().any(|h| host.contains(h.as_str()))
    }

    /// Returns true for generation endpoints.
    pub fn is_generation(&self, host: &str, path: &str) -> bool {
        self.host_matches(host)
            && self
                .generation_markers
                .iter()
                .any(|m| path.contains(m.as_str()))
    }

    /// Returns true for the telemetry endpoint.
    pub fn is_telemetry(&self, host: &str, path: &str) -> bool {
        self.host_matches(host)
            && self
                .telemetry_markers
                .iter()
                .any(|m| path.contains(m.as_str()))
    }
}

/// Per-channel decode state.
struct Channel {
    chunks: ChunkDecoder,
    inflater: Inflater,
    buf: String,
}

impl Channel {
    fn new() -> Self {
        Self {
            chunks: ChunkDecoder::new(),
            inflater: Inflater::new(),
            buf: String::new(),
        }
    }
}

/// Stateful decoder over all interception channels.
pub struct WireDecoder {
    rules: InterceptRules,
    ctx: Arc<CoordinationContext>,
    /// Decoded events are pushed here, enveloped with an interception
    /// timestamp; `None` in unit tests that only want return values.
    sink: Option<EventSink>,
    /// Model id reported alongside quota signals.
    model: RwLock<String>,
    channels: Mutex<HashMap<String, Channel>>,
}

impl WireDecoder {
    /// Creates a decoder publishing into `sink`.
    pub fn new(
        rules: InterceptRules,
        ctx: Arc<CoordinationContext>,
        sink: Option<EventSink>,
    ) -> Self {
        Self {
            rules,
            ctx,
            sink,
            model: RwLock::new(String::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the model id attached to subsequent quota signals.
    pub fn set_model(&self, model: impl Into<String>) {
        *self.model.write() = model.into();
    }

    /// Returns true if traffic for this host/path should be intercepted.
    pub fn should_intercept(&self, host: &str, path: &str) -> bool {
        self.rules.is_generation(host, path) || self.rules.is_telemetry(host, path)
    }

    /// Processes intercepted response bytes for one channel.
    ///
    /// Returns the decoded events (also pushed to the sink). Never fails:
    /// decode problems are logged and the offending data skipped.
    pub fn process_response(
        &self,
        channel_id: &str,
        bytes: &[u8],
        host: &str,
        path: &str,
    ) -> Vec<GenerationEvent> {
        if !self.rules.is_generation(host, path) {
            return Vec::new();
        }

        let mut channels = self.channels.lock();
        let channel = channels
            .entry(channel_id.to_string())
            .or_insert_with(Channel::new);

        let mut events = Vec::new();
        let finished = match Self::decode_into(channel, bytes, &mut events) {
            Ok(finished) => finished,
            Err(e) => {
                warn!(channel = channel_id, error = %e, "decode failure; channel degraded to no-op");
                false
            }
        };

        if finished {
            // Terminal zero-length chunk: the generation stream completed.
            events.push(GenerationEvent::finished());
            channels.remove(channel_id);
        }
        drop(channels);

        if let Some(sink) = &self.sink {
            let ts = unix_now();
            for event in &events {
                sink.push(event.clone().into_queue_item(ts));
            }
        }
        events
    }

    fn decode_into(
        channel: &mut Channel,
        bytes: &[u8],
        events: &mut Vec<GenerationEvent>,
    ) -> crate::error::Result<bool> {
        let (payload, finished) = channel.chunks.push(bytes)?;
        if !payload.is_empty() {
            let inflated = channel.inflater.push(&payload)?;
            channel.buf.push_str(&String::from_utf8_lossy(&inflated));
        }

        if channel.buf.len() > MAX_CHANNEL_BUFFER {
            warn!(
                len = channel.buf.len(),
                "channel buffer overflow; clearing"
            );
            channel.buf.clear();
        }

        for payload in scan_records(&mut channel.buf) {
            events.push(match payload {
                WirePayload::Body(text) => GenerationEvent::body_text(text),
                WirePayload::Reason(text) => GenerationEvent::reason_text(text),
                WirePayload::Function(calls) => GenerationEvent {
                    function: calls,
                    ..GenerationEvent::default()
                },
            });
        }
        Ok(finished)
    }

    /// Processes intercepted request bytes.
    ///
    /// On the telemetry endpoint, the body is URL-decoded and scanned for
    /// quota-exhaustion markers; a match raises the quota-exceeded signal.
    pub fn process_request(&self, channel_id: &str, bytes: &[u8], host: &str, path: &str) {
        if !self.rules.is_telemetry(host, path) {
            return;
        }

        let decoded = percent_decode(&String::from_utf8_lossy(bytes));
        let lowered = decoded.to_lowercase();
        for marker in &self.rules.quota_markers {
            if lowered.contains(&marker.to_lowercase()) {
                debug!(channel = channel_id, marker = %marker, "quota marker in telemetry");
                self.ctx.raise_quota_exceeded(QuotaSignal {
                    matched_text: marker.clone(),
                    model: self.model.read().clone(),
                });
                return;
            }
        }
    }

    /// Drops state for a closed channel.
    pub fn forget_channel(&self, channel_id: &str) {
        self.channels.lock().remove(channel_id);
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Decodes percent-encoding in place; `+` becomes a space.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                // Hex digits are checked byte-wise; slicing the str here
                // would panic on a multibyte char after the escape.
                let hi = (bytes[i + 1] as char).to_digit(16);
                let lo = (bytes[i + 2] as char).to_digit(16);
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunked::encode_chunked;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use serde_json::json;
    use std::io::Write;

    const HOST: &str = "chat.example.com";
    const GEN_PATH: &str = "/rpc/StreamGenerateContent";
    const TEL_PATH: &str = "/rpc/LogClientError";

    fn decoder() -> (WireDecoder, Arc<CoordinationContext>) {
        let ctx = Arc::new(CoordinationContext::new());
        (
            WireDecoder::new(InterceptRules::default(), ctx.clone(), None),
            ctx,
        )
    }

    fn body_record(text: &str) -> String {
        json!([[[null, [text, null]]], "model"]).to_string()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut e = ZlibEncoder::new(Vec::new(), Compression::default());
        e.write_all(data).unwrap();
        e.finish().unwrap()
    }

    fn wire_encode(records: &str, chunk_size: usize) -> Vec<u8> {
        encode_chunked(&zlib(records.as_bytes()), chunk_size)
    }

    fn texts(events: &[GenerationEvent]) -> Vec<String> {
        events
            .iter()
            .filter(|e| !e.body.is_empty())
            .map(|e| e.body.clone())
            .collect()
    }

    #[test]
    fn test_should_intercept_matches_rules() {
        let (d, _) = decoder();
        assert!(d.should_intercept(HOST, GEN_PATH));
        assert!(d.should_intercept(HOST, TEL_PATH));
        assert!(!d.should_intercept(HOST, "/static/app.js"));
    }

    #[test]
    fn test_full_pipeline_decodes_chunked_compressed_record() {
        let (d, _) = decoder();
        let wire = wire_encode(&body_record("hello from the wire"), 16);
        let events = d.process_response("ch1", &wire, HOST, GEN_PATH);

        assert_eq!(texts(&events), vec!["hello from the wire"]);
        // Terminal zero-length chunk produced a done event.
        assert!(events.last().unwrap().done);
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let record = body_record("split me at any offset and I still decode");
        let wire = wire_encode(&record, 11);

        let (whole, _) = decoder();
        let expected: Vec<String> = texts(&whole.process_response("w", &wire, HOST, GEN_PATH));

        for split in 1..wire.len() {
            let (d, _) = decoder();
            let mut events = d.process_response("ch", &wire[..split], HOST, GEN_PATH);
            events.extend(d.process_response("ch", &wire[split..], HOST, GEN_PATH));
            assert_eq!(texts(&events), expected, "split at {split}");
            assert!(events.last().unwrap().done, "split at {split}");
        }
    }

    #[test]
    fn test_record_split_mid_string_across_segments() {
        // Two compressed+chunked segments cutting one JSON record inside a
        // string literal.
        let record = body_record("first half and second half");
        let compressed = zlib(record.as_bytes());
        let cut = compressed.len() / 2;

        let mut seg1 = Vec::new();
        seg1.extend_from_slice(format!("{:x}\r\n", cut).as_bytes());
        seg1.extend_from_slice(&compressed[..cut]);
        seg1.extend_from_slice(b"\r\n");

        let rest = compressed.len() - cut;
        let mut seg2 = Vec::new();
        seg2.extend_from_slice(format!("{:x}\r\n", rest).as_bytes());
        seg2.extend_from_slice(&compressed[cut..]);
        seg2.extend_from_slice(b"\r\n0\r\n\r\n");

        let (d, _) = decoder();
        let mut events = d.process_response("ch", &seg1, HOST, GEN_PATH);
        events.extend(d.process_response("ch", &seg2, HOST, GEN_PATH));

        assert_eq!(texts(&events), vec!["first half and second half"]);
    }

    #[test]
    fn test_non_generation_path_is_ignored() {
        let (d, _) = decoder();
        let wire = wire_encode(&body_record("x"), 8);
        assert!(d
            .process_response("ch", &wire, HOST, "/unrelated")
            .is_empty());
    }

    #[test]
    fn test_telemetry_quota_scan_raises_flag() {
        let (d, ctx) = decoder();
        d.set_model("model-x");

        let body = b"error=It%20seems%20RESOURCE_EXHAUSTED+for+today";
        d.process_request("ch", body, HOST, TEL_PATH);

        assert!(ctx.quota_exceeded());
        let signal = ctx.quota_signal().unwrap();
        assert_eq!(signal.matched_text, "RESOURCE_EXHAUSTED");
        assert_eq!(signal.model, "model-x");
    }

    #[test]
    fn test_clean_telemetry_does_not_raise() {
        let (d, ctx) = decoder();
        d.process_request("ch", b"error=some%20other%20problem", HOST, TEL_PATH);
        assert!(!ctx.quota_exceeded());
    }

    #[test]
    fn test_generation_traffic_never_scanned_for_quota() {
        let (d, ctx) = decoder();
        d.process_request("ch", b"RESOURCE_EXHAUSTED", HOST, GEN_PATH);
        assert!(!ctx.quota_exceeded());
    }

    #[test]
    fn test_events_flow_into_sink() {
        let ctx = Arc::new(CoordinationContext::new());
        let (sink, queue) = chatbridge_core::EventQueue::channel();
        let d = WireDecoder::new(InterceptRules::default(), ctx, Some(sink));

        let wire = wire_encode(&body_record("queued"), 8);
        d.process_response("ch", &wire, HOST, GEN_PATH);

        let item = queue.try_pull().unwrap();
        let event = GenerationEvent::from_queue_item(&item).unwrap();
        assert_eq!(event.body, "queued");
        assert!(event.timestamp.is_some());
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%20b+c"), "a b c");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn test_percent_decode_multibyte_after_escape() {
        // A '%' with a multibyte char inside its two-byte lookahead must
        // pass through literally, not split the char.
        assert_eq!(percent_decode("%a\u{e9}"), "%a\u{e9}");
        assert_eq!(percent_decode("caf\u{e9}%20au%20lait"), "caf\u{e9} au lait");
        assert_eq!(percent_decode("%\u{1f600}"), "%\u{1f600}");
    }

    #[test]
    fn test_multibyte_telemetry_body_is_handled() {
        let (d, ctx) = decoder();
        d.set_model("model-x");

        let body = "erreur=%a\u{e9} quota exceeded".as_bytes();
        d.process_request("ch", body, HOST, TEL_PATH);

        assert!(ctx.quota_exceeded());
        let signal = ctx.quota_signal().unwrap();
        assert_eq!(signal.matched_text, "quota exceeded");
    }

    #[test]
    fn test_malformed_payload_degrades_to_empty() {
        let (d, _) = decoder();
        // Random bytes that are neither chunked nor a record.
        let events = d.process_response("ch", b"\x00\x01garbage\xff", HOST, GEN_PATH);
        assert!(events.is_empty());
    }
}
