//! Wire protocol decoding for intercepted chat traffic.
//!
//! Intercepted response bodies arrive chunk-transfer encoded, usually
//! compressed, and split at arbitrary byte offsets. This crate turns that
//! byte soup back into [`GenerationEvent`](chatbridge_core::GenerationEvent)s:
//!
//! ```text
//! raw bytes → ChunkDecoder → Inflater → text buffer → scan_records → events
//! ```
//!
//! ## Features
//!
//! - **Chunked transfer decoding** with framing auto-detection and a
//!   passthrough fallback for non-chunked bodies.
//! - **Streaming decompression** (gzip/zlib/plain, sniffed per channel).
//! - **Record scanning** with a string-aware balanced-bracket walker, so
//!   records split across network reads are reassembled.
//! - **Positional type-tag argument decoding** for function calls.
//! - **Quota telemetry scanning** on the client-error endpoint, raising the
//!   shared quota-exceeded signal.
//!
//! The decoder is infallible at its outer boundary: any internal error is
//! logged and degrades to an empty result, because it runs inside a network
//! interception callback that must never fail.

pub mod args;
pub mod chunked;
pub mod decoder;
pub mod error;
pub mod inflate;
pub mod record;

pub use decoder::{percent_decode, InterceptRules, WireDecoder, MAX_CHANNEL_BUFFER};
pub use error::{DecodeError, Result};
pub use record::WirePayload;
