//! Streaming decompression of intercepted bodies.
//!
//! Bodies are self-describing: gzip (magic `1f 8b`), zlib (`78` with a
//! valid header checksum), or uncompressed. The format is sniffed from the
//! first two bytes and the decoder then streams, tolerating input split at
//! arbitrary offsets across calls.

use std::io::Write;

use flate2::write::{GzDecoder, ZlibDecoder};

use crate::error::Result;

enum Mode {
    /// Fewer than two bytes seen; sniffing pending.
    Sniffing,
    Gzip(GzDecoder<Vec<u8>>),
    Zlib(ZlibDecoder<Vec<u8>>),
    Plain,
}

/// Stateful decompressor for one channel.
pub struct Inflater {
    mode: Mode,
    /// Bytes held back while sniffing.
    held: Vec<u8>,
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

impl Inflater {
    /// Creates an inflater for a fresh channel.
    pub fn new() -> Self {
        Self {
            mode: Mode::Sniffing,
            held: Vec::new(),
        }
    }

    /// Feeds compressed (or plain) bytes; returns whatever decompressed
    /// output is available so far.
    pub fn push(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        if let Mode::Sniffing = self.mode {
            self.held.extend_from_slice(input);
            if self.held.len() < 2 {
                return Ok(Vec::new());
            }
            self.mode = sniff(&self.held);
            let held = std::mem::take(&mut self.held);
            return self.feed(&held);
        }
        self.feed(input)
    }

    fn feed(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        match &mut self.mode {
            Mode::Sniffing => unreachable!("feed called while sniffing"),
            Mode::Gzip(decoder) => {
                decoder.write_all(input)?;
                decoder.flush()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Mode::Zlib(decoder) => {
                decoder.write_all(input)?;
                decoder.flush()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Mode::Plain => Ok(input.to_vec()),
        }
    }
}

/// Decides the framing from the first two bytes.
fn sniff(head: &[u8]) -> Mode {
    if head[0] == 0x1f && head[1] == 0x8b {
        return Mode::Gzip(GzDecoder::new(Vec::new()));
    }
    // zlib: CMF 0x78 and a header checksum divisible by 31.
    if head[0] == 0x78 && (u16::from(head[0]) * 256 + u16::from(head[1])) % 31 == 0 {
        return Mode::Zlib(ZlibDecoder::new(Vec::new()));
    }
    Mode::Plain
}
