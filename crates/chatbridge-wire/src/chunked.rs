//! HTTP/1.1 chunked-transfer decoding.
//!
//! The interception callback hands over raw body bytes as they arrive, cut
//! at arbitrary offsets. The decoder keeps per-channel state so a chunk
//! size line, chunk data or trailer split across calls resumes cleanly on
//! the next call. Input that does not look chunked at all falls back to
//! passthrough.

use crate::error::{DecodeError, Result};

/// How this channel's body is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Not yet determined (no complete size line seen).
    Unknown,
    /// Hex-length-prefixed chunked transfer.
    Chunked,
    /// Raw body, passed through unchanged.
    Passthrough,
}

/// Stateful de-chunker for one channel.
#[derive(Debug)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
    framing: Framing,
    finished: bool,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    /// Creates a decoder for a fresh channel.
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            framing: Framing::Unknown,
            finished: false,
        }
    }

    /// Returns true once the terminal zero-length chunk has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feeds raw bytes; returns the de-chunked payload available so far and
    /// whether the body completed on this call.
    ///
    /// Partial trailing data (a cut size line or an incomplete chunk) is
    /// preserved for the next call, never discarded.
    pub fn push(&mut self, input: &[u8]) -> Result<(Vec<u8>, bool)> {
        if self.finished {
            return Ok((Vec::new(), false));
        }
        self.pending.extend_from_slice(input);

        if self.framing == Framing::Passthrough {
            return Ok((std::mem::take(&mut self.pending), false));
        }

        let mut out = Vec::new();
        let mut completed = false;

        loop {
            let Some(line_end) = find_line_end(&self.pending) else {
                break;
            };
            let line = &self.pending[..line_end.start];
            if line.is_empty() && self.framing == Framing::Chunked {
                // CRLF left over from the previous chunk's data.
                self.pending.drain(..line_end.end);
                continue;
            }
            let size = match parse_chunk_size(line) {
                Some(size) => {
                    self.framing = Framing::Chunked;
                    size
                }
                None => {
                    if self.framing == Framing::Unknown {
                        // Not chunked after all; hand the body through raw.
                        self.framing = Framing::Passthrough;
                        return Ok((std::mem::take(&mut self.pending), false));
                    }
                    return Err(DecodeError::BadChunkSize(
                        String::from_utf8_lossy(line).into_owned(),
                    ));
                }
            };

            if size == 0 {
                // Terminal chunk. Trailers, if any, are irrelevant here.
                self.pending.clear();
                self.finished = true;
                completed = true;
                break;
            }

            let data_start = line_end.end;
            let data_end = data_start + size;
            if self.pending.len() < data_end {
                break;
            }
            out.extend_from_slice(&self.pending[data_start..data_end]);
            // The trailing CRLF shows up as a blank line next iteration.
            self.pending.drain(..data_end);
        }

        Ok((out, completed))
    }
}

struct LineEnd {
    /// Offset of the terminator.
    start: usize,
    /// Offset just past the terminator.
    end: usize,
}

/// Finds the first CRLF (or bare LF) terminator.
fn find_line_end(buf: &[u8]) -> Option<LineEnd> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    if pos > 0 && buf[pos - 1] == b'\r' {
        Some(LineEnd {
            start: pos - 1,
            end: pos + 1,
        })
    } else {
        Some(LineEnd {
            start: pos,
            end: pos + 1,
        })
    }
}

/// Parses a hex chunk-size line, ignoring chunk extensions.
fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(line).ok()?;
    let size_part = text.split(';').next()?.trim();
    if size_part.is_empty() {
        return None;
    }
    usize::from_str_radix(size_part, 16).ok()
}

#[cfg(test)]
pub(crate) fn encode_chunked(payload: &[u8], chunk_size: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in payload.chunks(chunk_size.max(1)) {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}
