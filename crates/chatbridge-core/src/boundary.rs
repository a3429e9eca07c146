//! Reasoning/body boundary detection.
//!
//! Upstream mixes "thinking" text and answer text into one reasoning
//! channel; the answer portion is recognizable because it starts at a line
//! boundary with an optional code fence followed by an opening tag. The
//! detector watches a small sliding window of recent reasoning text and
//! freezes a split index on the first structural match. The split is a
//! one-way latch: everything at or after it is answer body for the rest of
//! the session.

use once_cell::sync::Lazy;
use regex::Regex;

/// Sliding-window size in bytes.
const WINDOW_SIZE: usize = 100;

/// Line-start, optional code fence, then an opening tag.
static BOUNDARY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(?:```[a-zA-Z0-9]*[ \t]*\n)?<[a-zA-Z]").expect("boundary pattern compiles")
});

/// Stateful boundary detector over a stream of reasoning-text deltas.
#[derive(Debug, Default)]
pub struct BoundaryDetector {
    /// Recent tail of the reasoning stream.
    window: String,
    /// Global byte offset of the window start within the full stream.
    window_start: usize,
    /// Total bytes fed so far.
    total: usize,
    /// Frozen split index, once matched.
    split: Option<usize>,
}

impl BoundaryDetector {
    /// Creates an empty detector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the frozen split index, if the boundary has been seen.
    pub fn split(&self) -> Option<usize> {
        self.split
    }

    /// Feeds one delta of reasoning text.
    ///
    /// Returns the global byte index where body content begins, the first
    /// time the pattern matches. Later calls return `None`; the latch never
    /// re-fires and never rewinds.
    pub fn feed(&mut self, delta: &str) -> Option<usize> {
        if self.split.is_some() || delta.is_empty() {
            return None;
        }

        self.window.push_str(delta);
        self.total += delta.len();
        self.trim_window();

        if let Some(m) = BOUNDARY_PATTERN.find(&self.window) {
            let split = self.window_start + m.start();
            self.split = Some(split);
            return Some(split);
        }
        None
    }

    /// Keeps the window at most [`WINDOW_SIZE`] bytes, cutting on a char
    /// boundary.
    fn trim_window(&mut self) {
        if self.window.len() <= WINDOW_SIZE {
            return;
        }
        let excess = self.window.len() - WINDOW_SIZE;
        let cut = (excess..self.window.len())
            .find(|&i| self.window.is_char_boundary(i))
            .unwrap_or(self.window.len());
        self.window.drain(..cut);
        self.window_start += cut;
    }
}
