//! # Chunk Timeline
//!
//! Shared data structures for the two streaming chunk-assembly state machines:
//! the accelerated-path timeline of text chunks with timestamps, the CPU-path
//! history of token-id records, and the per-window throughput counters.
//!
//! ## Invariants:
//! - Within a timeline, every chunk except possibly the last is finalised; the
//!   last chunk is the sole mutation target until a chunk-boundary event
//!   finalises it
//! - Chunk start timestamps are non-decreasing across the timeline
//! - The CPU history always ends with exactly one non-finalised record until
//!   the engine signals the last chunk

use serde::Serialize;
use std::time::Instant;

/// One transcript fragment on the accelerated path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    /// Text accumulated so far for this fragment
    pub text: String,

    /// `(start, end)` in seconds; `end` is unset until the chunk is finalised
    pub timestamp: (f64, Option<f64>),

    /// Absolute offset of the sliding window this chunk belongs to
    pub offset: f64,

    /// Set once the chunk's end boundary has been observed
    pub finalised: bool,
}

/// Ordered sequence of transcript chunks, append-only except for in-place
/// mutation of the tail.
#[derive(Debug, Default)]
pub struct ChunkTimeline {
    chunks: Vec<Chunk>,
}

impl ChunkTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fresh, non-finalised chunk; it becomes the mutation target.
    ///
    /// `local_time` is the chunk's start time within its sliding window;
    /// `offset` places the window on the absolute timeline.
    pub fn begin_chunk(&mut self, offset: f64, local_time: f64) {
        self.chunks.push(Chunk {
            text: String::new(),
            timestamp: (offset + local_time, None),
            offset,
            finalised: false,
        });
    }

    /// Append text to the tail chunk.
    ///
    /// Returns `false` without mutating when the timeline is empty, which
    /// guards against out-of-order callback delivery from the engine.
    pub fn append_text(&mut self, text: &str) -> bool {
        match self.chunks.last_mut() {
            Some(chunk) => {
                chunk.text.push_str(text);
                true
            }
            None => false,
        }
    }

    /// Finalise the tail chunk, setting its end timestamp from the window's
    /// local time plus the chunk's own offset.
    pub fn end_chunk(&mut self, local_time: f64) {
        if let Some(chunk) = self.chunks.last_mut() {
            chunk.timestamp.1 = Some(local_time + chunk.offset);
            chunk.finalised = true;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Clone the current chunk list for an outbound update message.
    pub fn snapshot(&self) -> Vec<Chunk> {
        self.chunks.clone()
    }
}

/// Per-window token throughput counters.
///
/// `tokens_per_second` stays unset until the second token of a window and is
/// cleared again when the window is finalised.
#[derive(Debug, Default)]
pub struct StreamingStats {
    start_time: Option<Instant>,
    num_tokens: u64,
    tokens_per_second: Option<f64>,
}

impl StreamingStats {
    /// Record one emitted token, lazily starting the window timer.
    pub fn record_token(&mut self) {
        let start = *self.start_time.get_or_insert_with(Instant::now);
        self.num_tokens += 1;
        if self.num_tokens > 1 {
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            if elapsed_ms > 0.0 {
                self.tokens_per_second = Some(self.num_tokens as f64 / elapsed_ms * 1000.0);
            }
        }
    }

    /// Reset at the start of each sliding-window step.
    pub fn reset(&mut self) {
        self.start_time = None;
        self.num_tokens = 0;
        self.tokens_per_second = None;
    }

    pub fn tokens_per_second(&self) -> Option<f64> {
        self.tokens_per_second
    }

    pub fn num_tokens(&self) -> u64 {
        self.num_tokens
    }
}

/// One CPU-path history record: the cumulative token-id sequence of a
/// sliding-window step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenChunk {
    /// Full token-id sequence decoded so far for this window
    pub tokens: Vec<u32>,

    /// Window timestamps merged in at the chunk boundary
    pub timestamp: Option<(f64, Option<f64>)>,

    /// Set once the engine has crossed this window's boundary
    pub finalised: bool,
}

/// Boundary information delivered by the engine when a sliding-window step
/// completes.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryInfo {
    pub tokens: Vec<u32>,
    pub timestamp: (f64, Option<f64>),
    pub is_last: bool,
}

/// CPU-path history list, seeded with one empty non-finalised record.
#[derive(Debug)]
pub struct ChunkHistory {
    records: Vec<TokenChunk>,
}

impl Default for ChunkHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkHistory {
    pub fn new() -> Self {
        Self {
            records: vec![TokenChunk::default()],
        }
    }

    /// Merge boundary info into the current record and finalise it; unless the
    /// engine signalled the last chunk, append a fresh record which becomes
    /// current.
    pub fn merge_boundary(&mut self, boundary: BoundaryInfo) {
        let last = self
            .records
            .last_mut()
            .expect("history always holds at least one record");
        last.tokens = boundary.tokens;
        last.timestamp = Some(boundary.timestamp);
        last.finalised = true;

        if !boundary.is_last {
            self.records.push(TokenChunk::default());
        }
    }

    /// Overwrite the current record's tokens with the engine's cumulative
    /// sequence for this window.
    pub fn set_current_tokens(&mut self, tokens: Vec<u32>) {
        let last = self
            .records
            .last_mut()
            .expect("history always holds at least one record");
        last.tokens = tokens;
    }

    pub fn records(&self) -> &[TokenChunk] {
        &self.records
    }
}
