//! # Inference Engine Contract
//!
//! The seam between the worker and the underlying inference engine. The
//! worker drives the engine through a single `EngineEvent` tagged union
//! rather than per-backend callback objects, so the chunk-assembly state
//! machines stay independent of how a backend actually delivers events.
//!
//! ## Contract:
//! - `PipelineLoader::load` builds a device-resident pipeline for a
//!   descriptor and engine options, forwarding load progress verbatim
//! - `InferencePipeline::generate` runs one transcription job, invoking the
//!   event sink synchronously between decoding steps
//! - `InferencePipeline::decode_and_merge` consolidates the CPU-path token
//!   history into a transcript
//! - `InferencePipeline::dispose` releases device resources; the lifecycle
//!   manager calls it before loading a replacement instance

use crate::protocol::Subtask;
use crate::transcription::policy::{EngineOptions, ModelDescriptor};
use crate::transcription::timeline::{BoundaryInfo, TokenChunk};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Low-level decoding events, in the order the engine produces them.
///
/// The accelerated-path assembler consumes the first five variants; the
/// CPU-path assembler consumes the last two. Each assembler ignores the
/// variants that belong to the other path.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A new transcript segment opened at `time` seconds within the current
    /// sliding window
    ChunkStart { time: f64 },

    /// One token was emitted
    Token,

    /// Incremental text decoded since the previous event
    PartialText { text: String },

    /// The current segment closed at `time` seconds within the window
    ChunkEnd { time: f64 },

    /// The current sliding-window step completed
    WindowFinalized,

    /// A sliding-window step crossed its boundary (CPU path)
    ChunkBoundary { boundary: BoundaryInfo },

    /// Cumulative token-id sequence after one generation step (CPU path)
    GenerationStep { output_token_ids: Vec<u32> },
}

/// Callback for engine-defined load-progress payloads, forwarded verbatim
/// to the job channel as "progress" messages.
pub type ProgressSink = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Parameters of one generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Greedy decoding when false (always false in this worker)
    pub do_sample: bool,

    /// Sliding-window length in seconds
    pub chunk_length_s: f64,

    /// Overlap between consecutive windows in seconds
    pub stride_length_s: f64,

    /// Language selector; `None` lets the engine auto-detect
    pub language: Option<String>,

    /// Transcribe or translate
    pub task: Subtask,

    /// Whether to emit timestamp information
    pub return_timestamps: bool,
}

/// Options for consolidating the CPU-path history.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Seconds per timestamp-token increment
    pub time_precision: f64,

    pub return_timestamps: bool,
}

/// One merged transcript segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub text: String,
    pub timestamp: (f64, Option<f64>),
}

/// Final transcript returned by a generation call or a history merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TranscriptOutput {
    pub text: String,
    pub chunks: Vec<Segment>,
}

/// A loaded, device-resident pipeline instance.
#[async_trait]
pub trait InferencePipeline: Send + Sync {
    /// Seconds per timestamp-token increment, derived from the loaded
    /// configuration: `feature_extractor_chunk_length / max_source_positions`.
    fn time_precision(&self) -> f64;

    /// Run one transcription over `audio` (16 kHz mono samples), invoking
    /// `on_event` synchronously between decoding steps; events are never
    /// delivered concurrently with each other or with the job's await points.
    async fn generate(
        &self,
        audio: &[f32],
        request: &GenerationRequest,
        on_event: &mut (dyn FnMut(EngineEvent) + Send),
    ) -> Result<TranscriptOutput>;

    /// Decode and merge the CPU-path history into a consolidated transcript.
    fn decode_and_merge(&self, history: &[TokenChunk], options: &DecodeOptions) -> Result<TranscriptOutput>;

    /// Release device resources held by this instance.
    async fn dispose(&self) -> Result<()>;
}

/// Builds pipeline instances; the lifecycle manager owns the single slot the
/// results live in.
#[async_trait]
pub trait PipelineLoader: Send + Sync + 'static {
    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        options: &EngineOptions,
        progress: ProgressSink,
    ) -> Result<Arc<dyn InferencePipeline>, LoadError>;
}

/// Clonable load-failure wrapper.
///
/// Load results travel through a shared future that every concurrent resolver
/// awaits, so the error type must be `Clone`.
#[derive(Debug, Clone)]
pub struct LoadError(Arc<anyhow::Error>);

impl LoadError {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline load failed: {}", self.0)
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref().as_ref())
    }
}

impl From<anyhow::Error> for LoadError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}
