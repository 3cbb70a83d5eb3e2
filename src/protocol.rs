//! # Job Channel Protocol
//!
//! Wire schema of the transcription job channel, kept independent of the
//! WebSocket transport that carries it. One inbound job request describes a
//! transcription; outbound messages are discriminated by a `status` field.
//!
//! ## Message Flow:
//! 1. Client sends a JSON job request, then the job's audio as one binary frame
//! 2. Worker streams `progress` passthroughs while the model loads
//! 3. Worker streams `update` messages after each decoding step
//! 4. Worker ends the job with exactly one `complete` or one `error`

use crate::transcription::policy::DeviceKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task discriminator carried on every transcript-bearing message.
pub const TASK: &str = "automatic-speech-recognition";

/// What the engine should do with the audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subtask {
    Transcribe,
    Translate,
}

/// Inbound transcription job.
///
/// The audio itself arrives as a separate binary frame; see the websocket
/// module for the supported encodings.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    /// Model identifier before normalization (e.g. "openai/whisper-tiny")
    pub model: String,

    /// Whether the multilingual model variant was requested
    pub multilingual: bool,

    /// CPU quantization flag
    pub quantized: bool,

    pub subtask: Subtask,

    /// Target language; unset lets the engine auto-detect
    #[serde(default)]
    pub language: Option<String>,

    /// Defaults to CPU when absent
    #[serde(default)]
    pub device: DeviceKind,
}

/// Outbound worker messages, discriminated by `status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerMessage {
    /// Passthrough of an engine load-progress event, forwarded unmodified
    Progress {
        #[serde(flatten)]
        event: Value,
    },

    /// Progressive transcript snapshot after a decoding step
    Update { task: &'static str, data: Value },

    /// Final transcript; emitted once, never after a failure
    Complete { task: &'static str, data: Value },

    /// Job failure; emitted once, the worker keeps serving
    Error { task: &'static str, data: Value },
}

impl WorkerMessage {
    pub fn progress(event: Value) -> Self {
        WorkerMessage::Progress { event }
    }

    pub fn update(data: Value) -> Self {
        WorkerMessage::Update { task: TASK, data }
    }

    pub fn complete(data: Value) -> Self {
        WorkerMessage::Complete { task: TASK, data }
    }

    pub fn error(data: Value) -> Self {
        WorkerMessage::Error { task: TASK, data }
    }
}

/// Outbound half of the job channel.
///
/// The WebSocket actor implements this over its connection; tests implement
/// it with an in-memory collector.
pub trait JobSink: Send + Sync {
    fn send(&self, message: WorkerMessage);
}
