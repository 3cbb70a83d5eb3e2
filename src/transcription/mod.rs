//! # Transcription Module
//!
//! Speech-to-text transcription over Whisper models via the Candle-rs
//! framework, organized around a single device-resident pipeline.
//!
//! ## Key Components:
//! - **policy**: pure mapping from job parameters to engine configuration
//! - **engine**: the pipeline/loader traits and the decoding event stream
//! - **manager**: single-slot pipeline lifecycle (reuse, dispose, reload)
//! - **timeline**: chunk timeline and token-history data structures
//! - **orchestrator**: runs one job, folding engine events into job-channel
//!   messages
//! - **whisper**: the concrete Candle backend

pub mod engine;
pub mod manager;
pub mod orchestrator;
pub mod policy;
pub mod timeline;
pub mod whisper;
