//! # Streaming Orchestrator
//!
//! Runs one transcription job end to end: resolves the pipeline through the
//! lifecycle manager, drives the engine, and folds the engine's event stream
//! into progressive "update" messages on the job channel.
//!
//! ## Two Assembly Paths:
//! - **Accelerated**: text-level events build a `ChunkTimeline`; every partial
//!   text append emits an update carrying the full chunk snapshot and the
//!   current throughput
//! - **CPU**: token-level events build a `ChunkHistory`; every generation step
//!   re-decodes the whole history through the engine's merge routine and emits
//!   the consolidated transcript
//!
//! A job ends with exactly one "complete" or one "error" message; after a
//! failure no further messages are produced for that job.

use crate::protocol::{JobRequest, JobSink, WorkerMessage};
use crate::transcription::engine::{
    DecodeOptions, EngineEvent, GenerationRequest, InferencePipeline, ProgressSink,
};
use crate::transcription::manager::PipelineManager;
use crate::transcription::policy::{self, DeviceKind, ModelDescriptor};
use crate::transcription::timeline::{Chunk, ChunkHistory, ChunkTimeline, StreamingStats, TokenChunk};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Payload of one accelerated-path "update" message.
///
/// `text` is always empty; the chunk list is the source of truth for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateSnapshot {
    pub text: String,
    pub chunks: Vec<Chunk>,
    pub tokens_per_second: Option<f64>,
}

/// Accelerated-path state machine: folds text-level engine events into the
/// chunk timeline and per-window throughput counters.
pub struct StreamAssembler {
    timeline: ChunkTimeline,
    stats: StreamingStats,
    chunk_count: u32,
    chunk_length_s: f64,
    stride_length_s: f64,

    /// Most recent computed throughput; survives window resets so the final
    /// transcript can still report it
    last_tps: Option<f64>,
}

impl StreamAssembler {
    pub fn new(chunk_length_s: f64, stride_length_s: f64) -> Self {
        Self {
            timeline: ChunkTimeline::new(),
            stats: StreamingStats::default(),
            chunk_count: 0,
            chunk_length_s,
            stride_length_s,
            last_tps: None,
        }
    }

    /// Fold one engine event; returns an update payload when the event
    /// produced visible transcript progress.
    pub fn apply(&mut self, event: EngineEvent) -> Option<UpdateSnapshot> {
        match event {
            EngineEvent::ChunkStart { time } => {
                // Windows overlap by the stride, so each finalized window
                // advances the absolute offset by (length - stride).
                let offset = (self.chunk_length_s - self.stride_length_s) * self.chunk_count as f64;
                self.timeline.begin_chunk(offset, time);
                None
            }
            EngineEvent::Token => {
                self.stats.record_token();
                if let Some(tps) = self.stats.tokens_per_second() {
                    self.last_tps = Some(tps);
                }
                None
            }
            EngineEvent::PartialText { text } => {
                if self.timeline.append_text(&text) {
                    Some(UpdateSnapshot {
                        text: String::new(),
                        chunks: self.timeline.snapshot(),
                        tokens_per_second: self.last_tps,
                    })
                } else {
                    None
                }
            }
            EngineEvent::ChunkEnd { time } => {
                self.timeline.end_chunk(time);
                None
            }
            EngineEvent::WindowFinalized => {
                self.stats.reset();
                self.chunk_count += 1;
                None
            }
            // CPU-path events carry nothing for this assembler.
            EngineEvent::ChunkBoundary { .. } | EngineEvent::GenerationStep { .. } => None,
        }
    }

    pub fn last_tokens_per_second(&self) -> Option<f64> {
        self.last_tps
    }
}

/// CPU-path state machine: folds token-level engine events into the chunk
/// history.
#[derive(Debug, Default)]
pub struct HistoryAssembler {
    history: ChunkHistory,
}

impl HistoryAssembler {
    pub fn new() -> Self {
        Self {
            history: ChunkHistory::new(),
        }
    }

    /// Fold one engine event; returns `true` when the history changed in a way
    /// that warrants re-decoding it into an update message.
    pub fn apply(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::GenerationStep { output_token_ids } => {
                self.history.set_current_tokens(output_token_ids);
                true
            }
            EngineEvent::ChunkBoundary { boundary } => {
                self.history.merge_boundary(boundary);
                false
            }
            _ => false,
        }
    }

    pub fn records(&self) -> &[TokenChunk] {
        self.history.records()
    }
}

/// Run one transcription job and report every outcome through `sink`.
///
/// Load and inference failures each produce exactly one "error" message; a
/// successful job produces exactly one "complete" message. The function never
/// returns an error itself, so the connection handler stays alive for
/// subsequent jobs either way.
pub async fn process_job(
    manager: &PipelineManager,
    request: &JobRequest,
    audio: &[f32],
    sink: Arc<dyn JobSink>,
) {
    let descriptor = ModelDescriptor::from_job(
        &request.model,
        request.multilingual,
        request.quantized,
        request.device,
    );

    let progress: ProgressSink = {
        let sink = Arc::clone(&sink);
        Arc::new(move |event| sink.send(WorkerMessage::progress(event)))
    };

    let pipeline = match manager.resolve(&descriptor, progress).await {
        Ok(pipeline) => pipeline,
        Err(error) => {
            warn!("Pipeline load failed for {}: {}", descriptor.model_id, error);
            sink.send(WorkerMessage::error(json!(error.to_string())));
            return;
        }
    };

    let (chunk_length_s, stride_length_s) = policy::sliding_window(&request.model);
    let generation = GenerationRequest {
        do_sample: false,
        chunk_length_s,
        stride_length_s,
        language: request.language.clone(),
        task: request.subtask,
        return_timestamps: true,
    };

    info!(
        "Starting transcription job: model={}, device={}, {:.0}s windows of audio ({} samples)",
        descriptor.model_id,
        descriptor.device,
        chunk_length_s,
        audio.len()
    );

    let result = match request.device {
        DeviceKind::Accelerated => run_accelerated(&pipeline, &generation, audio, &sink).await,
        DeviceKind::Cpu => run_cpu(&pipeline, &generation, audio, &sink).await,
    };

    match result {
        Ok(data) => sink.send(WorkerMessage::complete(data)),
        Err(error) => {
            warn!("Transcription failed for {}: {}", descriptor.model_id, error);
            sink.send(WorkerMessage::error(json!(error.to_string())));
        }
    }
}

async fn run_accelerated(
    pipeline: &Arc<dyn InferencePipeline>,
    generation: &GenerationRequest,
    audio: &[f32],
    sink: &Arc<dyn JobSink>,
) -> anyhow::Result<Value> {
    let mut assembler = StreamAssembler::new(generation.chunk_length_s, generation.stride_length_s);

    let output = {
        let sink = Arc::clone(sink);
        let mut on_event = |event: EngineEvent| {
            if let Some(snapshot) = assembler.apply(event) {
                sink.send(WorkerMessage::update(json!(snapshot)));
            }
        };
        pipeline.generate(audio, generation, &mut on_event).await?
    };

    let mut data = json!(output);
    if let Some(object) = data.as_object_mut() {
        object.insert(
            "tokens_per_second".to_string(),
            json!(assembler.last_tokens_per_second()),
        );
    }
    Ok(data)
}

async fn run_cpu(
    pipeline: &Arc<dyn InferencePipeline>,
    generation: &GenerationRequest,
    audio: &[f32],
    sink: &Arc<dyn JobSink>,
) -> anyhow::Result<Value> {
    let mut assembler = HistoryAssembler::new();
    let options = DecodeOptions {
        time_precision: pipeline.time_precision(),
        return_timestamps: generation.return_timestamps,
    };

    let output = {
        let sink = Arc::clone(sink);
        let merger = Arc::clone(pipeline);
        let mut on_event = |event: EngineEvent| {
            if assembler.apply(event) {
                match merger.decode_and_merge(assembler.records(), &options) {
                    Ok(merged) => sink.send(WorkerMessage::update(json!(merged))),
                    Err(error) => warn!("Failed to decode token history: {}", error),
                }
            }
        };
        pipeline.generate(audio, generation, &mut on_event).await?
    };

    Ok(json!(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Subtask;
    use crate::transcription::engine::{LoadError, PipelineLoader, Segment, TranscriptOutput};
    use crate::transcription::policy::EngineOptions;
    use crate::transcription::timeline::BoundaryInfo;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct CollectingSink {
        messages: StdMutex<Vec<Value>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: StdMutex::new(Vec::new()),
            })
        }

        fn statuses(&self) -> Vec<String> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .map(|m| m["status"].as_str().unwrap().to_string())
                .collect()
        }

        fn of_status(&self, status: &str) -> Vec<Value> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m["status"] == status)
                .cloned()
                .collect()
        }
    }

    impl JobSink for CollectingSink {
        fn send(&self, message: WorkerMessage) {
            let value = serde_json::to_value(&message).unwrap();
            self.messages.lock().unwrap().push(value);
        }
    }

    /// Replays a fixed event script, then returns a canned output or fails.
    #[derive(Default)]
    struct ScriptedPipeline {
        script: Vec<EngineEvent>,
        output: TranscriptOutput,
        fail: bool,

        /// Language selector seen by each generate call
        languages: Arc<StdMutex<Vec<Option<String>>>>,
    }

    #[async_trait]
    impl InferencePipeline for ScriptedPipeline {
        fn time_precision(&self) -> f64 {
            0.02
        }

        async fn generate(
            &self,
            _audio: &[f32],
            request: &GenerationRequest,
            on_event: &mut (dyn FnMut(EngineEvent) + Send),
        ) -> anyhow::Result<TranscriptOutput> {
            self.languages.lock().unwrap().push(request.language.clone());
            for event in self.script.iter().cloned() {
                on_event(event);
            }
            if self.fail {
                return Err(anyhow!("decoder state corrupted"));
            }
            Ok(self.output.clone())
        }

        fn decode_and_merge(
            &self,
            history: &[TokenChunk],
            _options: &DecodeOptions,
        ) -> anyhow::Result<TranscriptOutput> {
            // Render the history as one segment per record so tests can see
            // exactly what was merged.
            let chunks: Vec<Segment> = history
                .iter()
                .map(|record| Segment {
                    text: record
                        .tokens
                        .iter()
                        .map(|t| t.to_string())
                        .collect::<Vec<_>>()
                        .join("-"),
                    timestamp: record.timestamp.unwrap_or((0.0, None)),
                })
                .collect();
            Ok(TranscriptOutput {
                text: chunks.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join(" "),
                chunks,
            })
        }

        async fn dispose(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct ScriptedLoader {
        pipeline: StdMutex<Option<Arc<ScriptedPipeline>>>,
        fail: bool,
    }

    impl ScriptedLoader {
        fn serving(pipeline: ScriptedPipeline) -> Arc<Self> {
            Arc::new(Self {
                pipeline: StdMutex::new(Some(Arc::new(pipeline))),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                pipeline: StdMutex::new(None),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl PipelineLoader for ScriptedLoader {
        async fn load(
            &self,
            _descriptor: &ModelDescriptor,
            _options: &EngineOptions,
            progress: ProgressSink,
        ) -> Result<Arc<dyn InferencePipeline>, LoadError> {
            if self.fail {
                return Err(LoadError::new(anyhow!("weights unavailable")));
            }
            progress(json!({"file": "model.safetensors", "progress": 100.0}));
            let pipeline = self
                .pipeline
                .lock()
                .unwrap()
                .take()
                .expect("pipeline already taken");
            Ok(pipeline)
        }
    }

    fn request(device: DeviceKind) -> JobRequest {
        JobRequest {
            model: "openai/whisper-base".to_string(),
            multilingual: true,
            quantized: false,
            subtask: Subtask::Transcribe,
            language: None,
            device,
        }
    }

    fn output(text: &str) -> TranscriptOutput {
        TranscriptOutput {
            text: text.to_string(),
            chunks: vec![Segment {
                text: text.to_string(),
                timestamp: (0.0, Some(4.0)),
            }],
        }
    }

    #[tokio::test]
    async fn test_accelerated_offsets_advance_per_window() {
        // Two windows of a 30s/5s model; the second window's chunks land at
        // an absolute offset of 25s.
        let script = vec![
            EngineEvent::ChunkStart { time: 0.0 },
            EngineEvent::Token,
            EngineEvent::Token,
            EngineEvent::PartialText {
                text: " Hello".to_string(),
            },
            EngineEvent::ChunkEnd { time: 4.0 },
            EngineEvent::WindowFinalized,
            EngineEvent::ChunkStart { time: 1.0 },
            EngineEvent::PartialText {
                text: " world".to_string(),
            },
            EngineEvent::ChunkEnd { time: 3.0 },
            EngineEvent::WindowFinalized,
        ];
        let loader = ScriptedLoader::serving(ScriptedPipeline {
            script,
            output: output(" Hello world"),
            ..Default::default()
        });
        let manager = PipelineManager::new(loader);
        let sink = CollectingSink::new();

        process_job(
            &manager,
            &request(DeviceKind::Accelerated),
            &[0.0; 16_000],
            sink.clone(),
        )
        .await;

        let updates = sink.of_status("update");
        assert_eq!(updates.len(), 2);

        let chunks = &updates[1]["data"]["chunks"];
        assert_eq!(chunks[0]["timestamp"], json!([0.0, 4.0]));
        assert_eq!(chunks[1]["timestamp"][0], 26.0);
        assert_eq!(chunks[1]["text"], " world");

        let complete = sink.of_status("complete");
        assert_eq!(complete.len(), 1);
        assert!(complete[0]["data"]
            .as_object()
            .unwrap()
            .contains_key("tokens_per_second"));
    }

    #[tokio::test]
    async fn test_partial_text_before_any_chunk_emits_nothing() {
        let script = vec![EngineEvent::PartialText {
            text: "stray".to_string(),
        }];
        let loader = ScriptedLoader::serving(ScriptedPipeline {
            script,
            output: TranscriptOutput::default(),
            ..Default::default()
        });
        let manager = PipelineManager::new(loader);
        let sink = CollectingSink::new();

        process_job(
            &manager,
            &request(DeviceKind::Accelerated),
            &[],
            sink.clone(),
        )
        .await;

        assert!(sink.of_status("update").is_empty());
        assert_eq!(sink.of_status("complete").len(), 1);
    }

    #[tokio::test]
    async fn test_engine_failure_yields_single_error_and_no_complete() {
        let loader = ScriptedLoader::serving(ScriptedPipeline {
            script: vec![EngineEvent::ChunkStart { time: 0.0 }],
            fail: true,
            ..Default::default()
        });
        let manager = PipelineManager::new(loader);
        let sink = CollectingSink::new();

        process_job(
            &manager,
            &request(DeviceKind::Accelerated),
            &[],
            sink.clone(),
        )
        .await;

        let errors = sink.of_status("error");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["data"], "decoder state corrupted");
        assert!(sink.of_status("complete").is_empty());
    }

    #[tokio::test]
    async fn test_load_failure_is_reported_as_error() {
        let manager = PipelineManager::new(ScriptedLoader::failing());
        let sink = CollectingSink::new();

        process_job(&manager, &request(DeviceKind::Cpu), &[], sink.clone()).await;

        assert_eq!(sink.statuses(), vec!["error"]);
    }

    #[tokio::test]
    async fn test_load_progress_is_forwarded() {
        let loader = ScriptedLoader::serving(ScriptedPipeline {
            script: Vec::new(),
            output: TranscriptOutput::default(),
            ..Default::default()
        });
        let manager = PipelineManager::new(loader);
        let sink = CollectingSink::new();

        process_job(&manager, &request(DeviceKind::Cpu), &[], sink.clone()).await;

        let progress = sink.of_status("progress");
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0]["file"], "model.safetensors");
    }

    #[tokio::test]
    async fn test_cpu_generation_steps_redecode_whole_history() {
        let script = vec![
            EngineEvent::GenerationStep {
                output_token_ids: vec![1],
            },
            EngineEvent::GenerationStep {
                output_token_ids: vec![1, 2],
            },
            EngineEvent::ChunkBoundary {
                boundary: BoundaryInfo {
                    tokens: vec![1, 2, 3],
                    timestamp: (0.0, Some(30.0)),
                    is_last: false,
                },
            },
            EngineEvent::GenerationStep {
                output_token_ids: vec![4],
            },
            EngineEvent::ChunkBoundary {
                boundary: BoundaryInfo {
                    tokens: vec![4, 5],
                    timestamp: (25.0, Some(40.0)),
                    is_last: true,
                },
            },
        ];
        let loader = ScriptedLoader::serving(ScriptedPipeline {
            script,
            output: output("merged"),
            ..Default::default()
        });
        let manager = PipelineManager::new(loader);
        let sink = CollectingSink::new();

        process_job(
            &manager,
            &request(DeviceKind::Cpu),
            &[0.0; 16_000],
            sink.clone(),
        )
        .await;

        // One update per generation step, none for boundaries.
        let updates = sink.of_status("update");
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[1]["data"]["text"], "1-2");

        // The post-boundary step sees the finalised first record plus the
        // fresh current one.
        assert_eq!(updates[2]["data"]["text"], "1-2-3 4");
        assert_eq!(updates[2]["data"]["chunks"][0]["timestamp"], json!([0.0, 30.0]));

        let complete = sink.of_status("complete");
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0]["data"]["text"], "merged");
    }

    #[test]
    fn test_assembler_window_offset_formula() {
        let mut assembler = StreamAssembler::new(20.0, 3.0);
        assembler.apply(EngineEvent::ChunkStart { time: 0.5 });
        assembler.apply(EngineEvent::ChunkEnd { time: 2.0 });
        assembler.apply(EngineEvent::WindowFinalized);
        assembler.apply(EngineEvent::ChunkStart { time: 1.0 });

        let snapshot = assembler
            .apply(EngineEvent::PartialText {
                text: " hi".to_string(),
            })
            .expect("append succeeds");
        assert_eq!(snapshot.chunks[0].timestamp, (0.5, Some(2.0)));
        assert_eq!(snapshot.chunks[1].timestamp, (18.0, None));
        assert_eq!(snapshot.text, "");
    }

    #[tokio::test]
    async fn test_unset_language_reaches_engine_unchanged() {
        let pipeline = ScriptedPipeline::default();
        let languages = Arc::clone(&pipeline.languages);
        let manager = PipelineManager::new(ScriptedLoader::serving(pipeline));
        let sink = CollectingSink::new();

        let request = request(DeviceKind::Cpu);
        assert_eq!(request.language, None);
        process_job(&manager, &request, &[], sink.clone()).await;

        // The engine decides what an unset language means; nothing upstream
        // fills one in.
        assert_eq!(languages.lock().unwrap().as_slice(), &[None]);
    }

    #[tokio::test]
    async fn test_explicit_language_is_forwarded() {
        let pipeline = ScriptedPipeline::default();
        let languages = Arc::clone(&pipeline.languages);
        let manager = PipelineManager::new(ScriptedLoader::serving(pipeline));
        let sink = CollectingSink::new();

        let mut request = request(DeviceKind::Cpu);
        request.language = Some("de".to_string());
        process_job(&manager, &request, &[], sink.clone()).await;

        assert_eq!(
            languages.lock().unwrap().as_slice(),
            &[Some("de".to_string())]
        );
    }
}
