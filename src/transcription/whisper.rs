//! # Candle Whisper Backend
//!
//! Concrete inference backend built on Candle-rs. Downloads model snapshots
//! from HuggingFace at the policy-selected revision, runs greedy
//! sliding-window decoding, and reports decoding progress through the engine
//! event stream.
//!
//! ## Decoding Process:
//! 1. Slice the audio into overlapping windows (`chunk_length_s` long,
//!    advancing by `chunk_length_s - stride_length_s`)
//! 2. Convert each window to a log-mel spectrogram and run the encoder
//! 3. Greedily decode tokens, segmenting on timestamp tokens
//! 4. Emit one boundary event per window with its absolute time range

use crate::transcription::engine::{
    DecodeOptions, EngineEvent, GenerationRequest, InferencePipeline, LoadError, PipelineLoader,
    ProgressSink, Segment, TranscriptOutput,
};
use crate::transcription::policy::{DeviceKind, EngineOptions, ModelDescriptor, Precision};
use crate::transcription::timeline::{BoundaryInfo, TokenChunk};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use hf_hub::api::tokio::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde_json::json;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::protocol::Subtask;

/// Loads Candle Whisper pipelines from HuggingFace snapshots.
pub struct WhisperLoader;

impl WhisperLoader {
    pub fn new() -> Self {
        Self
    }

    async fn load_inner(
        &self,
        descriptor: &ModelDescriptor,
        options: &EngineOptions,
        progress: &ProgressSink,
    ) -> Result<Arc<WhisperPipeline>> {
        let start_time = std::time::Instant::now();
        info!(
            "Loading pipeline for {} (revision {}) on {}",
            descriptor.model_id, options.revision, descriptor.device
        );

        let device = select_device(descriptor.device)?;
        let dtype = weight_dtype(options);

        let api = ApiBuilder::new().with_progress(false).build()?;
        let repo = api.repo(Repo::with_revision(
            descriptor.model_id.clone(),
            RepoType::Model,
            options.revision.to_string(),
        ));

        let config_filename = fetch_file(&repo, descriptor, "config.json", progress).await?;
        let tokenizer_filename = fetch_file(&repo, descriptor, "tokenizer.json", progress).await?;
        let model_filename = fetch_file(&repo, descriptor, "model.safetensors", progress).await?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_filename)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let special = SpecialTokens::resolve(&tokenizer)?;
        let mel_filters = mel_filter_bank(config.num_mel_bins);

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_filename], dtype, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        info!(
            "Pipeline for {} loaded in {:.2}s",
            descriptor.model_id,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Arc::new(WhisperPipeline {
            model: StdMutex::new(model),
            config,
            tokenizer,
            mel_filters,
            device,
            dtype,
            special,
            model_id: descriptor.model_id.clone(),
        }))
    }
}

impl Default for WhisperLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineLoader for WhisperLoader {
    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        options: &EngineOptions,
        progress: ProgressSink,
    ) -> Result<Arc<dyn InferencePipeline>, LoadError> {
        let pipeline = self
            .load_inner(descriptor, options, &progress)
            .await
            .map_err(LoadError::new)?;
        Ok(pipeline)
    }
}

/// Download one snapshot file, bracketed by progress events.
async fn fetch_file(
    repo: &ApiRepo,
    descriptor: &ModelDescriptor,
    name: &str,
    progress: &ProgressSink,
) -> Result<std::path::PathBuf> {
    progress(json!({"name": descriptor.model_id, "file": name, "progress": 0.0}));
    let path = repo
        .get(name)
        .await
        .map_err(|e| anyhow!("Failed to download {} from {}: {}", name, descriptor.model_id, e))?;
    progress(json!({"name": descriptor.model_id, "file": name, "progress": 100.0}));
    Ok(path)
}

fn select_device(kind: DeviceKind) -> Result<Device> {
    match kind {
        DeviceKind::Cpu => Ok(Device::Cpu),
        DeviceKind::Accelerated => {
            if candle_core::utils::cuda_is_available() {
                Ok(Device::new_cuda(0)?)
            } else if candle_core::utils::metal_is_available() {
                Ok(Device::new_metal(0)?)
            } else {
                Err(anyhow!(
                    "Accelerated device requested but no CUDA or Metal device is available"
                ))
            }
        }
    }
}

/// Map the policy's precision selection onto a weight dtype.
///
/// Candle loads one weight set for the whole model, so the encoder precision
/// drives the choice; 4-bit decoder weights and CPU integer quantization have
/// no separate load path here and fall back to the nearest supported dtype.
fn weight_dtype(options: &EngineOptions) -> DType {
    match options.dtype {
        Some(map) => {
            if map.decoder == Precision::Q4 {
                debug!(
                    "{} decoder weights unsupported by this backend, sharing the encoder dtype",
                    map.decoder.as_str()
                );
            }
            match map.encoder {
                Precision::Fp16 => DType::F16,
                _ => DType::F32,
            }
        }
        None => {
            if options.quantized == Some(true) {
                debug!("Quantized CPU weights unavailable, loading f32");
            }
            DType::F32
        }
    }
}

/// Triangular HTK-scale mel filter bank over the FFT bins the spectrogram
/// routine produces (`N_FFT / 2 + 1` per filter).
fn mel_filter_bank(n_mels: usize) -> Vec<f32> {
    fn hz_to_mel(hz: f32) -> f32 {
        2595.0 * (1.0 + hz / 700.0).log10()
    }
    fn mel_to_hz(mel: f32) -> f32 {
        700.0 * (10f32.powf(mel / 2595.0) - 1.0)
    }

    let n_freqs = m::N_FFT / 2 + 1;
    let sample_rate = m::SAMPLE_RATE as f32;
    let mel_max = hz_to_mel(sample_rate / 2.0);

    let hz_point = |i: usize| mel_to_hz(mel_max * i as f32 / (n_mels + 1) as f32);
    let to_bin = |hz: f32| hz * m::N_FFT as f32 / sample_rate;

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for i in 0..n_mels {
        let left = to_bin(hz_point(i));
        let center = to_bin(hz_point(i + 1));
        let right = to_bin(hz_point(i + 2));

        for j in 0..n_freqs {
            let f = j as f32;
            let weight = if f < left || f > right {
                0.0
            } else if f <= center {
                (f - left) / (center - left).max(1e-5)
            } else {
                (right - f) / (right - center).max(1e-5)
            };
            filters[i * n_freqs + j] = weight;
        }
    }
    filters
}

/// Vocabulary positions of the control tokens this backend needs.
#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    eot: u32,

    /// Absent from English-only vocabularies
    transcribe: Option<u32>,
    translate: Option<u32>,

    /// First timestamp token; ids at or above it encode times
    timestamp_begin: u32,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer) -> Result<Self> {
        let required = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("Tokenizer is missing the {} token", token))
        };
        let no_timestamps = required(m::NO_TIMESTAMPS_TOKEN)?;
        Ok(Self {
            sot: required(m::SOT_TOKEN)?,
            eot: required(m::EOT_TOKEN)?,
            transcribe: tokenizer.token_to_id(m::TRANSCRIBE_TOKEN),
            translate: tokenizer.token_to_id(m::TRANSLATE_TOKEN),
            timestamp_begin: no_timestamps + 1,
        })
    }
}

/// A loaded Whisper pipeline.
///
/// The model sits behind a mutex because decoding mutates its KV caches; the
/// tokenizer and configuration are read-only and shared freely.
pub struct WhisperPipeline {
    model: StdMutex<m::model::Whisper>,
    config: Config,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    device: Device,
    dtype: DType,
    special: SpecialTokens,
    model_id: String,
}

impl WhisperPipeline {
    fn lock_model(&self) -> Result<std::sync::MutexGuard<'_, m::model::Whisper>> {
        self.model
            .lock()
            .map_err(|_| anyhow!("Model mutex poisoned by an earlier panic"))
    }

    fn decode_text(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))
    }

    /// Prompt tokens for one window: start-of-transcript, then language and
    /// task selectors when the vocabulary carries them.
    fn prompt_tokens(&self, request: &GenerationRequest) -> Vec<u32> {
        let mut tokens = vec![self.special.sot];
        if let Some(transcribe) = self.special.transcribe {
            let language = request.language.as_deref().unwrap_or("en");
            match self.tokenizer.token_to_id(&format!("<|{}|>", language)) {
                Some(id) => tokens.push(id),
                None => warn!("Unknown language {:?}, letting the model decide", language),
            }
            let task_token = match request.task {
                Subtask::Transcribe => transcribe,
                Subtask::Translate => self.special.translate.unwrap_or(transcribe),
            };
            tokens.push(task_token);
        }
        tokens
    }

    /// Greedily decode one audio window, emitting events as tokens arrive.
    /// Returns the segments recognized in this window, shifted to absolute
    /// time by `offset`.
    fn decode_window(
        &self,
        model: &mut m::model::Whisper,
        samples: &[f32],
        request: &GenerationRequest,
        offset: f64,
        is_last: bool,
        on_event: &mut (dyn FnMut(EngineEvent) + Send),
    ) -> Result<Vec<Segment>> {
        let mel = audio::pcm_to_mel(&self.config, samples, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let n_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, n_frames), &self.device)?.to_dtype(self.dtype)?;

        let features = model.encoder.forward(&mel, true)?;

        let mut tokens = self.prompt_tokens(request);
        let prompt_len = tokens.len();
        let window_seconds = samples.len() as f64 / m::SAMPLE_RATE as f64;
        let time_precision = self.time_precision();

        let mut segments = Vec::new();
        let mut segment_tokens: Vec<u32> = Vec::new();
        let mut emitted = String::new();
        let mut segment_start: Option<f64> = None;

        for step in 0.. {
            if tokens.len() >= self.config.max_target_positions {
                break;
            }
            let input = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;
            let ys = model.decoder.forward(&input, &features, step == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let next = logits.argmax(0)?.to_scalar::<u32>()?;

            if next == self.special.eot {
                break;
            }
            if is_repetitive(&tokens[prompt_len..], next) {
                debug!("Stopping window decode early on repetitive output");
                break;
            }

            if next >= self.special.timestamp_begin {
                let time = (next - self.special.timestamp_begin) as f64 * time_precision;
                match segment_start.take() {
                    None => {
                        segment_start = Some(time);
                        segment_tokens.clear();
                        emitted.clear();
                        on_event(EngineEvent::ChunkStart { time });
                    }
                    Some(start) => {
                        let text = self.decode_text(&segment_tokens)?;
                        if !text.is_empty() {
                            segments.push(Segment {
                                text,
                                timestamp: (offset + start, Some(offset + time)),
                            });
                        }
                        on_event(EngineEvent::ChunkEnd { time });
                    }
                }
            } else if next < self.special.eot {
                on_event(EngineEvent::Token);
                if segment_start.is_none() {
                    // Text before the first timestamp token; open a segment
                    // at the window start so nothing is dropped.
                    segment_start = Some(0.0);
                    segment_tokens.clear();
                    emitted.clear();
                    on_event(EngineEvent::ChunkStart { time: 0.0 });
                }
                segment_tokens.push(next);
                let decoded = self.decode_text(&segment_tokens)?;
                if let Some(delta) = stream_delta(&emitted, &decoded) {
                    on_event(EngineEvent::PartialText {
                        text: delta.to_string(),
                    });
                    emitted = decoded;
                }
            }

            tokens.push(next);
            on_event(EngineEvent::GenerationStep {
                output_token_ids: tokens.clone(),
            });
        }

        // An open segment at end-of-window closes at the window's duration.
        if let Some(start) = segment_start {
            if !segment_tokens.is_empty() {
                let text = self.decode_text(&segment_tokens)?;
                if !text.is_empty() {
                    segments.push(Segment {
                        text,
                        timestamp: (offset + start, Some(offset + window_seconds)),
                    });
                }
            }
            on_event(EngineEvent::ChunkEnd {
                time: window_seconds,
            });
        }

        on_event(EngineEvent::ChunkBoundary {
            boundary: BoundaryInfo {
                tokens,
                timestamp: (offset, Some(offset + window_seconds)),
                is_last,
            },
        });

        Ok(segments)
    }
}

#[async_trait]
impl InferencePipeline for WhisperPipeline {
    fn time_precision(&self) -> f64 {
        m::CHUNK_LENGTH as f64 / self.config.max_source_positions as f64
    }

    async fn generate(
        &self,
        audio: &[f32],
        request: &GenerationRequest,
        on_event: &mut (dyn FnMut(EngineEvent) + Send),
    ) -> Result<TranscriptOutput> {
        if audio.is_empty() {
            return Ok(TranscriptOutput::default());
        }
        if request.do_sample {
            debug!("Sampling requested but unsupported, decoding greedily");
        }

        let mut model = self.lock_model()?;

        let sample_rate = m::SAMPLE_RATE as f64;
        let window_len = (request.chunk_length_s * sample_rate) as usize;
        let step = ((request.chunk_length_s - request.stride_length_s) * sample_rate) as usize;

        let mut output = TranscriptOutput::default();
        let mut start = 0usize;
        let mut window_index = 0u32;

        loop {
            let end = (start + window_len).min(audio.len());
            let window = &audio[start..end];
            let is_last = end >= audio.len();
            let offset =
                window_index as f64 * (request.chunk_length_s - request.stride_length_s);

            let segments =
                self.decode_window(&mut model, window, request, offset, is_last, on_event)?;
            for segment in segments {
                output.text.push_str(&segment.text);
                output.chunks.push(segment);
            }

            on_event(EngineEvent::WindowFinalized);

            if is_last {
                break;
            }
            start += step;
            window_index += 1;
        }

        debug!(
            "Transcribed {:.1}s of audio into {} segments",
            audio.len() as f64 / sample_rate,
            output.chunks.len()
        );
        Ok(output)
    }

    /// Re-decode the full token history, splitting each record into segments
    /// on its timestamp tokens and shifting them by the record's window start.
    fn decode_and_merge(
        &self,
        history: &[TokenChunk],
        options: &DecodeOptions,
    ) -> Result<TranscriptOutput> {
        let mut output = TranscriptOutput::default();

        for record in history {
            let offset = record.timestamp.map(|t| t.0).unwrap_or(0.0);
            let mut segment_start: Option<f64> = None;
            let mut segment_tokens: Vec<u32> = Vec::new();

            for &token in &record.tokens {
                if token >= self.special.timestamp_begin {
                    let time = (token - self.special.timestamp_begin) as f64 * options.time_precision;
                    match segment_start.take() {
                        None => segment_start = Some(time),
                        Some(start) => {
                            let text = self.decode_text(&segment_tokens)?;
                            if !text.is_empty() {
                                output.text.push_str(&text);
                                output.chunks.push(Segment {
                                    text,
                                    timestamp: (offset + start, Some(offset + time)),
                                });
                            }
                            segment_tokens.clear();
                        }
                    }
                } else if token < self.special.eot {
                    segment_tokens.push(token);
                }
            }

            // Tokens past the final timestamp belong to a segment whose end
            // the engine never announced.
            if !segment_tokens.is_empty() {
                let text = self.decode_text(&segment_tokens)?;
                if !text.is_empty() {
                    let start = segment_start.unwrap_or(0.0);
                    output.text.push_str(&text);
                    output.chunks.push(Segment {
                        text,
                        timestamp: (offset + start, record.timestamp.and_then(|t| t.1)),
                    });
                }
            }
        }

        if !options.return_timestamps {
            output.chunks.clear();
        }
        Ok(output)
    }

    async fn dispose(&self) -> Result<()> {
        let mut model = self.lock_model()?;
        model.reset_kv_cache();
        info!("Released pipeline for {}", self.model_id);
        Ok(())
    }
}

/// Text to stream since `emitted`, or `None` when the decode has not yet
/// grown past it cleanly.
///
/// Byte-level BPE decodes are not append-only: a re-decode can rewrite
/// earlier bytes, and a token mid-way through a multi-byte character decodes
/// to a trailing replacement character. Both cases hold the text back until
/// the decode stabilizes into an extension of what was already sent.
fn stream_delta<'a>(emitted: &str, decoded: &'a str) -> Option<&'a str> {
    if decoded.ends_with('\u{FFFD}') || !decoded.starts_with(emitted) {
        return None;
    }
    let delta = &decoded[emitted.len()..];
    if delta.is_empty() {
        None
    } else {
        Some(delta)
    }
}

/// Greedy decoding can lock onto short loops; stop the window when the tail
/// repeats.
fn is_repetitive(tokens: &[u32], new_token: u32) -> bool {
    let n = tokens.len();
    if n >= 2 && tokens[n - 2..] == [new_token, new_token] {
        return true;
    }
    if n >= 6 && tokens[n - 3..] == tokens[n - 6..n - 3] {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::policy::DtypeMap;

    #[test]
    fn test_mel_filter_bank_shape() {
        let n_freqs = m::N_FFT / 2 + 1;
        for n_mels in [80, 128] {
            let filters = mel_filter_bank(n_mels);
            assert_eq!(filters.len(), n_mels * n_freqs);

            // Every filter responds somewhere and weights stay normalized.
            for i in 0..n_mels {
                let row = &filters[i * n_freqs..(i + 1) * n_freqs];
                assert!(row.iter().any(|&w| w > 0.0), "filter {} is silent", i);
                assert!(row.iter().all(|&w| (0.0..=1.0).contains(&w)));
            }
        }
    }

    #[test]
    fn test_weight_dtype_follows_encoder_precision() {
        let accelerated = EngineOptions {
            revision: "main",
            dtype: Some(DtypeMap {
                encoder: Precision::Fp16,
                decoder: Precision::Q4,
            }),
            quantized: None,
        };
        assert_eq!(weight_dtype(&accelerated), DType::F16);

        let turbo = EngineOptions {
            revision: "main",
            dtype: Some(DtypeMap {
                encoder: Precision::Fp32,
                decoder: Precision::Q4,
            }),
            quantized: None,
        };
        assert_eq!(weight_dtype(&turbo), DType::F32);

        let cpu = EngineOptions {
            revision: "main",
            dtype: None,
            quantized: Some(true),
        };
        assert_eq!(weight_dtype(&cpu), DType::F32);
    }

    #[test]
    fn test_stream_delta_on_stable_growth() {
        assert_eq!(stream_delta("", " Hello"), Some(" Hello"));
        assert_eq!(stream_delta(" Hello", " Hello world"), Some(" world"));
        assert_eq!(stream_delta(" Hello", " Hello"), None);
    }

    #[test]
    fn test_stream_delta_holds_back_rewrites() {
        // A re-decode that rewrote earlier bytes must not be diffed by offset.
        assert_eq!(stream_delta(" Hel", " Häl"), None);
        // Once the decode extends the emitted text again, streaming resumes.
        assert_eq!(stream_delta(" Hel", " Hello"), Some("lo"));
    }

    #[test]
    fn test_stream_delta_holds_back_incomplete_characters() {
        assert_eq!(stream_delta("caf", "caf\u{FFFD}"), None);
        assert_eq!(stream_delta("caf", "café"), Some("é"));
    }

    #[test]
    fn test_repetition_guard() {
        assert!(is_repetitive(&[5, 5], 5));
        assert!(is_repetitive(&[1, 2, 3, 1, 2, 3], 7));
        assert!(!is_repetitive(&[1, 2, 3, 4, 5], 6));
        assert!(!is_repetitive(&[5], 5));
    }
}
