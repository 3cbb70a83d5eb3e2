//! # Device Configuration Policy
//!
//! Pure mapping from a transcription job's (model, multilingual, device,
//! quantized) parameters to the engine configuration used to load a pipeline:
//! per-sub-model precision, quantization mode, model revision, and the
//! normalized model identifier.
//!
//! ## Key Decisions:
//! - **English-only suffix**: CPU jobs for non-distil, non-multilingual models
//!   use the `.en` model variant (lower resource use in exchange for dropping
//!   multilingual capability)
//! - **Medium revision**: `whisper-medium` models load the `no_attentions`
//!   revision, which omits attention-state tensors to reduce load-time memory
//! - **Accelerated precision**: fp16 encoder (fp32 only for the large turbo
//!   variant), q4 decoder (fp16 decoding is numerically unstable on this path)

use serde::{Deserialize, Serialize};

/// Compute device a job runs on.
///
/// Unrecognized device strings are rejected by serde when the job request is
/// deserialized, so the policy itself has no failure mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// CPU inference with optional integer quantization
    #[default]
    Cpu,

    /// GPU-accelerated inference with a mixed-precision dtype map
    Accelerated,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Accelerated => write!(f, "accelerated"),
        }
    }
}

/// Identifies which engine configuration is loaded.
///
/// Two descriptors are equal iff all fields match; the lifecycle manager
/// reloads the pipeline whenever the descriptor of an incoming job differs
/// from the one currently held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    /// Normalized model identifier (after `.en` suffixing)
    pub model_id: String,

    /// Whether CPU quantization was requested
    pub quantized: bool,

    /// Target device
    pub device: DeviceKind,
}

impl ModelDescriptor {
    /// Build a descriptor from raw job parameters, normalizing the model id.
    pub fn from_job(model: &str, multilingual: bool, quantized: bool, device: DeviceKind) -> Self {
        Self {
            model_id: normalize_model_id(model, multilingual, device),
            quantized,
            device,
        }
    }
}

/// Numeric precision for one sub-model of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Fp32,
    Fp16,
    /// 4-bit quantized weights
    Q4,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Fp32 => "fp32",
            Precision::Fp16 => "fp16",
            Precision::Q4 => "q4",
        }
    }
}

/// Per-sub-model precision selection for the accelerated path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtypeMap {
    pub encoder: Precision,
    pub decoder: Precision,
}

/// Engine configuration derived from a descriptor.
///
/// `dtype` is set only for accelerated jobs; `quantized` only for CPU jobs.
/// The engine treats this as opaque load configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Model revision to download (`"main"` or `"no_attentions"`)
    pub revision: &'static str,

    /// Mixed-precision map (accelerated path only)
    pub dtype: Option<DtypeMap>,

    /// Integer quantization flag (CPU path only)
    pub quantized: Option<bool>,
}

/// Repository prefix identifying distil-whisper models.
const DISTIL_PREFIX: &str = "distil-whisper/";

/// The one accelerated model whose encoder must stay in full precision.
const LARGE_TURBO_MODEL: &str = "onnx-community/whisper-large-v3-turbo";

/// Whether a model id names a distil-whisper variant.
pub fn is_distil_model(model: &str) -> bool {
    model.starts_with(DISTIL_PREFIX)
}

/// Normalize a model identifier for the requested configuration.
///
/// Non-distil, non-multilingual models running on CPU get the English-only
/// `.en` suffix; every other combination uses the id as-is.
pub fn normalize_model_id(model: &str, multilingual: bool, device: DeviceKind) -> String {
    if !is_distil_model(model) && !multilingual && device == DeviceKind::Cpu {
        format!("{}.en", model)
    } else {
        model.to_string()
    }
}

/// Derive the engine configuration for a descriptor.
///
/// ## Selection Rules:
/// - Medium models request the `no_attentions` revision regardless of device
/// - Accelerated: encoder fp16 (fp32 for the large turbo variant), decoder q4
/// - CPU: the boolean quantization flag is passed through unchanged
pub fn engine_options(descriptor: &ModelDescriptor) -> EngineOptions {
    let revision = if descriptor.model_id.contains("/whisper-medium") {
        "no_attentions"
    } else {
        "main"
    };

    match descriptor.device {
        DeviceKind::Accelerated => EngineOptions {
            revision,
            dtype: Some(DtypeMap {
                encoder: if descriptor.model_id == LARGE_TURBO_MODEL {
                    Precision::Fp32
                } else {
                    Precision::Fp16
                },
                decoder: Precision::Q4,
            }),
            quantized: None,
        },
        DeviceKind::Cpu => EngineOptions {
            revision,
            dtype: None,
            quantized: Some(descriptor.quantized),
        },
    }
}

/// Sliding-window parameters `(chunk_length_s, stride_length_s)` for a model.
///
/// Distil models decode shorter windows with tighter overlap.
pub fn sliding_window(model: &str) -> (f64, f64) {
    if is_distil_model(model) {
        (20.0, 3.0)
    } else {
        (30.0, 5.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_english_suffix_for_cpu_monolingual() {
        assert_eq!(normalize_model_id("foo", false, DeviceKind::Cpu), "foo.en");
    }

    #[test]
    fn test_no_suffix_when_multilingual_or_accelerated_or_distil() {
        assert_eq!(normalize_model_id("foo", true, DeviceKind::Cpu), "foo");
        assert_eq!(normalize_model_id("foo", false, DeviceKind::Accelerated), "foo");
        assert_eq!(
            normalize_model_id("distil-whisper/distil-small", false, DeviceKind::Cpu),
            "distil-whisper/distil-small"
        );
    }

    #[test]
    fn test_medium_models_use_no_attentions_revision() {
        for device in [DeviceKind::Cpu, DeviceKind::Accelerated] {
            let descriptor = ModelDescriptor::from_job("openai/whisper-medium", true, false, device);
            assert_eq!(engine_options(&descriptor).revision, "no_attentions");
        }

        let descriptor = ModelDescriptor::from_job("openai/whisper-tiny", true, false, DeviceKind::Cpu);
        assert_eq!(engine_options(&descriptor).revision, "main");
    }

    #[test]
    fn test_accelerated_dtype_map() {
        let descriptor = ModelDescriptor::from_job("openai/whisper-base", true, false, DeviceKind::Accelerated);
        let options = engine_options(&descriptor);
        let dtype = options.dtype.expect("accelerated jobs carry a dtype map");
        assert_eq!(dtype.encoder, Precision::Fp16);
        assert_eq!(dtype.decoder, Precision::Q4);
        assert_eq!(options.quantized, None);
    }

    #[test]
    fn test_large_turbo_keeps_full_precision_encoder() {
        let descriptor = ModelDescriptor::from_job(
            "onnx-community/whisper-large-v3-turbo",
            true,
            false,
            DeviceKind::Accelerated,
        );
        let dtype = engine_options(&descriptor).dtype.unwrap();
        assert_eq!(dtype.encoder, Precision::Fp32);
        assert_eq!(dtype.decoder, Precision::Q4);
    }

    #[test]
    fn test_cpu_quantization_passthrough() {
        let descriptor = ModelDescriptor::from_job("openai/whisper-tiny", false, true, DeviceKind::Cpu);
        let options = engine_options(&descriptor);
        assert_eq!(options.quantized, Some(true));
        assert!(options.dtype.is_none());
    }

    #[test]
    fn test_descriptor_equality_drives_reload() {
        let a = ModelDescriptor::from_job("foo", true, false, DeviceKind::Cpu);
        let b = ModelDescriptor::from_job("foo", true, false, DeviceKind::Cpu);
        let c = ModelDescriptor::from_job("foo", true, true, DeviceKind::Cpu);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_sliding_window_parameters() {
        assert_eq!(sliding_window("openai/whisper-base"), (30.0, 5.0));
        assert_eq!(sliding_window("distil-whisper/distil-medium.en"), (20.0, 3.0));
    }

    #[test]
    fn test_unknown_device_string_is_rejected() {
        assert!(serde_json::from_str::<DeviceKind>("\"webgpu\"").is_err());
        assert_eq!(
            serde_json::from_str::<DeviceKind>("\"accelerated\"").unwrap(),
            DeviceKind::Accelerated
        );
    }
}
