//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values built into the code
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_SERVER_PORT, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub jobs: JobsConfig,
}

/// Server binding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Model settings outside any single job's control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Model preloaded into the pipeline slot at startup
    pub default_model: String,
}

/// Job-channel tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Largest binary audio frame accepted, in bytes
    pub max_audio_bytes: usize,

    /// Seconds of client silence before the connection is dropped
    pub heartbeat_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            models: ModelsConfig {
                default_model: "openai/whisper-tiny".to_string(),
            },
            jobs: JobsConfig {
                // 10 minutes of f32 samples at 16 kHz
                max_audio_bytes: 10 * 60 * 16_000 * 4,
                heartbeat_timeout_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and APP_* environment
    /// variables, in that priority order. `HOST` and `PORT` are honored as
    /// deployment-platform overrides.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Check that the configuration values make sense before the server
    /// starts serving with them.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }
        if self.models.default_model.is_empty() {
            return Err(anyhow::anyhow!("Default model cannot be empty"));
        }
        if self.jobs.max_audio_bytes == 0 {
            return Err(anyhow::anyhow!("Max audio size must be greater than 0"));
        }
        Ok(())
    }

    /// Apply a partial JSON update (used by the runtime config endpoint).
    /// Only the fields present in the payload change; the result is
    /// re-validated before it is accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(models) = partial.get("models") {
            if let Some(model) = models.get("default_model").and_then(|v| v.as_str()) {
                self.models.default_model = model.to_string();
            }
        }

        if let Some(jobs) = partial.get("jobs") {
            if let Some(bytes) = jobs.get("max_audio_bytes").and_then(|v| v.as_u64()) {
                self.jobs.max_audio_bytes = bytes as usize;
            }
            if let Some(secs) = jobs.get("heartbeat_timeout_secs").and_then(|v| v.as_u64()) {
                self.jobs.heartbeat_timeout_secs = secs;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.models.default_model.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_update_leaves_other_fields() {
        let mut config = AppConfig::default();
        let json = r#"{"models": {"default_model": "openai/whisper-base"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.models.default_model, "openai/whisper-base");
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_update_rejects_invalid_result() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"server": {"port": 0}}"#).is_err());
    }
}
