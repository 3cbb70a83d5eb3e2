//! # Application State Management
//!
//! Shared state every connection and HTTP handler can reach: the runtime
//! configuration, job metrics, and the single pipeline slot. Mutable pieces
//! sit behind `Arc<RwLock<..>>` so many readers can proceed while updates
//! stay exclusive.

use crate::config::AppConfig;
use crate::transcription::manager::PipelineManager;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// State shared across all connections.
#[derive(Clone)]
pub struct AppState {
    /// Runtime configuration, updatable through the config endpoint
    pub config: Arc<RwLock<AppConfig>>,

    /// Transcription job counters
    pub metrics: Arc<RwLock<JobMetrics>>,

    /// The single-slot pipeline owner every job resolves through
    pub pipelines: Arc<PipelineManager>,

    /// Server start, for uptime reporting
    pub start_time: Instant,
}

/// Counters over the transcription jobs this process has served.
#[derive(Debug, Default, Clone)]
pub struct JobMetrics {
    pub jobs_received: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub active_jobs: u32,
}

impl AppState {
    pub fn new(config: AppConfig, pipelines: Arc<PipelineManager>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(JobMetrics::default())),
            pipelines,
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; cloning releases the lock
    /// immediately instead of holding it across a handler.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating the candidate.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn job_started(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.jobs_received += 1;
        metrics.active_jobs += 1;
    }

    pub fn job_completed(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.jobs_completed += 1;
        if metrics.active_jobs > 0 {
            metrics.active_jobs -= 1;
        }
    }

    pub fn job_failed(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.jobs_failed += 1;
        if metrics.active_jobs > 0 {
            metrics.active_jobs -= 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> JobMetrics {
        self.metrics.read().unwrap().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
