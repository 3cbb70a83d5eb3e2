//! # Pipeline Lifecycle Manager
//!
//! Owns the single live pipeline slot. At most one instance is
//! device-resident per worker: a descriptor change disposes the previous
//! instance strictly before a replacement load begins, and the in-flight load
//! itself is published into the slot before it is awaited, so concurrent
//! resolves for the same descriptor join one load instead of duplicating it.
//!
//! ## Slot States:
//! - empty: no pipeline loaded or loading
//! - `(descriptor, load)` with the load pending: resolves for the same
//!   descriptor await the shared load
//! - `(descriptor, load)` with the load settled Ok: the resident instance
//! - a settled-Err load never stays in the slot; the failing resolve clears it

use crate::transcription::engine::{InferencePipeline, LoadError, PipelineLoader, ProgressSink};
use crate::transcription::policy::{self, ModelDescriptor};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<dyn InferencePipeline>, LoadError>>>;

/// Snapshot of the slot for the health endpoints.
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub descriptor: ModelDescriptor,

    /// True once the load has settled successfully
    pub ready: bool,
}

/// Single-slot owner of the loaded inference pipeline.
pub struct PipelineManager {
    loader: Arc<dyn PipelineLoader>,
    slot: Mutex<Option<(ModelDescriptor, SharedLoad)>>,
}

impl PipelineManager {
    pub fn new(loader: Arc<dyn PipelineLoader>) -> Self {
        Self {
            loader,
            slot: Mutex::new(None),
        }
    }

    /// Resolve the pipeline for `descriptor`, reusing the held instance when
    /// the descriptor matches and reloading otherwise.
    ///
    /// `progress` is forwarded verbatim to the load operation and not
    /// otherwise interpreted. A load failure propagates to the caller and
    /// clears the slot, so no stale descriptor points at an absent instance.
    pub async fn resolve(
        &self,
        descriptor: &ModelDescriptor,
        progress: ProgressSink,
    ) -> Result<Arc<dyn InferencePipeline>, LoadError> {
        let load = {
            let mut slot = self.slot.lock().await;
            match slot.as_ref() {
                Some((held, load)) if held == descriptor => load.clone(),
                _ => {
                    // Dispose the previous instance before a new load begins;
                    // two simultaneous device-resident models must never exist.
                    if let Some((held, previous)) = slot.take() {
                        info!("Replacing pipeline {:?} with {:?}", held, descriptor);
                        Self::dispose_settled(previous).await;
                    }

                    let options = policy::engine_options(descriptor);
                    let loader = Arc::clone(&self.loader);
                    let load_descriptor = descriptor.clone();
                    let load: SharedLoad = async move {
                        loader.load(&load_descriptor, &options, progress).await
                    }
                    .boxed()
                    .shared();

                    // Publish the in-flight load itself, not its eventual
                    // result, before awaiting it.
                    *slot = Some((descriptor.clone(), load.clone()));
                    load
                }
            }
        };

        match load.await {
            Ok(pipeline) => Ok(pipeline),
            Err(error) => {
                self.clear_failed(descriptor).await;
                Err(error)
            }
        }
    }

    /// Current slot contents, if any.
    pub async fn status(&self) -> Option<PipelineStatus> {
        let slot = self.slot.lock().await;
        slot.as_ref().map(|(descriptor, load)| PipelineStatus {
            descriptor: descriptor.clone(),
            ready: matches!(load.peek(), Some(Ok(_))),
        })
    }

    /// Await a previous load and dispose its instance if it produced one.
    /// A load that failed holds no device memory.
    async fn dispose_settled(load: SharedLoad) {
        if let Ok(instance) = load.await {
            if let Err(error) = instance.dispose().await {
                warn!("Failed to dispose previous pipeline: {}", error);
            }
        }
    }

    /// Drop a settled-Err load from the slot, unless another resolve has
    /// already replaced it.
    async fn clear_failed(&self, descriptor: &ModelDescriptor) {
        let mut slot = self.slot.lock().await;
        let failed = matches!(
            slot.as_ref(),
            Some((held, load)) if held == descriptor && matches!(load.peek(), Some(Err(_)))
        );
        if failed {
            *slot = None;
        }
    }
}
