//! Capture → encode → publish pipeline
//!
//! [`RecoveryCoordinator`] owns the renderer session and the encode job,
//! drives the [`FrameScheduler`] and rebuilds everything from scratch
//! whenever either side fails. It is also the only writer of the
//! [`ReadinessFlag`] that the health endpoint reads.

mod backoff;
mod coordinator;
mod scheduler;

pub use backoff::Backoff;
pub use coordinator::RecoveryCoordinator;
pub use scheduler::{FrameScheduler, TickOutcome};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::encoder::JobId;

/// Commands that can be sent to the coordinator
#[derive(Debug, Clone)]
pub enum PipelineCommand {
    /// Tear everything down and stop
    Shutdown,
}

/// Status updates from the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStatus {
    /// Building renderer, audio loop and encoder
    Bootstrapping {
        /// 1-based count of consecutive attempts
        attempt: u32,
    },
    /// Frames are flowing and readiness is advertised
    Live { job_id: JobId },
    /// Tearing down after a failure
    Recovering { reason: String },
    /// Stopped on request
    Stopped,
    /// Gave up after too many consecutive failures
    Exhausted,
}

/// Whether the stream can be advertised as up. Written by the coordinator.
#[derive(Debug, Clone, Default)]
pub struct ReadinessFlag(Arc<AtomicBool>);

impl ReadinessFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    /// Read-only view for the health endpoint
    pub fn probe(&self) -> ReadinessProbe {
        ReadinessProbe(self.0.clone())
    }
}

/// Read side of [`ReadinessFlag`]
#[derive(Debug, Clone)]
pub struct ReadinessProbe(Arc<AtomicBool>);

impl ReadinessProbe {
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Create command and status channels for the coordinator
pub fn create_pipeline_channels() -> (
    mpsc::Sender<PipelineCommand>,
    mpsc::Receiver<PipelineCommand>,
    broadcast::Sender<PipelineStatus>,
    broadcast::Receiver<PipelineStatus>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (status_tx, status_rx) = broadcast::channel(16);
    (cmd_tx, cmd_rx, status_tx, status_rx)
}
