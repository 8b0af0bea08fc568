use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{trace, warn};

use crate::encoder::EncodeJob;
use crate::renderer::{RendererSession, RendererState};

/// Result of one scheduler tick
#[derive(Debug)]
pub enum TickOutcome {
    /// Nothing to do (disarmed, renderer not ready or encoder not accepting)
    Skipped,
    /// One frame captured and written
    Delivered,
    /// Capture or write failed; reported once per failure episode
    Failed(String),
}

/// Fixed-period frame pump, armed only while the pipeline is live.
///
/// Missed ticks are skipped rather than bunched up: dropping frames is fine,
/// stalling is not.
pub struct FrameScheduler {
    period: Duration,
    interval: Option<Interval>,
    failure_reported: bool,
}

impl FrameScheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            interval: None,
            failure_reported: false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.interval.is_some()
    }

    /// Start ticking one period from now. Arming twice keeps the existing timer.
    pub fn arm(&mut self) {
        if self.interval.is_some() {
            return;
        }
        let mut interval = tokio::time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.interval = Some(interval);
        self.failure_reported = false;
    }

    pub fn disarm(&mut self) {
        self.interval = None;
    }

    /// Wait for the next tick; never resolves while disarmed
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    /// Capture one frame and forward it to the encoder
    pub async fn run_tick(
        &mut self,
        renderer: Option<&mut RendererSession>,
        job: Option<&mut EncodeJob>,
    ) -> TickOutcome {
        if !self.is_armed() {
            return TickOutcome::Skipped;
        }
        let (Some(renderer), Some(job)) = (renderer, job) else {
            return TickOutcome::Skipped;
        };
        if renderer.state() != RendererState::Ready || !job.accepts_frames() {
            return TickOutcome::Skipped;
        }

        let frame = match renderer.capture_frame().await {
            Ok(frame) => frame,
            Err(e) => return self.fail(format!("frame capture failed: {e}")),
        };
        if let Err(e) = job.write_frame(&frame).await {
            return self.fail(format!("frame write failed: {e}"));
        }

        trace!(
            "Delivered {} byte frame of {:?} captured at {}",
            frame.bytes().len(),
            frame.region(),
            frame.captured_at()
        );
        TickOutcome::Delivered
    }

    fn fail(&mut self, reason: String) -> TickOutcome {
        self.disarm();
        if self.failure_reported {
            return TickOutcome::Skipped;
        }
        self.failure_reported = true;
        warn!("Frame scheduler disarmed: {}", reason);
        TickOutcome::Failed(reason)
    }
}
