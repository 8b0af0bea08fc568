//! Recovery coordinator
//!
//! Single owner of the renderer session, the encode job and the frame
//! scheduler. Encoder events, scheduler ticks, the settle and rebuild
//! timers and shutdown requests are all handled on one task, so pipeline
//! state has exactly one writer.
//!
//! Any failure tears down both halves of the pipeline before a rebuild is
//! scheduled: there is never more than one renderer or encode job alive.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{
    Backoff, FrameScheduler, PipelineCommand, PipelineStatus, ReadinessFlag, TickOutcome,
};
use crate::audio::{AudioPlaylistBuilder, PlaylistError};
use crate::config::Config;
use crate::crash::record_transition;
use crate::encoder::{EncodeJob, EncodeJobState, Encoder, EncoderError, EncoderEvent};
use crate::renderer::{Browser, RendererError, RendererSession, RendererSettings};

/// Failure while building a pipeline instance
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("renderer: {0}")]
    Renderer(#[from] RendererError),

    #[error("audio: {0}")]
    Playlist(#[from] PlaylistError),

    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline gave up after {attempts} consecutive failed attempts")]
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Bootstrapping,
    Live,
    Recovering,
    Stopped,
    Exhausted,
}

/// Everything needed to build one pipeline instance
struct InstanceRecipe {
    browser: Arc<dyn Browser>,
    encoder: Arc<dyn Encoder>,
    playlist_builder: AudioPlaylistBuilder,
    renderer_settings: RendererSettings,
    frame_rate: u32,
    output: PathBuf,
    events_tx: mpsc::UnboundedSender<EncoderEvent>,
}

impl InstanceRecipe {
    /// Renderer, then audio loop, then encoder. Whatever was built before a
    /// failure is left in `renderer`/`job` for the teardown that follows.
    async fn build(
        &self,
        renderer: &mut Option<RendererSession>,
        job: &mut Option<EncodeJob>,
    ) -> Result<(), BootstrapError> {
        debug_assert!(renderer.is_none() && job.is_none());

        let session =
            RendererSession::open(self.browser.as_ref(), self.renderer_settings.clone()).await?;
        *renderer = Some(session);

        let playlist = self.playlist_builder.build()?;

        let mut new_job = EncodeJob::configure(
            playlist,
            self.playlist_builder.list_path().to_path_buf(),
            self.output.clone(),
        );
        let result = new_job
            .start(self.encoder.as_ref(), self.frame_rate, self.events_tx.clone())
            .await;
        *job = Some(new_job);
        result?;

        Ok(())
    }
}

pub struct RecoveryCoordinator {
    recipe: InstanceRecipe,
    settle_delay: Duration,
    backoff: Backoff,

    state: CoordinatorState,
    renderer: Option<RendererSession>,
    job: Option<EncodeJob>,
    scheduler: FrameScheduler,
    readiness: ReadinessFlag,

    /// Consecutive failed pipeline instances; reset when one goes live
    failures: u32,
    settle_at: Option<Instant>,
    rebuild_at: Option<Instant>,

    cmd_rx: mpsc::Receiver<PipelineCommand>,
    status_tx: broadcast::Sender<PipelineStatus>,
    events_rx: mpsc::UnboundedReceiver<EncoderEvent>,
}

impl RecoveryCoordinator {
    pub fn new(
        config: &Config,
        browser: Arc<dyn Browser>,
        encoder: Arc<dyn Encoder>,
        readiness: ReadinessFlag,
        cmd_rx: mpsc::Receiver<PipelineCommand>,
        status_tx: broadcast::Sender<PipelineStatus>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            recipe: InstanceRecipe {
                browser,
                encoder,
                playlist_builder: AudioPlaylistBuilder::new(
                    &config.paths.audio_dir,
                    config.audio_list_path(),
                ),
                renderer_settings: RendererSettings::from_config(config),
                frame_rate: config.capture.frame_rate,
                output: config.manifest_path(),
                events_tx,
            },
            settle_delay: Duration::from_millis(config.encoder.settle_ms),
            backoff: Backoff::from_config(&config.recovery),
            state: CoordinatorState::Bootstrapping,
            renderer: None,
            job: None,
            scheduler: FrameScheduler::new(config.frame_period()),
            readiness,
            failures: 0,
            settle_at: None,
            rebuild_at: None,
            cmd_rx,
            status_tx,
            events_rx,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Run until stopped or out of attempts
    pub async fn run(&mut self) -> Result<(), PipelineError> {
        info!(
            "Pipeline coordinator starting ({} fps, output {:?})",
            self.recipe.frame_rate, self.recipe.output
        );
        self.rebuild_at = Some(Instant::now());

        while !matches!(
            self.state,
            CoordinatorState::Stopped | CoordinatorState::Exhausted
        ) {
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => {
                    match cmd {
                        PipelineCommand::Shutdown => {
                            info!("Shutdown command received");
                            self.stop().await;
                        }
                    }
                }

                Some(event) = self.events_rx.recv() => {
                    self.handle_encoder_event(event).await;
                }

                _ = sleep_until(self.rebuild_at) => {
                    self.rebuild_at = None;
                    self.bootstrap().await;
                }

                _ = sleep_until(self.settle_at) => {
                    self.settle_at = None;
                    self.go_live().await;
                }

                _ = self.scheduler.tick() => {
                    let outcome = self
                        .scheduler
                        .run_tick(self.renderer.as_mut(), self.job.as_mut())
                        .await;
                    if let TickOutcome::Failed(reason) = outcome {
                        self.recover(reason).await;
                    }
                }
            }
        }

        info!("Pipeline coordinator stopped");
        match self.state {
            CoordinatorState::Exhausted => Err(PipelineError::Exhausted {
                attempts: self.failures,
            }),
            _ => Ok(()),
        }
    }

    /// Full teardown without rebuilding. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if self.state == CoordinatorState::Stopped {
            debug!("Pipeline already stopped");
            return;
        }
        info!("Stopping pipeline");
        self.rebuild_at = None;
        self.teardown().await;
        self.state = CoordinatorState::Stopped;
        self.publish(PipelineStatus::Stopped);
    }

    async fn bootstrap(&mut self) {
        let attempt = self.failures + 1;
        self.state = CoordinatorState::Bootstrapping;
        self.publish(PipelineStatus::Bootstrapping { attempt });

        // Bring-up can take a while; a shutdown request must not wait for it.
        // Dropping the build releases anything it had launched so far.
        let outcome = tokio::select! {
            result = self.recipe.build(&mut self.renderer, &mut self.job) => Some(result),
            Some(PipelineCommand::Shutdown) = self.cmd_rx.recv() => None,
        };

        match outcome {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                error!("Pipeline bootstrap attempt {} failed: {}", attempt, e);
                self.recover(e.to_string()).await;
            }
            None => {
                info!("Shutdown command received during bootstrap");
                self.stop().await;
            }
        }
    }

    async fn handle_encoder_event(&mut self, event: EncoderEvent) {
        let Some(job) = self.job.as_mut() else {
            debug!("Ignoring encoder event with no active job: {:?}", event);
            return;
        };
        if job.id() != event.job_id() {
            debug!("Ignoring stale encoder event: {:?}", event);
            return;
        }

        match event {
            EncoderEvent::Started { job_id } => {
                if self.state == CoordinatorState::Bootstrapping && self.settle_at.is_none() {
                    info!(
                        "Encoder job {} started, going live in {:?}",
                        job_id, self.settle_delay
                    );
                    self.settle_at = Some(Instant::now() + self.settle_delay);
                }
            }
            EncoderEvent::Failed { diagnostic, .. } => {
                job.mark_failed();
                self.recover(EncoderError::RuntimeFailure(diagnostic).to_string())
                    .await;
            }
            EncoderEvent::Ended { job_id } => {
                job.mark_failed();
                let reason = format!("job {job_id} ended unexpectedly");
                self.recover(EncoderError::RuntimeFailure(reason).to_string())
                    .await;
            }
        }
    }

    async fn go_live(&mut self) {
        if self.state != CoordinatorState::Bootstrapping {
            return;
        }

        let renderer_ready = self.renderer.as_ref().is_some_and(|r| r.is_ready());
        let Some(job) = self.job.as_mut() else {
            return;
        };
        if job.state() != EncodeJobState::Starting {
            return;
        }
        if !renderer_ready {
            self.recover("renderer lost before going live".to_string())
                .await;
            return;
        }

        job.mark_live();
        let job_id = job.id();
        info!(
            "Pipeline live: job {} writing {:?} with {} audio tracks",
            job_id,
            job.output(),
            job.playlist().tracks().len()
        );

        self.scheduler.arm();
        self.readiness.set(true);
        self.failures = 0;
        self.state = CoordinatorState::Live;
        self.publish(PipelineStatus::Live { job_id });
    }

    async fn recover(&mut self, reason: String) {
        if matches!(
            self.state,
            CoordinatorState::Stopped | CoordinatorState::Exhausted
        ) {
            return;
        }

        warn!("Pipeline failure: {}", reason);
        self.state = CoordinatorState::Recovering;
        self.teardown().await;
        self.publish(PipelineStatus::Recovering { reason });

        self.failures += 1;
        if self.backoff.exhausted(self.failures) {
            error!(
                "Giving up after {} consecutive failed attempts",
                self.failures
            );
            self.state = CoordinatorState::Exhausted;
            self.publish(PipelineStatus::Exhausted);
            return;
        }

        let delay = self.backoff.delay_for(self.failures);
        info!("Rebuilding pipeline in {:?}", delay);
        self.rebuild_at = Some(Instant::now() + delay);
    }

    /// Disarm, clear readiness, stop the encoder, close the renderer
    async fn teardown(&mut self) {
        self.scheduler.disarm();
        self.readiness.set(false);
        self.settle_at = None;

        if let Some(mut job) = self.job.take() {
            job.stop().await;
            debug!("Encode job {} torn down ({:?})", job.id(), job.state());
        }
        if let Some(mut renderer) = self.renderer.take() {
            renderer.close().await;
        }
    }

    fn publish(&self, status: PipelineStatus) {
        record_transition(&format!("{:?}", status));
        let _ = self.status_tx.send(status);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
