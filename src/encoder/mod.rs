//! External encoder process
//!
//! [`Encoder`] starts one ffmpeg job per pipeline instance. The job reports
//! its lifecycle on an [`EncoderEvent`] channel rather than restarting
//! itself; deciding what happens after a failure is the coordinator's job.

mod command;
mod error;
mod pipe;
mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use command::FfmpegCommandBuilder;
pub use error::EncoderError;
pub use pipe::EncodePipe;
pub use supervisor::FfmpegEncoder;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audio::AudioPlaylist;
use crate::renderer::Frame;

pub type JobId = Uuid;

/// Lifecycle notifications from a running job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderEvent {
    /// Process spawned and accepting input
    Started { job_id: JobId },
    /// Process exited without being asked to
    Failed { job_id: JobId, diagnostic: String },
    /// Process exited after a stop request
    Ended { job_id: JobId },
}

impl EncoderEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            EncoderEvent::Started { job_id }
            | EncoderEvent::Failed { job_id, .. }
            | EncoderEvent::Ended { job_id } => *job_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeJobState {
    Configuring,
    Starting,
    Live,
    Ending,
    Ended,
    Failed,
}

/// What to encode and where
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub job_id: JobId,
    pub audio_list: PathBuf,
    pub output: PathBuf,
    pub frame_rate: u32,
    /// Restart the audio list when it runs out
    pub loop_audio: bool,
}

/// Starts encoder processes
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Spawn a job. `Started` is sent on `events` before this returns.
    async fn start(
        &self,
        request: EncodeRequest,
        events: mpsc::UnboundedSender<EncoderEvent>,
    ) -> Result<Box<dyn EncodeHandle>, EncoderError>;
}

/// Handle to one running encoder process
#[async_trait]
pub trait EncodeHandle: Send {
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), EncoderError>;

    /// Whether frames can still be written
    fn is_open(&self) -> bool;

    /// Signal the process to finish and release the input pipe. Idempotent.
    async fn stop(&mut self);
}

/// The single encode job of a pipeline instance
pub struct EncodeJob {
    id: JobId,
    state: EncodeJobState,
    playlist: AudioPlaylist,
    audio_list: PathBuf,
    output: PathBuf,
    handle: Option<Box<dyn EncodeHandle>>,
}

impl EncodeJob {
    /// New job with a fresh id; nothing is spawned until [`EncodeJob::start`]
    pub fn configure(playlist: AudioPlaylist, audio_list: PathBuf, output: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: EncodeJobState::Configuring,
            playlist,
            audio_list,
            output,
            handle: None,
        }
    }

    pub async fn start(
        &mut self,
        encoder: &dyn Encoder,
        frame_rate: u32,
        events: mpsc::UnboundedSender<EncoderEvent>,
    ) -> Result<(), EncoderError> {
        if self.state != EncodeJobState::Configuring {
            return Err(EncoderError::StartFailure(format!(
                "job {} already started",
                self.id
            )));
        }
        self.state = EncodeJobState::Starting;

        let request = EncodeRequest {
            job_id: self.id,
            audio_list: self.audio_list.clone(),
            output: self.output.clone(),
            frame_rate,
            loop_audio: self.playlist.is_looped(),
        };
        match encoder.start(request, events).await {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state = EncodeJobState::Failed;
                Err(e)
            }
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn state(&self) -> EncodeJobState {
        self.state
    }

    pub fn playlist(&self) -> &AudioPlaylist {
        &self.playlist
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn mark_live(&mut self) {
        if self.state == EncodeJobState::Starting {
            self.state = EncodeJobState::Live;
        }
    }

    pub fn mark_failed(&mut self) {
        if self.state != EncodeJobState::Ended {
            self.state = EncodeJobState::Failed;
        }
    }

    /// Live with an open input pipe
    pub fn accepts_frames(&self) -> bool {
        self.state == EncodeJobState::Live && self.handle.as_ref().is_some_and(|h| h.is_open())
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), EncoderError> {
        match self.handle.as_mut() {
            Some(handle) => handle.write_frame(frame).await,
            None => Err(EncoderError::PipeClosed),
        }
    }

    /// Stop the process if one was spawned. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if self.state == EncodeJobState::Ended {
            return;
        }
        if self.state != EncodeJobState::Failed {
            self.state = EncodeJobState::Ending;
        }
        if let Some(handle) = self.handle.as_mut() {
            handle.stop().await;
        }
        if self.state == EncodeJobState::Ending {
            self.state = EncodeJobState::Ended;
        }
    }
}
