//! ffmpeg process supervision
//!
//! Each job gets a monitor task that relays stderr, keeps the last few
//! lines for failure diagnostics and reports how the process ended.
//! Stopping delivers SIGINT so ffmpeg can finalize the manifest, then
//! kills the process if it has not exited within the grace period.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    EncodeHandle, EncodePipe, EncodeRequest, Encoder, EncoderError, EncoderEvent,
    FfmpegCommandBuilder, JobId,
};
use crate::config::EncoderConfig;
use crate::renderer::Frame;

/// Stderr lines kept for the failure diagnostic
const DIAGNOSTIC_LINES: usize = 20;
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);
const MAX_LINE_LENGTH: usize = 64 * 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Spawns ffmpeg for each encode job
pub struct FfmpegEncoder {
    config: EncoderConfig,
}

impl FfmpegEncoder {
    pub fn new(config: &EncoderConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn start(
        &self,
        request: EncodeRequest,
        events: mpsc::UnboundedSender<EncoderEvent>,
    ) -> Result<Box<dyn EncodeHandle>, EncoderError> {
        let args = FfmpegCommandBuilder::new(&request.output, &request.audio_list)
            .with_config(&self.config)
            .with_framerate(request.frame_rate)
            .with_audio_loop(request.loop_audio)
            .build();

        info!(
            "Starting ffmpeg job {}: {:?} {}",
            request.job_id,
            self.config.ffmpeg_path,
            args.join(" ")
        );

        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EncoderError::StartFailure(format!("{:?}: {}", self.config.ffmpeg_path, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncoderError::StartFailure("stdin not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EncoderError::StartFailure("stderr not captured".to_string()))?;

        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(supervise(
            request.job_id,
            child,
            stderr,
            cancel.clone(),
            Duration::from_millis(self.config.stop_grace_ms),
            events.clone(),
        ));

        info!("Started ffmpeg job {}", request.job_id);
        let _ = events.send(EncoderEvent::Started {
            job_id: request.job_id,
        });

        Ok(Box::new(FfmpegJob {
            job_id: request.job_id,
            pipe: EncodePipe::new(stdin, Duration::from_millis(self.config.write_timeout_ms)),
            cancel,
            monitor: Some(monitor),
        }))
    }
}

struct FfmpegJob {
    job_id: JobId,
    pipe: EncodePipe,
    cancel: CancellationToken,
    monitor: Option<JoinHandle<()>>,
}

impl FfmpegJob {
    fn process_running(&self) -> bool {
        self.monitor.as_ref().is_some_and(|m| !m.is_finished())
    }
}

#[async_trait]
impl EncodeHandle for FfmpegJob {
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), EncoderError> {
        if !self.process_running() {
            self.pipe.close();
            return Err(EncoderError::PipeClosed);
        }
        self.pipe.write(frame.bytes()).await
    }

    fn is_open(&self) -> bool {
        self.pipe.is_open() && self.process_running()
    }

    async fn stop(&mut self) {
        let Some(monitor) = self.monitor.take() else {
            return;
        };

        // Cancel before closing stdin so an EOF-triggered exit still counts
        // as requested.
        self.cancel.cancel();
        self.pipe.close();

        if let Err(e) = monitor.await {
            error!("ffmpeg monitor for job {} panicked: {}", self.job_id, e);
        }
        debug!(
            "ffmpeg job {} stopped after {} frames",
            self.job_id,
            self.pipe.frames_written()
        );
    }
}

enum Exit {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
}

async fn supervise(
    job_id: JobId,
    mut child: Child,
    stderr: ChildStderr,
    cancel: CancellationToken,
    grace: Duration,
    events: mpsc::UnboundedSender<EncoderEvent>,
) {
    // ffmpeg rewrites its progress line with '\r'
    let codec = AnyDelimiterCodec::new_with_max_length(b"\r\n".to_vec(), Vec::new(), MAX_LINE_LENGTH);
    let mut lines = FramedRead::new(stderr, codec);
    let mut stderr_open = true;
    let mut tail = StderrTail::new(DIAGNOSTIC_LINES);
    let mut progress = ProgressLog::new(job_id);

    let exit = loop {
        tokio::select! {
            line = lines.next(), if stderr_open => match line {
                Some(Ok(bytes)) => relay_line(job_id, &bytes, &mut progress, &mut tail),
                Some(Err(e)) => {
                    debug!("ffmpeg [{}] stderr read error: {}", job_id, e);
                    stderr_open = false;
                }
                None => stderr_open = false,
            },
            status = child.wait() => break Exit::Exited(status),
            _ = cancel.cancelled() => break Exit::Cancelled,
        }
    };

    let event = match exit {
        Exit::Cancelled => {
            match terminate(&mut child, grace).await {
                Ok(status) => info!("ffmpeg job {} ended ({})", job_id, status),
                Err(e) => warn!("ffmpeg job {} did not terminate cleanly: {}", job_id, e),
            }
            EncoderEvent::Ended { job_id }
        }
        Exit::Exited(_) if cancel.is_cancelled() => {
            info!("ffmpeg job {} ended", job_id);
            EncoderEvent::Ended { job_id }
        }
        Exit::Exited(status) => {
            // Pick up whatever the process wrote on its way out
            if stderr_open {
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
                    while let Some(Ok(bytes)) = lines.next().await {
                        relay_line(job_id, &bytes, &mut progress, &mut tail);
                    }
                })
                .await;
            }
            let summary = match status {
                Ok(status) => format!("ffmpeg exited with {status}"),
                Err(e) => format!("failed to wait for ffmpeg: {e}"),
            };
            let diagnostic = tail.diagnostic(&summary);
            error!("ffmpeg job {} failed: {}", job_id, diagnostic);
            EncoderEvent::Failed { job_id, diagnostic }
        }
    };

    let _ = events.send(event);
}

fn relay_line(job_id: JobId, bytes: &[u8], progress: &mut ProgressLog, tail: &mut StderrTail) {
    let line = String::from_utf8_lossy(bytes);
    let line = line.trim();
    if line.is_empty() || progress.observe(line) {
        return;
    }
    debug!("ffmpeg [{}]: {}", job_id, line);
    tail.push(line);
}

/// SIGINT, then kill once the grace period runs out
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }
        }
    }

    #[cfg(not(unix))]
    {
        child.start_kill()?;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("ffmpeg did not exit within {:?}, killing", grace);
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Last N non-progress stderr lines
struct StderrTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, line: &str) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    fn diagnostic(&self, summary: &str) -> String {
        if self.lines.is_empty() {
            return summary.to_string();
        }
        let tail: Vec<&str> = self.lines.iter().map(String::as_str).collect();
        format!("{summary}; last output: {}", tail.join(" | "))
    }
}

/// Rate-limited summary of ffmpeg progress lines
struct ProgressLog {
    job_id: JobId,
    last_logged: Option<Instant>,
}

impl ProgressLog {
    fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            last_logged: None,
        }
    }

    /// Returns false if `line` is not a progress line
    fn observe(&mut self, line: &str) -> bool {
        if !is_progress(line) {
            return false;
        }

        let due = self
            .last_logged
            .map_or(true, |at| at.elapsed() >= PROGRESS_LOG_INTERVAL);
        if due {
            info!(
                "ffmpeg [{}] frame={} fps={} time={} bitrate={} speed={}",
                self.job_id,
                extract_value(line, "frame=").unwrap_or_else(|| "?".into()),
                extract_value(line, "fps=").unwrap_or_else(|| "?".into()),
                extract_value(line, "time=").unwrap_or_else(|| "?".into()),
                extract_value(line, "bitrate=").unwrap_or_else(|| "N/A".into()),
                extract_value(line, "speed=").unwrap_or_else(|| "?".into()),
            );
            self.last_logged = Some(Instant::now());
        }
        true
    }
}

fn is_progress(line: &str) -> bool {
    line.contains("time=") && line.contains("bitrate=")
}

fn extract_value(line: &str, key: &str) -> Option<String> {
    let start = line.find(key)?;
    let after_key = line[start + key.len()..].trim_start();
    let end = after_key
        .find(char::is_whitespace)
        .unwrap_or(after_key.len());
    Some(after_key[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_value() {
        let line = "frame= 123 fps= 10.0 q=28.0 size=N/A time=00:00:12.30 bitrate=N/A speed=0.99x";

        assert_eq!(extract_value(line, "frame="), Some("123".to_string()));
        assert_eq!(extract_value(line, "fps="), Some("10.0".to_string()));
        assert_eq!(extract_value(line, "time="), Some("00:00:12.30".to_string()));
        assert_eq!(extract_value(line, "speed="), Some("0.99x".to_string()));
        assert_eq!(extract_value(line, "missing="), None);
        assert!(is_progress(line));
        assert!(!is_progress("Input #0, image2pipe, from 'pipe:0':"));
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let mut tail = StderrTail::new(2);
        assert_eq!(tail.diagnostic("exit 1"), "exit 1");

        tail.push("a");
        tail.push("b");
        tail.push("c");
        assert_eq!(tail.diagnostic("exit 1"), "exit 1; last output: b | c");
    }

    #[cfg(unix)]
    fn encoder_with(script: &str, dir: &std::path::Path) -> FfmpegEncoder {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-ffmpeg");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = EncoderConfig::default();
        config.ffmpeg_path = path;
        config.stop_grace_ms = 500;
        FfmpegEncoder::new(&config)
    }

    fn request(dir: &std::path::Path) -> EncodeRequest {
        EncodeRequest {
            job_id: uuid::Uuid::new_v4(),
            audio_list: dir.join("audio_list.txt"),
            output: dir.join("stream.m3u8"),
            frame_rate: 10,
            loop_audio: true,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unrequested_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = encoder_with("#!/bin/sh\necho 'Conversion failed!' >&2\nexit 1\n", dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let req = request(dir.path());

        let mut handle = encoder.start(req.clone(), tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(EncoderEvent::Started { job_id: req.job_id }));

        match rx.recv().await {
            Some(EncoderEvent::Failed { job_id, diagnostic }) => {
                assert_eq!(job_id, req.job_id);
                assert!(diagnostic.contains("Conversion failed!"), "{diagnostic}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        handle.stop().await;
        assert!(!handle.is_open());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_reports_ended_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = encoder_with("#!/bin/sh\nexec cat > /dev/null\n", dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let req = request(dir.path());

        let mut handle = encoder.start(req.clone(), tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(EncoderEvent::Started { job_id: req.job_id }));

        let frame = Frame::new(vec![0xFF, 0xD8, 0xFF, 0xD9], crate::config::Region {
            x: 0,
            y: 0,
            width: 1,
            height: 1,
        });
        handle.write_frame(&frame).await.unwrap();
        assert!(handle.is_open());

        handle.stop().await;
        handle.stop().await;

        assert_eq!(rx.recv().await, Some(EncoderEvent::Ended { job_id: req.job_id }));
        assert!(!handle.is_open());
        assert!(matches!(
            handle.write_frame(&frame).await,
            Err(EncoderError::PipeClosed)
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EncoderConfig::default();
        config.ffmpeg_path = dir.path().join("no-such-ffmpeg");
        let encoder = FfmpegEncoder::new(&config);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = encoder.start(request(dir.path()), tx).await;
        assert!(matches!(result, Err(EncoderError::StartFailure(_))));
        assert!(rx.try_recv().is_err());
    }
}
