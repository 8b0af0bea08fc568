use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::ChildStdin;

use super::EncoderError;

/// Byte sink feeding captured frames into the encoder's stdin.
///
/// Every write is bounded by `write_timeout`. A write that fails or times
/// out closes the pipe; the encoder cannot resync on a torn frame.
pub struct EncodePipe<W = ChildStdin> {
    writer: Option<W>,
    write_timeout: Duration,
    frames_written: u64,
}

impl<W: AsyncWrite + Unpin + Send> EncodePipe<W> {
    pub fn new(writer: W, write_timeout: Duration) -> Self {
        Self {
            writer: Some(writer),
            write_timeout,
            frames_written: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), EncoderError> {
        let writer = self.writer.as_mut().ok_or(EncoderError::PipeClosed)?;

        let result = match tokio::time::timeout(self.write_timeout, writer.write_all(bytes)).await {
            Ok(Ok(())) => writer.flush().await.map_err(EncoderError::from),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(EncoderError::PipeClosed),
            Ok(Err(e)) => Err(EncoderError::Io(e)),
            Err(_) => Err(EncoderError::PipeTimeout {
                timeout_ms: self.write_timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(()) => {
                self.frames_written += 1;
                Ok(())
            }
            Err(e) => {
                self.writer = None;
                Err(e)
            }
        }
    }

    /// Drop the writer so the encoder sees end-of-input
    pub fn close(&mut self) {
        self.writer = None;
    }
}
