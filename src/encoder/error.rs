use thiserror::Error;

/// Errors from starting, feeding or supervising the encoder process
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("encoder failed to start: {0}")]
    StartFailure(String),

    #[error("encoder failed: {0}")]
    RuntimeFailure(String),

    #[error("frame write did not complete within {timeout_ms}ms")]
    PipeTimeout { timeout_ms: u64 },

    #[error("encoder input pipe is closed")]
    PipeClosed,

    #[error("encoder I/O error: {0}")]
    Io(#[from] std::io::Error),
}
