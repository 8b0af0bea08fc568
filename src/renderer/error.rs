//! Renderer error taxonomy.

use thiserror::Error;

/// Errors raised while bringing up or capturing from a renderer session.
#[derive(Debug, Error)]
pub enum RendererError {
    /// Chrome could not be started or connected to.
    #[error("failed to launch browser: {0}")]
    LaunchFailed(String),

    /// The page did not settle before the navigation timeout.
    #[error("page {url} did not settle within {timeout_ms}ms")]
    NavigationTimeout { url: String, timeout_ms: u64 },

    /// The browser rejected the navigation outright.
    #[error("navigation to {url} failed: {reason}")]
    NavigationFailed { url: String, reason: String },

    /// No location input on the page; it is assumed to be configured already.
    #[error("input field not found: {selector}")]
    InputNotFound { selector: String },

    /// No autocomplete affordance appeared after typing.
    #[error("no autocomplete suggestion appeared within {timeout_ms}ms")]
    AutocompleteTimeout { timeout_ms: u64 },

    /// No submit control; submission falls back to a key press.
    #[error("submit control not found within {timeout_ms}ms")]
    SubmitControlNotFound { timeout_ms: u64 },

    /// The content container never appeared.
    #[error("ready marker {selector} not found within {timeout_ms}ms")]
    ReadyMarkerTimeout { selector: String, timeout_ms: u64 },

    /// A frame could not be captured.
    #[error("frame capture failed: {0}")]
    FrameCapture(String),

    /// The page or browser went away underneath us.
    #[error("renderer session closed unexpectedly")]
    UnexpectedSessionClosed,

    /// DevTools protocol error.
    #[error("CDP error: {0}")]
    Cdp(String),

    /// A DevTools call did not answer in time.
    #[error("timed out after {timeout_ms}ms: {context}")]
    Timeout { timeout_ms: u64, context: String },
}

impl RendererError {
    /// Whether bring-up may continue past this error in lenient mode.
    pub fn is_setup_recoverable(&self) -> bool {
        matches!(
            self,
            RendererError::InputNotFound { .. }
                | RendererError::AutocompleteTimeout { .. }
                | RendererError::SubmitControlNotFound { .. }
                | RendererError::ReadyMarkerTimeout { .. }
                | RendererError::Cdp(_)
                | RendererError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_recoverable_classification() {
        assert!(RendererError::InputNotFound { selector: "input".into() }.is_setup_recoverable());
        assert!(RendererError::SubmitControlNotFound { timeout_ms: 5 }.is_setup_recoverable());
        assert!(!RendererError::UnexpectedSessionClosed.is_setup_recoverable());
        assert!(!RendererError::NavigationTimeout {
            url: "http://x".into(),
            timeout_ms: 1
        }
        .is_setup_recoverable());
        assert!(!RendererError::FrameCapture("io".into()).is_setup_recoverable());
    }

    #[test]
    fn test_display_messages() {
        let err = RendererError::ReadyMarkerTimeout {
            selector: "#weather-content".into(),
            timeout_ms: 30_000,
        };
        assert_eq!(
            err.to_string(),
            "ready marker #weather-content not found within 30000ms"
        );
    }
}
