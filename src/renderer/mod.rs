//! Headless browser rendering and frame capture
//!
//! The renderer owns one Chrome page, drives it through the target's
//! set-up flow (navigate, fill the location input, submit, wait for the
//! content container) and then takes JPEG snapshots of a fixed region on
//! demand.
//!
//! Browser access sits behind the [`Browser`] and [`PageDriver`] traits so
//! the bring-up flow and the pipeline can be exercised without Chrome.

mod cdp;
mod chrome;
mod error;
mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use cdp::CdpBrowser;
pub use chrome::find_chrome;
pub use error::RendererError;
pub use session::{RendererSession, RendererSettings};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::{Region, Size};

/// Renderer session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RendererState {
    #[default]
    Uninitialized,
    Navigating,
    AwaitingInput,
    Submitting,
    Ready,
    Failed,
    Closed,
}

/// One captured still image
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    captured_at: DateTime<Utc>,
    region: Region,
}

impl Frame {
    pub fn new(data: Vec<u8>, region: Region) -> Self {
        Self {
            data,
            captured_at: Utc::now(),
            region,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn region(&self) -> Region {
        self.region
    }
}

/// How an element is located on the page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// Plain CSS selector
    Css(String),
    /// A `<button>` whose caption matches one of `texts` (case-insensitive),
    /// or failing that, the first element matching `fallback`
    Button { texts: Vec<String>, fallback: String },
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css(selector.into())
    }

    /// JavaScript expression that evaluates to the element or `null`
    pub fn to_js(&self) -> String {
        match self {
            Locator::Css(selector) => format!(
                "document.querySelector({})",
                serde_json::to_string(selector).unwrap_or_default()
            ),
            Locator::Button { texts, fallback } => {
                let texts: Vec<String> = texts.iter().map(|t| t.to_lowercase()).collect();
                format!(
                    r"(() => {{
                        const texts = {texts};
                        for (const b of document.querySelectorAll('button')) {{
                            const caption = (b.innerText || b.textContent || '').trim().toLowerCase();
                            if (texts.includes(caption)) return b;
                        }}
                        return document.querySelector({fallback});
                    }})()",
                    texts = serde_json::to_string(&texts).unwrap_or_else(|_| "[]".into()),
                    fallback = serde_json::to_string(fallback).unwrap_or_default(),
                )
            }
        }
    }

    /// Short human-readable form for logs
    pub fn describe(&self) -> String {
        match self {
            Locator::Css(selector) => selector.clone(),
            Locator::Button { texts, fallback } => {
                format!("button {:?} or {}", texts, fallback)
            }
        }
    }
}

/// Keys the bring-up flow needs to press
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    ArrowDown,
    Enter,
}

impl Key {
    pub fn name(self) -> &'static str {
        match self {
            Key::ArrowDown => "ArrowDown",
            Key::Enter => "Enter",
        }
    }

    pub fn key_code(self) -> u32 {
        match self {
            Key::ArrowDown => 40,
            Key::Enter => 13,
        }
    }

    /// Text the key inserts, if any
    pub fn text(self) -> Option<&'static str> {
        match self {
            Key::ArrowDown => None,
            Key::Enter => Some("\r"),
        }
    }
}

/// Low-level control of a single browser page
#[async_trait]
pub trait PageDriver: Send {
    /// Navigate and wait until network activity has settled
    async fn navigate(&mut self, url: &str, settle_timeout: Duration) -> Result<(), RendererError>;

    /// Wait for an element; `Ok(false)` if it did not appear in time
    async fn wait_for(&mut self, locator: &Locator, timeout: Duration) -> Result<bool, RendererError>;

    /// Focus the element and type `text` one key at a time
    async fn type_into(
        &mut self,
        locator: &Locator,
        text: &str,
        key_delay: Duration,
    ) -> Result<(), RendererError>;

    /// Press a key, on the given element or on whatever has focus
    async fn press_key(&mut self, target: Option<&Locator>, key: Key) -> Result<(), RendererError>;

    async fn click(&mut self, locator: &Locator) -> Result<(), RendererError>;

    async fn set_viewport(&mut self, size: Size) -> Result<(), RendererError>;

    /// JPEG snapshot of `clip`, or of the whole viewport
    async fn screenshot(&mut self, clip: Option<Region>, quality: u8) -> Result<Vec<u8>, RendererError>;

    /// Whether the page or its browser has gone away
    fn is_closed(&self) -> bool;

    /// Close the page and its browser; safe to call more than once
    async fn close(&mut self) -> Result<(), RendererError>;
}

/// Something that can hand out fresh pages
#[async_trait]
pub trait Browser: Send + Sync {
    async fn launch(&self, viewport: Size) -> Result<Box<dyn PageDriver>, RendererError>;
}
