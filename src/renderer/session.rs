//! Renderer session: one page driven through the target's set-up flow.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Browser, Frame, Key, Locator, PageDriver, RendererError, RendererState};
use crate::config::{Config, Region, Size};

/// Everything a session needs to bring up and capture from a page
#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub target_url: String,
    pub input_value: String,
    pub region: Region,
    pub viewport: Size,
    pub jpeg_quality: u8,
    pub navigation_timeout: Duration,
    pub input_timeout: Duration,
    pub autocomplete_timeout: Duration,
    pub autocomplete_pause: Duration,
    pub selection_pause: Duration,
    pub submit_timeout: Duration,
    pub ready_timeout: Duration,
    pub key_delay: Duration,
    pub strict_setup: bool,
    /// Where debug snapshots go; `None` disables them
    pub debug_dir: Option<PathBuf>,
    pub input: Locator,
    pub autocomplete: Locator,
    pub submit: Locator,
    pub ready: Locator,
}

impl RendererSettings {
    pub fn from_config(config: &Config) -> Self {
        let r = &config.renderer;
        Self {
            target_url: config.target_url(),
            input_value: config.target.input_value.clone(),
            region: config.capture.region,
            viewport: config.capture.viewport,
            jpeg_quality: config.capture.jpeg_quality,
            navigation_timeout: Duration::from_millis(r.navigation_timeout_ms),
            input_timeout: Duration::from_millis(r.input_timeout_ms),
            autocomplete_timeout: Duration::from_millis(r.autocomplete_timeout_ms),
            autocomplete_pause: Duration::from_millis(r.autocomplete_pause_ms),
            selection_pause: Duration::from_millis(r.selection_pause_ms),
            submit_timeout: Duration::from_millis(r.submit_timeout_ms),
            ready_timeout: Duration::from_millis(r.ready_timeout_ms),
            key_delay: Duration::from_millis(r.key_delay_ms),
            strict_setup: r.strict_setup,
            debug_dir: r
                .debug_screenshots
                .then(|| config.paths.output_dir.clone()),
            input: Locator::css(&r.input_selector),
            autocomplete: Locator::css(&r.autocomplete_selector),
            submit: Locator::Button {
                texts: r.submit_texts.clone(),
                fallback: r.submit_selector.clone(),
            },
            ready: Locator::css(&r.ready_selector),
        }
    }
}

/// Exclusive owner of one browser page
pub struct RendererSession {
    page: Option<Box<dyn PageDriver>>,
    state: RendererState,
    settings: RendererSettings,
}

impl RendererSession {
    /// Launch a page and run the full bring-up. On error the page has
    /// already been released.
    pub async fn open(
        browser: &dyn Browser,
        settings: RendererSettings,
    ) -> Result<Self, RendererError> {
        let page = browser.launch(settings.viewport).await?;
        let mut session = Self {
            page: Some(page),
            state: RendererState::Uninitialized,
            settings,
        };

        match session.bring_up().await {
            Ok(()) => {
                session.state = RendererState::Ready;
                info!("Renderer ready at {}", session.settings.target_url);
                Ok(session)
            }
            Err(e) => {
                session.state = RendererState::Failed;
                session.close().await;
                Err(e)
            }
        }
    }

    pub fn state(&self) -> RendererState {
        self.state
    }

    /// Ready and the page is still there
    pub fn is_ready(&self) -> bool {
        self.state == RendererState::Ready
            && self.page.as_ref().is_some_and(|p| !p.is_closed())
    }

    async fn bring_up(&mut self) -> Result<(), RendererError> {
        let settings = &self.settings;
        let page = self
            .page
            .as_deref_mut()
            .ok_or(RendererError::UnexpectedSessionClosed)?;
        let debug_dir = settings.debug_dir.as_deref();

        self.state = RendererState::Navigating;
        info!("Navigating to {}", settings.target_url);
        page.navigate(&settings.target_url, settings.navigation_timeout)
            .await?;
        debug_snapshot(page, debug_dir, "post-navigation.jpg", settings.jpeg_quality).await;

        self.state = RendererState::AwaitingInput;
        match configure_location(page, settings, &mut self.state).await {
            Ok(()) => info!("Submitted location {}", settings.input_value),
            Err(RendererError::InputNotFound { selector }) if !settings.strict_setup => {
                info!("No location input ({}), assuming already set", selector);
            }
            Err(e) => {
                let snapshot = match e {
                    RendererError::ReadyMarkerTimeout { .. } => "debug-zip-failure.jpg",
                    _ => "debug-error.jpg",
                };
                debug_snapshot(page, debug_dir, snapshot, settings.jpeg_quality).await;

                if settings.strict_setup || !e.is_setup_recoverable() {
                    return Err(e);
                }
                warn!("Location set-up incomplete, continuing: {}", e);
            }
        }

        debug_snapshot(page, debug_dir, "post-setup.jpg", settings.jpeg_quality).await;
        page.set_viewport(settings.viewport).await
    }

    /// Capture the configured region. Any failure leaves the session Failed.
    pub async fn capture_frame(&mut self) -> Result<Frame, RendererError> {
        let Some(page) = self.page.as_deref_mut() else {
            self.state = RendererState::Failed;
            return Err(RendererError::UnexpectedSessionClosed);
        };
        if page.is_closed() {
            self.state = RendererState::Failed;
            return Err(RendererError::UnexpectedSessionClosed);
        }

        let region = self.settings.region;
        match page.screenshot(Some(region), self.settings.jpeg_quality).await {
            Ok(data) => Ok(Frame::new(data, region)),
            Err(e) => {
                self.state = RendererState::Failed;
                if page.is_closed() {
                    return Err(RendererError::UnexpectedSessionClosed);
                }
                Err(match e {
                    RendererError::UnexpectedSessionClosed | RendererError::FrameCapture(_) => e,
                    other => RendererError::FrameCapture(other.to_string()),
                })
            }
        }
    }

    /// Release the page. Safe to call on every teardown path.
    pub async fn close(&mut self) {
        if let Some(mut page) = self.page.take() {
            if let Err(e) = page.close().await {
                warn!("Error closing renderer page: {}", e);
            }
            info!("Renderer session closed");
        }
        self.state = RendererState::Closed;
    }
}

async fn configure_location(
    page: &mut dyn PageDriver,
    settings: &RendererSettings,
    state: &mut RendererState,
) -> Result<(), RendererError> {
    if !page.wait_for(&settings.input, settings.input_timeout).await? {
        return Err(RendererError::InputNotFound {
            selector: settings.input.describe(),
        });
    }

    debug!("Typing location into {}", settings.input.describe());
    page.type_into(&settings.input, &settings.input_value, settings.key_delay)
        .await?;

    if !page
        .wait_for(&settings.autocomplete, settings.autocomplete_timeout)
        .await?
    {
        let err = RendererError::AutocompleteTimeout {
            timeout_ms: settings.autocomplete_timeout.as_millis() as u64,
        };
        debug!("{}, proceeding anyway", err);
    }
    tokio::time::sleep(settings.autocomplete_pause).await;

    page.press_key(None, Key::ArrowDown).await?;
    tokio::time::sleep(settings.selection_pause).await;

    *state = RendererState::Submitting;
    if page.wait_for(&settings.submit, settings.submit_timeout).await? {
        page.click(&settings.submit).await?;
    } else {
        let err = RendererError::SubmitControlNotFound {
            timeout_ms: settings.submit_timeout.as_millis() as u64,
        };
        warn!("{}, pressing Enter on the input", err);
        page.press_key(Some(&settings.input), Key::Enter).await?;
    }

    if !page.wait_for(&settings.ready, settings.ready_timeout).await? {
        return Err(RendererError::ReadyMarkerTimeout {
            selector: settings.ready.describe(),
            timeout_ms: settings.ready_timeout.as_millis() as u64,
        });
    }
    Ok(())
}

async fn debug_snapshot(page: &mut dyn PageDriver, dir: Option<&Path>, name: &str, quality: u8) {
    let Some(dir) = dir else { return };
    let path = dir.join(name);
    let result = match page.screenshot(None, quality).await {
        Ok(data) => tokio::fs::write(&path, data).await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    match result {
        Ok(()) => debug!("Wrote debug snapshot {:?}", path),
        Err(e) => warn!("Debug snapshot {} failed: {}", name, e),
    }
}
