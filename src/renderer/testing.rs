//! In-memory browser used by renderer and pipeline tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{Browser, Key, Locator, PageDriver, RendererError};
use crate::config::{Region, RendererConfig, Size};

/// Per-launch behaviour of a [`FakePage`]
#[derive(Debug, Clone, Default)]
pub struct PageScript {
    pub fail_launch: bool,
    pub fail_navigation: bool,
    pub missing_input: bool,
    pub missing_autocomplete: bool,
    pub missing_submit: bool,
    pub missing_ready: bool,
    /// Page disappears after this many successful frames
    pub close_after_frames: Option<usize>,
}

#[derive(Default)]
struct Stats {
    launched: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    closed: AtomicUsize,
}

/// Hands out [`FakePage`]s and counts how many are alive at once
#[derive(Clone)]
pub struct FakeBrowser {
    scripts: Arc<Mutex<VecDeque<PageScript>>>,
    default_script: PageScript,
    stats: Arc<Stats>,
    actions: Arc<Mutex<Vec<String>>>,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::with_script(PageScript::default())
    }

    /// Every launch uses `script` unless a queued one is pending
    pub fn with_script(script: PageScript) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(VecDeque::new())),
            default_script: script,
            stats: Arc::new(Stats::default()),
            actions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a one-off script for the next launch
    pub fn push_script(&self, script: PageScript) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn launched(&self) -> usize {
        self.stats.launched.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.stats.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.stats.max_live.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.stats.closed.load(Ordering::SeqCst)
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn launch(&self, _viewport: Size) -> Result<Box<dyn PageDriver>, RendererError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_script.clone());

        self.stats.launched.fetch_add(1, Ordering::SeqCst);
        if script.fail_launch {
            return Err(RendererError::LaunchFailed("scripted launch failure".into()));
        }

        let live = self.stats.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(FakePage {
            script,
            selectors: RendererConfig::default(),
            stats: self.stats.clone(),
            actions: self.actions.clone(),
            frames: 0,
            gone: false,
            released: false,
        }))
    }
}

pub struct FakePage {
    script: PageScript,
    selectors: RendererConfig,
    stats: Arc<Stats>,
    actions: Arc<Mutex<Vec<String>>>,
    frames: usize,
    /// Closed from outside, as if the browser crashed
    gone: bool,
    released: bool,
}

impl FakePage {
    fn record(&self, action: String) {
        self.actions.lock().unwrap().push(action);
    }

    fn present(&self, locator: &Locator) -> bool {
        match locator {
            Locator::Button { .. } => !self.script.missing_submit,
            Locator::Css(s) if *s == self.selectors.input_selector => !self.script.missing_input,
            Locator::Css(s) if *s == self.selectors.autocomplete_selector => {
                !self.script.missing_autocomplete
            }
            Locator::Css(s) if *s == self.selectors.ready_selector => !self.script.missing_ready,
            Locator::Css(_) => true,
        }
    }

    fn check_open(&self) -> Result<(), RendererError> {
        if self.is_closed() {
            Err(RendererError::UnexpectedSessionClosed)
        } else {
            Ok(())
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.stats.live.fetch_sub(1, Ordering::SeqCst);
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn navigate(&mut self, url: &str, settle_timeout: Duration) -> Result<(), RendererError> {
        self.check_open()?;
        self.record(format!("navigate {url}"));
        if self.script.fail_navigation {
            tokio::time::sleep(settle_timeout).await;
            return Err(RendererError::NavigationTimeout {
                url: url.to_string(),
                timeout_ms: settle_timeout.as_millis() as u64,
            });
        }
        Ok(())
    }

    async fn wait_for(&mut self, locator: &Locator, timeout: Duration) -> Result<bool, RendererError> {
        self.check_open()?;
        if self.present(locator) {
            Ok(true)
        } else {
            tokio::time::sleep(timeout).await;
            Ok(false)
        }
    }

    async fn type_into(
        &mut self,
        _locator: &Locator,
        text: &str,
        _key_delay: Duration,
    ) -> Result<(), RendererError> {
        self.check_open()?;
        self.record(format!("type {text}"));
        Ok(())
    }

    async fn press_key(&mut self, target: Option<&Locator>, key: Key) -> Result<(), RendererError> {
        self.check_open()?;
        match target {
            Some(locator) => self.record(format!("press {} on {}", key.name(), locator.describe())),
            None => self.record(format!("press {}", key.name())),
        }
        Ok(())
    }

    async fn click(&mut self, locator: &Locator) -> Result<(), RendererError> {
        self.check_open()?;
        self.record(format!("click {}", locator.describe()));
        Ok(())
    }

    async fn set_viewport(&mut self, size: Size) -> Result<(), RendererError> {
        self.check_open()?;
        self.record(format!("viewport {}x{}", size.width, size.height));
        Ok(())
    }

    async fn screenshot(&mut self, clip: Option<Region>, _quality: u8) -> Result<Vec<u8>, RendererError> {
        self.check_open()?;
        if clip.is_some() {
            if let Some(limit) = self.script.close_after_frames {
                if self.frames >= limit {
                    self.gone = true;
                    return Err(RendererError::UnexpectedSessionClosed);
                }
            }
            self.frames += 1;
        }
        Ok(vec![0xFF, 0xD8, 0xFF, 0xD9])
    }

    fn is_closed(&self) -> bool {
        self.gone || self.released
    }

    async fn close(&mut self) -> Result<(), RendererError> {
        if !self.released {
            self.record("close".to_string());
        }
        self.release();
        Ok(())
    }
}

impl Drop for FakePage {
    fn drop(&mut self) {
        self.release();
    }
}
