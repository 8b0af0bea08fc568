//! Chrome DevTools protocol client over `tokio-tungstenite`.
//!
//! Only implements the handful of commands the renderer needs: navigation,
//! element lookup, key input, viewport emulation and screenshots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{find_chrome, Browser, Key, Locator, PageDriver, RendererError};
use crate::config::{Region, RendererConfig, Size};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Pending CDP command waiting for its response
type PendingTx = oneshot::Sender<Result<Value, String>>;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const STARTUP_POLLS: u32 = 100;
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Resolves once the document has loaded and no new resource entries have
/// shown up for half a second.
const NETWORK_IDLE_JS: &str = r"new Promise((resolve) => {
    const quietMs = 500;
    let last = performance.getEntriesByType('resource').length;
    let stableSince = Date.now();
    const check = () => {
        const n = performance.getEntriesByType('resource').length;
        if (n !== last) { last = n; stableSince = Date.now(); }
        if (document.readyState === 'complete' && Date.now() - stableSince >= quietMs) {
            return resolve(true);
        }
        setTimeout(check, 100);
    };
    check();
})";

/// Launches headless Chrome instances
pub struct CdpBrowser {
    chrome_path: PathBuf,
    command_timeout: Duration,
}

impl CdpBrowser {
    /// Locate Chrome using the configured path, `CHROME_PATH`, or known locations
    pub fn new(config: &RendererConfig) -> Result<Self, RendererError> {
        let chrome_path = find_chrome(config.chrome_path.as_deref()).ok_or_else(|| {
            RendererError::LaunchFailed(
                "Chrome not found; install Chromium or set CHROME_PATH".to_string(),
            )
        })?;
        info!("Using Chrome binary at {:?}", chrome_path);
        Ok(Self {
            chrome_path,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        })
    }
}

#[async_trait]
impl Browser for CdpBrowser {
    async fn launch(&self, viewport: Size) -> Result<Box<dyn PageDriver>, RendererError> {
        let page = CdpPage::launch(&self.chrome_path, viewport, self.command_timeout).await?;
        Ok(Box::new(page))
    }
}

/// Internal CDP command message
struct CdpCommand {
    method: String,
    params: Value,
    response_tx: PendingTx,
}

/// One Chrome process with a single page attached over DevTools
pub struct CdpPage {
    cmd_tx: mpsc::Sender<CdpCommand>,
    closed: Arc<AtomicBool>,
    chrome: Option<Child>,
    handler: JoinHandle<()>,
    command_timeout: Duration,
}

impl CdpPage {
    async fn launch(
        chrome_path: &Path,
        viewport: Size,
        command_timeout: Duration,
    ) -> Result<Self, RendererError> {
        let port = free_port()?;

        let mut child = Command::new(chrome_path)
            .arg("--headless=new")
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-infobars")
            .arg("--window-position=0,0")
            .arg("--ignore-certificate-errors")
            .arg("--ignore-certificate-errors-spki-list")
            .arg("--disable-features=TranslateUI")
            .arg(format!("--window-size={},{}", viewport.width, viewport.height))
            .arg(format!("--remote-debugging-port={port}"))
            .arg("about:blank")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RendererError::LaunchFailed(e.to_string()))?;

        let ws_url = wait_for_ws_url(port, &mut child).await?;
        debug!("Connecting to DevTools at {}", ws_url);

        let (ws, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| RendererError::LaunchFailed(format!("WebSocket connect: {e}")))?;

        let closed = Arc::new(AtomicBool::new(false));
        let (cmd_tx, cmd_rx) = mpsc::channel::<CdpCommand>(64);
        let handler = tokio::spawn(cdp_handler_loop(ws, cmd_rx, closed.clone()));

        let mut page = Self {
            cmd_tx,
            closed,
            chrome: Some(child),
            handler,
            command_timeout,
        };

        page.call("Page.enable", json!({}), command_timeout).await?;
        page.set_viewport(viewport).await?;

        info!("Browser launched (pid {:?})", page.chrome.as_ref().and_then(Child::id));
        Ok(page)
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RendererError> {
        if self.is_closed() {
            return Err(RendererError::UnexpectedSessionClosed);
        }

        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(CdpCommand {
                method: method.into(),
                params,
                response_tx: tx,
            })
            .await
            .map_err(|_| RendererError::UnexpectedSessionClosed)?;

        let result = tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| RendererError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
                context: format!("CDP {method}"),
            })?
            .map_err(|_| RendererError::UnexpectedSessionClosed)?;

        result.map_err(RendererError::Cdp)
    }

    async fn evaluate(&self, expression: &str, timeout: Duration) -> Result<Value, RendererError> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
                timeout,
            )
            .await?;
        if let Some(exception) = result.get("exceptionDetails") {
            let msg = exception["exception"]["description"]
                .as_str()
                .or_else(|| exception["text"].as_str())
                .unwrap_or("evaluation error");
            return Err(RendererError::Cdp(msg.to_string()));
        }
        Ok(result["result"]["value"].clone())
    }

    async fn focus(&self, locator: &Locator) -> Result<(), RendererError> {
        let js = format!(
            "(() => {{ const el = {}; if (!el) return false; el.focus(); return true; }})()",
            locator.to_js()
        );
        let found = self.evaluate(&js, self.command_timeout).await?;
        if found.as_bool() != Some(true) {
            return Err(RendererError::Cdp(format!(
                "element not found: {}",
                locator.describe()
            )));
        }
        Ok(())
    }

    async fn dispatch_key(&self, event_type: &str, key: &str, code: u32, text: Option<&str>) -> Result<(), RendererError> {
        let mut params = json!({
            "type": event_type,
            "key": key,
            "windowsVirtualKeyCode": code,
            "nativeVirtualKeyCode": code,
        });
        if let Some(text) = text {
            params["text"] = json!(text);
            params["unmodifiedText"] = json!(text);
        }
        self.call("Input.dispatchKeyEvent", params, self.command_timeout)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl PageDriver for CdpPage {
    async fn navigate(&mut self, url: &str, settle_timeout: Duration) -> Result<(), RendererError> {
        let timeout_ms = settle_timeout.as_millis() as u64;
        let deadline = Instant::now() + settle_timeout;

        let result = self
            .call("Page.navigate", json!({ "url": url }), settle_timeout)
            .await
            .map_err(|e| match e {
                RendererError::Timeout { .. } => RendererError::NavigationTimeout {
                    url: url.to_string(),
                    timeout_ms,
                },
                other => other,
            })?;

        if let Some(error_text) = result.get("errorText").and_then(Value::as_str) {
            if !error_text.is_empty() {
                return Err(RendererError::NavigationFailed {
                    url: url.to_string(),
                    reason: error_text.to_string(),
                });
            }
        }

        // The evaluation context is torn down while the new document commits,
        // so retry until the idle probe runs to completion or time runs out.
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RendererError::NavigationTimeout {
                    url: url.to_string(),
                    timeout_ms,
                });
            }

            match self.evaluate(NETWORK_IDLE_JS, remaining).await {
                Ok(_) => return Ok(()),
                Err(RendererError::Timeout { .. }) => {
                    return Err(RendererError::NavigationTimeout {
                        url: url.to_string(),
                        timeout_ms,
                    })
                }
                Err(RendererError::UnexpectedSessionClosed) => {
                    return Err(RendererError::UnexpectedSessionClosed)
                }
                Err(e) => {
                    debug!("Network idle probe failed, retrying: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn wait_for(&mut self, locator: &Locator, timeout: Duration) -> Result<bool, RendererError> {
        let js = format!(
            r"new Promise((resolve) => {{
                const deadline = Date.now() + {t};
                const check = () => {{
                    if ({expr}) return resolve(true);
                    if (Date.now() >= deadline) return resolve(false);
                    setTimeout(check, 100);
                }};
                check();
            }})",
            t = timeout.as_millis(),
            expr = locator.to_js(),
        );
        match self.evaluate(&js, timeout + Duration::from_secs(2)).await {
            Ok(found) => Ok(found.as_bool() == Some(true)),
            Err(RendererError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn type_into(
        &mut self,
        locator: &Locator,
        text: &str,
        key_delay: Duration,
    ) -> Result<(), RendererError> {
        self.focus(locator).await?;
        for ch in text.chars() {
            let s = ch.to_string();
            self.dispatch_key("keyDown", &s, 0, Some(&s)).await?;
            self.dispatch_key("keyUp", &s, 0, None).await?;
            tokio::time::sleep(key_delay).await;
        }
        Ok(())
    }

    async fn press_key(&mut self, target: Option<&Locator>, key: Key) -> Result<(), RendererError> {
        if let Some(locator) = target {
            self.focus(locator).await?;
        }
        self.dispatch_key("keyDown", key.name(), key.key_code(), key.text())
            .await?;
        self.dispatch_key("keyUp", key.name(), key.key_code(), None)
            .await
    }

    async fn click(&mut self, locator: &Locator) -> Result<(), RendererError> {
        let js = format!(
            "(() => {{ const el = {}; if (!el) return false; el.click(); return true; }})()",
            locator.to_js()
        );
        let clicked = self.evaluate(&js, self.command_timeout).await?;
        if clicked.as_bool() != Some(true) {
            return Err(RendererError::Cdp(format!(
                "element not found: {}",
                locator.describe()
            )));
        }
        Ok(())
    }

    async fn set_viewport(&mut self, size: Size) -> Result<(), RendererError> {
        self.call(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": size.width,
                "height": size.height,
                "deviceScaleFactor": 1,
                "mobile": false,
            }),
            self.command_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn screenshot(&mut self, clip: Option<Region>, quality: u8) -> Result<Vec<u8>, RendererError> {
        let mut params = json!({ "format": "jpeg", "quality": quality });
        if let Some(region) = clip {
            params["clip"] = json!({
                "x": region.x,
                "y": region.y,
                "width": region.width,
                "height": region.height,
                "scale": 1,
            });
        }

        let result = self
            .call("Page.captureScreenshot", params, self.command_timeout)
            .await?;
        let b64 = result["data"]
            .as_str()
            .ok_or_else(|| RendererError::FrameCapture("no data in response".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| RendererError::FrameCapture(format!("base64 decode: {e}")))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.handler.is_finished()
    }

    async fn close(&mut self) -> Result<(), RendererError> {
        if !self.is_closed() {
            let _ = self
                .call("Browser.close", json!({}), Duration::from_secs(2))
                .await;
        }
        self.closed.store(true, Ordering::SeqCst);
        self.handler.abort();

        if let Some(mut child) = self.chrome.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill Chrome process: {}", e);
            }
        }
        Ok(())
    }
}

impl Drop for CdpPage {
    fn drop(&mut self) {
        // Chrome itself goes with `kill_on_drop`
        self.handler.abort();
    }
}

fn free_port() -> Result<u16, RendererError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .map_err(|e| RendererError::LaunchFailed(format!("bind port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| RendererError::LaunchFailed(format!("local_addr: {e}")))?
        .port();
    Ok(port)
}

/// Poll the DevTools `/json` endpoint until Chrome lists a page target.
async fn wait_for_ws_url(port: u16, child: &mut Child) -> Result<String, RendererError> {
    let url = format!("http://127.0.0.1:{port}/json");

    for _ in 0..STARTUP_POLLS {
        tokio::time::sleep(STARTUP_POLL_INTERVAL).await;

        if let Some(status) = child
            .try_wait()
            .map_err(|e| RendererError::LaunchFailed(format!("wait: {e}")))?
        {
            return Err(RendererError::LaunchFailed(format!(
                "Chrome exited early with {status}"
            )));
        }

        let Ok(resp) = reqwest::get(&url).await else {
            continue;
        };
        let Ok(targets): Result<Vec<Value>, _> = resp.json().await else {
            continue;
        };
        if let Some(ws_url) = page_ws_url(&targets) {
            return Ok(ws_url);
        }
    }

    Err(RendererError::LaunchFailed(format!(
        "Chrome did not expose DevTools on port {port} in time"
    )))
}

fn page_ws_url(targets: &[Value]) -> Option<String> {
    targets
        .iter()
        .filter(|t| t["type"].as_str() == Some("page"))
        .find_map(|t| t["webSocketDebuggerUrl"].as_str().map(String::from))
}

/// Routes commands out over the socket and responses back to callers.
/// Flags the page closed when the socket ends or the target detaches.
async fn cdp_handler_loop(
    ws: WsStream,
    mut cmd_rx: mpsc::Receiver<CdpCommand>,
    closed: Arc<AtomicBool>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut pending: HashMap<u64, PendingTx> = HashMap::new();
    let next_id = AtomicU64::new(1);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let msg = json!({
                    "id": id,
                    "method": cmd.method,
                    "params": cmd.params,
                });
                let _ = pending.insert(id, cmd.response_tx);
                if ws_tx.send(Message::Text(msg.to_string().into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let Ok(val): Result<Value, _> = serde_json::from_str(&text) else {
                    continue;
                };
                if let Some(id) = val.get("id").and_then(Value::as_u64) {
                    if let Some(tx) = pending.remove(&id) {
                        if let Some(err) = val.get("error") {
                            let msg = err["message"].as_str().unwrap_or("CDP error");
                            let _ = tx.send(Err(msg.into()));
                        } else {
                            let _ = tx.send(Ok(val["result"].clone()));
                        }
                    }
                } else if is_terminal_event(&val) {
                    warn!("DevTools target went away: {}", val["method"]);
                    break;
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
}

fn is_terminal_event(event: &Value) -> bool {
    matches!(
        event["method"].as_str(),
        Some("Inspector.detached") | Some("Inspector.targetCrashed")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_picks_first_page_target() {
        let targets = vec![
            json!({ "type": "service_worker", "webSocketDebuggerUrl": "ws://sw" }),
            json!({ "type": "page", "webSocketDebuggerUrl": "ws://page/1" }),
            json!({ "type": "page", "webSocketDebuggerUrl": "ws://page/2" }),
        ];
        assert_eq!(page_ws_url(&targets), Some("ws://page/1".to_string()));
        assert_eq!(page_ws_url(&[]), None);
    }

    #[test]
    fn test_detach_and_crash_are_terminal() {
        assert!(is_terminal_event(&json!({ "method": "Inspector.detached" })));
        assert!(is_terminal_event(&json!({ "method": "Inspector.targetCrashed" })));
        assert!(!is_terminal_event(&json!({ "method": "Page.loadEventFired" })));
    }

    #[test]
    fn test_free_port_is_nonzero() {
        assert_ne!(free_port().unwrap(), 0);
    }
}
