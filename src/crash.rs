//! Crash diagnostics
//!
//! Installs a panic hook that appends a report with a full backtrace to a
//! dedicated crash log. The report includes the last pipeline transition
//! recorded through [`record_transition`], which is usually enough to tell
//! whether the renderer or the encoder side was being rebuilt at the time.

use std::fs::OpenOptions;
use std::io::Write;
use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::error;

static CRASH_LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

static LAST_TRANSITION: Mutex<Option<String>> = Mutex::new(None);

const CRASH_LOG_FILENAME: &str = "crash.log";

/// Initialize crash handling. Call this early in main().
///
/// Returns the path to the crash log file.
pub fn init_crash_handler(log_dir: &Path) -> std::io::Result<PathBuf> {
    let crash_log_path = log_dir.join(CRASH_LOG_FILENAME);

    // Fail early if the log cannot be opened rather than inside the hook
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&crash_log_path)?;

    let _ = CRASH_LOG_PATH.set(crash_log_path.clone());

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        handle_panic(panic_info);
        default_hook(panic_info);
    }));

    Ok(crash_log_path)
}

/// Remember the most recent pipeline transition for crash reports
pub fn record_transition(transition: &str) {
    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
    if let Ok(mut last) = LAST_TRANSITION.lock() {
        *last = Some(format!("[{}] {}", timestamp, transition));
    }
}

fn last_transition() -> String {
    LAST_TRANSITION
        .lock()
        .ok()
        .and_then(|last| last.clone())
        .unwrap_or_else(|| "none recorded".to_string())
}

fn handle_panic(panic_info: &PanicHookInfo<'_>) {
    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");

    let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic payload".to_string()
    };

    let location = match panic_info.location() {
        Some(loc) => format!("{}:{}:{}", loc.file(), loc.line(), loc.column()),
        None => "unknown location".to_string(),
    };

    let report = format_report(
        &timestamp.to_string(),
        &location,
        &message,
        &last_transition(),
        &std::backtrace::Backtrace::force_capture().to_string(),
    );

    if let Some(path) = CRASH_LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = file.write_all(report.as_bytes());
            let _ = file.flush();
            let _ = file.sync_all();
        }
    }

    error!(
        "PANIC at {}: {} (see crash.log for full backtrace)",
        location, message
    );
}

fn format_report(
    timestamp: &str,
    location: &str,
    message: &str,
    transition: &str,
    backtrace: &str,
) -> String {
    let separator = "=".repeat(80);
    format!(
        "\n{sep}\n\
         PANIC at {ts}\n\
         {sep}\n\
         Location: {loc}\n\
         Message: {msg}\n\
         Last pipeline transition: {tr}\n\
         \n\
         Backtrace:\n\
         {bt}\n\
         {sep}\n",
        sep = separator,
        ts = timestamp,
        loc = location,
        msg = message,
        tr = transition,
        bt = backtrace
    )
}
