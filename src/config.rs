//! Configuration management for pagecast
//!
//! Settings are read from a TOML file and then overridden from the
//! environment, so container deployments can be driven by env vars alone.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const CONFIG_PATH_ENV: &str = "PAGECAST_CONFIG";

/// Highest rate that still yields a whole-millisecond capture period
const MAX_FRAME_RATE: u32 = 1000;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Page being rendered and the value submitted to it
    #[serde(default)]
    pub target: TargetConfig,

    /// Frame capture geometry and rate
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Browser bring-up timeouts, selectors and strictness
    #[serde(default)]
    pub renderer: RendererConfig,

    /// Encoder process settings
    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Rebuild backoff
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Well-known directories
    #[serde(default)]
    pub paths: PathsConfig,

    /// HTTP surface and channel metadata
    #[serde(default)]
    pub server: ServerConfig,

    /// Container limits (informational only)
    #[serde(default)]
    pub resources: ResourcesConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    /// Value typed into the location input (a ZIP code or "City, State")
    pub input_value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Frames per second pushed into the encoder
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// JPEG quality for captured frames (0-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Pixel rectangle sampled on every tick
    #[serde(default = "default_region")]
    pub region: Region,

    /// Browser viewport
    #[serde(default = "default_viewport")]
    pub viewport: Size,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Explicit Chrome binary; falls back to CHROME_PATH and known locations
    pub chrome_path: Option<PathBuf>,
    pub navigation_timeout_ms: u64,
    pub input_timeout_ms: u64,
    pub autocomplete_timeout_ms: u64,
    pub autocomplete_pause_ms: u64,
    pub selection_pause_ms: u64,
    pub submit_timeout_ms: u64,
    pub ready_timeout_ms: u64,
    pub key_delay_ms: u64,

    /// Treat input-setup failures as fatal to the bring-up
    pub strict_setup: bool,

    /// Write post-navigation/post-setup/failure snapshots into the output dir
    pub debug_screenshots: bool,

    pub input_selector: String,
    pub autocomplete_selector: String,
    /// Button captions accepted as the submit control (case-insensitive)
    pub submit_texts: Vec<String>,
    pub submit_selector: String,
    pub ready_selector: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub ffmpeg_path: PathBuf,
    pub manifest_name: String,
    pub segment_secs: u32,
    pub list_size: u32,
    pub volume: f32,
    pub video_codec: String,
    pub video_bitrate: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub preset: String,

    /// Delay between encoder start and advertising readiness
    pub settle_ms: u64,

    /// Upper bound on a single frame write into the encoder
    pub write_timeout_ms: u64,

    /// How long a stopping encoder gets before it is killed
    pub stop_grace_ms: u64,

    /// Output video size
    pub scale: Size,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failed rebuilds tolerated before giving up (unset = forever)
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub output_dir: PathBuf,
    pub audio_dir: PathBuf,
    pub logo_dir: PathBuf,
    /// Directory holding the audio loop descriptor
    pub scratch_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub channel_id: String,
    pub channel_name: String,
    pub channel_number: u32,
    pub guide_title: String,
    pub guide_description: String,
    pub logo_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub cpu_cores: String,
    pub ram_limit_mb: String,
}

// Default value functions
fn default_frame_rate() -> u32 {
    10
}

fn default_region() -> Region {
    Region {
        x: 11,
        y: 40,
        width: 631,
        height: 480,
    }
}

fn default_viewport() -> Size {
    Size {
        width: 1280,
        height: 720,
    }
}

fn default_jpeg_quality() -> u8 {
    90
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            input_value: "90210".to_string(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_rate: default_frame_rate(),
            region: default_region(),
            viewport: default_viewport(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            navigation_timeout_ms: 30_000,
            input_timeout_ms: 5_000,
            autocomplete_timeout_ms: 3_000,
            autocomplete_pause_ms: 1_000,
            selection_pause_ms: 500,
            submit_timeout_ms: 5_000,
            ready_timeout_ms: 30_000,
            key_delay_ms: 100,
            strict_setup: false,
            debug_screenshots: false,
            input_selector: r#"input[placeholder="Zip or City, State"]"#.to_string(),
            autocomplete_selector: r#".autocomplete-suggestion, ul li, [role="option"]"#
                .to_string(),
            submit_texts: vec!["go".to_string()],
            submit_selector: r#"button[type="submit"]"#.to_string(),
            ready_selector: "div.weather-display, #weather-content".to_string(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            manifest_name: "stream.m3u8".to_string(),
            segment_secs: 2,
            list_size: 2,
            volume: 0.5,
            video_codec: "libx264".to_string(),
            video_bitrate: "1000k".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: "128k".to_string(),
            preset: "ultrafast".to_string(),
            settle_ms: 2_000,
            write_timeout_ms: 1_000,
            stop_grace_ms: 3_000,
            scale: default_viewport(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: None,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            audio_dir: PathBuf::from("music"),
            logo_dir: PathBuf::from("logo"),
            scratch_dir: PathBuf::from("."),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 9798,
            channel_id: "WS4000".to_string(),
            channel_name: "WeatherStar 4000".to_string(),
            channel_number: 275,
            guide_title: "Local Weather".to_string(),
            guide_description: "Enjoy your local weather with a touch of nostalgia.".to_string(),
            logo_file: "ws4000.png".to_string(),
        }
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            cpu_cores: "0.3".to_string(),
            ram_limit_mb: "400".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, `PAGECAST_CONFIG`, or the
    /// default location, then apply environment overrides
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config_path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os(CONFIG_PATH_ENV) {
                Some(path) => PathBuf::from(path),
                None => Self::default_config_path()?,
            },
        };

        Self::load_from(config_path, |key| std::env::var(key).ok())
    }

    /// Read `config_path` (writing defaults there if it is missing), then
    /// apply overrides from `lookup` and validate
    fn load_from<F>(config_path: PathBuf, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            config.config_path = Some(config_path);
            config
        } else {
            let mut config = Config::default();
            config.config_path = Some(config_path);
            // A read-only filesystem must not stop the channel from coming up
            if let Err(e) = config.save() {
                warn!("Could not write default config: {:#}", e);
            }
            config
        };

        config.apply_env(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "pagecast", "pagecast")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Apply environment overrides. `lookup` is injected so tests don't
    /// have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ZIP_CODE") {
            self.target.input_value = v;
        }
        if let Some(v) = lookup("WS4KP_HOST") {
            self.target.host = v;
        }
        if let Some(port) = parse_env(&lookup, "WS4KP_PORT") {
            self.target.port = port;
        }
        if let Some(rate) = parse_env(&lookup, "FRAME_RATE") {
            self.capture.frame_rate = rate;
        }
        if let Some(port) = parse_env(&lookup, "STREAM_PORT") {
            self.server.port = port;
        }
        if let Some(v) = lookup("CPU_CORES") {
            self.resources.cpu_cores = v;
        }
        if let Some(v) = lookup("RAM_LIMIT_MB") {
            self.resources.ram_limit_mb = v;
        }
        if let Some(v) = lookup("CHROME_PATH") {
            self.renderer.chrome_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FFMPEG_PATH") {
            self.encoder.ffmpeg_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PAGECAST_OUTPUT_DIR") {
            self.paths.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PAGECAST_AUDIO_DIR") {
            self.paths.audio_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PAGECAST_LOGO_DIR") {
            self.paths.logo_dir = PathBuf::from(v);
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.capture.frame_rate == 0 {
            anyhow::bail!("capture.frame_rate must be greater than zero");
        }
        if self.capture.frame_rate > MAX_FRAME_RATE {
            anyhow::bail!(
                "capture.frame_rate ({}) must not exceed {}",
                self.capture.frame_rate,
                MAX_FRAME_RATE
            );
        }
        if self.capture.region.width == 0 || self.capture.region.height == 0 {
            anyhow::bail!("capture.region must have a non-zero width and height");
        }
        if self.recovery.base_delay_ms > self.recovery.max_delay_ms {
            anyhow::bail!(
                "recovery.base_delay_ms ({}) exceeds recovery.max_delay_ms ({})",
                self.recovery.base_delay_ms,
                self.recovery.max_delay_ms
            );
        }
        Ok(())
    }

    /// Address of the rendered page
    pub fn target_url(&self) -> String {
        format!("http://{}:{}", self.target.host, self.target.port)
    }

    /// Interval between frame captures, never shorter than 1ms
    pub fn frame_period(&self) -> Duration {
        Duration::from_millis((1000 / u64::from(self.capture.frame_rate.max(1))).max(1))
    }

    /// Path of the segmented manifest written by the encoder
    pub fn manifest_path(&self) -> PathBuf {
        self.paths.output_dir.join(&self.encoder.manifest_name)
    }

    /// Path of the audio loop descriptor
    pub fn audio_list_path(&self) -> PathBuf {
        self.paths.scratch_dir.join("audio_list.txt")
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid number", key, raw);
            None
        }
    }
}
