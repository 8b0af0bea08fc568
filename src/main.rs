//! pagecast
//!
//! Renders a web page in headless Chrome, captures a fixed region of it as
//! JPEG frames and republishes them with a looping soundtrack as a live HLS
//! channel, with an M3U playlist, an XMLTV guide and a health endpoint.

mod audio;
mod config;
mod crash;
mod encoder;
mod logging;
mod pipeline;
mod renderer;
mod server;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use config::Config;
use encoder::FfmpegEncoder;
use pipeline::{create_pipeline_channels, PipelineCommand, ReadinessFlag, RecoveryCoordinator};
use renderer::CdpBrowser;

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("pagecast: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(0);
    }

    let config_arg = config_flag(&args)?;

    // Held until the end of run() so buffered log lines are flushed
    let _log_guard = logging::init_logging()?;

    match logging::get_log_dir().and_then(|dir| {
        crash::init_crash_handler(&dir).context("Failed to open crash log")
    }) {
        Ok(path) => info!("Crash reports will be written to {:?}", path),
        Err(e) => warn!("Crash handler not installed: {:#}", e),
    }

    info!("pagecast {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::load(config_arg.as_deref())?;
    info!("Configuration loaded from {:?}", config.config_path()?);
    info!(
        "Resource limits: {} CPU cores, {} MB RAM",
        config.resources.cpu_cores, config.resources.ram_limit_mb
    );
    info!(
        "Rendering {} at {} fps (input value {:?})",
        config.target_url(),
        config.capture.frame_rate,
        config.target.input_value
    );

    create_directories(&config)?;

    let browser = match CdpBrowser::new(&config.renderer) {
        Ok(browser) => browser,
        Err(e) => {
            error!("Cannot start renderer: {}", e);
            return Ok(1);
        }
    };
    let encoder = FfmpegEncoder::new(&config.encoder);

    let runtime = Arc::new(tokio::runtime::Runtime::new().context("Failed to start runtime")?);

    let readiness = ReadinessFlag::new();
    let (cmd_tx, cmd_rx, status_tx, _status_rx) = create_pipeline_channels();

    let mut coordinator = RecoveryCoordinator::new(
        &config,
        Arc::new(browser),
        Arc::new(encoder),
        readiness.clone(),
        cmd_rx,
        status_tx,
    );

    // Ctrl+C / SIGTERM run the full teardown before the process exits
    let ctrl_c_runtime = runtime.clone();
    ctrlc::set_handler(move || {
        info!("Termination signal received, shutting down...");
        let tx = cmd_tx.clone();
        ctrl_c_runtime.spawn(async move {
            let _ = tx.send(PipelineCommand::Shutdown).await;
        });
    })
    .context("Failed to install signal handler")?;

    let code = runtime.block_on(async {
        let server_shutdown = CancellationToken::new();
        let server_config = config.clone();
        let probe = readiness.probe();
        let token = server_shutdown.clone();
        let server = tokio::spawn(async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(e) = server::serve(&server_config, probe, shutdown).await {
                error!("HTTP server error: {:#}", e);
            }
        });

        let code = match coordinator.run().await {
            Ok(()) => 0,
            Err(e) => {
                error!("Pipeline error: {}", e);
                1
            }
        };
        info!("Pipeline finished in state {:?}", coordinator.state());

        server_shutdown.cancel();
        let _ = server.await;
        code
    });

    info!("Shutdown complete");
    Ok(code)
}

/// Value of `-c/--config`, if given
fn config_flag(args: &[String]) -> Result<Option<PathBuf>> {
    let Some(pos) = args.iter().position(|a| a == "--config" || a == "-c") else {
        return Ok(None);
    };
    let path = args
        .get(pos + 1)
        .context("--config requires a path argument")?;
    Ok(Some(PathBuf::from(path)))
}

fn create_directories(config: &Config) -> Result<()> {
    for dir in [
        &config.paths.output_dir,
        &config.paths.audio_dir,
        &config.paths.logo_dir,
        &config.paths.scratch_dir,
    ] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {:?}", dir))?;
    }
    Ok(())
}

fn print_help() {
    println!("pagecast - Republish a web page as a live HLS channel");
    println!();
    println!("USAGE:");
    println!("    pagecast [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help           Print this help message");
    println!("    -c, --config <PATH>  Use the given config file");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG             Set log level (e.g., debug, info, warn)");
    println!("    PAGECAST_CONFIG      Config file path when --config is not given");
    println!("    ZIP_CODE             Value typed into the page's location input");
    println!("    WS4KP_HOST           Host of the rendered page");
    println!("    WS4KP_PORT           Port of the rendered page");
    println!("    FRAME_RATE           Capture frame rate");
    println!("    STREAM_PORT          Port of the HTTP server");
    println!("    CHROME_PATH          Chrome/Chromium binary");
    println!("    FFMPEG_PATH          ffmpeg binary");
}
