//! doorcamd - door camera daemon
//!
//! This daemon:
//! 1. Opens the configured camera
//! 2. Starts the relay tick loop (and button polling, if wired)
//! 3. Serves stream, capture and control over HTTP until Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use doorcam::{
    actuator::{ActuatorController, ActuatorTicker},
    api::ApiServer,
    config::DoorcamConfig,
    ingest::{open_source, FrameSource},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Door camera: MJPEG stream, snapshots and relay control")]
struct Args {
    /// JSON config file. Falls back to DOORCAM_CONFIG.
    #[arg(long, value_name = "PATH", env = "DOORCAM_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding config and DOORCAM_ADDR.
    #[arg(long, value_name = "ADDR")]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = DoorcamConfig::load_with(args.config.as_deref(), args.addr.as_deref())?;

    let mut source = open_source(config.camera.clone())?;
    source
        .connect()
        .with_context(|| format!("connect camera {}", config.camera.url))?;
    let source: Arc<dyn FrameSource> = Arc::from(source);
    log::info!(
        "camera {} ready ({}x{} {:?}, {} buffers)",
        config.camera.url,
        config.camera.width,
        config.camera.height,
        config.camera.format,
        config.camera.fb_count
    );

    let controller = Arc::new(ActuatorController::new(
        config.actuator_outputs(),
        config.actuator.timing,
    ));
    let mut ticker = ActuatorTicker::new(controller.clone(), config.actuator.tick_interval);
    if let Some(button) = config.button() {
        ticker = ticker.with_button(button);
    }
    let ticker_handle = ticker.spawn()?;

    let api_handle = ApiServer::new(
        config.api_config(),
        source.clone(),
        controller.clone(),
        config.stream,
    )
    .spawn()?;
    log::info!("doorcamd serving on http://{}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("doorcamd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    api_handle.stop()?;
    ticker_handle.stop()?;
    controller.shutdown();

    let stats = source.stats();
    log::info!(
        "captured {} frames from {} ({} buffers outstanding)",
        stats.frames_captured,
        stats.source,
        stats.pool.outstanding()
    );
    Ok(())
}
