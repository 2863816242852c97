//! roadwatchd - pothole detection stream server
//!
//! This daemon:
//! 1. Loads configuration (file, then environment overrides)
//! 2. Registers the configured detection backend
//! 3. Serves the control routes, the MJPEG feeds and the SSE event stream
//! 4. Releases the active source on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use roadwatch::config::{DetectorSettings, RoadwatchConfig};
use roadwatch::{
    ApiConfig, ApiContext, ApiServer, EventQueue, FrameAnnotator, OracleRegistry, SharedOracle,
    SourceManager, StubBackend, SystemOpener,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Pothole detection stream server")]
struct Args {
    /// TOML or JSON config file.
    #[arg(long, env = "ROADWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address; overrides the config file and ROADWATCH_API_ADDR.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = RoadwatchConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        cfg.api.addr = addr;
    }

    let oracle = build_oracle(&cfg.detector)?;
    let manager = Arc::new(SourceManager::new(
        Arc::new(SystemOpener),
        cfg.camera.clone(),
    ));
    let ctx = ApiContext {
        manager: Arc::clone(&manager),
        oracle,
        queue: Arc::new(EventQueue::new()),
        annotator: FrameAnnotator::new(cfg.events.label.clone(), cfg.events.threshold),
    };

    let api_handle = ApiServer::new(ApiConfig::from_config(&cfg), ctx).spawn()?;
    log::info!("roadwatch api listening on {}", api_handle.addr);
    log::info!(
        "camera {} at {}x{} {}fps, uploads in {}",
        cfg.camera.device,
        cfg.camera.width,
        cfg.camera.height,
        cfg.camera.fps,
        cfg.api.upload_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("roadwatchd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;
    manager.stop();

    Ok(())
}

fn build_oracle(settings: &DetectorSettings) -> Result<SharedOracle> {
    let mut registry = OracleRegistry::new();
    registry.register(StubBackend::new());

    match settings.backend.as_str() {
        "stub" => {
            log::warn!("detector backend is 'stub': frames stream unannotated");
        }
        "tract" => register_tract(&mut registry, settings)?,
        other => return Err(anyhow!("unknown detector backend '{}'", other)),
    }
    registry.set_default(&settings.backend)?;
    registry.warm_up_all()?;
    log::info!(
        "detector backends: {} (using '{}')",
        registry.list().join(", "),
        settings.backend
    );

    registry
        .default_backend()
        .ok_or_else(|| anyhow!("no detector backend registered"))
}

#[cfg(feature = "backend-tract")]
fn register_tract(registry: &mut OracleRegistry, settings: &DetectorSettings) -> Result<()> {
    let model_path = settings
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("detector.model_path is required for the tract backend"))?;
    let backend = roadwatch::TractBackend::new(
        model_path,
        settings.input_width,
        settings.input_height,
        settings.labels.clone(),
    )?
    .with_min_confidence(settings.min_confidence);
    log::info!("loaded detection model {}", model_path.display());
    registry.register(backend);
    Ok(())
}

#[cfg(not(feature = "backend-tract"))]
fn register_tract(_registry: &mut OracleRegistry, _settings: &DetectorSettings) -> Result<()> {
    Err(anyhow!(
        "detector backend 'tract' requires building with the backend-tract feature"
    ))
}
