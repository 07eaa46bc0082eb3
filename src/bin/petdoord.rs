//! petdoord - pet door monitor daemon
//!
//! This daemon:
//! 1. Loads config (file, environment, then command-line overrides)
//! 2. Prepares the `cats/`, `dogs/`, `unknown/` evidence layout
//! 3. Opens the frame source and classifier backend
//! 4. Runs the pipeline on a worker thread
//! 5. Serves the management API until Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use pet_door_monitor::{
    api::{ApiConfig, ApiServer},
    detect::open_classifier,
    ClassifierBoundary, EvidenceStore, MonitorConfig, Pipeline, SharedConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Motion-gated pet door monitor")]
struct Args {
    /// JSON config file.
    #[arg(long, env = "PETDOOR_CONFIG")]
    config: Option<PathBuf>,
    /// Evidence root (overrides config and PETDOOR_STORAGE_PATH).
    #[arg(long)]
    storage: Option<PathBuf>,
    /// Frame source URL: `stub://<name>` or a V4L2 device path.
    #[arg(long)]
    source: Option<String>,
    /// Management API bind address.
    #[arg(long)]
    api_addr: Option<String>,
    /// Run without the management API.
    #[arg(long)]
    no_api: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = MonitorConfig::load_from(args.config.as_deref())?;
    if let Some(storage) = args.storage {
        cfg.storage_path = storage;
    }
    if let Some(source) = args.source {
        cfg.source_url = source;
    }
    if let Some(addr) = args.api_addr {
        cfg.api_addr = addr;
    }

    let store = EvidenceStore::open(&cfg.storage_path).with_context(|| {
        format!(
            "failed to prepare evidence storage at {}",
            cfg.storage_path.display()
        )
    })?;
    let source = pet_door_monitor::open_source(&cfg.source_url, cfg.pipeline.resolution)?;
    let classifier = ClassifierBoundary::new(open_classifier(&cfg.classifier)?);

    log::info!("petdoord {} starting", env!("CARGO_PKG_VERSION"));
    log::info!("storage: {}", cfg.storage_path.display());
    log::info!("source: {}", cfg.source_url);
    log::info!(
        "fps={} resolution={}x{} confidence={} motion_threshold={}% cooldown={}s limit={}GB",
        cfg.pipeline.fps,
        cfg.pipeline.resolution.width,
        cfg.pipeline.resolution.height,
        cfg.pipeline.detection_confidence,
        cfg.pipeline.motion_threshold_percent,
        cfg.pipeline.cooldown_seconds,
        cfg.pipeline.high_water_mark_gb
    );

    let shared = SharedConfig::new(cfg.pipeline.clone());
    let worker = Pipeline::new(source, classifier, store, shared).spawn()?;

    let api_handle = if args.no_api {
        log::info!("management api disabled");
        None
    } else {
        let api_config = ApiConfig {
            addr: cfg.api_addr.clone(),
        };
        Some(ApiServer::new(api_config, worker.handle()).spawn()?)
    };

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("petdoord running, waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");

    if let Some(api_handle) = api_handle {
        api_handle.stop()?;
    }
    worker.stop()?;
    Ok(())
}
