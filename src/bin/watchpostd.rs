//! watchpostd - weapon detection daemon
//!
//! This daemon:
//! 1. Loads configuration (file named by WATCHPOST_CONFIG, then env overrides)
//! 2. Opens the evidence store and the detector backend
//! 3. Acquires the capture device (primary index, then fallback)
//! 4. Runs the capture loop on its own thread
//! 5. Serves status, evidence, snapshots and the MJPEG stream until Ctrl-C
//!
//! If the device or detector cannot be brought up the API still starts, and the
//! stream endpoint answers 503.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;

use watchpost::api::{ApiConfig, ApiServer, ApiState};
use watchpost::detect::build_backend;
use watchpost::{
    open_configured, CategoryClassifier, EvidenceStore, Pipeline, PipelineHandle, PipelineParts,
    PipelineSettings, SqliteEvidenceStore, StatusQuery, WatchpostConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Serve the API only; do not open the camera.
    #[arg(long)]
    no_capture: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = WatchpostConfig::load()?;
    log::info!(
        "watchpostd {} starting. evidence db {}, snapshots in {}",
        env!("CARGO_PKG_VERSION"),
        cfg.db_path,
        cfg.snapshot_root.display()
    );

    let store: Arc<dyn EvidenceStore> = Arc::new(SqliteEvidenceStore::open(&cfg.db_path)?);
    let status = Arc::new(StatusQuery::new(
        Arc::clone(&store),
        CategoryClassifier::new(&cfg.alerts.categories)?,
        cfg.alerts.alert_window,
    ));

    let pipeline = if args.no_capture {
        log::info!("capture disabled by --no-capture");
        None
    } else {
        match start_pipeline(&cfg, Arc::clone(&store)) {
            Ok(handle) => Some(handle),
            Err(err) => {
                log::error!("pipeline unavailable: {:#}", err);
                None
            }
        }
    };

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: cfg.api_addr.clone(),
            snapshot_root: cfg.snapshot_root.clone(),
            public_base_url: cfg.public_base_url.clone(),
        },
        ApiState {
            store,
            status,
            broadcaster: pipeline.as_ref().map(|p| p.broadcaster()),
        },
    )
    .spawn()?;
    log::info!("api listening on {}", api_handle.addr);

    let (tx, rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("watchpostd running; Ctrl-C to stop");
    let _ = rx.recv();
    log::info!("shutdown signal received");

    if let Some(pipeline) = pipeline {
        match pipeline.stop() {
            Ok(stats) => log::info!(
                "pipeline stopped: frames={} inferences={} triggers={}",
                stats.frames,
                stats.inferences,
                stats.triggers
            ),
            Err(err) => log::warn!("pipeline ended with error: {:#}", err),
        }
    }
    api_handle.stop()?;
    Ok(())
}

fn start_pipeline(cfg: &WatchpostConfig, store: Arc<dyn EvidenceStore>) -> Result<PipelineHandle> {
    let detector = build_backend(&cfg.detection)?;
    let parts = PipelineParts::from_config(cfg, store)?;
    let capture = open_configured(&cfg.capture)?;
    let pipeline = Pipeline::new(capture, detector, parts, PipelineSettings::from_config(cfg));
    PipelineHandle::spawn(pipeline)
}
