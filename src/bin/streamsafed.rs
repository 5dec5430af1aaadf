//! streamsafed - StreamSafe redaction daemon
//!
//! This daemon:
//! 1. Loads configuration (file named by STREAMSAFE_CONFIG, then env overrides)
//! 2. Serves the control API for live sessions and processing jobs
//! 3. Optionally starts a live session on the configured source
//! 4. Stops every session and job on Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use streamsafe::{
    api::{ApiConfig, ApiServer, ApiState},
    live::StreamRequest,
    StreamSafeConfig,
};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = StreamSafeConfig::load()?;
    log::info!(
        "streamsafed {} starting; source={} enabled={:?}",
        env!("CARGO_PKG_VERSION"),
        config.source.uri,
        config.detection.enabled()
    );
    match &config.detectors.plate_model {
        Some(path) => log::info!("plate model: {}", path.display()),
        None => log::warn!("no plate model configured; fixed plate regions will be blurred"),
    }

    let state = Arc::new(ApiState::from_config(&config)?);
    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        token_path: config.api_token_path.clone(),
    };
    let api_handle = ApiServer::new(api_config, state.clone()).spawn()?;
    if let Some(path) = &api_handle.token_path {
        log::info!("api token written to {}", path.display());
    } else {
        log::warn!("api token (handle securely): {}", api_handle.token);
    }

    if config.live.autostart {
        let request = StreamRequest::default();
        match state.live.start(&request, config.detection) {
            Ok(id) => log::info!("autostarted live session {} on {}", id, config.source.uri),
            Err(e) => log::error!("autostart on {} failed: {:#}", config.source.uri, e),
        }
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("streamsafed waiting for shutdown signal (Ctrl-C)...");
    loop {
        match rx.recv_timeout(HEALTH_LOG_INTERVAL) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::info!(
                    "health: streams={} jobs={} uptime={:.0}s",
                    state.live.active_count(),
                    state.jobs.active_count(),
                    state.uptime().as_secs_f64()
                );
            }
        }
    }

    log::info!("shutdown signal received, stopping sessions and API server...");
    state.shutdown()?;
    api_handle.stop()?;
    Ok(())
}
