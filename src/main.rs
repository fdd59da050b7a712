//! ptt-core - Main entry point
//!
//! Push-to-talk conferencing server: WebSocket signaling + WebRTC audio,
//! serial radio relay, VOX/dashboard HTTP API.

use clap::Parser;
use log::{error, info};
use std::sync::Arc;

use ptt_core::args::Args;
use ptt_core::audio::ingress::spawn_mic_ingress;
use ptt_core::config::PathsConfig;
use ptt_core::logging;
use ptt_core::web::http_server::run_http_server;
use ptt_core::web::shared::spawn_floor_sweeper;
use ptt_core::SharedState;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Create the directories the server writes into.
fn prepare_directories(paths: &PathsConfig) -> std::io::Result<()> {
    std::fs::create_dir_all(&paths.recordings_dir)?;
    std::fs::create_dir_all(&paths.recordings_temp_dir)?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init(&config.logging, &config.paths, args.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!("ptt-core {} starting", env!("CARGO_PKG_VERSION"));

    if let Err(e) = prepare_directories(&config.paths) {
        error!("Failed to prepare directories: {}", e);
        std::process::exit(1);
    }

    // A leftover marker means the supervisor restarted us as requested
    let restart_marker = config.paths.restart_marker();
    if restart_marker.exists() {
        info!("Relaunched after dashboard restart request");
        let _ = std::fs::remove_file(&restart_marker);
    }

    if config.logging.enable_file_log {
        logging::spawn_retention_task(config.paths.log_dir.clone(), config.logging.retention_days);
    }

    let state = Arc::new(SharedState::new(config));

    spawn_mic_ingress(state.clone());
    spawn_floor_sweeper(state.clone());

    tokio::select! {
        result = run_http_server(state.clone()) => {
            if let Err(e) = result {
                error!("HTTP server failed: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            state.force_release_floor().await;
            state.relay.turn_off();
        }
    }
}
