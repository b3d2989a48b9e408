//! Nebula lobby relay.
//!
//! Accepts game sessions, relays each session's byte stream to every other
//! session, and optionally links to an upstream lobby.

mod lobby;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use nebula_config::{CliArgs, Config};

use crate::lobby::Lobby;
use crate::settings::LobbySettings;

fn main() {
    let args = CliArgs::parse();

    let config_dir = args
        .config
        .clone()
        .or_else(Config::default_dir)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    nebula_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let settings = LobbySettings::from_config(&config.network);
    let mut lobby = match Lobby::new(settings) {
        Ok(lobby) => lobby,
        Err(e) => {
            tracing::error!("Failed to start lobby: {e}");
            std::process::exit(1);
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    if let Err(e) = stop_on_ctrl_c(Arc::clone(&stop)) {
        tracing::warn!("Cannot watch for Ctrl-C, stop the process to exit: {e}");
    }
    if let Err(e) = lobby.run(&stop) {
        tracing::error!("Lobby stopped: {e}");
        std::process::exit(1);
    }
}

/// Set `stop` when the process receives Ctrl-C.
fn stop_on_ctrl_c(stop: Arc<AtomicBool>) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Ctrl-C received, stopping lobby");
                    stop.store(true, Ordering::Relaxed);
                }
            });
        })?;
    Ok(())
}
