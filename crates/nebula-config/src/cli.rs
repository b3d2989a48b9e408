//! Command-line argument parsing for the lobby server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Lobby server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "nebula-server", about = "Nebula lobby relay")]
pub struct CliArgs {
    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Upstream server address.
    #[arg(long)]
    pub server: Option<String>,

    /// Upstream server port.
    #[arg(long)]
    pub server_port: Option<u16>,

    /// Compress session traffic.
    #[arg(long)]
    pub compression: Option<bool>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.network.listen_port = port;
        }
        if let Some(ref addr) = args.server {
            self.network.server_address = addr.clone();
        }
        if let Some(port) = args.server_port {
            self.network.server_port = port;
        }
        if let Some(enabled) = args.compression {
            self.network.compression = enabled;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
