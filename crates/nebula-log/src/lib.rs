//! Structured logging for the Nebula lobby server.
//!
//! Console output with uptime timestamps and thread names (connector workers
//! are named), plus an optional JSON log file in debug builds. The level
//! comes from `RUST_LOG`, falling back to the config's `debug.log_level`.

use std::path::Path;

use nebula_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_FILTER: &str = "info";

/// Name of the JSON log file written under `log_dir`.
pub const LOG_FILE_NAME: &str = "nebula-server.log";

/// Initialize the global tracing subscriber.
///
/// * `log_dir` - Directory for the JSON log file (debug builds only)
/// * `debug_build` - Whether to write the JSON log file
/// * `config` - Source of the `log_level` fallback
///
/// Calling it a second time in one process leaves the first subscriber in place.
///
/// ```no_run
/// use nebula_config::Config;
/// use nebula_log::init_logging;
///
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), true, Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if debug_build
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE_NAME))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true)
            .with_timer(fmt::time::uptime())
            .json();

        let _ = subscriber.with(file_layer).try_init();
        return;
    }

    let _ = subscriber.try_init();
}

/// Filter directive taken from the config, or [`DEFAULT_FILTER`].
pub fn filter_directive(config: Option<&Config>) -> String {
    config
        .map(|c| c.debug.log_level.trim())
        .filter(|level| !level.is_empty())
        .unwrap_or(DEFAULT_FILTER)
        .to_string()
}

/// An `EnvFilter` built from [`DEFAULT_FILTER`].
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        assert_eq!(format!("{}", default_env_filter()), "info");
    }

    #[test]
    fn test_directive_from_config() {
        let mut config = Config::default();
        config.debug.log_level = "debug,nebula_net=trace".to_string();
        assert_eq!(filter_directive(Some(&config)), "debug,nebula_net=trace");
    }

    #[test]
    fn test_empty_level_falls_back_to_default() {
        let mut config = Config::default();
        config.debug.log_level = "  ".to_string();
        assert_eq!(filter_directive(Some(&config)), DEFAULT_FILTER);
        assert_eq!(filter_directive(None), DEFAULT_FILTER);
    }

    #[test]
    fn test_env_filter_parsing() {
        for directive in ["info", "debug,nebula_net=trace", "warn,nebula_server=debug"] {
            assert!(
                EnvFilter::try_new(directive).is_ok(),
                "Failed to parse filter: {directive}"
            );
        }
    }

    #[test]
    fn test_debug_build_writes_json_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        init_logging(Some(&log_dir), true, None);
        tracing::info!(session = 7, "json log probe");

        let contents = std::fs::read_to_string(log_dir.join(LOG_FILE_NAME)).unwrap_or_default();
        // Another test may have installed the global subscriber first.
        if contents.is_empty() {
            return;
        }
        let line = contents
            .lines()
            .find(|line| line.contains("json log probe"))
            .expect("probe line");
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["level"], "INFO");
        assert_eq!(value["fields"]["session"], 7);
    }
}
