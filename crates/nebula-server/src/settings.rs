//! Runtime settings derived from the persisted [`NetworkConfig`].

use std::time::Duration;

use nebula_config::NetworkConfig;
use nebula_net::{ConnectorConfig, SocketConfig};

/// Everything the lobby needs, in transport types.
#[derive(Debug, Clone)]
pub struct LobbySettings {
    /// Port to listen on (0 picks one).
    pub listen_port: u16,
    /// Target duration of one tick.
    pub tick_interval: Duration,
    /// Upper bound on one readiness wait.
    pub poll_timeout: Duration,
    /// Time allowed for the upstream greeting to arrive.
    pub read_timeout: Duration,
    /// Switch every session into compressed mode on join.
    pub compression: bool,
    /// Sessions accepted before new ones are turned away.
    pub max_players: usize,
    /// Applied to accepted streams.
    pub socket: SocketConfig,
    /// Applied to the upstream connector.
    pub connector: ConnectorConfig,
    /// Upstream lobby to link to at startup.
    pub upstream: Option<(String, u16)>,
}

impl LobbySettings {
    pub fn from_config(network: &NetworkConfig) -> Self {
        let socket = SocketConfig {
            tcp_nodelay: !network.use_nagle,
            write_timeout: Some(Duration::from_millis(network.write_timeout_ms)),
            ..SocketConfig::default()
        };
        let upstream = (!network.server_address.trim().is_empty())
            .then(|| (network.server_address.trim().to_string(), network.server_port));

        Self {
            listen_port: network.listen_port,
            tick_interval: Duration::from_secs(1) / network.tick_rate.max(1),
            poll_timeout: Duration::from_millis(network.poll_timeout_ms),
            read_timeout: Duration::from_millis(network.read_timeout_ms),
            compression: network.compression,
            max_players: network.max_players as usize,
            connector: ConnectorConfig {
                connect_timeout: Duration::from_millis(network.connect_timeout_ms),
                worker_threads: network.connector_threads,
                max_pending: network.max_pending_connects,
                socket: socket.clone(),
            },
            socket,
            upstream,
        }
    }
}

impl Default for LobbySettings {
    fn default() -> Self {
        Self::from_config(&NetworkConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_map_through() {
        let settings = LobbySettings::default();
        assert_eq!(settings.listen_port, 2100);
        assert_eq!(settings.tick_interval, Duration::from_millis(50));
        assert_eq!(settings.connector.connect_timeout, Duration::from_secs(15));
        assert!(settings.socket.tcp_nodelay);
        assert_eq!(settings.socket.write_timeout, Some(Duration::from_secs(2)));
        assert_eq!(settings.connector.socket.write_timeout, Some(Duration::from_secs(2)));
        assert!(settings.upstream.is_none());
    }

    #[test]
    fn test_nagle_and_upstream() {
        let network = NetworkConfig {
            use_nagle: true,
            server_address: " lobby.example.net ".to_string(),
            server_port: 4000,
            tick_rate: 0,
            ..NetworkConfig::default()
        };
        let settings = LobbySettings::from_config(&network);
        assert!(!settings.socket.tcp_nodelay);
        assert!(!settings.connector.socket.tcp_nodelay);
        assert_eq!(
            settings.upstream,
            Some(("lobby.example.net".to_string(), 4000))
        );
        assert_eq!(settings.tick_interval, Duration::from_secs(1));
    }
}
