//! Cross-platform TCP socket configuration.
//!
//! Provides [`SocketConfig`] to encapsulate platform-specific socket options
//! (TCP_NODELAY, keepalive, SO_REUSEADDR, dual-stack IPv6) and helper functions
//! to apply them consistently to every stream and listener the transport owns.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};

/// Listen backlog for server sockets.
const LISTEN_BACKLOG: i32 = 128;

/// Platform-specific TCP socket configuration applied to every connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm for lower latency. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Keepalive probe interval. Default: 10s.
    pub keepalive_interval: Duration,
    /// Number of keepalive probes before declaring connection dead. Default: 3.
    pub keepalive_retries: u32,
    /// Enable `SO_REUSEADDR` on server sockets. Default: true on Linux/macOS, false on Windows.
    pub reuse_addr: bool,
    /// Longest a blocking write may wait for the peer to drain. Default: none.
    pub write_timeout: Option<Duration>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            keepalive_retries: 3,
            reuse_addr: !cfg!(target_os = "windows"),
            write_timeout: None,
        }
    }
}

/// Apply socket configuration to a connected [`TcpStream`].
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if config.keepalive_enabled {
        let sock_ref = SockRef::from(stream);
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);

        // Retries are supported on Linux and Windows but not macOS.
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let keepalive = keepalive.with_retries(config.keepalive_retries);

        sock_ref.set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Create a non-blocking, listening [`TcpListener`] with proper socket options.
///
/// Sets `SO_REUSEADDR` and, when binding an IPv6 address, clears `IPV6_V6ONLY`
/// so one socket accepts both IPv4 and IPv6 peers.
pub fn create_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }

    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Whether an IPv6 listener also accepts IPv4-mapped peers.
pub(crate) fn is_dual_stack(listener: &TcpListener) -> bool {
    SockRef::from(listener)
        .only_v6()
        .map(|only_v6| !only_v6)
        .unwrap_or(false)
}

/// Determine the best bind address for the server.
///
/// Prefers IPv6 dual-stack (`[::]`) if available, which accepts both IPv4 and
/// IPv6 connections on platforms that support it.
pub fn default_bind_address(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
}

/// Fallback: bind IPv4 only (`0.0.0.0`).
pub fn ipv4_bind_address(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_nodelay_is_set() {
        let config = SocketConfig::default();
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        configure_stream(&client, &config).unwrap();

        assert!(client.nodelay().unwrap(), "TCP_NODELAY should be enabled");
    }

    #[test]
    fn test_nodelay_disabled_when_configured() {
        let config = SocketConfig {
            tcp_nodelay: false,
            ..Default::default()
        };
        let listener =
            create_listener("127.0.0.1:0".parse().unwrap(), &SocketConfig::default()).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        configure_stream(&client, &config).unwrap();

        assert!(
            !client.nodelay().unwrap(),
            "TCP_NODELAY should be disabled when configured off"
        );
    }

    #[test]
    fn test_keepalive_is_configured() {
        let config = SocketConfig {
            keepalive_idle: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(5),
            ..Default::default()
        };
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        configure_stream(&client, &config).unwrap();

        assert!(SockRef::from(&client).keepalive().unwrap());
    }

    #[test]
    fn test_listener_is_nonblocking() {
        let listener =
            create_listener("127.0.0.1:0".parse().unwrap(), &SocketConfig::default()).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_ipv4_listener_is_not_dual_stack() {
        let listener =
            create_listener("127.0.0.1:0".parse().unwrap(), &SocketConfig::default()).unwrap();
        assert!(!is_dual_stack(&listener));
    }

    #[test]
    fn test_ipv6_listener_is_dual_stack() {
        match create_listener("[::1]:0".parse().unwrap(), &SocketConfig::default()) {
            Ok(listener) => assert!(is_dual_stack(&listener)),
            Err(_) => eprintln!("IPv6 not available, skipping test"),
        }
    }

    #[test]
    fn test_default_bind_address_is_ipv6() {
        let addr = default_bind_address(7777);
        assert!(addr.is_ipv6(), "Default bind address should be IPv6 for dual-stack");
        assert_eq!(addr.port(), 7777);
    }

    #[test]
    fn test_ipv4_fallback_address() {
        let addr = ipv4_bind_address(7777);
        assert!(addr.is_ipv4(), "Fallback should be IPv4");
        assert_eq!(addr.port(), 7777);
    }

    #[test]
    fn test_reuse_addr_platform_default() {
        let config = SocketConfig::default();
        assert_eq!(config.reuse_addr, !cfg!(target_os = "windows"));
    }
}
