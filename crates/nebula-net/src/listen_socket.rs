//! Server-side listening socket yielding new [`Connection`]s.

use std::io;
use std::net::{SocketAddr, TcpListener};

use crate::connection::Connection;
use crate::error::NetResult;
use crate::platform::{
    SocketConfig, create_listener, default_bind_address, ipv4_bind_address, is_dual_stack,
};
use crate::poll_group::{PollHandle, Pollable, TransportKind};
use crate::sys;

/// Bitmask of IP versions a listen socket accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IpVersions(u8);

impl IpVersions {
    /// IPv4 peers.
    pub const IPV4: Self = Self(0b0000_0001);
    /// IPv6 peers.
    pub const IPV6: Self = Self(0b0000_0010);

    /// Raw mask bits.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for IpVersions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A bound, listening, non-blocking TCP socket.
pub struct ListenSocket {
    listener: TcpListener,
    local_addr: SocketAddr,
    ip_versions: IpVersions,
    config: SocketConfig,
}

impl ListenSocket {
    /// Listen on `port` on all interfaces.
    ///
    /// Tries a dual-stack IPv6 socket first and falls back to IPv4 only.
    pub fn open(port: u16, config: &SocketConfig) -> NetResult<Self> {
        match Self::bind(default_bind_address(port), config) {
            Ok(socket) => Ok(socket),
            Err(e) => {
                tracing::info!("IPv6 listen on port {port} unavailable ({e}), falling back to IPv4");
                Self::bind(ipv4_bind_address(port), config)
            }
        }
    }

    /// Listen on an explicit address (port 0 picks an ephemeral port).
    pub fn bind(addr: SocketAddr, config: &SocketConfig) -> NetResult<Self> {
        let listener = create_listener(addr, config)?;
        let local_addr = listener.local_addr()?;
        let ip_versions = if !local_addr.is_ipv6() {
            IpVersions::IPV4
        } else if is_dual_stack(&listener) {
            IpVersions::IPV4 | IpVersions::IPV6
        } else {
            IpVersions::IPV6
        };
        tracing::info!("Listening on {local_addr} ({ip_versions:?})");
        Ok(Self {
            listener,
            local_addr,
            ip_versions,
            config: config.clone(),
        })
    }

    /// Accept one pending connection.
    ///
    /// `None` covers both "nothing pending" and "accept failed"; use
    /// [`try_accept`](Self::try_accept) to tell them apart.
    pub fn accept(&self) -> Option<Connection> {
        match self.try_accept() {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Accept on {} failed: {e}", self.local_addr);
                None
            }
        }
    }

    /// Accept one pending connection, reporting errors separately from "nothing pending".
    pub fn try_accept(&self) -> NetResult<Option<Connection>> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let conn = Connection::from_stream(stream, &self.config)?;
                    tracing::debug!("Accepted connection from {peer}");
                    return Ok(Some(conn));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// IP versions this socket accepts, fixed at construction.
    pub fn supported_ip_versions(&self) -> IpVersions {
        self.ip_versions
    }

    /// Bound address, including the OS-chosen port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Pollable for ListenSocket {
    fn poll_handle(&self) -> PollHandle {
        PollHandle::new(TransportKind::Tcp, sys::raw_socket(&self.listener))
    }
}

impl std::fmt::Debug for ListenSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenSocket")
            .field("local_addr", &self.local_addr)
            .field("ip_versions", &self.ip_versions)
            .finish()
    }
}
