//! Transport core: TCP connections, readiness polling, listening sockets,
//! background connects, and streaming zlib compression.

pub mod bandwidth;
pub mod compression;
pub mod connection;
pub mod connector;
pub mod error;
pub mod listen_socket;
pub mod platform;
pub mod poll_group;
mod sys;

#[cfg(test)]
mod scenario_tests;

pub use bandwidth::{NetworkCounters, NetworkStats, StatsSnapshot, update_network_stats};
pub use compression::{CompressionAdapter, CompressionConfig, CompressionError};
pub use connection::{Connection, Transferred};
pub use connector::{AsyncConnector, ConnectorConfig, OpenConnectionResult};
pub use error::{NetError, NetResult, OpenError};
pub use listen_socket::{IpVersions, ListenSocket};
pub use platform::{
    SocketConfig, configure_stream, create_listener, default_bind_address, ipv4_bind_address,
};
pub use poll_group::{PollGroup, PollHandle, Pollable, TransportKind};
