//! Error types shared by the transport layer.

use std::io;

use crate::compression::CompressionError;

/// Result alias used by every fallible transport operation.
pub type NetResult<T> = Result<T, NetError>;

/// Errors surfaced by connections, listen sockets, poll groups and the connector.
///
/// "Nothing available right now" is never an error: non-blocking calls report
/// it as `Ok(0)` or `None`.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// A blocking call reached its deadline before completing.
    #[error("operation timed out")]
    TimedOut,

    /// The peer closed the stream before the requested bytes arrived.
    #[error("connection closed by peer")]
    Closed,

    /// An OS-level socket error.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    /// The streaming codec rejected the data or is in a bad state.
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),

    /// A synchronous open failed to resolve or connect.
    #[error(transparent)]
    Open(#[from] OpenError),

    /// The connector already has the maximum number of requests in flight.
    #[error("connector saturated: {limit} requests already in flight")]
    ConnectorSaturated {
        /// Configured in-flight limit.
        limit: usize,
    },

    /// The connector's worker pool is no longer accepting requests.
    #[error("connector has shut down")]
    ConnectorShutDown,
}

/// Failure to establish an outbound connection.
///
/// `code` is the OS error number when one is available and `-1` otherwise,
/// so it is never zero.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct OpenError {
    /// Numeric error code (OS errno / WSA error, or `-1`).
    pub code: i32,
    /// Human-readable description including the target.
    pub message: String,
}

impl OpenError {
    /// Build an error for a host name that did not resolve.
    pub fn resolve(host: &str, err: &io::Error) -> Self {
        let code = error_code(err);
        Self {
            code,
            message: format!("Cannot resolve host \"{host}\": [{code}]: {err}"),
        }
    }

    /// Build an error for a resolved target that refused or timed out.
    pub fn connect(host: &str, port: u16, err: &io::Error) -> Self {
        let code = error_code(err);
        Self {
            code,
            message: format!("Cannot connect to [{host}]:{port}, [{code}]:{err}"),
        }
    }

    /// Error delivered to a callback whose request was dropped by a shutting-down pool.
    pub fn abandoned(host: &str, port: u16) -> Self {
        Self {
            code: -1,
            message: format!("Connection attempt to [{host}]:{port} abandoned"),
        }
    }
}

fn error_code(err: &io::Error) -> i32 {
    match err.raw_os_error() {
        Some(code) if code != 0 => code,
        _ => -1,
    }
}
