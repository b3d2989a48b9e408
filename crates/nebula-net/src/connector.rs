//! Outbound connects that never block the calling thread.
//!
//! [`AsyncConnector::open_async`] hands a request to a bounded worker pool.
//! A worker resolves the host, tries each address with a timeout and invokes
//! the caller's callback exactly once with an [`OpenConnectionResult`]. The
//! callback runs on a worker thread; forwarding the result to the owning
//! thread (a channel, a queue) is up to the callback.
//!
//! There is no cancellation. A caller that wants to ignore stale results
//! should tag requests itself, e.g. with a generation counter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::{Semaphore, TryAcquireError};

use crate::connection::Connection;
use crate::error::{NetError, NetResult, OpenError};
use crate::platform::SocketConfig;

/// Either a newly owned connection or the reason the connect failed.
pub type OpenConnectionResult = Result<Connection, OpenError>;

type Callback = Box<dyn FnOnce(OpenConnectionResult) + Send + 'static>;

/// Configuration for [`AsyncConnector`].
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Per-address connect timeout. Default: 15s.
    pub connect_timeout: Duration,
    /// Worker threads in the pool. Default: 2.
    pub worker_threads: usize,
    /// Maximum requests in flight; further requests are refused. Default: 64.
    pub max_pending: usize,
    /// Options applied to every established stream.
    pub socket: SocketConfig,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            worker_threads: 2,
            max_pending: 64,
            socket: SocketConfig::default(),
        }
    }
}

/// One outbound connect owned by a worker until its callback has fired.
struct OpenConnectionRequest {
    host: String,
    port: u16,
    completion: Completion,
}

/// Guarantees the callback runs exactly once.
///
/// If the worker task is dropped before finishing (pool shutdown), the
/// callback fires from `Drop` with an "abandoned" error.
struct Completion {
    callback: Option<Callback>,
    host: String,
    port: u16,
}

impl Completion {
    fn complete(mut self, result: OpenConnectionResult) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            tracing::debug!("Connect to [{}]:{} abandoned", self.host, self.port);
            callback(Err(OpenError::abandoned(&self.host, self.port)));
        }
    }
}

/// Bounded pool that completes outbound connects off the caller's thread.
pub struct AsyncConnector {
    runtime: Option<Runtime>,
    permits: Arc<Semaphore>,
    config: ConnectorConfig,
}

impl AsyncConnector {
    /// Start the worker pool.
    ///
    /// Fails if the worker threads cannot be created.
    pub fn new(config: ConnectorConfig) -> NetResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("nebula-connect")
            .enable_io()
            .enable_time()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
            permits: Arc::new(Semaphore::new(config.max_pending.max(1))),
            config,
        })
    }

    /// Connect to `host:port` in the background and report through `callback`.
    ///
    /// Returns once the request is queued. If the request is refused
    /// ([`NetError::ConnectorSaturated`] or [`NetError::ConnectorShutDown`])
    /// the callback is dropped without being called.
    pub fn open_async<F>(&self, host: impl Into<String>, port: u16, callback: F) -> NetResult<()>
    where
        F: FnOnce(OpenConnectionResult) + Send + 'static,
    {
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(NetError::ConnectorShutDown);
        };
        let host = host.into();

        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                tracing::warn!(
                    "Refusing connect to [{host}]:{port}: {} requests in flight",
                    self.config.max_pending
                );
                return Err(NetError::ConnectorSaturated {
                    limit: self.config.max_pending.max(1),
                });
            }
            Err(TryAcquireError::Closed) => return Err(NetError::ConnectorShutDown),
        };

        let request = OpenConnectionRequest {
            completion: Completion {
                callback: Some(Box::new(callback)),
                host: host.clone(),
                port,
            },
            host,
            port,
        };
        let timeout = self.config.connect_timeout;
        let socket = self.config.socket.clone();

        runtime.spawn(async move {
            let OpenConnectionRequest {
                host,
                port,
                completion,
            } = request;
            let result = open_connection(&host, port, timeout, &socket).await;
            if let Err(err) = &result {
                tracing::debug!("{err}");
            }
            completion.complete(result);
            drop(permit);
        });
        Ok(())
    }

    /// Requests currently owned by workers.
    pub fn in_flight(&self) -> usize {
        self.config.max_pending.max(1) - self.permits.available_permits()
    }

    /// The configuration the pool was built with.
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }
}

impl Drop for AsyncConnector {
    fn drop(&mut self) {
        self.permits.close();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for AsyncConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncConnector")
            .field("in_flight", &self.in_flight())
            .field("config", &self.config)
            .finish()
    }
}

/// Resolve, then try each address in order until one connects.
async fn open_connection(
    host: &str,
    port: u16,
    timeout: Duration,
    socket: &SocketConfig,
) -> OpenConnectionResult {
    let addrs: Vec<SocketAddr> = match tokio::net::lookup_host((host, port)).await {
        Ok(addrs) => addrs.collect(),
        Err(e) => return Err(OpenError::resolve(host, &e)),
    };
    if addrs.is_empty() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found");
        return Err(OpenError::resolve(host, &err));
    }

    let mut last_err: Option<std::io::Error> = None;
    for addr in addrs {
        let attempt = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await;
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                last_err = Some(e);
                continue;
            }
            Err(_) => {
                last_err = Some(std::io::ErrorKind::TimedOut.into());
                continue;
            }
        };

        let opened = stream
            .into_std()
            .and_then(|stream| Connection::from_stream(stream, socket));
        match opened {
            Ok(conn) => {
                tracing::debug!("Connected to [{host}]:{port} via {addr}");
                return Ok(conn);
            }
            Err(e) => last_err = Some(e),
        }
    }

    let err = last_err.unwrap_or_else(|| std::io::ErrorKind::NotConnected.into());
    Err(OpenError::connect(host, port, &err))
}
