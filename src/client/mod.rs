//! Client implementations
//!
//! The [`Client`] is the bridge between callers and the transport event
//! loop: it owns a tokio runtime that drives all connection I/O, a
//! connection pool, and the configuration for connecting (timeouts, proxy,
//! TLS). Requests go in through [`Client::send`] (blocking) or
//! [`Client::send_with`] (callback); both ride the same exchange machinery
//! underneath.

use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use thiserror::Error as ThisError;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

pub(crate) mod body;
pub mod builder;
pub(crate) mod codec;
pub mod conn;
pub(crate) mod exchange;
pub mod pool;
pub mod request;
pub mod response;

pub use self::builder::Builder;
pub use self::conn::transport::proxy::{ProxyConfig, ProxyCredentials, ProxyError};
pub use self::pool::Config as PoolConfig;
pub use self::request::{Entity, Request};
pub use self::response::{Response, ResponseBody};

use self::pool::Pool;

/// A processing failure surfaced by the connector.
///
/// Sources are preserved, so the original cause of a failure stays reachable
/// through [`std::error::Error::source`].
#[derive(Debug, Clone, ThisError)]
#[non_exhaustive]
pub enum Error {
    /// The transport connection could not be established.
    #[error("connection failed")]
    Connect(#[source] Arc<io::Error>),

    /// The connect timeout elapsed before the transport connected.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// TLS negotiation or server identity validation failed.
    #[error("TLS negotiation failed")]
    Tls(#[source] Arc<io::Error>),

    /// Forward-proxy traversal failed.
    #[error("proxy handshake failed")]
    Proxy(#[from] ProxyError),

    /// The connection failed mid-exchange.
    #[error("connection failed during exchange")]
    Transport(#[source] Arc<io::Error>),

    /// Producing the request entity failed.
    #[error("request entity could not be written")]
    BodyWrite(#[source] Arc<io::Error>),

    /// The configured read timeout elapsed before the exchange completed.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The request cannot be expressed on the wire.
    #[error("invalid request: {0}")]
    Protocol(String),

    /// The exchange went away before resolving.
    #[error("exchange was canceled")]
    Canceled,

    /// The client's I/O driver could not be started.
    #[error("failed to start I/O driver")]
    Runtime(#[source] Arc<io::Error>),
}

/// State shared between the client handle and every exchange.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) pool: Pool,
    pub(crate) config: Config,
    tls: OnceLock<Arc<rustls::ClientConfig>>,
}

/// Resolved connector configuration, threaded explicitly through the
/// transport assembly rather than read from shared global state.
#[derive(Debug, Clone, Default)]
pub(crate) struct Config {
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) proxy: Option<ProxyConfig>,
    pub(crate) tls: Option<Arc<rustls::ClientConfig>>,
    pub(crate) danger_accept_invalid_certs: bool,
}

impl Shared {
    pub(crate) fn new(pool: Pool, config: Config) -> Self {
        Self {
            pool,
            config,
            tls: OnceLock::new(),
        }
    }

    /// The TLS configuration for new connections.
    ///
    /// Built lazily so clients that never speak TLS never touch the
    /// platform certificate store.
    pub(crate) fn tls_config(&self) -> Arc<rustls::ClientConfig> {
        if let Some(config) = &self.config.tls {
            return config.clone();
        }

        self.tls
            .get_or_init(|| {
                Arc::new(if self.config.danger_accept_invalid_certs {
                    conn::transport::tls::insecure_tls_config()
                } else {
                    conn::transport::tls::default_tls_config()
                })
            })
            .clone()
    }
}

/// An asynchronous, connection-pooling HTTP client with blocking and
/// callback entry points.
///
/// The client owns its event loop: a multi-threaded tokio runtime drives
/// all transport I/O, while entity production and callback delivery run on
/// the runtime's blocking pool. Cloning the client is cheap and shares the
/// runtime and the connection pool.
///
/// Both entry points are made for non-async callers. Do not call them, or
/// drop the last clone of a client, from inside an async context: the
/// blocking wait (and the runtime shutdown on drop) would stall the calling
/// executor.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

#[derive(Debug)]
struct ClientRef {
    runtime: Runtime,
    shared: Arc<Shared>,
}

/// A cancellable handle to a callback-based call.
///
/// Dropping the handle detaches the exchange; it keeps running and the
/// callback still fires. [`RequestHandle::cancel`] aborts it instead, in
/// which case the callback may never run.
#[derive(Debug)]
pub struct RequestHandle {
    driver: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

impl RequestHandle {
    /// Abort the exchange and the callback delivery, best effort.
    pub fn cancel(&self) {
        self.driver.abort();
        self.watcher.abort();
    }

    /// Whether the callback has been dispatched (or the call was aborted).
    pub fn is_finished(&self) -> bool {
        self.watcher.is_finished()
    }
}

impl Client {
    /// Start configuring a client.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Build a client with default configuration.
    pub fn new() -> Result<Self, Error> {
        Self::builder().build()
    }

    pub(crate) fn from_parts(runtime: Runtime, shared: Arc<Shared>) -> Self {
        Self {
            inner: Arc::new(ClientRef { runtime, shared }),
        }
    }

    fn submit(&self, request: Request) -> SubmittedExchange {
        let (signals, availability, completion) = exchange::ExchangeHandle::new();
        let driver = self
            .inner
            .runtime
            .handle()
            .spawn(exchange::run(self.inner.shared.clone(), request, signals));

        SubmittedExchange {
            availability,
            completion,
            driver,
        }
    }

    /// Execute a request, blocking until the exchange completes.
    ///
    /// When a positive read timeout is configured the wait is bounded:
    /// exceeding it raises [`Error::Timeout`] promptly and aborts the
    /// underlying exchange best-effort, closing its connection.
    ///
    /// On success the returned response carries the fully received body;
    /// reading it does not block. Failures surface as a single [`Error`]
    /// with the original cause attached.
    pub fn send(&self, request: Request) -> Result<Response, Error> {
        let SubmittedExchange {
            availability,
            completion,
            driver,
        } = self.submit(request);
        let handle = self.inner.runtime.handle();

        let done = match self.inner.shared.config.read_timeout {
            Some(timeout) if !timeout.is_zero() => {
                match handle.block_on(async move { tokio::time::timeout(timeout, completion).await }) {
                    Ok(done) => done,
                    Err(_elapsed) => {
                        trace!(?timeout, "read timeout elapsed, aborting exchange");
                        driver.abort();
                        return Err(Error::Timeout(timeout));
                    }
                }
            }
            _ => handle.block_on(completion),
        };

        match done {
            Ok(Ok(())) => match handle.block_on(availability) {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(error)) => Err(error),
                Err(_) => Err(Error::Canceled),
            },
            Ok(Err(error)) => Err(error),
            Err(_) => Err(Error::Canceled),
        }
    }

    /// Execute a request, invoking `callback` with the outcome.
    ///
    /// Returns immediately with a cancellable handle. The callback fires
    /// exactly once, from a worker thread rather than a transport thread, so
    /// it may block (for instance to read the response body) without
    /// stalling connection I/O.
    pub fn send_with<F>(&self, request: Request, callback: F) -> RequestHandle
    where
        F: FnOnce(Result<Response, Error>) + Send + 'static,
    {
        let SubmittedExchange {
            availability,
            completion,
            driver,
        } = self.submit(request);

        let watcher = self.inner.runtime.handle().spawn(async move {
            let outcome = match completion.await {
                Ok(Ok(())) => match availability.await {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(error)) => Err(error),
                    Err(_) => Err(Error::Canceled),
                },
                Ok(Err(error)) => Err(error),
                Err(_) => Err(Error::Canceled),
            };

            // Deliver off the event loop so callback code can block freely.
            let delivered = tokio::task::spawn_blocking(move || callback(outcome));
            let _ = delivered.await;
        });

        RequestHandle { driver, watcher }
    }
}

struct SubmittedExchange {
    availability: oneshot::Receiver<Result<Response, Error>>,
    completion: oneshot::Receiver<Result<(), Error>>,
    driver: JoinHandle<()>,
}
