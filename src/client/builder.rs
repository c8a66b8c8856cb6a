//! Configuring and constructing clients.
//!
//! All connector configuration is explicit and resolved once at build time:
//! the event loop size, the connect and read timeouts, the proxy, the TLS
//! client configuration, and the pool limits. Nothing is read from global
//! or static state.

use std::sync::Arc;
use std::time::Duration;

use super::conn::transport::proxy::ProxyConfig;
use super::pool;
use super::{Client, Config, Error, Shared};

/// A builder for [`Client`]s.
///
/// ```no_run
/// use relais::Client;
/// use std::time::Duration;
///
/// let client = Client::builder()
///     .connect_timeout(Duration::from_secs(5))
///     .read_timeout(Duration::from_secs(30))
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Default)]
pub struct Builder {
    worker_threads: Option<usize>,
    config: Config,
    pool: pool::Config,
}

impl Builder {
    /// Size the event-loop thread group (and the blocking pool alongside
    /// it). Unset, tokio's defaults apply.
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = Some(count);
        self
    }

    /// Bound the time to establish a transport connection.
    ///
    /// The bound covers connection establishment only, never the rest of
    /// the exchange. A zero duration disables the bound.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    /// Bound how long a blocking [`Client::send`] waits for an exchange to
    /// complete. A zero duration disables the bound.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    /// Route all connections through a forward HTTP proxy.
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    /// Use a specific rustls client configuration for TLS connections
    /// instead of the platform default.
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.config.tls = Some(config);
        self
    }

    /// Skip server certificate and hostname verification.
    ///
    /// Handshake signatures are still checked. This defeats the point of
    /// TLS; reach for it only against servers you control.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.config.danger_accept_invalid_certs = accept;
        self
    }

    /// How long an idle connection may sit in the pool before it is dropped
    /// instead of reused.
    pub fn pool_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pool.idle_timeout = timeout;
        self
    }

    /// The maximum number of idle connections kept per destination.
    pub fn pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.pool.max_idle_per_host = max;
        self
    }

    /// Build the client, starting its runtime.
    pub fn build(self) -> Result<Client, Error> {
        let mut runtime = tokio::runtime::Builder::new_multi_thread();
        runtime.enable_all().thread_name("relais-io");
        if let Some(count) = self.worker_threads {
            runtime.worker_threads(count.max(1));
            runtime.max_blocking_threads(count.max(1));
        }

        let runtime = runtime
            .build()
            .map_err(|error| Error::Runtime(Arc::new(error)))?;

        let shared = Shared::new(pool::Pool::new(self.pool), self.config);
        Ok(Client::from_parts(runtime, Arc::new(shared)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_leave_timeouts_unset() {
        let builder = Builder::default();
        assert!(builder.config.connect_timeout.is_none());
        assert!(builder.config.read_timeout.is_none());
        assert!(builder.config.proxy.is_none());
        assert!(!builder.config.danger_accept_invalid_certs);
    }

    #[test]
    fn settings_are_recorded() {
        let builder = Builder::default()
            .worker_threads(2)
            .connect_timeout(Duration::from_secs(1))
            .read_timeout(Duration::from_secs(2))
            .pool_max_idle_per_host(3)
            .pool_idle_timeout(Some(Duration::from_secs(4)));

        assert_eq!(builder.worker_threads, Some(2));
        assert_eq!(builder.config.connect_timeout, Some(Duration::from_secs(1)));
        assert_eq!(builder.config.read_timeout, Some(Duration::from_secs(2)));
        assert_eq!(builder.pool.max_idle_per_host, 3);
        assert_eq!(builder.pool.idle_timeout, Some(Duration::from_secs(4)));
    }

    #[test]
    fn build_starts_a_runtime() {
        crate::fixtures::subscribe();
        let client = Builder::default().worker_threads(1).build().unwrap();
        drop(client);
    }
}
