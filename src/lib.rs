//! # Relais: an asynchronous, pooling HTTP client connector
//!
//! Relais bridges a synchronous, blocking request/response programming model
//! onto a non-blocking, event-loop transport. A [`Client`] owns a
//! multi-threaded tokio runtime which drives all connection I/O, and exposes
//! two entry points over it:
//!
//! - a blocking call ([`Client::send`]) which submits a request and waits for
//!   the exchange to finish, bounded by an optional read timeout;
//! - a callback call ([`Client::send_with`]) which returns a cancellable
//!   handle immediately and later invokes the callback exactly once, from a
//!   worker thread rather than a transport thread.
//!
//! ## Architecture Overview
//!
//! Requests are multiplexed over a small set of pooled physical connections.
//! Each destination (scheme, host, port) has its own bucket of idle
//! connections; a connection is owned by exactly one in-flight exchange at a
//! time and returns to its bucket only after the exchange completed cleanly.
//!
//! A new connection is assembled as a stack of transports: TCP (bounded by
//! the connect timeout), then an optional forward-proxy CONNECT handshake,
//! then an optional TLS handshake, and finally the HTTP/1.1 codec. Request
//! entities of unknown length are streamed with chunked transfer encoding;
//! entity production runs on the runtime's blocking pool so that reading a
//! caller's `std::io::Read` never occupies an event-loop thread. Response
//! bodies arrive asynchronously and are handed to the caller through a
//! blocking reader backed by a chunk queue, so the caller-side body API stays
//! pull-based while the transport stays push-based.
//!
//! ## Exchange lifecycle
//!
//! Every exchange resolves two independent signals: *availability* (enough of
//! the response exists to hand back a response object) and *completion* (the
//! exchange is fully done, successfully or not). Completion failing forces
//! availability to fail if it has not already resolved, so each caller
//! observes exactly one outcome per call, delivered exactly once.

use std::{fmt, pin::Pin};

pub mod client;

#[allow(dead_code)]
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
#[allow(dead_code)]
type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use self::client::{Builder, Client, Entity, Error, Request, Response};

#[allow(unused)]
/// Utility struct for formatting a `Display` type in a `Debug` context.
pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Test fixtures
#[cfg(test)]
#[allow(dead_code)]
pub(crate) mod fixtures {

    use std::sync::Once;

    /// Registers a global default tracing subscriber when called for the first time. This is intended
    /// for use in tests.
    pub fn subscribe() {
        static INSTALL_TRACING_SUBSCRIBER: Once = Once::new();
        INSTALL_TRACING_SUBSCRIBER.call_once(|| {
            let subscriber = tracing_subscriber::FmtSubscriber::builder()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .finish();
            tracing::subscriber::set_global_default(subscriber).unwrap();
        });
    }
}
