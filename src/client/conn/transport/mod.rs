//! Transport stacks for establishing client connections.
//!
//! Each transport is a [`tower::Service`] taking a [`Target`] and producing
//! a ready [`ClientStream`]. Stacks are assembled per connection attempt
//! from the client configuration: TCP at the bottom, then an optional
//! forward-proxy CONNECT handshake, then an optional TLS handshake. The
//! proxy stage runs before TLS so that encryption happens end-to-end through
//! the tunnel.

use std::sync::Arc;
use std::time::Duration;

use tower::util::BoxCloneService;

use super::{ClientStream, Target};
use crate::client::Error;

pub(crate) mod proxy;
pub(crate) mod tcp;
pub(crate) mod tls;

pub(crate) use self::proxy::HttpProxyTransport;
pub(crate) use self::tcp::TcpTransport;
pub(crate) use self::tls::TlsTransport;

/// A fully assembled transport stack, boxed to a uniform service type.
pub(crate) type Transport = BoxCloneService<Target, ClientStream, Error>;

/// Assemble the transport stack for one connection attempt.
///
/// `tls` carries the client configuration only when the target scheme
/// requires encryption.
pub(crate) fn build(
    connect_timeout: Option<Duration>,
    proxy: Option<&proxy::ProxyConfig>,
    tls: Option<Arc<rustls::ClientConfig>>,
) -> Transport {
    let mut transport = Transport::new(TcpTransport::new(connect_timeout));

    if let Some(proxy) = proxy {
        transport = Transport::new(HttpProxyTransport::new(transport, proxy.clone()));
    }

    if let Some(config) = tls {
        transport = Transport::new(TlsTransport::new(transport, config));
    }

    transport
}
