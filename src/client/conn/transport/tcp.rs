//! TCP transport for client connections.
//!
//! Connects to the target's host and port, optionally bounded by a connect
//! timeout. The timeout covers connection establishment only; exceeding it
//! fails the attempt before any bytes are sent.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{Instrument as _, trace};

use super::super::{ClientStream, Target};
use crate::BoxFuture;
use crate::client::Error;

/// A TCP connector for client connections.
#[derive(Debug, Clone)]
pub(crate) struct TcpTransport {
    connect_timeout: Option<Duration>,
}

impl TcpTransport {
    pub(crate) fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }
}

impl tower::Service<Target> for TcpTransport {
    type Response = ClientStream;
    type Error = Error;
    type Future = BoxFuture<'static, Result<ClientStream, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, target: Target) -> Self::Future {
        let connect_timeout = self.connect_timeout;
        let span = tracing::trace_span!("tcp", target = %target);

        Box::pin(
            async move {
                let connect = TcpStream::connect((target.host.as_str(), target.port));

                let stream = match connect_timeout {
                    Some(timeout) if !timeout.is_zero() => {
                        match tokio::time::timeout(timeout, connect).await {
                            Ok(connected) => connected,
                            Err(_) => {
                                trace!(?timeout, "connect attempt timed out");
                                return Err(Error::ConnectTimeout(timeout));
                            }
                        }
                    }
                    _ => connect.await,
                }
                .map_err(|error| Error::Connect(Arc::new(error)))?;

                if let Ok(peer_addr) = stream.peer_addr() {
                    trace!(peer.addr = %peer_addr, "tcp connected");
                } else {
                    trace!("tcp connected");
                }

                let _ = stream.set_nodelay(true);

                Ok(ClientStream::Plain(stream))
            }
            .instrument(span),
        )
    }
}
