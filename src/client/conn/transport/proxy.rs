//! Forward-proxy traversal via HTTP CONNECT.
//!
//! The handshake runs on the freshly connected stream before any TLS
//! negotiation, so the tunnel carries the encrypted session untouched.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};

use base64::Engine as _;
use bytes::BytesMut;
use http::Uri;
use thiserror::Error;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tower::ServiceExt as _;
use tracing::{Instrument as _, trace};

use super::super::{ClientStream, Scheme, Target};
use crate::BoxFuture;
use crate::client::Error as ClientError;

/// Default port when the proxy address does not carry one.
const DEFAULT_PROXY_PORT: u16 = 8080;

/// Maximum accepted size of the proxy's CONNECT reply head.
const MAX_REPLY_SIZE: usize = 8 * 1024;

/// An error raised while traversing a forward proxy.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ProxyError {
    /// The configured proxy address could not be understood.
    #[error("malformed proxy address: {0}")]
    Address(String),

    /// The connection to the proxy failed while handshaking.
    #[error("proxy connection failed")]
    Io(#[source] Arc<io::Error>),

    /// The proxy answered CONNECT with a non-success status.
    #[error("proxy refused CONNECT with status {0}")]
    Refused(u16),

    /// The proxy's reply could not be parsed.
    #[error("malformed proxy response")]
    Malformed,
}

/// Credentials presented to the proxy as HTTP Basic authorization.
#[derive(Clone)]
pub struct ProxyCredentials {
    username: String,
    password: String,
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"...")
            .finish()
    }
}

/// Configuration for a forward HTTP proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    host: String,
    port: u16,
    credentials: Option<ProxyCredentials>,
}

impl ProxyConfig {
    /// Configure a proxy at the given host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
        }
    }

    /// Configure a proxy from a URI such as `http://proxy.internal:3128`.
    ///
    /// The port defaults to 8080 when the URI does not carry one.
    pub fn from_uri(uri: &Uri) -> Result<Self, ClientError> {
        let host = uri
            .host()
            .ok_or_else(|| ProxyError::Address(format!("no host in {uri}")))?;
        let port = uri.port_u16().unwrap_or(DEFAULT_PROXY_PORT);
        Ok(Self::new(host, port))
    }

    /// Present the given credentials as Basic authorization.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(ProxyCredentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    fn target(&self) -> Target {
        Target {
            scheme: Scheme::Http,
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Wrapper around a transport which connects to the proxy and tunnels
/// through it with CONNECT.
#[derive(Debug, Clone)]
pub(crate) struct HttpProxyTransport<T> {
    transport: T,
    proxy: ProxyConfig,
}

impl<T> HttpProxyTransport<T> {
    pub(crate) fn new(transport: T, proxy: ProxyConfig) -> Self {
        Self { transport, proxy }
    }
}

impl<T> tower::Service<Target> for HttpProxyTransport<T>
where
    T: tower::Service<Target, Response = ClientStream, Error = ClientError>
        + Clone
        + Send
        + 'static,
    T::Future: Send,
{
    type Response = ClientStream;
    type Error = ClientError;
    type Future = BoxFuture<'static, Result<ClientStream, ClientError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.transport.poll_ready(cx)
    }

    fn call(&mut self, target: Target) -> Self::Future {
        let proxy = self.proxy.clone();
        let transport = self.transport.clone();
        let span = tracing::trace_span!("proxy", proxy.host = %proxy.host, proxy.port = proxy.port);

        Box::pin(
            async move {
                let mut stream = transport.oneshot(proxy.target()).await?;
                handshake(&mut stream, &target, &proxy).await?;
                trace!("proxy tunnel established");
                Ok(stream)
            }
            .instrument(span),
        )
    }
}

/// Perform the CONNECT handshake on a fresh stream to the proxy.
async fn handshake(
    stream: &mut ClientStream,
    target: &Target,
    proxy: &ProxyConfig,
) -> Result<(), ProxyError> {
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
        host = target.host,
        port = target.port,
    );
    if let Some(credentials) = &proxy.credentials {
        let token = base64::engine::general_purpose::STANDARD.encode(format!(
            "{}:{}",
            credentials.username, credentials.password
        ));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| ProxyError::Io(Arc::new(e)))?;

    let mut reply = BytesMut::with_capacity(1024);
    loop {
        let read = stream
            .read_buf(&mut reply)
            .await
            .map_err(|e| ProxyError::Io(Arc::new(e)))?;
        if read == 0 {
            return Err(ProxyError::Io(Arc::new(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed during CONNECT",
            ))));
        }

        let mut headers = [httparse::EMPTY_HEADER; 16];
        let mut parsed = httparse::Response::new(&mut headers);
        match parsed.parse(&reply) {
            Ok(httparse::Status::Complete(_)) => {
                let code = parsed.code.ok_or(ProxyError::Malformed)?;
                if (200..300).contains(&code) {
                    return Ok(());
                }
                return Err(ProxyError::Refused(code));
            }
            Ok(httparse::Status::Partial) if reply.len() > MAX_REPLY_SIZE => {
                return Err(ProxyError::Malformed);
            }
            Ok(httparse::Status::Partial) => continue,
            Err(_) => return Err(ProxyError::Malformed),
        }
    }
}
