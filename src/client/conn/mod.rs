//! Connections and the destination identity they are keyed by.
//!
//! A [`Connection`] is an established transport channel (plain TCP or TLS)
//! with the HTTP codec attached. It is owned exclusively by at most one
//! in-flight exchange; afterwards it is either returned to the pool bucket
//! for its [`PoolKey`] or dropped, which closes the socket.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use http::Uri;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::Error;
use super::codec::Http1Codec;

pub mod h2;
pub(crate) mod transport;

/// URI scheme accepted by the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub(crate) fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Where a request should connect to: scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Target {
    pub(crate) scheme: Scheme,
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl Target {
    /// Derive the connection target from a request URI.
    ///
    /// Fails when the URI has no host, or a scheme other than `http` and
    /// `https`.
    pub(crate) fn from_uri(uri: &Uri) -> Result<Self, Error> {
        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            Some(other) => {
                return Err(Error::Protocol(format!("unsupported scheme {other:?}")));
            }
            None => return Err(Error::Protocol("request URI has no scheme".into())),
        };

        let host = uri
            .host()
            .ok_or_else(|| Error::Protocol("request URI has no host".into()))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();

        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());

        Ok(Self { scheme, host, port })
    }

    pub(crate) fn is_secure(&self) -> bool {
        self.scheme == Scheme::Https
    }

    pub(crate) fn key(&self) -> PoolKey {
        PoolKey {
            scheme: self.scheme,
            host: self.host.clone(),
            port: self.port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// Identity of a pool bucket: requests with the same key may share idle
/// connections.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// Dispatching wrapper over the stream types a transport stack can produce.
#[pin_project(project = ClientStreamProjected)]
pub(crate) enum ClientStream {
    /// Plaintext TCP.
    Plain(#[pin] TcpStream),
    /// TLS over TCP.
    Tls(#[pin] Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientStream::Plain(_) => f.debug_struct("ClientStream::Plain").finish(),
            ClientStream::Tls(_) => f.debug_struct("ClientStream::Tls").finish(),
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProjected::Plain(stream) => stream.poll_read(cx, buf),
            ClientStreamProjected::Tls(stream) => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProjected::Plain(stream) => stream.poll_write(cx, buf),
            ClientStreamProjected::Tls(stream) => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProjected::Plain(stream) => stream.poll_flush(cx),
            ClientStreamProjected::Tls(stream) => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProjected::Plain(stream) => stream.poll_shutdown(cx),
            ClientStreamProjected::Tls(stream) => stream.poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProjected::Plain(stream) => stream.poll_write_vectored(cx, bufs),
            ClientStreamProjected::Tls(stream) => stream.poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            ClientStream::Plain(stream) => stream.is_write_vectored(),
            ClientStream::Tls(stream) => stream.is_write_vectored(),
        }
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// An established transport channel with its codec attached.
pub(crate) struct Connection {
    framed: Framed<ClientStream, Http1Codec>,
    key: PoolKey,
    id: u64,
}

impl Connection {
    pub(crate) fn new(stream: ClientStream, key: PoolKey) -> Self {
        Self {
            framed: Framed::new(stream, Http1Codec::new()),
            key,
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Take the connection apart so one exchange can drive the read and
    /// write halves independently.
    pub(crate) fn into_parts(self) -> (Framed<ClientStream, Http1Codec>, PoolKey, u64) {
        (self.framed, self.key, self.id)
    }

    /// Reassemble a connection after an exchange finished with it.
    pub(crate) fn from_parts(
        framed: Framed<ClientStream, Http1Codec>,
        key: PoolKey,
        id: u64,
    ) -> Self {
        Self { framed, key, id }
    }

    /// Whether bytes are already buffered on the read side.
    ///
    /// A clean connection has nothing buffered between exchanges; anything
    /// left over means the peer spoke out of turn and the connection is not
    /// safe to reuse.
    pub(crate) fn has_buffered_input(&self) -> bool {
        !self.framed.read_buffer().is_empty()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_from_uri_defaults_ports() {
        let uri: Uri = "http://example.com/path".parse().unwrap();
        let target = Target::from_uri(&uri).unwrap();
        assert_eq!(target.port, 80);
        assert!(!target.is_secure());

        let uri: Uri = "https://example.com/".parse().unwrap();
        let target = Target::from_uri(&uri).unwrap();
        assert_eq!(target.port, 443);
        assert!(target.is_secure());

        let uri: Uri = "http://example.com:8080/".parse().unwrap();
        let target = Target::from_uri(&uri).unwrap();
        assert_eq!(target.port, 8080);
    }

    #[test]
    fn target_requires_supported_scheme() {
        let uri: Uri = "ftp://example.com/".parse().unwrap();
        assert!(matches!(Target::from_uri(&uri), Err(Error::Protocol(_))));

        let uri: Uri = "/relative/path".parse().unwrap();
        assert!(matches!(Target::from_uri(&uri), Err(Error::Protocol(_))));
    }

    #[test]
    fn keys_distinguish_destinations() {
        let one = Target::from_uri(&"http://a.example.com/x".parse().unwrap())
            .unwrap()
            .key();
        let two = Target::from_uri(&"http://a.example.com/y".parse().unwrap())
            .unwrap()
            .key();
        let other = Target::from_uri(&"https://a.example.com/x".parse().unwrap())
            .unwrap()
            .key();

        assert_eq!(one, two);
        assert_ne!(one, other);
    }
}
