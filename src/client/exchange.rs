//! Exchange execution: one request, one connection, two signals.
//!
//! An exchange acquires a pooled connection (or connects through the
//! transport stack), writes the request head, streams the entity from the
//! blocking pool, and drives the response back through the body bridge. It
//! resolves two independent signals:
//!
//! - **availability** carries the response object as soon as the status and
//!   headers are decoded;
//! - **completion** resolves once the exchange is fully done: the entity was
//!   written, the response end was observed, and the connection was handed
//!   back.
//!
//! Completion failing forces availability to fail if it is still pending, so
//! every caller observes exactly one outcome. The connection returns to the
//! pool only after a clean completion on a reusable channel; every failure
//! path closes it instead.

use std::io::{self, Read as _};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use http::{HeaderMap, HeaderValue, Method, Uri, header};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument as _, debug, trace};
use tower::ServiceExt as _;

use super::body::{self, BodySink};
use super::codec::{RequestBodyKind, RequestFrame, RequestHead, ResponseFrame};
use super::conn::{Connection, Target, transport};
use super::request::{Entity, Request};
use super::response::Response;
use super::{Error, Shared};

const ENTITY_CHUNK_SIZE: usize = 8 * 1024;
const ENTITY_CHANNEL_DEPTH: usize = 4;

/// Resolver side of the availability/completion signal pair.
///
/// Each sender fires at most once; [`ExchangeHandle::fail`] resolves both
/// exceptionally, skipping any signal that already fired.
#[derive(Clone)]
pub(crate) struct ExchangeHandle {
    state: Arc<Mutex<SignalState>>,
}

struct SignalState {
    availability: Option<oneshot::Sender<Result<Response, Error>>>,
    completion: Option<oneshot::Sender<Result<(), Error>>>,
}

impl ExchangeHandle {
    #[allow(clippy::type_complexity)]
    pub(crate) fn new() -> (
        Self,
        oneshot::Receiver<Result<Response, Error>>,
        oneshot::Receiver<Result<(), Error>>,
    ) {
        let (availability_tx, availability_rx) = oneshot::channel();
        let (completion_tx, completion_rx) = oneshot::channel();

        (
            Self {
                state: Arc::new(Mutex::new(SignalState {
                    availability: Some(availability_tx),
                    completion: Some(completion_tx),
                })),
            },
            availability_rx,
            completion_rx,
        )
    }

    /// Resolve availability with the response, unless already resolved.
    pub(crate) fn available(&self, response: Response) {
        if let Some(tx) = self.state.lock().availability.take() {
            let _ = tx.send(Ok(response));
        }
    }

    /// Resolve completion normally.
    pub(crate) fn complete(&self) {
        if let Some(tx) = self.state.lock().completion.take() {
            let _ = tx.send(Ok(()));
        }
    }

    /// Resolve completion exceptionally, forcing availability along with it
    /// when the response never became available.
    pub(crate) fn fail(&self, error: Error) {
        let mut state = self.state.lock();
        if let Some(tx) = state.completion.take() {
            let _ = tx.send(Err(error.clone()));
        }
        if let Some(tx) = state.availability.take() {
            let _ = tx.send(Err(error));
        }
    }
}

impl std::fmt::Debug for ExchangeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ExchangeHandle")
            .field("availability_pending", &state.availability.is_some())
            .field("completion_pending", &state.completion.is_some())
            .finish()
    }
}

/// Execute one exchange to completion, resolving the signals exactly once.
pub(crate) async fn run(shared: Arc<Shared>, request: Request, signals: ExchangeHandle) {
    let span = tracing::debug_span!("exchange", method = %request.method(), uri = %request.uri());

    let mut driver = Driver {
        shared,
        signals,
        body: None,
    };

    async {
        if let Err(error) = driver.drive(request).await {
            debug!(error = %error, "exchange failed");
            if let Some(body) = driver.body.take() {
                body.complete(Some(error.clone()));
            }
            driver.signals.fail(error);
        }
    }
    .instrument(span)
    .await
}

struct Driver {
    shared: Arc<Shared>,
    signals: ExchangeHandle,
    body: Option<BodySink>,
}

impl Driver {
    async fn drive(&mut self, request: Request) -> Result<(), Error> {
        let (method, uri, headers, entity) = request.into_parts();
        let target = Target::from_uri(&uri)?;
        let key = target.key();

        // Pool hit skips connecting entirely.
        let connection = match self.shared.pool.acquire(&key) {
            Some(connection) => connection,
            None => {
                debug!(target = %target, "connecting");
                let transport = transport::build(
                    self.shared.config.connect_timeout,
                    self.shared.config.proxy.as_ref(),
                    target.is_secure().then(|| self.shared.tls_config()),
                );
                let stream = transport.oneshot(target.clone()).await?;
                Connection::new(stream, key.clone())
            }
        };

        let head = request_head(method, &uri, headers, &target, &entity)?;

        let (framed, key, id) = connection.into_parts();
        let (mut sink, mut stream) = framed.split();

        trace!(id, "sending request head");
        sink.send(RequestFrame::Head(head))
            .await
            .map_err(transport_error)?;

        // Entity production must not occupy an event-loop thread: a caller's
        // reader may block, so it runs on the blocking pool and feeds the
        // driver through a bounded channel.
        let mut entity_rx = match entity {
            Entity::Empty => None,
            Entity::Full(bytes) => {
                if !bytes.is_empty() {
                    sink.send(RequestFrame::Data(bytes))
                        .await
                        .map_err(transport_error)?;
                }
                sink.send(RequestFrame::End).await.map_err(transport_error)?;
                trace!("entity fully written");
                None
            }
            Entity::Streaming { reader, .. } => Some(spawn_entity_writer(reader)),
        };

        let mut response_ended = false;
        let mut reuse = false;

        loop {
            tokio::select! {
                chunk = recv_chunk(&mut entity_rx), if entity_rx.is_some() => {
                    match chunk {
                        Some(Ok(data)) => {
                            sink.send(RequestFrame::Data(data)).await.map_err(transport_error)?;
                        }
                        Some(Err(error)) => return Err(Error::BodyWrite(Arc::new(error))),
                        None => {
                            sink.send(RequestFrame::End).await.map_err(transport_error)?;
                            trace!("entity fully written");
                            entity_rx = None;
                            if response_ended {
                                break;
                            }
                        }
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(ResponseFrame::Head(head))) => {
                            trace!(status = %head.status, "response head received");
                            let (body, reader) = body::channel();
                            self.body = Some(body);
                            self.signals.available(Response::new(head, reader));
                        }
                        Some(Ok(ResponseFrame::Data(data))) => {
                            if let Some(body) = &self.body {
                                body.publish(data);
                            }
                        }
                        Some(Ok(ResponseFrame::End { reuse: keep })) => {
                            trace!(reuse = keep, "response fully received");
                            reuse = keep;
                            response_ended = true;
                            if entity_rx.is_none() {
                                break;
                            }
                        }
                        Some(Err(error)) => return Err(transport_error(error)),
                        None => {
                            return Err(transport_error(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed during exchange",
                            )));
                        }
                    }
                }
            }
        }

        // Clean completion: end the body bridge and settle the connection
        // before resolving completion, so a caller resumed by the signal
        // already finds the connection back in the pool.
        if let Some(body) = self.body.take() {
            body.complete(None);
        }

        let framed = sink
            .reunite(stream)
            .expect("reunited halves come from the same split");
        let connection = Connection::from_parts(framed, key, id);

        if reuse && !connection.has_buffered_input() {
            let key = connection.key().clone();
            self.shared.pool.release(&key, connection);
        } else {
            self.shared.pool.discard(connection);
        }

        self.signals.complete();

        Ok(())
    }
}

/// Build the wire-level head: explicit Host, entity framing headers, and the
/// origin-form request target.
fn request_head(
    method: Method,
    uri: &Uri,
    mut headers: HeaderMap,
    target: &Target,
    entity: &Entity,
) -> Result<RequestHead, Error> {
    let body = match entity {
        Entity::Empty => RequestBodyKind::None,
        Entity::Full(bytes) => RequestBodyKind::Sized(bytes.len() as u64),
        Entity::Streaming {
            length: Some(length),
            ..
        } => RequestBodyKind::Sized(*length),
        Entity::Streaming { length: None, .. } => RequestBodyKind::Chunked,
    };

    if !headers.contains_key(header::HOST) {
        let host = if target.port == target.scheme.default_port() {
            target.host.clone()
        } else {
            format!("{}:{}", target.host, target.port)
        };
        let host = HeaderValue::try_from(host)
            .map_err(|_| Error::Protocol("request host is not a valid header value".into()))?;
        headers.insert(header::HOST, host);
    }

    match body {
        RequestBodyKind::Sized(length) => {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        }
        RequestBodyKind::Chunked => {
            headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }
        RequestBodyKind::None => {}
    }

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    Ok(RequestHead {
        method,
        target: path,
        headers,
        body,
    })
}

/// Pull the caller's reader on the blocking pool, handing chunks to the
/// driver over a bounded channel so a slow connection back-pressures the
/// producer instead of buffering the entity.
fn spawn_entity_writer(
    reader: Box<dyn io::Read + Send + 'static>,
) -> mpsc::Receiver<io::Result<Bytes>> {
    let (tx, rx) = mpsc::channel(ENTITY_CHANNEL_DEPTH);

    tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let mut buf = vec![0u8; ENTITY_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        // exchange went away
                        break;
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    let _ = tx.blocking_send(Err(error));
                    break;
                }
            }
        }
    });

    rx
}

async fn recv_chunk(
    rx: &mut Option<mpsc::Receiver<io::Result<Bytes>>>,
) -> Option<io::Result<Bytes>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn transport_error(error: io::Error) -> Error {
    Error::Transport(Arc::new(error))
}
