//! Stream correlation for multiplexed connections.
//!
//! On a multiplexed transport many exchanges share one physical connection,
//! each identified by a stream id. The transport's read side resolves
//! responses by id, while submitting tasks register their expectation before
//! the request is written. A response for an unknown id is a protocol
//! violation by the peer: it is logged and dropped without disturbing the
//! other streams, and never tears down the shared connection.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{trace, warn};

/// A registered expectation for one stream: the signal that the request
/// write finished, paired with the promise the response will resolve.
#[derive(Debug)]
pub struct PendingStream<T> {
    /// Resolves once the request for this stream was fully written.
    pub sent: oneshot::Receiver<()>,
    /// Resolves with the response for this stream.
    pub respond: oneshot::Sender<T>,
}

/// A concurrent mapping from stream id to its pending exchange.
///
/// Written by submitting tasks, read by the connection's read loop.
pub struct StreamMap<T> {
    streams: Mutex<HashMap<u32, PendingStream<T>>>,
}

impl<T> Default for StreamMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> StreamMap<T> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Register the expectation for a stream before its request is sent.
    ///
    /// Returns the previously registered expectation for the same id, if
    /// any, which the caller should treat as abandoned.
    pub fn register(&self, id: u32, pending: PendingStream<T>) -> Option<PendingStream<T>> {
        trace!(stream.id = id, "registering stream");
        self.streams.lock().insert(id, pending)
    }

    /// Resolve the promise for a stream with its response.
    ///
    /// Returns `false` when the id is unknown (the response is logged and
    /// dropped) or when the waiting side already went away.
    pub fn complete(&self, id: u32, response: T) -> bool {
        let Some(pending) = self.streams.lock().remove(&id) else {
            warn!(stream.id = id, "response received for unknown stream");
            return false;
        };

        if pending.respond.send(response).is_err() {
            trace!(stream.id = id, "stream waiter went away");
            return false;
        }

        true
    }

    /// Drop the expectation for a stream whose caller gave up.
    pub fn abandon(&self, id: u32) -> Option<PendingStream<T>> {
        self.streams.lock().remove(&id)
    }

    /// The number of streams still awaiting a response.
    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    /// Whether no stream is awaiting a response.
    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }
}

impl<T> fmt::Debug for StreamMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMap")
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> (
        PendingStream<&'static str>,
        oneshot::Sender<()>,
        oneshot::Receiver<&'static str>,
    ) {
        let (sent_tx, sent_rx) = oneshot::channel();
        let (respond_tx, respond_rx) = oneshot::channel();
        (
            PendingStream {
                sent: sent_rx,
                respond: respond_tx,
            },
            sent_tx,
            respond_rx,
        )
    }

    #[tokio::test]
    async fn complete_resolves_the_registered_promise() {
        crate::fixtures::subscribe();

        let map = StreamMap::new();
        let (entry, _sent, respond) = pending();

        assert!(map.register(3, entry).is_none());
        assert!(map.complete(3, "response"));
        assert!(map.is_empty());

        assert_eq!(respond.await.unwrap(), "response");
    }

    #[test]
    fn unknown_stream_is_dropped_without_effect() {
        crate::fixtures::subscribe();

        let map = StreamMap::new();
        let (entry, _sent, _respond) = pending();
        map.register(1, entry);

        assert!(!map.complete(99, "stray"));
        // stream 1 is untouched
        assert_eq!(map.len(), 1);
        assert!(map.complete(1, "real"));
    }

    #[test]
    fn register_displaces_a_previous_entry() {
        let map = StreamMap::new();
        let (first, _sent_a, _respond_a) = pending();
        let (second, _sent_b, _respond_b) = pending();

        assert!(map.register(7, first).is_none());
        assert!(map.register(7, second).is_some());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn gone_waiter_reports_false() {
        let map = StreamMap::new();
        let (entry, _sent, respond) = pending();
        map.register(5, entry);
        drop(respond);

        assert!(!map.complete(5, "late"));
    }

    #[test]
    fn abandon_clears_the_expectation() {
        let map = StreamMap::new();
        let (entry, _sent, _respond) = pending();
        map.register(9, entry);

        assert!(map.abandon(9).is_some());
        assert!(map.abandon(9).is_none());
        assert!(!map.complete(9, "gone"));
    }
}
