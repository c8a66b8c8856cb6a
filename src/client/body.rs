//! Bridging between the transport event loop and blocking body readers.
//!
//! The transport driver pushes response chunks from runtime tasks, while the
//! caller pulls them through a plain [`std::io::Read`]. The two sides meet in
//! a chunk queue guarded by a mutex and a condition variable: publishing
//! never blocks the event loop, reading blocks the caller until a chunk
//! arrives or the stream ends.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use parking_lot::{Condvar, Mutex};

use super::Error;

/// Create a linked producer/consumer pair for one exchange's response body.
pub(crate) fn channel() -> (BodySink, BodyReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            ended: false,
            cause: None,
        }),
        available: Condvar::new(),
    });

    (
        BodySink {
            shared: shared.clone(),
        },
        BodyReader {
            shared,
            current: None,
        },
    )
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
}

struct State {
    queue: VecDeque<Bytes>,
    ended: bool,
    cause: Option<Error>,
}

impl State {
    /// End the stream, dropping queued chunks when the end is abnormal, and
    /// recording the first cause only.
    fn end(&mut self, cause: Option<Error>) {
        if !self.ended {
            self.cause = cause;
            if self.cause.is_some() {
                self.queue.clear();
            }
            self.ended = true;
        }
    }
}

/// The producer half: owned by the exchange driver, fed from transport tasks.
pub(crate) struct BodySink {
    shared: Arc<Shared>,
}

impl BodySink {
    /// Append a chunk to the queue and wake a blocked reader.
    ///
    /// Empty chunks, and chunks arriving after the stream ended, are
    /// discarded.
    pub(crate) fn publish(&self, chunk: Bytes) {
        let mut state = self.shared.state.lock();
        if state.ended || chunk.is_empty() {
            return;
        }

        state.queue.push_back(chunk);
        drop(state);
        self.shared.available.notify_all();
    }

    /// Mark the end of the stream.
    ///
    /// With a cause, all queued chunks are dropped and the next read raises
    /// the cause; without one, queued chunks drain normally and reads then
    /// report end of stream. Either way a blocked reader is woken.
    pub(crate) fn complete(&self, cause: Option<Error>) {
        let mut state = self.shared.state.lock();
        state.end(cause);
        drop(state);
        self.shared.available.notify_all();
    }
}

impl Drop for BodySink {
    fn drop(&mut self) {
        // A sink dropped without completing means the exchange went away;
        // readers must not be left blocked forever.
        self.complete(Some(Error::Canceled));
    }
}

impl std::fmt::Debug for BodySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BodySink")
            .field("queued", &state.queue.len())
            .field("ended", &state.ended)
            .finish()
    }
}

/// The consumer half: a blocking byte stream over the published chunks.
pub(crate) struct BodyReader {
    shared: Arc<Shared>,
    current: Option<Bytes>,
}

impl BodyReader {
    /// Block until a chunk is available, or the stream has ended.
    fn next_chunk(&self) -> io::Result<Option<Bytes>> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(chunk) = state.queue.pop_front() {
                return Ok(Some(chunk));
            }

            if state.ended {
                return match &state.cause {
                    None => Ok(None),
                    Some(cause) => Err(io::Error::other(cause.clone())),
                };
            }

            self.shared.available.wait(&mut state);
        }
    }

    /// Drop the chunk being drained and force abnormal completion.
    ///
    /// Idempotent; subsequent reads report the stream as closed.
    pub(crate) fn close(&mut self) {
        self.current = None;
        let mut state = self.shared.state.lock();
        state.end(Some(Error::Canceled));
        drop(state);
        self.shared.available.notify_all();
    }
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if let Some(chunk) = self.current.as_mut() {
                let len = chunk.len().min(buf.len());
                chunk.copy_to_slice(&mut buf[..len]);
                if chunk.is_empty() {
                    self.current = None;
                }
                return Ok(len);
            }

            match self.next_chunk()? {
                Some(chunk) => self.current = Some(chunk),
                None => return Ok(0),
            }
        }
    }
}

impl std::fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyReader")
            .field("buffered", &self.current.as_ref().map(Bytes::len))
            .finish()
    }
}
