//! Connection pooling for clients.
//!
//! Idle connections are cached per destination so that consecutive
//! exchanges to the same host reuse an established channel instead of
//! connecting again. Buckets behave as stacks: the most recently released
//! connection is handed out first.
//!
//! The pool is a fixed set of shards, each an independently locked map of
//! buckets, with the shard picked by the key's hash. Creating a new bucket
//! and mutating an existing one therefore contend only with destinations
//! that land on the same shard, never globally.

use std::collections::HashMap;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::BuildHasher;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use super::conn::{Connection, PoolKey};

const SHARD_COUNT: usize = 8;

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// The maximum idle duration of a connection.
    pub idle_timeout: Option<Duration>,

    /// The maximum number of idle connections per host.
    pub max_idle_per_host: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(90)),
            max_idle_per_host: 32,
        }
    }
}

struct Idle {
    connection: Connection,
    since: Instant,
}

type Shard = Mutex<HashMap<PoolKey, Vec<Idle>>>;

/// A pool of idle connections to remote hosts.
pub(crate) struct Pool {
    shards: Box<[Shard]>,
    hasher: RandomState,
    config: Config,
}

impl Pool {
    pub(crate) fn new(config: Config) -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            hasher: RandomState::new(),
            config,
        }
    }

    fn shard(&self, key: &PoolKey) -> &Shard {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Remove and return an idle connection for the key, newest first.
    ///
    /// Connections past the idle timeout are dropped on the way out.
    pub(crate) fn acquire(&self, key: &PoolKey) -> Option<Connection> {
        let mut shard = self.shard(key).lock();

        let connection = {
            let bucket = shard.get_mut(key)?;
            loop {
                let Some(idle) = bucket.pop() else { break None };

                if let Some(timeout) = self.config.idle_timeout {
                    if idle.since.elapsed() > timeout {
                        trace!(id = idle.connection.id(), "dropping expired idle connection");
                        continue;
                    }
                }

                break Some(idle.connection);
            }
        };

        if shard.get(key).is_some_and(|bucket| bucket.is_empty()) {
            shard.remove(key);
        }

        if let Some(connection) = &connection {
            trace!(id = connection.id(), key = ?key, "connection found in pool");
        }

        connection
    }

    /// Return a connection to its bucket after a clean exchange.
    ///
    /// A full bucket drops the connection instead.
    pub(crate) fn release(&self, key: &PoolKey, connection: Connection) {
        let mut shard = self.shard(key).lock();
        let bucket = shard.entry(key.clone()).or_default();

        if bucket.len() >= self.config.max_idle_per_host {
            trace!(id = connection.id(), "bucket full, dropping connection");
            return;
        }

        trace!(id = connection.id(), key = ?key, "connection returned to pool");
        bucket.push(Idle {
            connection,
            since: Instant::now(),
        });
    }

    /// Close a connection and never return it to the pool.
    pub(crate) fn discard(&self, connection: Connection) {
        trace!(id = connection.id(), "discarding connection");
        drop(connection);
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("config", &self.config).finish()
    }
}
