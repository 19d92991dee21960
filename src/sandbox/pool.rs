//! Pooled connections to the Docker control API.
//!
//! A harness that drives many sandboxes concurrently can exhaust file
//! descriptors if every backend opens a fresh client per run. The pool caps
//! open clients at one per execution context. It is an ordinary value:
//! construct it once at process start, share it via `Arc`, and pass it into
//! every backend.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bollard::Docker;
use tracing::{debug, warn};

/// Caller-supplied identity for pool bookkeeping (worker id, task id).
///
/// Supplied explicitly rather than derived from ambient thread identity so
/// the pool behaves the same under thread-based and task-based runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextToken(u64);

impl ContextToken {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client reuse policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolMode {
    /// One client per context token, reused across runs.
    #[default]
    Reuse,
    /// Every acquisition registers a fresh client under a fresh key, so a
    /// client is never handed out twice. This keeps the pre-pool behavior
    /// reachable; note that `release` never finds these clients.
    NoReuse,
}

/// Bounded cache of Docker clients, keyed by execution context.
#[derive(Debug)]
pub struct DockerClientPool {
    clients: Mutex<HashMap<u64, Docker>>,
    mode: PoolMode,
    counter: AtomicU64,
}

impl DockerClientPool {
    pub fn new(mode: PoolMode) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            mode,
            counter: AtomicU64::new(0),
        }
    }

    fn key_for(&self, token: ContextToken) -> u64 {
        match self.mode {
            PoolMode::Reuse => token.id(),
            PoolMode::NoReuse => self.counter.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Returns the context's registered client, connecting if necessary.
    ///
    /// Connection setup happens outside the map lock; only the O(1)
    /// bookkeeping runs under it. When two acquisitions race for the same
    /// key, the client already in the map wins and the loser's connection
    /// is dropped, so there is never more than one live client per key.
    pub fn acquire(&self, token: ContextToken) -> Result<Docker, bollard::errors::Error> {
        let key = self.key_for(token);
        if let Some(client) = self.lock().get(&key) {
            debug!(key, "returning pooled docker client");
            return Ok(client.clone());
        }

        debug!(key, "creating new docker client");
        let client = Docker::connect_with_local_defaults()?;
        Ok(self.lock().entry(key).or_insert(client).clone())
    }

    /// Drops the context's client, closing its connections once every
    /// outstanding clone is gone.
    ///
    /// Returns `false` (and logs a warning) when nothing was registered for
    /// the context; callers treat that as non-fatal.
    pub fn release(&self, token: ContextToken) -> bool {
        let key = self.key_for(token);
        let removed = self.lock().remove(&key).is_some();
        if removed {
            debug!(key, "released docker client");
        } else {
            warn!(key, "release called for a context with no registered client");
        }
        removed
    }

    /// Number of currently registered clients.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Docker>> {
        self.clients.lock().expect("client pool mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_without_acquire_is_non_fatal() {
        let pool = DockerClientPool::new(PoolMode::Reuse);
        assert!(!pool.release(ContextToken::new(7)));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_no_reuse_mode_burns_a_fresh_key_per_call() {
        let pool = DockerClientPool::new(PoolMode::NoReuse);
        let token = ContextToken::new(1);
        assert_eq!(pool.key_for(token), 0);
        assert_eq!(pool.key_for(token), 1);
        // Releases consume keys too, so they never match an acquisition.
        assert!(!pool.release(token));
    }

    #[test]
    fn test_reuse_mode_keys_on_the_token() {
        let pool = DockerClientPool::new(PoolMode::Reuse);
        assert_eq!(pool.key_for(ContextToken::new(42)), 42);
        assert_eq!(pool.key_for(ContextToken::new(42)), 42);
    }
}
