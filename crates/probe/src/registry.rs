//! Process-wide cache of one connection handle per target identifier.
//!
//! Initialization is serialized per identifier only: concurrent first
//! probes of one target wait for a single open, while unrelated targets
//! open in parallel. A failed open is remembered for a short backoff
//! window so an unreachable database is not re-dialed on every scrape.
//!
//! The registry is generic over the handle type; the executor stores
//! `sqlx::PgPool`, tests store counters.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;

const DEFAULT_OPEN_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AcquireError<E> {
    #[error("open failed: {0}")]
    Open(#[source] E),
    #[error("open failed recently, next attempt in {retry_in:?}")]
    Backoff { retry_in: Duration },
}

#[derive(Debug)]
pub struct ConnectionRegistry<H> {
    entries: RwLock<HashMap<String, Arc<Entry<H>>>>,
    backoff: Duration,
}

#[derive(Debug)]
struct Entry<H> {
    state: tokio::sync::Mutex<EntryState<H>>,
}

#[derive(Debug)]
enum EntryState<H> {
    Empty { last_failure: Option<Instant> },
    Ready(H),
}

impl<H> Default for Entry<H> {
    fn default() -> Self {
        Entry {
            state: tokio::sync::Mutex::new(EntryState::Empty { last_failure: None }),
        }
    }
}

impl<H: Clone> Default for ConnectionRegistry<H> {
    fn default() -> Self {
        ConnectionRegistry::new()
    }
}

impl<H: Clone> ConnectionRegistry<H> {
    pub fn new() -> Self {
        ConnectionRegistry::with_backoff(DEFAULT_OPEN_BACKOFF)
    }

    pub fn with_backoff(backoff: Duration) -> Self {
        ConnectionRegistry {
            entries: RwLock::new(HashMap::new()),
            backoff,
        }
    }

    /// Return the cached handle for `key`, or run `open` to create it.
    ///
    /// Exactly one caller runs `open` under concurrent first access; the
    /// rest wait on the per-key lock and observe its result. An `Err`
    /// is never cached as a handle, but re-attempts inside the backoff
    /// window fail fast without re-opening.
    pub async fn acquire<F, Fut, E>(&self, key: &str, open: F) -> Result<H, AcquireError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<H, E>>,
    {
        let entry = self.entry(key);
        let mut state = entry.state.lock().await;

        match &*state {
            EntryState::Ready(handle) => Ok(handle.clone()),
            EntryState::Empty { last_failure } => {
                if let Some(failed_at) = last_failure {
                    let since = failed_at.elapsed();
                    if since < self.backoff {
                        return Err(AcquireError::Backoff {
                            retry_in: self.backoff - since,
                        });
                    }
                }
                match open().await {
                    Ok(handle) => {
                        *state = EntryState::Ready(handle.clone());
                        Ok(handle)
                    }
                    Err(err) => {
                        *state = EntryState::Empty {
                            last_failure: Some(Instant::now()),
                        };
                        Err(AcquireError::Open(err))
                    }
                }
            }
        }
    }

    /// Get or insert the per-key entry. Holds the map lock only long
    /// enough to clone the `Arc`; opens never run under it.
    fn entry(&self, key: &str) -> Arc<Entry<H>> {
        if let Some(entry) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(entry);
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(key.to_string()).or_default())
    }
}
