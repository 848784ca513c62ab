//! Single-flight keyed cache shared by the build workers.
//!
//! Two instances exist per build: repository handles keyed by normalized URL,
//! and chart builds keyed by `(url, name, version)`. All mutations go through
//! the `get_or_lock` / `set_unlock` pair so that concurrent consumers of the
//! same key trigger at most one producer while the rest block on the result.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Condvar, Mutex};
use thiserror::Error;

/// Terminal state of an abandoned producer, observed by every blocked reader.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheFailure {
    #[error("producer failed: {0}")]
    Failed(String),
    #[error("producer canceled")]
    Canceled,
}

#[derive(Debug, PartialEq, Error)]
pub enum CacheError {
    #[error("value already committed for key")]
    AlreadyCommitted,
    #[error(transparent)]
    Producer(#[from] CacheFailure),
}

/// Result of [`SyncCache::get_or_lock`].
#[derive(Debug)]
pub enum Fetched<V> {
    /// A committed value was found.
    Hit(V),
    /// No value and no producer: the caller is now the producer for the key
    /// and must call [`SyncCache::set_unlock`] or [`SyncCache::unlock_fail`].
    MustProduce,
}

enum Slot<V> {
    InFlight,
    Ready(V),
    Failed(CacheFailure),
}

pub struct SyncCache<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
    readers: Condvar,
}

impl<K, V> Default for SyncCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SyncCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            readers: Condvar::new(),
        }
    }

    /// Non-blocking lookup of a committed value.
    pub fn get(&self, key: &K) -> Option<V> {
        let slots = self.slots.lock().expect("poisoned cache lock");
        match slots.get(key) {
            Some(Slot::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Inserts a committed value; fails if the key already has one.
    pub fn set(&self, key: K, value: V) -> Result<(), CacheError> {
        let mut slots = self.slots.lock().expect("poisoned cache lock");
        if let Some(Slot::Ready(_)) = slots.get(&key) {
            return Err(CacheError::AlreadyCommitted);
        }
        slots.insert(key, Slot::Ready(value));
        self.readers.notify_all();
        Ok(())
    }

    /// Returns the committed value for `key`, or registers the caller as the
    /// producer when there is none. While another producer is in flight the
    /// call blocks until that producer publishes with [`Self::set_unlock`]
    /// (the exact published value is returned) or abandons the key with
    /// [`Self::unlock_fail`] (its failure is returned, no retry is attempted).
    pub fn get_or_lock(&self, key: &K) -> Result<Fetched<V>, CacheError> {
        let mut slots = self.slots.lock().expect("poisoned cache lock");
        loop {
            match slots.get(key) {
                None => {
                    slots.insert(key.clone(), Slot::InFlight);
                    return Ok(Fetched::MustProduce);
                }
                Some(Slot::Ready(value)) => return Ok(Fetched::Hit(value.clone())),
                Some(Slot::Failed(failure)) => return Err(failure.clone().into()),
                Some(Slot::InFlight) => {
                    slots = self.readers.wait(slots).expect("poisoned cache lock");
                }
            }
        }
    }

    /// Publishes the value produced for `key` and wakes all blocked readers.
    pub fn set_unlock(&self, key: K, value: V) {
        let mut slots = self.slots.lock().expect("poisoned cache lock");
        slots.insert(key, Slot::Ready(value));
        self.readers.notify_all();
    }

    /// Releases an in-flight key without publishing. Every blocked reader and
    /// any later consumer observes `failure`.
    pub fn unlock_fail(&self, key: K, failure: CacheFailure) {
        let mut slots = self.slots.lock().expect("poisoned cache lock");
        slots.insert(key, Slot::Failed(failure));
        self.readers.notify_all();
    }
}
