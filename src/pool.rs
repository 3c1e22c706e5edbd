//! A generic keyed pool of idle resources, used to keep authenticated
//! connections warm between transactions.
//!
//! A resource is either idle in the pool or checked out by exactly one
//! caller; `take` moves it out, so sharing is impossible by construction.

use {
    std::{
        collections::{HashMap, VecDeque},
        hash::Hash,
        sync::{Mutex, MutexGuard},
        time::{Duration, Instant},
    },
    tracing::debug,
};

struct Idle<R> {
    resource: R,
    since: Instant,
}

struct PoolState<K, R> {
    buckets: HashMap<K, VecDeque<Idle<R>>>,
    disposed: bool,
}

pub struct ConnectionPool<K, R> {
    state: Mutex<PoolState<K, R>>,
    capacity_per_key: usize,
    idle_timeout: Duration,
}

impl<K, R> ConnectionPool<K, R>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity_per_key: usize, idle_timeout: Duration) -> ConnectionPool<K, R> {
        ConnectionPool {
            state: Mutex::new(PoolState {
                buckets: HashMap::new(),
                disposed: false,
            }),
            capacity_per_key,
            idle_timeout,
        }
    }

    fn locked(&self) -> MutexGuard<'_, PoolState<K, R>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check out the most recently returned idle resource for `key`, if any.
    /// Entries idle past the timeout are discarded along the way.
    pub fn take(&self, key: &K) -> Option<R> {
        let mut state = self.locked();
        let bucket = state.buckets.get_mut(key)?;
        // Oldest entries sit at the front; expire them first.
        while let Some(front) = bucket.front() {
            if front.since.elapsed() > self.idle_timeout {
                bucket.pop_front();
                debug!("discarded idle connection past its timeout");
            } else {
                break;
            }
        }
        let entry = bucket.pop_back();
        if bucket.is_empty() {
            state.buckets.remove(key);
        }
        entry.map(|idle| idle.resource)
    }

    /// Return a resource to the pool. If the pool is disposed or the bucket
    /// for `key` is full, the resource is handed back to the caller for
    /// graceful retirement instead.
    #[must_use]
    pub fn put(&self, key: K, resource: R) -> Option<R> {
        let mut state = self.locked();
        if state.disposed {
            return Some(resource);
        }
        let bucket = state.buckets.entry(key).or_insert_with(VecDeque::new);
        if bucket.len() >= self.capacity_per_key {
            return Some(resource);
        }
        bucket.push_back(Idle {
            resource,
            since: Instant::now(),
        });
        None
    }

    pub fn idle_count(&self, key: &K) -> usize {
        self.locked().buckets.get(key).map_or(0, VecDeque::len)
    }

    /// Drain every idle resource and refuse all future returns. The drained
    /// resources are handed to the caller to destroy.
    pub fn dispose(&self) -> Vec<R> {
        let mut state = self.locked();
        state.disposed = true;
        state
            .buckets
            .drain()
            .flat_map(|(_, bucket)| bucket.into_iter().map(|idle| idle.resource))
            .collect()
    }
}
