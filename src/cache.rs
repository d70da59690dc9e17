//! Response cache keyed by request fingerprint, with single-flight
//! coalescing.
//!
//! The LRU index lives under one mutex; the value slot of an in-flight
//! computation is a shared future, so concurrent subscribers block on the
//! future, not on the index. For a fingerprint already building, only one
//! upstream call is made and every subscriber receives the same result.
//! Failures are never cached. Expired entries are removed lazily on access
//! and by a low-rate sweeper.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::{Error, Result};

/// Default bound on concurrent subscribers per fingerprint.
pub const DEFAULT_MAX_WAITERS: usize = 64;

type SharedCompute = Shared<BoxFuture<'static, Result<Bytes>>>;

struct Entry {
    bytes: Bytes,
    expires_at: Instant,
    last_used: Instant,
}

struct InFlight {
    future: SharedCompute,
    waiters: usize,
}

struct CacheState {
    entries: HashMap<String, Entry>,
    inflight: HashMap<String, InFlight>,
    total_bytes: usize,
}

/// How a lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Served from a stored entry
    Hit,
    /// Served by subscribing to a computation already in flight
    Coalesced,
    /// This caller ran the computation
    Computed,
}

impl Lookup {
    /// Whether the upstream was spared a call for this request.
    #[must_use]
    pub fn is_hit(self) -> bool {
        matches!(self, Self::Hit | Self::Coalesced)
    }
}

/// LRU response cache with single-flight coalescing.
pub struct FingerprintCache {
    state: Mutex<CacheState>,
    max_entries: usize,
    max_bytes: usize,
    max_waiters: usize,
}

impl FingerprintCache {
    /// Create a cache bounded by entry count and total body bytes.
    #[must_use]
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                inflight: HashMap::new(),
                total_bytes: 0,
            }),
            max_entries: max_entries.max(1),
            max_bytes: max_bytes.max(1),
            max_waiters: DEFAULT_MAX_WAITERS,
        }
    }

    /// Override the per-fingerprint subscriber bound.
    #[must_use]
    pub fn with_max_waiters(mut self, max_waiters: usize) -> Self {
        self.max_waiters = max_waiters.max(1);
        self
    }

    /// Look up `fingerprint`, coalescing with any in-flight computation, or
    /// run `compute` and store a successful result for `ttl`.
    ///
    /// Returns the body and how it was obtained. Exceeding the subscriber
    /// bound for a fingerprint yields [`Error::Overloaded`] without touching
    /// the computation.
    pub async fn get_or_compute<F>(
        &self,
        fingerprint: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<(Bytes, Lookup)>
    where
        F: Future<Output = Result<Bytes>> + Send + 'static,
    {
        let role = {
            let mut state = self.state.lock();

            // Stored entry: serve it, expiring lazily.
            let now = Instant::now();
            let mut expired = false;
            if let Some(entry) = state.entries.get_mut(fingerprint) {
                if entry.expires_at > now {
                    entry.last_used = now;
                    return Ok((entry.bytes.clone(), Lookup::Hit));
                }
                expired = true;
            }
            if expired {
                if let Some(removed) = state.entries.remove(fingerprint) {
                    state.total_bytes -= removed.bytes.len();
                }
                debug!(fingerprint, "Lazily evicted expired cache entry");
            }

            // Someone is already computing: subscribe, bounded.
            if let Some(inflight) = state.inflight.get_mut(fingerprint) {
                if inflight.waiters >= self.max_waiters {
                    return Err(Error::Overloaded(format!(
                        "too many subscribers for fingerprint {fingerprint}"
                    )));
                }
                inflight.waiters += 1;
                Role::Subscriber(inflight.future.clone())
            } else {
                let shared: SharedCompute = compute.boxed().shared();
                state.inflight.insert(
                    fingerprint.to_string(),
                    InFlight {
                        future: shared.clone(),
                        waiters: 0,
                    },
                );
                Role::Leader(shared)
            }
        };

        match role {
            Role::Subscriber(shared) => {
                let result = shared.await;
                result.map(|bytes| (bytes, Lookup::Coalesced))
            }
            Role::Leader(shared) => {
                let result = shared.await;
                let mut state = self.state.lock();
                state.inflight.remove(fingerprint);
                match result {
                    Ok(bytes) => {
                        state.total_bytes += bytes.len();
                        state.entries.insert(
                            fingerprint.to_string(),
                            Entry {
                                bytes: bytes.clone(),
                                expires_at: Instant::now() + ttl,
                                last_used: Instant::now(),
                            },
                        );
                        Self::evict_lru(&mut state, self.max_entries, self.max_bytes);
                        Ok((bytes, Lookup::Computed))
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Remove least-recently-used entries until within both bounds.
    fn evict_lru(state: &mut CacheState, max_entries: usize, max_bytes: usize) {
        while state.entries.len() > max_entries || state.total_bytes > max_bytes {
            let Some(oldest) = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            if let Some(removed) = state.entries.remove(&oldest) {
                state.total_bytes -= removed.bytes.len();
                debug!(fingerprint = %oldest, "Evicted LRU cache entry");
            }
        }
    }

    /// Remove expired entries. Called by the background sweeper.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(removed) = state.entries.remove(&key) {
                state.total_bytes -= removed.bytes.len();
            }
        }
    }

    /// Live entry count (for the cache gauge).
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Total cached body bytes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.total_bytes = 0;
    }
}

enum Role {
    Leader(SharedCompute),
    Subscriber(SharedCompute),
}

/// Spawn the periodic expiry sweeper; exits when `shutdown` fires.
pub fn spawn_sweeper(
    cache: Arc<FingerprintCache>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => cache.sweep_expired(),
                _ = shutdown.recv() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cache() -> FingerprintCache {
        FingerprintCache::new(100, 1 << 20)
    }

    #[tokio::test]
    async fn computes_then_hits() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = Arc::clone(&calls);
        let (bytes, lookup) = cache
            .get_or_compute("fp", Duration::from_secs(60), async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(Bytes::from_static(b"body"))
            })
            .await
            .unwrap();
        assert_eq!(bytes, Bytes::from_static(b"body"));
        assert_eq!(lookup, Lookup::Computed);

        let (bytes, lookup) = cache
            .get_or_compute("fp", Duration::from_secs(60), async {
                panic!("must not recompute")
            })
            .await
            .unwrap();
        assert_eq!(bytes, Bytes::from_static(b"body"));
        assert_eq!(lookup, Lookup::Hit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_coalesce_to_one_computation() {
        let cache = Arc::new(cache());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("fp", Duration::from_secs(60), async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Bytes::from_static(b"shared"))
                    })
                    .await
            }));
        }

        let mut hits = 0;
        for handle in handles {
            let (bytes, lookup) = handle.await.unwrap().unwrap();
            assert_eq!(bytes, Bytes::from_static(b"shared"));
            if lookup.is_hit() {
                hits += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hits, 49);
    }

    #[tokio::test]
    async fn failures_are_shared_but_not_cached() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = Arc::clone(&calls);
        let err = cache
            .get_or_compute("fp", Duration::from_secs(60), async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Err(Error::Upstream("boom".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));

        // The failure was not cached; a new request recomputes
        let calls_clone = Arc::clone(&calls);
        let (bytes, _) = cache
            .get_or_compute("fp", Duration::from_secs(60), async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(Bytes::from_static(b"ok"))
            })
            .await
            .unwrap();
        assert_eq!(bytes, Bytes::from_static(b"ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_entries_are_recomputed() {
        let cache = cache();
        cache
            .get_or_compute("fp", Duration::from_millis(10), async {
                Ok(Bytes::from_static(b"v1"))
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;

        let (bytes, lookup) = cache
            .get_or_compute("fp", Duration::from_secs(60), async {
                Ok(Bytes::from_static(b"v2"))
            })
            .await
            .unwrap();
        assert_eq!(bytes, Bytes::from_static(b"v2"));
        assert_eq!(lookup, Lookup::Computed);
    }

    #[tokio::test]
    async fn lru_eviction_respects_entry_bound() {
        let cache = FingerprintCache::new(2, 1 << 20);
        for key in ["a", "b"] {
            cache
                .get_or_compute(key, Duration::from_secs(60), async {
                    Ok(Bytes::from_static(b"x"))
                })
                .await
                .unwrap();
        }
        // Touch "a" so "b" is the least recently used
        cache
            .get_or_compute("a", Duration::from_secs(60), async {
                panic!("cached")
            })
            .await
            .unwrap();
        cache
            .get_or_compute("c", Duration::from_secs(60), async {
                Ok(Bytes::from_static(b"x"))
            })
            .await
            .unwrap();

        assert_eq!(cache.len(), 2);
        // "b" was evicted; recomputing it proves the miss
        let (_, lookup) = cache
            .get_or_compute("b", Duration::from_secs(60), async {
                Ok(Bytes::from_static(b"x"))
            })
            .await
            .unwrap();
        assert_eq!(lookup, Lookup::Computed);
    }

    #[tokio::test]
    async fn byte_bound_evicts_oldest() {
        let cache = FingerprintCache::new(100, 8);
        cache
            .get_or_compute("a", Duration::from_secs(60), async {
                Ok(Bytes::from_static(b"12345"))
            })
            .await
            .unwrap();
        cache
            .get_or_compute("b", Duration::from_secs(60), async {
                Ok(Bytes::from_static(b"67890"))
            })
            .await
            .unwrap();

        assert!(cache.total_bytes() <= 8);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn waiter_bound_yields_overloaded() {
        let cache = Arc::new(FingerprintCache::new(10, 1 << 20).with_max_waiters(1));

        let leader_cache = Arc::clone(&cache);
        let leader = tokio::spawn(async move {
            leader_cache
                .get_or_compute("fp", Duration::from_secs(60), async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(Bytes::from_static(b"slow"))
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // First subscriber fits the bound
        let sub_cache = Arc::clone(&cache);
        let subscriber = tokio::spawn(async move {
            sub_cache
                .get_or_compute("fp", Duration::from_secs(60), async {
                    panic!("coalesced")
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Second subscriber exceeds it
        let err = cache
            .get_or_compute("fp", Duration::from_secs(60), async { panic!("bounded") })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Overloaded(_)));

        leader.await.unwrap().unwrap();
        subscriber.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn sweeper_removes_expired_entries() {
        let cache = cache();
        cache
            .get_or_compute("fp", Duration::from_millis(5), async {
                Ok(Bytes::from_static(b"x"))
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.sweep_expired();
        assert!(cache.is_empty());
    }
}
