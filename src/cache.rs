//! Decision memoization with TTL and single-flight builds.
//!
//! Keyed by `request_id`. The first caller for a key installs a build slot
//! and produces the decision; concurrent callers for the same key await
//! that build instead of re-running verifiers. A hit returns the identical
//! decision previously stored; re-verification is never the observable
//! side effect of a hit.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::debug;

use crate::decision::Decision;

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups answered from a stored decision
    pub hits: u64,
    /// Lookups that started a build
    pub misses: u64,
    /// Lookups that awaited another caller's build
    pub coalesced: u64,
    /// Entries removed by TTL or capacity eviction
    pub evicted: u64,
    /// Stored decisions currently held
    pub entry_count: u64,
}

impl CacheStats {
    /// Hit rate over answered lookups.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

enum Slot {
    Ready {
        decision: Arc<Decision>,
        stored_at: DateTime<Utc>,
    },
    Building {
        rx: watch::Receiver<Option<Arc<Decision>>>,
    },
}

struct CacheInner {
    slots: Mutex<HashMap<String, Slot>>,
    stats: Mutex<CacheStats>,
    ttl: Duration,
    max_entries: usize,
}

impl CacheInner {
    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, CacheStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready_count(slots: &HashMap<String, Slot>) -> usize {
        slots
            .values()
            .filter(|s| matches!(s, Slot::Ready { .. }))
            .count()
    }
}

/// Outcome of a cache lookup.
pub enum Lookup {
    /// Stored decision is fresh; return it as-is
    Hit(Arc<Decision>),
    /// Caller owns the build. `None` when the cache is disabled, in which
    /// case there is nothing to complete.
    Build(Option<BuildGuard>),
    /// Another caller is building; await the receiver. A `None` value on
    /// the channel means the builder abandoned and the lookup should be
    /// retried.
    Wait(watch::Receiver<Option<Arc<Decision>>>),
}

/// Exclusive right to build the decision for one key.
///
/// Dropping the guard without completing releases the key and wakes
/// waiters so one of them can claim the build.
pub struct BuildGuard {
    inner: Arc<CacheInner>,
    request_id: String,
    tx: watch::Sender<Option<Arc<Decision>>>,
    completed: bool,
}

impl BuildGuard {
    /// Store the decision, publish it to waiters, and release the key.
    pub fn complete(mut self, decision: Arc<Decision>) {
        {
            let mut slots = self.inner.lock_slots();
            slots.insert(
                self.request_id.clone(),
                Slot::Ready {
                    decision: Arc::clone(&decision),
                    stored_at: Utc::now(),
                },
            );

            // Capacity bound: drop the oldest stored decision.
            while CacheInner::ready_count(&slots) > self.inner.max_entries {
                let oldest = slots
                    .iter()
                    .filter_map(|(k, s)| match s {
                        Slot::Ready { stored_at, .. } => Some((k.clone(), *stored_at)),
                        Slot::Building { .. } => None,
                    })
                    .min_by_key(|(_, stored_at)| *stored_at);
                match oldest {
                    Some((key, _)) => {
                        slots.remove(&key);
                        self.inner.lock_stats().evicted += 1;
                    }
                    None => break,
                }
            }

            self.inner.lock_stats().entry_count = CacheInner::ready_count(&slots) as u64;
        }

        self.completed = true;
        let _ = self.tx.send(Some(decision));
    }
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut slots = self.inner.lock_slots();
        if matches!(slots.get(&self.request_id), Some(Slot::Building { .. })) {
            slots.remove(&self.request_id);
        }
        drop(slots);
        let _ = self.tx.send(None);
    }
}

/// Bounded, TTL-governed decision cache with single-flight builds.
pub struct DecisionCache {
    inner: Arc<CacheInner>,
    enabled: bool,
}

impl DecisionCache {
    pub fn new(ttl: std::time::Duration, max_entries: usize, enabled: bool) -> Self {
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(1));
        Self {
            inner: Arc::new(CacheInner {
                slots: Mutex::new(HashMap::new()),
                stats: Mutex::new(CacheStats::default()),
                ttl,
                max_entries: max_entries.max(1),
            }),
            enabled,
        }
    }

    /// Look up a request, claiming the build on a miss.
    pub fn begin(&self, request_id: &str) -> Lookup {
        if !self.enabled {
            return Lookup::Build(None);
        }

        enum Found {
            Fresh(Arc<Decision>),
            Stale,
            Building(watch::Receiver<Option<Arc<Decision>>>),
            Vacant,
        }

        let mut slots = self.inner.lock_slots();
        let found = match slots.get(request_id) {
            Some(Slot::Ready {
                decision,
                stored_at,
            }) => {
                if *stored_at + self.inner.ttl >= Utc::now() {
                    Found::Fresh(Arc::clone(decision))
                } else {
                    Found::Stale
                }
            }
            Some(Slot::Building { rx }) => Found::Building(rx.clone()),
            None => Found::Vacant,
        };
        if matches!(found, Found::Stale) {
            slots.remove(request_id);
        }

        match found {
            Found::Fresh(decision) => {
                drop(slots);
                self.inner.lock_stats().hits += 1;
                debug!(request_id, "decision cache hit");
                Lookup::Hit(decision)
            }
            Found::Building(rx) => {
                drop(slots);
                self.inner.lock_stats().coalesced += 1;
                Lookup::Wait(rx)
            }
            Found::Stale | Found::Vacant => {
                let (tx, rx) = watch::channel(None);
                slots.insert(request_id.to_string(), Slot::Building { rx });
                drop(slots);
                self.inner.lock_stats().misses += 1;

                Lookup::Build(Some(BuildGuard {
                    inner: Arc::clone(&self.inner),
                    request_id: request_id.to_string(),
                    tx,
                    completed: false,
                }))
            }
        }
    }

    /// Remove every stored decision older than the TTL.
    pub fn evict_expired(&self) {
        if !self.enabled {
            return;
        }
        let now = Utc::now();
        let mut slots = self.inner.lock_slots();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Ready { stored_at, .. } => *stored_at + self.inner.ttl >= now,
            Slot::Building { .. } => true,
        });
        let removed = (before - slots.len()) as u64;
        let remaining = CacheInner::ready_count(&slots) as u64;
        drop(slots);

        if removed > 0 {
            debug!(removed, "evicted expired decisions");
        }
        let mut stats = self.inner.lock_stats();
        stats.evicted += removed;
        stats.entry_count = remaining;
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock_stats().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// A handle sharing this cache's state, for the eviction task.
    pub fn clone_handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            enabled: self.enabled,
        }
    }
}
