//! Pending challenge storage
//!
//! One entry per [`ChallengeIdentifier`], inserted atomically through the
//! DashMap entry API so concurrent registrations for the same key leave
//! exactly one winner. Entries older than the TTL are treated as absent and
//! removed by a background sweep running four times per TTL.

use super::ChallengeIdentifier;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredChallenge<V> {
    value: V,
    inserted_at: Instant,
}

/// TTL-bounded map of suspended exchanges
pub struct ChallengeStore<V> {
    entries: Arc<DashMap<ChallengeIdentifier, StoredChallenge<V>>>,
    ttl: Duration,
    cleanup_running: Arc<AtomicBool>,
}

impl<V: Clone + Send + Sync + 'static> ChallengeStore<V> {
    pub fn new(ttl: Duration) -> Self {
        Self::new_internal(ttl, true)
    }

    #[cfg(test)]
    pub(crate) fn new_no_background(ttl: Duration) -> Self {
        Self::new_internal(ttl, false)
    }

    fn new_internal(ttl: Duration, start_background: bool) -> Self {
        let entries: Arc<DashMap<ChallengeIdentifier, StoredChallenge<V>>> = Arc::new(DashMap::new());
        let cleanup_running = Arc::new(AtomicBool::new(start_background));

        if start_background {
            let entries = Arc::clone(&entries);
            let cleanup_flag = Arc::clone(&cleanup_running);
            let cleanup_interval = (ttl / 4).max(Duration::from_millis(10));

            tokio::spawn(async move {
                let mut interval = time::interval(cleanup_interval);
                interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

                while cleanup_flag.load(Ordering::Relaxed) {
                    interval.tick().await;

                    let now = Instant::now();
                    let before = entries.len();
                    entries.retain(|_, stored| now.duration_since(stored.inserted_at) <= ttl);
                    let removed = before.saturating_sub(entries.len());

                    if removed > 0 {
                        debug!(removed, remaining = entries.len(), "Abandoned challenges evicted");
                    }
                }

                debug!("Challenge store sweep stopped");
            });
        }

        ChallengeStore {
            entries,
            ttl,
            cleanup_running,
        }
    }

    fn is_live(&self, stored: &StoredChallenge<V>) -> bool {
        stored.inserted_at.elapsed() <= self.ttl
    }

    /// Insert unless a live entry exists for `id`
    ///
    /// Returns false, leaving the existing entry untouched, when one does.
    pub fn try_add(&self, id: ChallengeIdentifier, value: V) -> bool {
        let stored = StoredChallenge {
            value,
            inserted_at: Instant::now(),
        };

        match self.entries.entry(id) {
            Entry::Occupied(mut occupied) => {
                if self.is_live(occupied.get()) {
                    return false;
                }
                occupied.insert(stored);
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
                true
            }
        }
    }

    /// Live entry for `id`
    pub fn get(&self, id: &ChallengeIdentifier) -> Option<V> {
        let stored = self.entries.get(id)?;
        if self.is_live(&stored) {
            Some(stored.value.clone())
        } else {
            None
        }
    }

    pub fn contains(&self, id: &ChallengeIdentifier) -> bool {
        self.entries
            .get(id)
            .is_some_and(|stored| self.is_live(&stored))
    }

    /// Replace the value of a live entry, keeping its insertion time
    pub fn update(&self, id: &ChallengeIdentifier, value: V) -> bool {
        match self.entries.get_mut(id) {
            Some(mut stored) if self.is_live(&stored) => {
                stored.value = value;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, id: &ChallengeIdentifier) -> Option<V> {
        self.entries.remove(id).map(|(_, stored)| stored.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> Drop for ChallengeStore<V> {
    fn drop(&mut self) {
        self.cleanup_running.store(false, Ordering::Relaxed);
    }
}
