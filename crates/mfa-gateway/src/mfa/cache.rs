//! Authenticated client cache
//!
//! Remembers users that recently completed the second factor so that a
//! reconnect from the same station within the client's
//! `authentication_cache_lifetime` is bypassed instead of prompting again.
//! Entries are keyed by a SHA-256 digest of calling-station-id, identity and
//! client name, or of identity and client name in minimal-matching mode.

use crate::config::ClientConfig;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tracing::debug;

/// Cache of recent second-factor successes
pub struct AuthenticatedClientCache {
    /// Key digest to expiry instant
    entries: Arc<DashMap<String, Instant>>,
    cleanup_running: Arc<AtomicBool>,
}

impl AuthenticatedClientCache {
    /// Create the cache and start a purge task running every `purge_interval`
    pub fn new(purge_interval: Duration) -> Self {
        Self::new_internal(purge_interval, true)
    }

    #[cfg(test)]
    pub(crate) fn new_no_background() -> Self {
        Self::new_internal(Duration::from_secs(60), false)
    }

    fn new_internal(purge_interval: Duration, start_background: bool) -> Self {
        let entries: Arc<DashMap<String, Instant>> = Arc::new(DashMap::new());
        let cleanup_running = Arc::new(AtomicBool::new(start_background));

        if start_background {
            let entries = Arc::clone(&entries);
            let cleanup_flag = Arc::clone(&cleanup_running);

            tokio::spawn(async move {
                let mut interval = time::interval(purge_interval);
                interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

                while cleanup_flag.load(Ordering::Relaxed) {
                    interval.tick().await;

                    let now = Instant::now();
                    let before = entries.len();
                    entries.retain(|_, expires_at| *expires_at > now);
                    let removed = before.saturating_sub(entries.len());

                    if removed > 0 {
                        debug!(removed, remaining = entries.len(), "Authenticated client cache purged");
                    }
                }
            });
        }

        AuthenticatedClientCache {
            entries,
            cleanup_running,
        }
    }

    /// Digest identifying one user on one station of one client
    ///
    /// `None` when the entry cannot be matched reliably: full matching needs a
    /// calling-station-id.
    fn key(calling_station_id: Option<&str>, identity: &str, client: &ClientConfig) -> Option<String> {
        let mut hasher = Sha256::new();
        if !client.authentication_cache_minimal_matching {
            hasher.update(calling_station_id?.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(identity.to_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(client.name.as_bytes());

        Some(hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// Whether a live entry exists
    pub fn try_hit(&self, calling_station_id: Option<&str>, identity: &str, client: &ClientConfig) -> bool {
        if client.authentication_cache_lifetime().is_zero() {
            return false;
        }
        let Some(key) = Self::key(calling_station_id, identity, client) else {
            return false;
        };

        let now = Instant::now();
        match self.entries.get(&key).map(|expires_at| *expires_at) {
            Some(expires_at) if now < expires_at => true,
            Some(_) => {
                self.entries.remove_if(&key, |_, expires_at| *expires_at <= now);
                false
            }
            None => false,
        }
    }

    /// Record a second-factor success for the client's cache lifetime
    pub fn set_cache(&self, calling_station_id: Option<&str>, identity: &str, client: &ClientConfig) {
        let lifetime = client.authentication_cache_lifetime();
        if lifetime.is_zero() {
            return;
        }
        let Some(key) = Self::key(calling_station_id, identity, client) else {
            debug!(client = %client.name, "No calling-station-id, authentication not cached");
            return;
        };

        self.entries.insert(key, Instant::now() + lifetime);
        debug!(client = %client.name, lifetime_secs = lifetime.as_secs(), "Authentication cached");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for AuthenticatedClientCache {
    fn drop(&mut self) {
        self.cleanup_running.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_client;

    fn client(lifetime: u64, minimal: bool) -> ClientConfig {
        let mut client = test_client("vpn");
        client.authentication_cache_lifetime = lifetime;
        client.authentication_cache_minimal_matching = minimal;
        client
    }

    #[test]
    fn test_hit_after_set() {
        let cache = AuthenticatedClientCache::new_no_background();
        let client = client(3600, false);

        assert!(!cache.try_hit(Some("203.0.113.7"), "alice", &client));
        cache.set_cache(Some("203.0.113.7"), "alice", &client);
        assert!(cache.try_hit(Some("203.0.113.7"), "alice", &client));
        assert!(cache.try_hit(Some("203.0.113.7"), "ALICE", &client));

        assert!(!cache.try_hit(Some("203.0.113.8"), "alice", &client));
        assert!(!cache.try_hit(Some("203.0.113.7"), "bob", &client));
        assert!(!cache.try_hit(Some("203.0.113.7"), "alice", &test_client_with_name("other", 3600)));
    }

    fn test_client_with_name(name: &str, lifetime: u64) -> ClientConfig {
        let mut client = test_client(name);
        client.authentication_cache_lifetime = lifetime;
        client
    }

    #[test]
    fn test_key_is_hex_digest() {
        let client = client(3600, false);
        let key = AuthenticatedClientCache::key(Some("203.0.113.7"), "alice", &client).unwrap();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(Some(key), AuthenticatedClientCache::key(Some("203.0.113.7"), "Alice", &client));
    }

    #[test]
    fn test_zero_lifetime_disables_cache() {
        let cache = AuthenticatedClientCache::new_no_background();
        let client = client(0, false);

        cache.set_cache(Some("203.0.113.7"), "alice", &client);
        assert!(cache.is_empty());
        assert!(!cache.try_hit(Some("203.0.113.7"), "alice", &client));
    }

    #[test]
    fn test_full_matching_needs_station_id() {
        let cache = AuthenticatedClientCache::new_no_background();
        let client = client(3600, false);

        cache.set_cache(None, "alice", &client);
        assert!(cache.is_empty());
        assert!(!cache.try_hit(None, "alice", &client));
    }

    #[test]
    fn test_minimal_matching_ignores_station() {
        let cache = AuthenticatedClientCache::new_no_background();
        let client = client(3600, true);

        cache.set_cache(Some("203.0.113.7"), "alice", &client);
        assert!(cache.try_hit(Some("198.51.100.1"), "alice", &client));
        assert!(cache.try_hit(None, "alice", &client));
    }

    #[test]
    fn test_entry_expires() {
        let cache = AuthenticatedClientCache::new_no_background();
        let client = client(1, true);

        cache.set_cache(None, "alice", &client);
        assert!(cache.try_hit(None, "alice", &client));

        std::thread::sleep(Duration::from_millis(1100));
        assert!(!cache.try_hit(None, "alice", &client));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_background_purge() {
        let cache = AuthenticatedClientCache::new(Duration::from_millis(50));
        let client = client(1, true);

        cache.set_cache(None, "alice", &client);
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert!(cache.is_empty());
    }
}
