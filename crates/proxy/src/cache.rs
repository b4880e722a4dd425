// jrpc-proxy - a caching reverse proxy for JSON-RPC 2.0
// Copyright (C) 2025 jrpc-proxy contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! In-memory TTL byte cache and the tiered cache manager built on it
//!
//! Values are opaque byte sequences prefixed with an 8-byte little-endian
//! nanosecond eviction deadline. The per-entry deadline is authoritative for
//! correctness; background sweeps only reclaim memory.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::item::CachedItem;

const SHARD_COUNT: usize = 1024;
const DEADLINE_HEADER_LEN: usize = 8;

const MB: usize = 1024 * 1024;

/// Memory budgets and life windows of the three tiers. The long tier keeps
/// entries until their own deadline passes and is never swept.
const SHORT_TIER_BUDGET: usize = 64 * MB;
const MEDIUM_TIER_BUDGET: usize = 128 * MB;
const LONG_TIER_BUDGET: usize = 256 * MB;
const SHORT_TIER_LIFE: Duration = Duration::from_secs(60);
const MEDIUM_TIER_LIFE: Duration = Duration::from_secs(3600);
const SHORT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const MEDIUM_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Failures reported by cache writes.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Admission failed: storing the entry would exceed the memory budget.
    #[error("cache capacity exceeded")]
    CapacityExceeded,
}

struct Entry {
    inserted_at: Instant,
    // 8-byte little-endian deadline prefix followed by the stored bytes
    payload: Vec<u8>,
}

impl Entry {
    fn deadline_ns(&self) -> Option<u64> {
        let header = self.payload.get(..DEADLINE_HEADER_LEN)?;
        Some(u64::from_le_bytes(header.try_into().ok()?))
    }

    fn expired(&self, now_ns: u64) -> bool {
        match self.deadline_ns() {
            Some(deadline) => now_ns >= deadline,
            None => true,
        }
    }
}

fn unix_nanos_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}

fn deadline_after(ttl: Duration) -> u64 {
    let ttl_ns = u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX);
    unix_nanos_now().saturating_add(ttl_ns)
}

/// A concurrent keyed byte store with per-entry expiry and a hard memory cap.
///
/// Keys are hashed over 1,024 shards; all operations are non-suspending and
/// safe under concurrent callers. Duplicate concurrent sets race naturally
/// (last writer wins), which is fine because values for the same key within
/// TTL are functionally equivalent.
pub struct TtlCache {
    shards: Box<[RwLock<HashMap<String, Entry>>]>,
    used_bytes: AtomicUsize,
    max_bytes: usize,
    life_window: Option<Duration>,
}

impl TtlCache {
    /// Creates a cache with the given byte budget and optional background
    /// life window.
    pub fn new(max_bytes: usize, life_window: Option<Duration>) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect();
        Self { shards, used_bytes: AtomicUsize::new(0), max_bytes, life_window }
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % SHARD_COUNT
    }

    /// Stores `value` under `key` for `ttl`. A zero TTL stores nothing.
    ///
    /// Returns [`CacheError::CapacityExceeded`] when admission would push the
    /// cache past its memory budget.
    pub fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        if ttl.is_zero() {
            return Ok(());
        }
        let deadline = deadline_after(ttl);
        let mut payload = Vec::with_capacity(DEADLINE_HEADER_LEN + value.len());
        payload.extend_from_slice(&deadline.to_le_bytes());
        payload.extend_from_slice(value);

        let size = key.len() + payload.len();
        let mut shard = self.shards[self.shard_index(key)].write();
        let freed = shard.get(key).map(|e| key.len() + e.payload.len()).unwrap_or(0);
        if self.used_bytes.load(Ordering::Relaxed) + size - freed > self.max_bytes {
            return Err(CacheError::CapacityExceeded);
        }
        shard.insert(key.to_string(), Entry { inserted_at: Instant::now(), payload });
        self.used_bytes.fetch_add(size, Ordering::Relaxed);
        self.used_bytes.fetch_sub(freed, Ordering::Relaxed);
        Ok(())
    }

    /// Fetches the bytes stored under `key`, stripping the deadline header.
    ///
    /// Expired entries are deleted on sight and reported absent; entries
    /// shorter than the header prefix are treated as missing.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let idx = self.shard_index(key);
        let now = unix_nanos_now();
        {
            let shard = self.shards[idx].read();
            let entry = shard.get(key)?;
            if entry.payload.len() < DEADLINE_HEADER_LEN {
                return None;
            }
            if !entry.expired(now) {
                return Some(entry.payload[DEADLINE_HEADER_LEN..].to_vec());
            }
        }
        // lazy eviction; re-check under the write lock since the entry may
        // have been replaced in between
        let mut shard = self.shards[idx].write();
        if shard.get(key).is_some_and(|e| e.expired(now)) {
            if let Some(entry) = shard.remove(key) {
                self.used_bytes.fetch_sub(key.len() + entry.payload.len(), Ordering::Relaxed);
            }
        }
        None
    }

    /// Empties all shards.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
        self.used_bytes.store(0, Ordering::Relaxed);
    }

    /// Reclaims entries whose life window elapsed since insertion, plus any
    /// whose deadline already passed.
    pub fn sweep(&self) {
        let now = unix_nanos_now();
        let mut removed = 0usize;
        let mut freed = 0usize;
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            shard.retain(|key, entry| {
                let stale = entry.expired(now)
                    || self.life_window.is_some_and(|w| entry.inserted_at.elapsed() >= w);
                if stale {
                    removed += 1;
                    freed += key.len() + entry.payload.len();
                }
                !stale
            });
        }
        if removed > 0 {
            self.used_bytes.fetch_sub(freed, Ordering::Relaxed);
            debug!(removed, freed, "cache sweep reclaimed entries");
        }
    }

    /// Number of stored entries, including not-yet-reclaimed expired ones.
    pub fn entry_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Bytes currently accounted against the budget.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy)]
enum Tier {
    Short,
    Medium,
}

/// Three TTL caches with progressively larger budgets, routed by TTL band.
///
/// Writes go to the tier matching the entry's TTL; reads probe the suggested
/// tier first and then fall back to long, medium, short, so an item stored at
/// a longer tier stays visible when probed with a shorter hint while the
/// reverse never promotes an entry's lifetime.
pub struct TieredCache {
    short: TtlCache,
    medium: TtlCache,
    long: TtlCache,
}

impl Default for TieredCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TieredCache {
    /// Creates the three tiers with their fixed budgets and life windows.
    pub fn new() -> Self {
        Self {
            short: TtlCache::new(SHORT_TIER_BUDGET, Some(SHORT_TIER_LIFE)),
            medium: TtlCache::new(MEDIUM_TIER_BUDGET, Some(MEDIUM_TIER_LIFE)),
            long: TtlCache::new(LONG_TIER_BUDGET, None),
        }
    }

    fn tier_for(&self, ttl: Duration) -> &TtlCache {
        if ttl <= SHORT_TIER_LIFE {
            &self.short
        } else if ttl <= MEDIUM_TIER_LIFE {
            &self.medium
        } else {
            &self.long
        }
    }

    fn tier(&self, tier: Tier) -> &TtlCache {
        match tier {
            Tier::Short => &self.short,
            Tier::Medium => &self.medium,
        }
    }

    /// Stores `value` for `ttl` in the tier matching the TTL band. A zero
    /// TTL stores nothing.
    pub fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        if ttl.is_zero() {
            return Ok(());
        }
        self.tier_for(ttl).set(key, value, ttl)
    }

    /// Probes the tier suggested by `suggested_ttl`, then long, medium,
    /// short.
    pub fn get(&self, key: &str, suggested_ttl: Duration) -> Option<Vec<u8>> {
        self.tier_for(suggested_ttl)
            .get(key)
            .or_else(|| self.long.get(key))
            .or_else(|| self.medium.get(key))
            .or_else(|| self.short.get(key))
    }

    /// Like [`TieredCache::get`] but decodes the stored bytes into a
    /// [`CachedItem`]. Undecodable or empty records count as misses.
    pub fn get_item(&self, key: &str, suggested_ttl: Duration) -> Option<CachedItem> {
        let bytes = self.get(key, suggested_ttl)?;
        let item = CachedItem::from_bytes(&bytes);
        if item.is_none() {
            warn!(key, "dropping undecodable cached item");
        }
        item
    }

    /// Empties every tier.
    pub fn clear(&self) {
        self.short.clear();
        self.medium.clear();
        self.long.clear();
    }

    /// Total entries across tiers.
    pub fn entry_count(&self) -> usize {
        self.short.entry_count() + self.medium.entry_count() + self.long.entry_count()
    }

    /// Spawns the background sweepers for the short and medium tiers. The
    /// tasks stop when the shutdown channel fires.
    pub fn spawn_sweepers(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) {
        for (tier, every) in [
            (Tier::Short, SHORT_SWEEP_INTERVAL),
            (Tier::Medium, MEDIUM_SWEEP_INTERVAL),
        ] {
            let cache = Arc::clone(self);
            let mut rx = shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                // the first tick fires immediately; skip it
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => cache.tier(tier).sweep(),
                        _ = rx.recv() => break,
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[test]
    fn test_set_get_round_trip() {
        let cache = TtlCache::new(MB, None);
        assert!(cache.get("k").is_none());

        cache.set("k", b"payload", Duration::from_secs(5)).unwrap();
        assert_eq!(cache.get("k").unwrap(), b"payload");
        assert_eq!(cache.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_lazy_expiry_deletes_entry() {
        let cache = TtlCache::new(MB, None);
        cache.set("k", b"v", Duration::from_millis(50)).unwrap();
        assert!(cache.get("k").is_some());

        sleep(Duration::from_millis(80)).await;
        assert!(cache.get("k").is_none());
        // the expired probe removed the entry
        assert_eq!(cache.entry_count(), 0);
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_zero_ttl_stores_nothing() {
        let cache = TtlCache::new(MB, None);
        cache.set("k", b"v", Duration::ZERO).unwrap();
        assert!(cache.get("k").is_none());
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn test_short_entry_is_missing() {
        let cache = TtlCache::new(MB, None);
        let idx = cache.shard_index("k");
        cache.shards[idx]
            .write()
            .insert("k".to_string(), Entry { inserted_at: Instant::now(), payload: vec![1, 2, 3] });
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_capacity_admission() {
        let cache = TtlCache::new(64, None);
        cache.set("a", &[0u8; 20], Duration::from_secs(5)).unwrap();
        let err = cache.set("b", &[0u8; 40], Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, CacheError::CapacityExceeded));
        // replacing an existing key frees its old accounting first
        cache.set("a", &[0u8; 24], Duration::from_secs(5)).unwrap();
        assert_eq!(cache.get("a").unwrap(), vec![0u8; 24]);
    }

    #[test]
    fn test_clear() {
        let cache = TtlCache::new(MB, None);
        cache.set("a", b"1", Duration::from_secs(5)).unwrap();
        cache.set("b", b"2", Duration::from_secs(5)).unwrap();
        cache.clear();
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_none());
        assert_eq!(cache.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_by_life_window() {
        let cache = TtlCache::new(MB, Some(Duration::from_millis(50)));
        // deadline far in the future; the life window reclaims it anyway
        cache.set("k", b"v", Duration::from_secs(3600)).unwrap();
        sleep(Duration::from_millis(80)).await;

        cache.sweep();
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_expired_deadlines() {
        let cache = TtlCache::new(MB, None);
        cache.set("k", b"v", Duration::from_millis(30)).unwrap();
        sleep(Duration::from_millis(60)).await;

        cache.sweep();
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_tier_routing_by_ttl_band() {
        let tiered = TieredCache::new();
        tiered.set("s", b"1", Duration::from_secs(5)).unwrap();
        tiered.set("m", b"2", Duration::from_secs(600)).unwrap();
        tiered.set("l", b"3", Duration::from_secs(7200)).unwrap();

        assert_eq!(tiered.short.entry_count(), 1);
        assert_eq!(tiered.medium.entry_count(), 1);
        assert_eq!(tiered.long.entry_count(), 1);

        // band edges are inclusive
        tiered.set("s2", b"4", Duration::from_secs(60)).unwrap();
        tiered.set("m2", b"5", Duration::from_secs(3600)).unwrap();
        assert_eq!(tiered.short.entry_count(), 2);
        assert_eq!(tiered.medium.entry_count(), 2);
    }

    #[test]
    fn test_read_falls_back_across_tiers() {
        let tiered = TieredCache::new();
        tiered.set("k", b"long-lived", Duration::from_secs(7200)).unwrap();

        // probing with a short hint still finds the long-tier entry
        assert_eq!(tiered.get("k", Duration::from_secs(1)).unwrap(), b"long-lived");
        assert_eq!(tiered.get("k", Duration::ZERO).unwrap(), b"long-lived");
        assert_eq!(tiered.get("k", Duration::from_secs(7200)).unwrap(), b"long-lived");
    }

    #[test]
    fn test_tiered_zero_ttl_is_noop() {
        let tiered = TieredCache::new();
        tiered.set("k", b"v", Duration::ZERO).unwrap();
        assert_eq!(tiered.entry_count(), 0);
    }

    #[test]
    fn test_get_item_decodes_and_rejects_garbage() {
        let tiered = TieredCache::new();
        let item = CachedItem::Error(crate::jsonrpc::RpcError::internal_error());
        tiered.set("good", &item.to_bytes(), Duration::from_secs(5)).unwrap();
        tiered.set("bad", b"not json", Duration::from_secs(5)).unwrap();

        assert!(matches!(
            tiered.get_item("good", Duration::from_secs(5)),
            Some(CachedItem::Error(_))
        ));
        assert!(tiered.get_item("bad", Duration::from_secs(5)).is_none());
        assert!(tiered.get_item("absent", Duration::from_secs(5)).is_none());
    }
}
