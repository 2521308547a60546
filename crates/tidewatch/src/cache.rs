//! In-process TTL cache with per-key slots.
//!
//! The map lock is only held to find or create a slot; the slot's own async mutex is what a
//! fetch holds while its producer runs, so concurrent fetches of one key queue behind a single
//! upstream call while unrelated keys proceed untouched.

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;

pub type Payload = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
pub struct CacheEntry {
    pub payload: Payload,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn new(payload: Payload, ttl: Duration) -> Self {
        Self {
            payload,
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

pub type Slot = Arc<tokio::sync::Mutex<Option<CacheEntry>>>;

/// Composite cache key: `(operation, chain, wallet, token)`.
pub fn cache_key(op: &str, chain: &str, wallet: &str, token: &str) -> String {
    format!(
        "{op}:{}:{}:{}",
        chain.to_ascii_lowercase(),
        wallet.to_ascii_lowercase(),
        token.to_ascii_lowercase()
    )
}

#[derive(Debug)]
pub struct TtlCache {
    slots: Mutex<HashMap<String, Slot>>,
    max_entries: usize,
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl TtlCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        // A poisoned map only means a panic happened mid-insert; the map itself is still usable.
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Get (or create) the slot for `key`.
    pub fn slot(&self, key: &str) -> Slot {
        let mut slots = self.lock_slots();
        if let Some(s) = slots.get(key) {
            return Arc::clone(s);
        }
        if slots.len() >= self.max_entries {
            prune(&mut slots, self.max_entries);
        }
        let s: Slot = Arc::new(tokio::sync::Mutex::new(None));
        slots.insert(key.to_owned(), Arc::clone(&s));
        s
    }

    /// Number of keys currently tracked (live, expired, or in flight).
    pub fn len(&self) -> usize {
        self.lock_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A slot someone outside the map still holds (a fetch between `slot()` and `lock()`, or one
/// running its producer) must stay, or a concurrent fetch of the same key gets a fresh slot.
fn in_use(s: &Slot) -> bool {
    Arc::strong_count(s) > 1
}

/// Make room for one more slot: expired first, then the soonest-expiring live entries.
/// Slots in use are never evicted.
fn prune(slots: &mut HashMap<String, Slot>, max_entries: usize) {
    let now = Instant::now();
    slots.retain(|_, s| {
        if in_use(s) {
            return true;
        }
        match s.try_lock() {
            Ok(g) => g.as_ref().is_some_and(|e| e.is_live(now)),
            Err(_) => true,
        }
    });
    if slots.len() < max_entries {
        return;
    }

    let mut live: Vec<(String, Instant)> = slots
        .iter()
        .filter(|(_, s)| !in_use(s))
        .filter_map(|(k, s)| {
            let g = s.try_lock().ok()?;
            g.as_ref().map(|e| (k.clone(), e.expires_at))
        })
        .collect();
    live.sort_by_key(|(_, at)| *at);
    let excess = slots.len().saturating_sub(max_entries).saturating_add(1);
    for (k, _) in live.into_iter().take(excess) {
        slots.remove(&k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_case_insensitive_on_addresses() {
        assert_eq!(
            cache_key("balance", "Ethereum", "0xAbC", "0xDeF"),
            cache_key("balance", "ethereum", "0xabc", "0xdef")
        );
    }

    #[tokio::test]
    async fn same_key_shares_a_slot() {
        let cache = TtlCache::new(8);
        let a = cache.slot("k");
        let b = cache.slot("k");
        assert!(Arc::ptr_eq(&a, &b), "slot should be reused");
        assert_eq!(cache.len(), 1_usize);
    }

    #[tokio::test]
    async fn prune_keeps_size_bounded() {
        let cache = TtlCache::new(2);
        for k in ["a", "b", "c", "d"] {
            let s = cache.slot(k);
            *s.lock().await = Some(CacheEntry::new(Arc::new(1_u8), Duration::from_secs(60)));
        }
        assert!(cache.len() <= 2_usize, "len={}", cache.len());
    }

    #[tokio::test]
    async fn handed_out_slot_survives_pruning() {
        let cache = TtlCache::new(1);
        // Held but not yet locked or filled, as in a fetch that has not reached `lock()`.
        let held = cache.slot("k");
        let _other = cache.slot("other");
        let again = cache.slot("k");
        assert!(Arc::ptr_eq(&held, &again), "same key must keep one slot under size pressure");
    }
}
