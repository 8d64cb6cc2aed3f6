//! The generic expiring LRU cache substrate (§4.2) and the rubber-sink
//! istream consumer (§4.3) that feeds it response bodies.
//!
//! The original's `Cache`/`CacheItem` pair is an intrusive hash set plus an
//! intrusive LRU list, both threaded through hooks embedded in each item,
//! so that eviction never allocates. §9's design notes call the direct
//! translation of that into a strict-ownership language out: "prefer
//! arena-allocated nodes... side-tables for LRU/hash," and for the
//! pinning mechanism specifically recommends "an `Rc`/`shared_ptr` to an
//! item with `Weak` lease handles." This crate follows that recommendation
//! literally: one `hashlink::LinkedHashMap` serves as *both* the hash
//! table and the LRU list (the same data structure the teacher reaches for
//! in its own LRU cache, see `hashlink::LruCache` in
//! `ferron::modules::static_file_serving`), and each entry is an
//! `Rc<RefCell<Item<V>>>` so a [`SharedLease`] is just another clone of
//! that `Rc`.
//!
//! §5 states the caching core runs on a single-threaded cooperative event
//! loop with no parallel threads inside it; `Cache` takes that at face
//! value and is intentionally `!Send` (`Rc`/`RefCell`, not `Arc`/`Mutex`).
//! A façade that needs to share one `Cache` across tasks on the same
//! thread wraps it in an `Rc` and drives it from a `tokio::task::LocalSet`.

pub mod rubber_sink;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub use rubber_sink::{sink_into_rubber, SinkOutcome};

struct Item<K, V> {
    key: K,
    tag: Option<String>,
    size: u64,
    expires: Instant,
    last_accessed: Instant,
    removed: bool,
    value: V,
}

/// A token that pins a cache item: while held, the item cannot be
/// destroyed even if it's logically evicted (`Remove`, `Flush`,
/// `FlushTag`, or natural expiry all just set `removed` and unlink it).
/// Dropping the last lease (together with the cache's own reference, if
/// it still holds one) drops the item's value.
#[derive(Clone)]
pub struct SharedLease<K, V>(Rc<RefCell<Item<K, V>>>);

impl<K, V> SharedLease<K, V> {
    pub fn key(&self) -> std::cell::Ref<'_, K> {
        std::cell::Ref::map(self.0.borrow(), |i| &i.key)
    }

    pub fn value(&self) -> std::cell::Ref<'_, V> {
        std::cell::Ref::map(self.0.borrow(), |i| &i.value)
    }

    pub fn value_mut(&self) -> std::cell::RefMut<'_, V> {
        std::cell::RefMut::map(self.0.borrow_mut(), |i| &mut i.value)
    }

    pub fn size(&self) -> u64 {
        self.0.borrow().size
    }

    pub fn tag(&self) -> Option<String> {
        self.0.borrow().tag.clone()
    }

    /// True once the item has been unlinked from the cache (evicted,
    /// flushed, or expired) but is still alive because this (or another)
    /// lease holds it.
    pub fn is_removed(&self) -> bool {
        self.0.borrow().removed
    }
}

struct Inner<K, V> {
    items: hashlink::LinkedHashMap<K, Rc<RefCell<Item<K, V>>>>,
    tags: HashMap<String, HashSet<K>>,
    size: u64,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn unlink(&mut self, key: &K) -> Option<Rc<RefCell<Item<K, V>>>> {
        let rc = self.items.remove(key)?;
        {
            let mut item = rc.borrow_mut();
            item.removed = true;
            self.size -= item.size;
            if let Some(tag) = &item.tag {
                if let Some(set) = self.tags.get_mut(tag) {
                    set.remove(&item.key);
                    if set.is_empty() {
                        self.tags.remove(tag);
                    }
                }
            }
        }
        Some(rc)
    }

    fn link(&mut self, rc: Rc<RefCell<Item<K, V>>>) {
        let (key, size, tag) = {
            let item = rc.borrow();
            (item.key.clone(), item.size, item.tag.clone())
        };
        self.size += size;
        if let Some(tag) = &tag {
            self.tags.entry(tag.clone()).or_default().insert(key.clone());
        }
        self.items.insert(key, rc);
    }
}

/// An expiring, size-budgeted LRU cache keyed by `K`, holding values `V`.
/// `V` carries only the payload; size accounting, expiry, LRU order, tags
/// and pinning are all handled here.
pub struct Cache<K, V> {
    inner: RefCell<Inner<K, V>>,
    max_size: u64,
}

impl<K: Eq + Hash + Clone, V> Cache<K, V> {
    pub fn new(max_size: u64) -> Self {
        Self {
            inner: RefCell::new(Inner {
                items: hashlink::LinkedHashMap::new(),
                tags: HashMap::new(),
                size: 0,
            }),
            max_size,
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn size(&self) -> u64 {
        self.inner.borrow().size
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().items.is_empty()
    }

    /// Evicts the item at `key` if it has expired as of `now`. Returns
    /// `true` if it was evicted.
    fn evict_if_expired(&self, key: &K, now: Instant) -> bool {
        let expired = {
            let inner = self.inner.borrow();
            match inner.items.get(key) {
                Some(rc) => now >= rc.borrow().expires,
                None => false,
            }
        };
        if expired {
            self.inner.borrow_mut().unlink(key);
        }
        expired
    }

    /// `Get(key)`: the live, non-expired item, or `None`. Promotes the hit
    /// to the LRU tail. Synchronously evicts on expiry.
    pub fn get(&self, key: &K, now: Instant) -> Option<SharedLease<K, V>> {
        self.get_match(key, now, |_| true)
    }

    /// `GetMatch(key, predicate)`: same as [`Cache::get`], but the item is
    /// only returned (and promoted) if `predicate` holds for its value.
    pub fn get_match(
        &self,
        key: &K,
        now: Instant,
        predicate: impl FnOnce(&V) -> bool,
    ) -> Option<SharedLease<K, V>> {
        if self.evict_if_expired(key, now) {
            return None;
        }
        let mut inner = self.inner.borrow_mut();
        let rc = inner.items.get(key)?.clone();
        if !predicate(&rc.borrow().value) {
            return None;
        }
        rc.borrow_mut().last_accessed = now;
        inner.items.to_back(key);
        Some(SharedLease(rc))
    }

    /// Evicts entries from the LRU head until `extra` more bytes fit
    /// within `max_size`.
    fn need_room(&self, extra: u64) {
        let mut inner = self.inner.borrow_mut();
        while inner.size + extra > self.max_size {
            let Some((oldest_key, _)) = inner.items.iter().next().map(|(k, v)| (k.clone(), v.clone()))
            else {
                break;
            };
            inner.unlink(&oldest_key);
        }
    }

    fn make_item(key: K, value: V, size: u64, expires: Instant, tag: Option<String>, now: Instant) -> Rc<RefCell<Item<K, V>>> {
        Rc::new(RefCell::new(Item {
            key,
            tag,
            size,
            expires,
            last_accessed: now,
            removed: false,
            value,
        }))
    }

    /// `Add(key, item)`: insert without replacing. Returns `false` (and
    /// drops `value`) if the key is already present, or if `size` alone
    /// exceeds `max_size`.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &self,
        key: K,
        value: V,
        size: u64,
        expires: Instant,
        tag: Option<String>,
        now: Instant,
    ) -> bool {
        if size > self.max_size {
            return false;
        }
        if self.inner.borrow().items.contains_key(&key) {
            return false;
        }
        self.need_room(size);
        let item = Self::make_item(key, value, size, expires, tag, now);
        self.inner.borrow_mut().link(item);
        true
    }

    /// `Put(key, item)`: insert, replacing any existing entry at `key`.
    pub fn put(
        &self,
        key: K,
        value: V,
        size: u64,
        expires: Instant,
        tag: Option<String>,
        now: Instant,
    ) -> bool {
        if size > self.max_size {
            self.inner.borrow_mut().unlink(&key);
            return false;
        }
        self.inner.borrow_mut().unlink(&key);
        self.need_room(size);
        let item = Self::make_item(key, value, size, expires, tag, now);
        self.inner.borrow_mut().link(item);
        true
    }

    /// `PutMatch(key, item, predicate)`: replaces the entry at `key` only
    /// if it exists and `predicate` holds for its current value;
    /// otherwise behaves like [`Cache::add`].
    #[allow(clippy::too_many_arguments)]
    pub fn put_match(
        &self,
        key: K,
        value: V,
        size: u64,
        expires: Instant,
        tag: Option<String>,
        now: Instant,
        predicate: impl FnOnce(&V) -> bool,
    ) -> bool {
        let existing_matches = self
            .inner
            .borrow()
            .items
            .get(&key)
            .map(|rc| predicate(&rc.borrow().value))
            .unwrap_or(false);

        if existing_matches {
            self.put(key, value, size, expires, tag, now)
        } else {
            self.add(key, value, size, expires, tag, now)
        }
    }

    /// `Remove(key)`.
    pub fn remove(&self, key: &K) {
        self.inner.borrow_mut().unlink(key);
    }

    /// `RemoveMatch(key, predicate)`: removes the entry at `key` only if
    /// `predicate` holds for its value.
    pub fn remove_match(&self, key: &K, predicate: impl FnOnce(&V) -> bool) {
        let matches = self
            .inner
            .borrow()
            .items
            .get(key)
            .map(|rc| predicate(&rc.borrow().value))
            .unwrap_or(false);
        if matches {
            self.inner.borrow_mut().unlink(key);
        }
    }

    /// `RemoveAllMatch(predicate)`: removes every entry whose value
    /// matches, returning the count removed.
    pub fn remove_all_match(&self, predicate: impl Fn(&V) -> bool) -> usize {
        let keys: Vec<K> = {
            let inner = self.inner.borrow();
            inner
                .items
                .iter()
                .filter(|(_, rc)| predicate(&rc.borrow().value))
                .map(|(k, _)| k.clone())
                .collect()
        };
        let mut inner = self.inner.borrow_mut();
        for key in &keys {
            inner.unlink(key);
        }
        keys.len()
    }

    /// `Flush()`: evicts everything. Idempotent.
    pub fn flush(&self) {
        let keys: Vec<K> = self.inner.borrow().items.iter().map(|(k, _)| k.clone()).collect();
        let mut inner = self.inner.borrow_mut();
        for key in &keys {
            inner.unlink(key);
        }
    }

    /// `FlushTag(tag)`: drops every item carrying `tag`. Idempotent.
    pub fn flush_tag(&self, tag: &str) {
        let keys: Vec<K> = self
            .inner
            .borrow()
            .tags
            .get(tag)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let mut inner = self.inner.borrow_mut();
        for key in &keys {
            inner.unlink(key);
        }
    }

    /// The periodic expiry sweep (§4.2: "fires every ≈60s... evicts all
    /// items whose `expires < now`"). Returns the number of items evicted.
    pub fn expire_sweep(&self, now: Instant) -> usize {
        let expired: Vec<K> = {
            let inner = self.inner.borrow();
            inner
                .items
                .iter()
                .filter(|(_, rc)| rc.borrow().expires <= now)
                .map(|(k, _)| k.clone())
                .collect()
        };
        let mut inner = self.inner.borrow_mut();
        for key in &expired {
            inner.unlink(key);
        }
        expired.len()
    }
}

impl<K: Eq + Hash + Clone + 'static, V: 'static> Cache<K, V> {
    /// Drives the ≈60s expiry sweep on the current thread's `LocalSet`
    /// until the cache goes empty, at which point it disables itself —
    /// matching the original's "if the cache becomes empty, disables
    /// itself" rather than ticking forever on an idle cache. A later
    /// `add`/`put` does not automatically restart it; the façade owning
    /// the cache is expected to call this again the next time it becomes
    /// non-empty (in practice: once, right after construction, and again
    /// whenever this task returns while the façade is still alive).
    pub fn spawn_expiry_task(self: Rc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn_local(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.expire_sweep(Instant::now());
                if self.is_empty() {
                    break;
                }
            }
        })
    }
}

/// Tracks the background `spawn_local` tasks a façade hands off to a
/// rubber-sink store, so the façade can cancel every store still in
/// flight on shutdown (§4.8: "cache destruction cancels all in-flight
/// stores") instead of leaving them to run to completion orphaned.
///
/// `!Send`, like everything else here — a façade owns one of these
/// alongside its `Cache`, both driven from the same `LocalSet`.
#[derive(Default)]
pub struct InFlightStores {
    handles: RefCell<Vec<tokio::task::JoinHandle<()>>>,
}

impl InFlightStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `fut` on the current `LocalSet` and tracks its handle.
    /// Opportunistically drops handles for stores that already finished,
    /// so this list doesn't grow unbounded across a long-lived façade.
    pub fn spawn(&self, fut: impl std::future::Future<Output = ()> + 'static) {
        let mut handles = self.handles.borrow_mut();
        handles.retain(|h| !h.is_finished());
        handles.push(tokio::task::spawn_local(fut));
    }

    /// Aborts every store still running and forgets their handles.
    /// Idempotent: calling it again with nothing left in flight is a
    /// no-op.
    pub fn cancel_all(&self) {
        for handle in self.handles.borrow_mut().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for InFlightStores {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn put_then_get_returns_the_value() {
        let cache: Cache<String, &'static str> = Cache::new(1024);
        let t = now();
        assert!(cache.put("k".into(), "v1", 10, t + Duration::from_secs(60), None, t));
        let lease = cache.get(&"k".to_string(), t).unwrap();
        assert_eq!(*lease.value(), "v1");
    }

    #[test]
    fn put_replaces_the_prior_value_for_the_same_key() {
        let cache: Cache<String, &'static str> = Cache::new(1024);
        let t = now();
        cache.put("k".into(), "v1", 10, t + Duration::from_secs(60), None, t);
        cache.put("k".into(), "v2", 10, t + Duration::from_secs(60), None, t);
        let lease = cache.get(&"k".to_string(), t).unwrap();
        assert_eq!(*lease.value(), "v2");
        assert_eq!(cache.size(), 10);
    }

    #[test]
    fn put_then_remove_then_get_is_a_miss() {
        let cache: Cache<String, &'static str> = Cache::new(1024);
        let t = now();
        cache.put("k".into(), "v1", 10, t + Duration::from_secs(60), None, t);
        cache.remove(&"k".to_string());
        assert!(cache.get(&"k".to_string(), t).is_none());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn add_does_not_replace_an_existing_key() {
        let cache: Cache<String, &'static str> = Cache::new(1024);
        let t = now();
        assert!(cache.add("k".into(), "v1", 10, t + Duration::from_secs(60), None, t));
        assert!(!cache.add("k".into(), "v2", 10, t + Duration::from_secs(60), None, t));
        assert_eq!(*cache.get(&"k".to_string(), t).unwrap().value(), "v1");
    }

    #[test]
    fn budget_is_enforced_by_evicting_the_lru_head() {
        let cache: Cache<u32, u32> = Cache::new(100);
        let t = now();
        for i in 0..10u32 {
            cache.put(i, i, 10, t + Duration::from_secs(60), None, t);
        }
        assert!(cache.size() <= 100);
        // The earliest keys should have been evicted first.
        assert!(cache.get(&0, t).is_none());
        assert!(cache.get(&9, t).is_some());
    }

    #[test]
    fn get_promotes_to_mru_so_it_survives_eviction_pressure() {
        let cache: Cache<u32, u32> = Cache::new(30);
        let t = now();
        cache.put(1, 1, 10, t + Duration::from_secs(60), None, t);
        cache.put(2, 2, 10, t + Duration::from_secs(60), None, t);
        cache.put(3, 3, 10, t + Duration::from_secs(60), None, t);
        // Touch key 1 so it's no longer the LRU head.
        assert!(cache.get(&1, t).is_some());
        cache.put(4, 4, 10, t + Duration::from_secs(60), None, t);
        // Key 2 was the least recently used and should be the one evicted.
        assert!(cache.get(&2, t).is_none());
        assert!(cache.get(&1, t).is_some());
    }

    #[test]
    fn expiry_is_monotonic() {
        let cache: Cache<String, &'static str> = Cache::new(1024);
        let t = now();
        cache.put("k".into(), "v", 10, t + Duration::from_millis(1), None, t);
        let later = t + Duration::from_secs(1);
        assert!(cache.get(&"k".to_string(), later).is_none());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn expire_sweep_evicts_everything_past_its_deadline() {
        let cache: Cache<u32, u32> = Cache::new(1024);
        let t = now();
        cache.put(1, 1, 10, t + Duration::from_secs(1), None, t);
        cache.put(2, 2, 10, t + Duration::from_secs(100), None, t);
        let evicted = cache.expire_sweep(t + Duration::from_secs(2));
        assert_eq!(evicted, 1);
        assert!(cache.get(&1, t).is_none());
        assert!(cache.get(&2, t).is_some());
    }

    #[test]
    fn lease_keeps_a_removed_item_alive_until_dropped() {
        let cache: Cache<String, String> = Cache::new(1024);
        let t = now();
        cache.put("k".into(), "v".into(), 10, t + Duration::from_secs(60), None, t);
        let lease = cache.get(&"k".to_string(), t).unwrap();
        cache.remove(&"k".to_string());
        assert!(cache.get(&"k".to_string(), t).is_none());
        assert!(lease.is_removed());
        assert_eq!(*lease.value(), "v");
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn flush_is_idempotent() {
        let cache: Cache<u32, u32> = Cache::new(1024);
        let t = now();
        cache.put(1, 1, 10, t + Duration::from_secs(60), None, t);
        cache.flush();
        cache.flush();
        assert_eq!(cache.size(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn flush_tag_removes_only_matching_entries_and_is_idempotent() {
        let cache: Cache<u32, u32> = Cache::new(1024);
        let t = now();
        cache.put(1, 1, 10, t + Duration::from_secs(60), Some("T".into()), t);
        cache.put(2, 2, 10, t + Duration::from_secs(60), Some("T".into()), t);
        cache.put(3, 3, 10, t + Duration::from_secs(60), Some("U".into()), t);
        cache.flush_tag("T");
        assert!(cache.get(&1, t).is_none());
        assert!(cache.get(&2, t).is_none());
        assert!(cache.get(&3, t).is_some());
        assert_eq!(cache.size(), 10);
        cache.flush_tag("T");
        assert_eq!(cache.size(), 10);
    }

    #[test]
    fn oversized_item_is_rejected_immediately() {
        let cache: Cache<u32, u32> = Cache::new(50);
        let t = now();
        assert!(!cache.add(1, 1, 100, t + Duration::from_secs(60), None, t));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn in_flight_stores_are_aborted_on_cancel() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let stores = InFlightStores::new();
                let ran = Rc::new(RefCell::new(false));
                let ran_clone = ran.clone();
                stores.spawn(async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    *ran_clone.borrow_mut() = true;
                });
                tokio::task::yield_now().await;
                stores.cancel_all();
                tokio::task::yield_now().await;
                stores.cancel_all();
                assert!(!*ran.borrow());
            })
            .await;
    }

    #[tokio::test]
    async fn dropping_in_flight_stores_cancels_pending_work() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let ran = Rc::new(RefCell::new(false));
                {
                    let stores = InFlightStores::new();
                    let ran_clone = ran.clone();
                    stores.spawn(async move {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        *ran_clone.borrow_mut() = true;
                    });
                    tokio::task::yield_now().await;
                }
                tokio::task::yield_now().await;
                assert!(!*ran.borrow());
            })
            .await;
    }
}
