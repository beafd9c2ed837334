/// `scripting/cache.rs` — bounded loading cache with single-flight loads
///
/// Backs both the script record cache and the script index cache. A miss is
/// loaded by exactly one caller while concurrent callers for the same key
/// wait on the in-flight load and share its outcome. Failures are handed to
/// the waiters and then forgotten. A loader that panics counts as a failure.
use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use super::error::LoadError;

pub type LoadResult<V> = Result<V, Arc<LoadError>>;

type Loader<V> = Box<dyn Fn(&str) -> Result<V, LoadError> + Send + Sync>;

/// When a cached value stops being served as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Dropped once it has not been read for the given duration.
    AfterAccess(Duration),
    /// Reloaded by the first reader after the given age. Other readers keep
    /// the stale value until the reload lands; a failed reload keeps it.
    RefreshAfterWrite(Duration),
}

struct Entry<V> {
    value: V,
    written: Instant,
    accessed: Instant,
    refreshing: bool,
}

impl<V> Entry<V> {
    fn fresh(value: V) -> Self {
        let now = Instant::now();
        Self {
            value,
            written: now,
            accessed: now,
            refreshing: false,
        }
    }
}

struct Flight<V> {
    outcome: Mutex<Option<LoadResult<V>>>,
    done: Condvar,
}

impl<V: Clone> Flight<V> {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn wait(&self) -> LoadResult<V> {
        let mut outcome = lock(&self.outcome);
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            outcome = self.done.wait(outcome).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn finish(&self, result: LoadResult<V>) {
        *lock(&self.outcome) = Some(result);
        self.done.notify_all();
    }
}

enum Slot<V> {
    Ready(Entry<V>),
    Loading(Arc<Flight<V>>),
}

enum Lookup<V> {
    Hit(V),
    Wait(Arc<Flight<V>>),
    Load(Arc<Flight<V>>),
    Refresh(V),
}

pub struct LoadingCache<V> {
    name: &'static str,
    max_entries: usize,
    expiry: Expiry,
    loader: Loader<V>,
    slots: Mutex<HashMap<String, Slot<V>>>,
}

impl<V: Clone + Send + Sync + 'static> LoadingCache<V> {
    pub fn new<F>(name: &'static str, max_entries: usize, expiry: Expiry, loader: F) -> Self
    where
        F: Fn(&str) -> Result<V, LoadError> + Send + Sync + 'static,
    {
        Self {
            name,
            max_entries,
            expiry,
            loader: Box::new(loader),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> LoadResult<V> {
        match self.lookup(key, Instant::now()) {
            Lookup::Hit(value) => Ok(value),
            Lookup::Wait(flight) => flight.wait(),
            Lookup::Load(flight) => self.load(key, &flight),
            Lookup::Refresh(stale) => Ok(self.refresh(key, stale)),
        }
    }

    pub fn invalidate(&self, key: &str) {
        lock(&self.slots).remove(key);
    }

    pub fn invalidate_all(&self) {
        lock(&self.slots).clear();
    }

    /// Number of loaded values currently held.
    pub fn len(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &str, now: Instant) -> Lookup<V> {
        let mut slots = lock(&self.slots);
        match slots.get_mut(key) {
            Some(Slot::Loading(flight)) => return Lookup::Wait(Arc::clone(flight)),
            Some(Slot::Ready(entry)) => match self.expiry {
                Expiry::AfterAccess(ttl) => {
                    if now.saturating_duration_since(entry.accessed) <= ttl {
                        entry.accessed = now;
                        return Lookup::Hit(entry.value.clone());
                    }
                }
                Expiry::RefreshAfterWrite(interval) => {
                    entry.accessed = now;
                    if entry.refreshing || now.saturating_duration_since(entry.written) < interval {
                        return Lookup::Hit(entry.value.clone());
                    }
                    entry.refreshing = true;
                    return Lookup::Refresh(entry.value.clone());
                }
            },
            None => {}
        }
        let flight = Arc::new(Flight::new());
        slots.insert(key.to_string(), Slot::Loading(Arc::clone(&flight)));
        Lookup::Load(flight)
    }

    fn load(&self, key: &str, flight: &Flight<V>) -> LoadResult<V> {
        let result = self.call_loader(key).map_err(Arc::new);
        {
            let mut slots = lock(&self.slots);
            match &result {
                Ok(value) => {
                    slots.insert(key.to_string(), Slot::Ready(Entry::fresh(value.clone())));
                    self.evict(&mut slots, key);
                }
                Err(e) => {
                    slots.remove(key);
                    log::debug!("[script] {} cache: load of {} failed: {}", self.name, key, e);
                }
            }
        }
        flight.finish(result.clone());
        result
    }

    fn refresh(&self, key: &str, stale: V) -> V {
        let result = self.call_loader(key);
        let mut slots = lock(&self.slots);
        match result {
            Ok(value) => {
                slots.insert(key.to_string(), Slot::Ready(Entry::fresh(value.clone())));
                self.evict(&mut slots, key);
                value
            }
            Err(e) => {
                log::warn!(
                    "[script] {} cache: refresh of {} failed, keeping previous value: {}",
                    self.name,
                    key,
                    e
                );
                if let Some(Slot::Ready(entry)) = slots.get_mut(key) {
                    entry.refreshing = false;
                    entry.written = Instant::now();
                }
                stale
            }
        }
    }

    fn call_loader(&self, key: &str) -> Result<V, LoadError> {
        panic::catch_unwind(AssertUnwindSafe(|| (self.loader)(key))).unwrap_or_else(|_| {
            log::error!("[script] {} cache: loader panicked for {}", self.name, key);
            Err(LoadError::Panicked(key.to_string()))
        })
    }

    /// Purges expired entries, then the least recently read ones, until the
    /// bound holds. `keep` is the entry just written.
    fn evict(&self, slots: &mut HashMap<String, Slot<V>>, keep: &str) {
        let ready = |slots: &HashMap<String, Slot<V>>| {
            slots.values().filter(|slot| matches!(slot, Slot::Ready(_))).count()
        };
        if ready(slots) <= self.max_entries {
            return;
        }
        if let Expiry::AfterAccess(ttl) = self.expiry {
            let now = Instant::now();
            slots.retain(|k, slot| match slot {
                Slot::Ready(entry) => k == keep || now.saturating_duration_since(entry.accessed) <= ttl,
                Slot::Loading(_) => true,
            });
        }
        while ready(slots) > self.max_entries {
            let victim = slots
                .iter()
                .filter(|(k, _)| k.as_str() != keep)
                .filter_map(|(k, slot)| match slot {
                    Slot::Ready(entry) => Some((k, entry.accessed)),
                    Slot::Loading(_) => None,
                })
                .min_by_key(|(_, accessed)| *accessed)
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    slots.remove(&k);
                }
                None => break,
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier,
        },
        thread,
    };

    fn counting_cache(expiry: Expiry, max: usize) -> (Arc<LoadingCache<String>>, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let cache = LoadingCache::new("test", max, expiry, move |key: &str| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("{key}#{n}"))
        });
        (Arc::new(cache), loads)
    }

    // ── Loading ───────────────────────────────────────────────────────────────

    #[test]
    fn hits_do_not_reload() {
        let (cache, loads) = counting_cache(Expiry::AfterAccess(Duration::from_secs(60)), 10);
        assert_eq!(cache.get("a").unwrap(), "a#1");
        assert_eq!(cache.get("a").unwrap(), "a#1");
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_misses_share_one_load() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let cache = Arc::new(LoadingCache::new(
            "test",
            10,
            Expiry::AfterAccess(Duration::from_secs(60)),
            move |key: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(100));
                Ok(key.to_uppercase())
            },
        ));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get("k")
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), "K");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failures_are_not_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let cache = LoadingCache::new(
            "test",
            10,
            Expiry::AfterAccess(Duration::from_secs(60)),
            move |key: &str| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(LoadError::NotFound(key.to_string()))
                } else {
                    Ok(1)
                }
            },
        );
        assert!(matches!(cache.get("a").unwrap_err().as_ref(), LoadError::NotFound(k) if k == "a"));
        assert!(cache.is_empty());
        assert_eq!(cache.get("a").unwrap(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_loader_releases_waiters_and_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let cache = Arc::new(LoadingCache::new(
            "test",
            10,
            Expiry::AfterAccess(Duration::from_secs(60)),
            move |key: &str| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    thread::sleep(Duration::from_millis(100));
                    panic!("content store blew up");
                }
                Ok(key.to_uppercase())
            },
        ));
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get("k")
                })
            })
            .collect();
        for handle in handles {
            let err = handle.join().unwrap().unwrap_err();
            assert!(matches!(err.as_ref(), LoadError::Panicked(k) if k == "k"));
        }
        assert!(cache.is_empty());
        assert_eq!(cache.get("k").unwrap(), "K");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_refresh_keeps_the_previous_value() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let cache = LoadingCache::new(
            "test",
            1,
            Expiry::RefreshAfterWrite(Duration::from_millis(20)),
            move |_: &str| match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Ok("first".to_string()),
                1 => panic!("refresh blew up"),
                _ => Ok("third".to_string()),
            },
        );
        assert_eq!(cache.get("index").unwrap(), "first");
        thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get("index").unwrap(), "first");
        thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get("index").unwrap(), "third");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    // ── Expiry ────────────────────────────────────────────────────────────────

    #[test]
    fn idle_entries_expire_after_access() {
        let (cache, loads) = counting_cache(Expiry::AfterAccess(Duration::from_millis(50)), 10);
        cache.get("a").unwrap();
        thread::sleep(Duration::from_millis(120));
        assert_eq!(cache.get("a").unwrap(), "a#2");
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn refresh_after_write_reloads_old_entries() {
        let (cache, _) = counting_cache(Expiry::RefreshAfterWrite(Duration::from_millis(50)), 1);
        assert_eq!(cache.get("index").unwrap(), "index#1");
        assert_eq!(cache.get("index").unwrap(), "index#1");
        thread::sleep(Duration::from_millis(120));
        assert_eq!(cache.get("index").unwrap(), "index#2");
    }

    #[test]
    fn failed_refresh_keeps_the_previous_value() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let cache = LoadingCache::new(
            "test",
            1,
            Expiry::RefreshAfterWrite(Duration::from_millis(20)),
            move |key: &str| match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Ok("first".to_string()),
                _ => Err(LoadError::NotFound(key.to_string())),
            },
        );
        assert_eq!(cache.get("index").unwrap(), "first");
        thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get("index").unwrap(), "first");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    // ── Bounds ────────────────────────────────────────────────────────────────

    #[test]
    fn evicts_least_recently_read_beyond_capacity() {
        let (cache, loads) = counting_cache(Expiry::AfterAccess(Duration::from_secs(60)), 2);
        cache.get("a").unwrap();
        thread::sleep(Duration::from_millis(5));
        cache.get("b").unwrap();
        thread::sleep(Duration::from_millis(5));
        cache.get("a").unwrap();
        thread::sleep(Duration::from_millis(5));
        cache.get("c").unwrap();
        assert_eq!(cache.len(), 2);

        // "b" was read least recently and had to go.
        assert_eq!(cache.get("a").unwrap(), "a#1");
        assert_eq!(cache.get("b").unwrap(), "b#4");
        assert_eq!(loads.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn invalidate_forces_a_reload() {
        let (cache, _) = counting_cache(Expiry::AfterAccess(Duration::from_secs(60)), 10);
        cache.get("a").unwrap();
        cache.get("b").unwrap();
        cache.invalidate("a");
        assert_eq!(cache.get("a").unwrap(), "a#3");
        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
