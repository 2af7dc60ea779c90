//! Bounded in-memory cache shared between filter workers.
//!
//! Used for DNS results, reverse lookups and ignore-command verdicts.
//!
//! # Bounds
//!
//! - At most `max_count` entries are held; inserting into a full cache first
//!   drops expired entries, then the least recently used one.
//! - An entry is dead once it is older than `max_time`. Dead entries are
//!   evicted lazily on access rather than by a background sweeper.
//!
//! All operations take a single `parking_lot` mutex, so concurrent workers
//! observe a consistent map and the bound holds under contention.

use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    last_access: Instant,
}

/// Generic cache bounded by entry count and entry age.
#[derive(Debug)]
pub struct Cache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    max_count: usize,
    max_time: Duration,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache holding at most `max_count` entries for at most `max_time` each.
    pub fn new(max_count: usize, max_time: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_count: max_count.max(1),
            max_time,
        }
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn max_time(&self) -> Duration {
        self.max_time
    }

    /// Look up a live entry, evicting it if it has expired.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired = match entries.get_mut(key) {
            None => return None,
            Some(entry) if now.duration_since(entry.inserted_at) > self.max_time => true,
            Some(entry) => {
                entry.last_access = now;
                return Some(entry.value.clone());
            }
        };
        if expired {
            entries.remove(key);
        }
        None
    }

    /// Look up a live entry or fall back to `default`.
    pub fn get_or<Q>(&self, key: &Q, default: V) -> V
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).unwrap_or(default)
    }

    /// Insert or replace an entry.
    pub fn set(&self, key: K, value: V) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) && entries.len() >= self.max_count {
            let max_time = self.max_time;
            entries.retain(|_, e| now.duration_since(e.inserted_at) <= max_time);
            while entries.len() >= self.max_count {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_access)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        entries.remove(&k);
                    }
                    None => break,
                }
            }
        }
        entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                last_access: now,
            },
        );
    }

    /// Remove an entry. Removing a missing key is a no-op.
    pub fn unset<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of stored entries, live or not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_get_default_and_unset() {
        let c: Cache<&str, i32> = Cache::new(5, Duration::from_secs(60));
        assert_eq!(c.get("k"), None);
        assert_eq!(c.get_or("k", 7), 7);
        c.set("k", 1);
        assert_eq!(c.get("k"), Some(1));
        c.unset("k");
        c.unset("k");
        assert_eq!(c.get("k"), None);
        assert!(c.is_empty());
    }

    #[test]
    fn test_bounded_by_count() {
        let c: Cache<u32, u32> = Cache::new(5, Duration::from_secs(60));
        for i in 0..5 {
            c.set(i, i);
        }
        assert_eq!(c.len(), 5);
        // touch everything but 2 so it becomes the eviction victim
        for i in [0, 1, 3, 4] {
            std::thread::sleep(Duration::from_millis(1));
            assert_eq!(c.get(&i), Some(i));
        }
        c.set(5, 5);
        assert_eq!(c.len(), 5);
        assert_eq!(c.get(&2), None);
        assert_eq!(c.get(&5), Some(5));
    }

    #[test]
    fn test_replace_does_not_evict() {
        let c: Cache<u32, u32> = Cache::new(2, Duration::from_secs(60));
        c.set(1, 1);
        c.set(2, 2);
        c.set(2, 20);
        assert_eq!(c.get(&1), Some(1));
        assert_eq!(c.get(&2), Some(20));
    }

    #[test]
    fn test_expiry() {
        let c: Cache<u32, u32> = Cache::new(5, Duration::from_millis(20));
        for i in 0..5 {
            c.set(i, i);
        }
        std::thread::sleep(Duration::from_millis(40));
        for i in 0..5 {
            assert_eq!(c.get(&i), None);
        }
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn test_concurrent_flood_stays_bounded() {
        let c: Arc<Cache<u32, u32>> = Arc::new(Cache::new(5, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        c.set(t * 1000 + i, i);
                        assert!(c.len() <= 5);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(c.len() <= 5);
    }
}
