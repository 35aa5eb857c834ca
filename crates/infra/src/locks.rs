//! Striped per-key mutual exclusion.
//!
//! Keys hash onto a fixed set of stripes. A multi-key operation locks all of
//! its stripes in ascending stripe order, so two operations can never wait on
//! each other in a cycle.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::{Mutex, MutexGuard, PoisonError};

const DEFAULT_STRIPES: usize = 64;

#[derive(Debug)]
pub struct KeyLocks<K> {
    stripes: Vec<Mutex<()>>,
    _key: PhantomData<fn(&K)>,
}

/// Held stripes; dropping it releases them.
#[must_use = "the locks are released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct KeyGuard<'a> {
    _guards: Vec<MutexGuard<'a, ()>>,
}

impl<K: Hash> Default for KeyLocks<K> {
    fn default() -> Self {
        Self::with_stripes(DEFAULT_STRIPES)
    }
}

impl<K: Hash> KeyLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stripes(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
            _key: PhantomData,
        }
    }

    fn stripe_of(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    pub fn lock(&self, key: &K) -> KeyGuard<'_> {
        self.lock_all(std::slice::from_ref(key))
    }

    /// Lock every key's stripe, deduplicated, in stripe order.
    pub fn lock_all(&self, keys: &[K]) -> KeyGuard<'_> {
        let mut stripes: Vec<usize> = keys.iter().map(|k| self.stripe_of(k)).collect();
        stripes.sort_unstable();
        stripes.dedup();

        // The guarded value is `()`, so a poisoned stripe holds no broken state.
        let guards = stripes
            .into_iter()
            .map(|i| self.stripes[i].lock().unwrap_or_else(PoisonError::into_inner))
            .collect();
        KeyGuard { _guards: guards }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn same_key_is_serialised() {
        let locks = Arc::new(KeyLocks::<u32>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (locks, inside, max_seen) = (locks.clone(), inside.clone(), max_seen.clone());
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = locks.lock(&7);
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn overlapping_key_sets_do_not_deadlock() {
        let locks = Arc::new(KeyLocks::<u32>::with_stripes(4));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let locks = locks.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let keys = if i % 2 == 0 { [1, 2, 3] } else { [3, 2, 1] };
                        let _guard = locks.lock_all(&keys);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn duplicate_keys_lock_once() {
        let locks = KeyLocks::<u32>::new();
        let _guard = locks.lock_all(&[5, 5, 5]);
    }
}
