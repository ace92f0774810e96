// Copyright 2017 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! A Cache is a mapping `keyed_step -> keyed_result`. It delegates all value storage to a
//! [`Storage`] backend and holds only the key-to-key bindings itself, mirroring
//! `cache::PersistentCache`'s relationship to its backing `ShardedLmdb`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashing::Fingerprint;
use parking_lot::Mutex;
use storage::Storage;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// A `keyed_step -> keyed_result` mapping over a Storage backend.
///
/// `get` is O(1) expected. `put` is idempotent and commutative: concurrent `put`s of the same key
/// are permitted to race, and the last writer simply wins -- there is no build-lock per key here.
/// Callers wanting strict at-most-once-per-key behavior must front the cache with their own
/// single-flight map keyed by `keyed_step` (spec.md 4.1); the Engine's `in_flight` map is exactly
/// that front.
#[derive(Clone)]
pub struct Cache<S: Storage> {
    storage: S,
    bindings: Arc<Mutex<HashMap<Fingerprint, Fingerprint>>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl<S: Storage> Cache<S> {
    pub fn new(storage: S) -> Cache<S> {
        Cache {
            storage,
            bindings: Arc::new(Mutex::new(HashMap::new())),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Looks up the keyed_result bound to `keyed_step`, if any has been recorded.
    pub fn get(&self, keyed_step: &Fingerprint) -> Option<Fingerprint> {
        let result = self.bindings.lock().get(keyed_step).copied();
        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Records that `keyed_step` produced `keyed_result`. Idempotent: re-recording the same
    /// binding is a no-op race, not an error. Once a binding for a key is observed non-empty by
    /// `get`, it is never removed -- only ever potentially overwritten by a racing `put` of the
    /// same key (spec.md 8: `Cache.get` is monotonic).
    pub fn put(&self, keyed_step: Fingerprint, keyed_result: Fingerprint) {
        self.bindings.lock().insert(keyed_step, keyed_result);
        log::debug!("cache: recorded binding {keyed_step} -> {keyed_result}");
    }

    pub fn get_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Releases this Cache's resources by closing its backing Storage. A Cache owns no value
    /// bytes of its own (only key-to-key bindings), so there is nothing else here to close.
    pub fn close(&self) {
        self.storage.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemoryStorage;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::from_bytes_unsafe(&[byte; 32])
    }

    #[test]
    fn miss_then_hit() {
        let cache = Cache::new(MemoryStorage::new());
        assert_eq!(cache.get(&fp(1)), None);
        cache.put(fp(1), fp(2));
        assert_eq!(cache.get(&fp(1)), Some(fp(2)));

        let stats = cache.get_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn put_is_idempotent() {
        let cache = Cache::new(MemoryStorage::new());
        cache.put(fp(1), fp(2));
        cache.put(fp(1), fp(2));
        assert_eq!(cache.get(&fp(1)), Some(fp(2)));
    }

    #[test]
    fn get_is_monotonic_once_populated() {
        let cache = Cache::new(MemoryStorage::new());
        cache.put(fp(9), fp(10));
        for _ in 0..3 {
            assert_eq!(cache.get(&fp(9)), Some(fp(10)));
        }
    }

    #[test]
    fn distinct_keys_are_independent() {
        let cache = Cache::new(MemoryStorage::new());
        cache.put(fp(1), fp(2));
        assert_eq!(cache.get(&fp(3)), None);
    }

    #[test]
    fn close_is_idempotent_and_delegates_to_storage() {
        let cache = Cache::new(MemoryStorage::new());
        cache.put(fp(1), fp(2));
        cache.close();
        cache.close();
        assert_eq!(cache.get(&fp(1)), Some(fp(2)));
    }
}
