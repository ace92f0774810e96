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

//! Content-addressed byte storage: `put` hashes a value and returns the [`Digest`] it was stored
//! under, `get` is a pure function of that digest. Two backends are provided behind the
//! [`Storage`] trait: an in-memory map (the default) and a single-shard lmdb environment for
//! callers that want a persistent cache across process restarts.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use hashing::{Digest, Fingerprint};
use lmdb::{Cursor, Transaction};
use parking_lot::Mutex;

#[derive(Debug)]
pub enum StorageError {
    /// A value could not be encoded for storage (e.g. the caller's bincode encoding failed).
    Encode(String),
    /// A stored value could not be decoded back into the requested shape.
    Decode(String),
    /// The backend (lmdb, filesystem) returned an error unrelated to encoding.
    Backend(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Encode(msg) => write!(f, "failed to encode value for storage: {msg}"),
            StorageError::Decode(msg) => write!(f, "failed to decode stored value: {msg}"),
            StorageError::Backend(msg) => write!(f, "storage backend error: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// A content-addressed byte store. Implementations must be cheaply cloneable: the engine clones
/// its Storage once per worker to seed a separate-process worker with the same content.
pub trait Storage: Clone + Send + Sync + 'static {
    fn put_bytes(&self, bytes: &[u8]) -> Result<Digest, StorageError>;
    fn get_bytes(&self, digest: &Digest) -> Result<Option<Vec<u8>>, StorageError>;

    /// Releases any resources this backend holds open (e.g. flushes and closes an lmdb
    /// environment). Idempotent; safe to call more than once, including once directly by an
    /// Engine and once via `Cache::close` delegating to the same Storage handle.
    fn close(&self);
}

/// Encodes `value`, stores it, and returns the Digest it was stored under.
pub fn put<S: Storage, V: serde::Serialize>(storage: &S, value: &V) -> Result<Digest, StorageError> {
    let bytes = bincode::serialize(value).map_err(|e| StorageError::Encode(e.to_string()))?;
    storage.put_bytes(&bytes)
}

/// Fetches and decodes the value stored under `digest`, if present.
pub fn get<S: Storage, V: serde::de::DeserializeOwned>(
    storage: &S,
    digest: &Digest,
) -> Result<Option<V>, StorageError> {
    match storage.get_bytes(digest)? {
        Some(bytes) => {
            let value = bincode::deserialize(&bytes).map_err(|e| StorageError::Decode(e.to_string()))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// In-memory Storage backend: the default, and the only backend needed for a single engine
/// process's lifetime (spec.md Non-goals: persistent caches across process restarts are not
/// required for the core contract).
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<HashMap<Fingerprint, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        MemoryStorage::new()
    }
}

impl Storage for MemoryStorage {
    fn put_bytes(&self, bytes: &[u8]) -> Result<Digest, StorageError> {
        let digest = Digest::of_bytes(bytes);
        self.inner
            .lock()
            .entry(digest.hash)
            .or_insert_with(|| bytes.to_vec());
        Ok(digest)
    }

    fn get_bytes(&self, digest: &Digest) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.inner.lock().get(&digest.hash).cloned())
    }

    /// No persistent resources are held open by an in-memory store.
    fn close(&self) {}
}

/// A single, non-sharded lmdb environment. Grounded on `sharded_lmdb::ShardedLmdb`, but without
/// its multi-shard-per-store scheme: at the scale this engine targets, one environment is plenty,
/// and sharding exists upstream to avoid a single giant mmap under heavy concurrent writers, which
/// is out of scope here (see DESIGN.md).
#[derive(Clone)]
pub struct LmdbStorage {
    env: Arc<lmdb::Environment>,
    db: lmdb::Database,
}

impl LmdbStorage {
    const MAX_SIZE: usize = 16 * 1024 * 1024 * 1024;

    pub fn new(path: &Path) -> Result<LmdbStorage, StorageError> {
        std::fs::create_dir_all(path)
            .map_err(|e| StorageError::Backend(format!("creating {path:?}: {e}")))?;
        let env = lmdb::Environment::new()
            .set_flags(lmdb::EnvironmentFlags::NO_SYNC | lmdb::EnvironmentFlags::NO_TLS)
            .set_map_size(Self::MAX_SIZE)
            .set_max_dbs(1)
            .open(path)
            .map_err(|e| StorageError::Backend(format!("opening env at {path:?}: {e}")))?;
        let db = env
            .create_db(None, lmdb::DatabaseFlags::empty())
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        log::debug!("opened lmdb storage at {path:?}");
        Ok(LmdbStorage {
            env: Arc::new(env),
            db,
        })
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        let txn = self
            .env
            .begin_ro_txn()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let mut cursor = txn
            .open_ro_cursor(self.db)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(cursor.iter().count())
    }
}

impl Storage for LmdbStorage {
    fn put_bytes(&self, bytes: &[u8]) -> Result<Digest, StorageError> {
        let digest = Digest::of_bytes(bytes);
        let mut txn = self
            .env
            .begin_rw_txn()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        match txn.put(
            self.db,
            digest.hash.as_bytes(),
            &bytes,
            lmdb::WriteFlags::empty(),
        ) {
            Ok(()) => {}
            // Content-addressed: an existing value under this key is byte-identical.
            Err(lmdb::Error::KeyExist) => {
                log::trace!("lmdb storage: {} already present, skipping write", digest.hash);
            }
            Err(e) => return Err(StorageError::Backend(e.to_string())),
        }
        txn.commit().map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(digest)
    }

    fn get_bytes(&self, digest: &Digest) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self
            .env
            .begin_ro_txn()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        match txn.get(self.db, &digest.hash.as_bytes()) {
            Ok(bytes) => Ok(Some(bytes.to_vec())),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(StorageError::Backend(e.to_string())),
        }
    }

    /// Forces a sync of the lmdb environment to disk. The environment itself closes when the
    /// last `Arc<Environment>` handle is dropped; this just ensures writes are durable first.
    fn close(&self) {
        if let Err(e) = self.env.sync(true) {
            log::warn!("failed to sync lmdb storage on close: {e}");
        }
    }
}
