// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use cache::Cache;
use hashing::Digest;
use storage::Storage;

use crate::error::EngineExecuteError;
use crate::node::{get_by_hash, key_for_request, Node, Step};

/// Shared behavior of every Engine variant, mirroring `Engine._should_cache` /
/// `Engine._maybe_cache_get` / `Engine._maybe_cache_put` in the original: whether a Step's result
/// may come from (and be recorded into) the Cache at all is a property of the Node alone.
pub(crate) fn should_cache<N: Node>(step: &Step<N>) -> bool {
    step.is_cacheable()
}

/// Looks a Step up in the Cache. Returns the Step's keyed Digest (so a caller can `put` a freshly
/// computed result back under the same key without re-keying), and the cached result, if any.
/// Returns `(None, None)` for a Step that is not cacheable at all.
pub(crate) fn maybe_cache_get<N: Node, S: Storage>(
    storage: &S,
    cache: &Cache<S>,
    step: &Step<N>,
) -> Result<(Option<Digest>, Option<N::Item>), EngineExecuteError> {
    if !should_cache(step) {
        return Ok((None, None));
    }
    let keyed = key_for_request(storage, step)?;
    let hit = match cache.get(&keyed.hash) {
        Some(result_hash) => get_by_hash::<S, N::Item>(storage, result_hash)?,
        None => None,
    };
    Ok((Some(keyed), hit))
}

/// Records a freshly computed result into the Cache, if `keyed` is `Some` (i.e. the Step that
/// produced it was cacheable).
pub(crate) fn maybe_cache_put<N: Node, S: Storage>(
    storage: &S,
    cache: &Cache<S>,
    keyed: Option<Digest>,
    item: &N::Item,
) -> Result<(), EngineExecuteError> {
    if let Some(keyed) = keyed {
        let result_digest = storage::put(storage, item)?;
        cache.put(keyed.hash, result_digest.hash);
    }
    Ok(())
}
