// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use cache::{Cache, CacheStats};
use storage::Storage;

use crate::core::{maybe_cache_get, maybe_cache_put};
use crate::error::{EngineExecuteError, TaskError};
use crate::result::EngineResult;
use crate::scheduler::Scheduler;

/// The oracle Engine variant: no pools, no concurrency, no `in_flight` map. Every Step of every
/// batch is run inline, in the order the Scheduler produced it, one at a time. Every other Engine
/// variant is required to produce the same `root_entries` as this one for the same Scheduler
/// (spec.md 8), so `LocalSerialEngine` doubles as the reference implementation tests compare
/// against.
pub struct LocalSerialEngine<N: crate::node::Node, Sch: Scheduler<N>, S: Storage> {
    scheduler: Sch,
    storage: S,
    cache: Cache<S>,
}

impl<N: crate::node::Node, Sch: Scheduler<N>, S: Storage> LocalSerialEngine<N, Sch, S> {
    pub fn new(scheduler: Sch, storage: S) -> Self {
        let cache = Cache::new(storage.clone());
        LocalSerialEngine {
            scheduler,
            storage,
            cache,
        }
    }

    /// No-op: there is no pool to warm up.
    pub fn start(&mut self) {}

    /// No pool to tear down, but the Engine still owns Storage and Cache and must release them
    /// (spec.md 4.2: `close()` shuts down pools, closes Cache and Storage).
    pub fn close(&mut self) {
        self.cache.close();
        self.storage.close();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.get_stats()
    }

    pub fn execute(&mut self, request: &Sch::ExecutionRequest) -> Result<EngineResult<N>, EngineExecuteError> {
        let node_builder = self.scheduler.node_builder();

        for batch in self.scheduler.schedule(request) {
            for (step, promise) in batch {
                let (keyed, hit) = maybe_cache_get(&self.storage, &self.cache, &step)?;
                let result = match hit {
                    Some(item) => Ok(item),
                    None => step.call(&node_builder),
                };
                match result {
                    Ok(item) => {
                        maybe_cache_put(&self.storage, &self.cache, keyed, &item)?;
                        promise.success(item);
                    }
                    Err(e) => {
                        promise.failure(TaskError(e.clone()));
                        return Ok(EngineResult::Failure(TaskError(e)));
                    }
                }
            }
        }

        Ok(EngineResult::Finished(self.scheduler.root_entries(request)))
    }
}
