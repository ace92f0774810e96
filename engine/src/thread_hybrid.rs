// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::mpsc;

use cache::{Cache, CacheStats};
use storage::Storage;
use task_executor::Executor;

use crate::config::EngineConfig;
use crate::core::{maybe_cache_get, maybe_cache_put};
use crate::error::{EngineExecuteError, ReduceAbort, TaskError};
use crate::node::{get_by_hash, key_for_request, Node, Step, StepId};
use crate::reduction::{reduce, ConcurrentOps, InFlight, Pending};
use crate::result::EngineResult;
use crate::scheduler::Scheduler;

type ProcessedMessage<N> = (StepId, Option<Result<<N as Node>::Item, <N as Node>::Error>>);

/// Hides cache fetch latency behind the compute of every async-eligible Step: on submission, both
/// a cache-fetch and a full compute are dispatched concurrently, and whichever completes first
/// resolves the Step's Promise; the other's result is drained silently once it eventually arrives.
/// Synchronous Steps are executed inline on the engine's own thread, exactly as in
/// `LocalSerialEngine`. Grounded on `ThreadHybridEngine` in the original engine module; the dual
/// submission and its "first completion wins, the loser is dropped" semantics are an open question
/// preserved as-is (see DESIGN.md) rather than resolved to a single strategy.
pub struct ThreadHybridEngine<N: Node, Sch: Scheduler<N>, S: Storage> {
    scheduler: Sch,
    storage: S,
    cache: Cache<S>,
    executor: Executor,
    pool_size: usize,
    node_builder: Option<N::Builder>,
    processed_tx: mpsc::Sender<ProcessedMessage<N>>,
    processed_rx: mpsc::Receiver<ProcessedMessage<N>>,
    async_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl<N: Node, Sch: Scheduler<N>, S: Storage> ThreadHybridEngine<N, Sch, S> {
    pub fn new(scheduler: Sch, storage: S, config: EngineConfig) -> Result<Self, EngineExecuteError> {
        let cache = Cache::new(storage.clone());
        let (processed_tx, processed_rx) = mpsc::channel();
        let executor = Executor::new_owned(1, config.pool_size().max(1))
            .map_err(EngineExecuteError::ExecutorStart)?;
        Ok(ThreadHybridEngine {
            scheduler,
            storage,
            cache,
            executor,
            pool_size: config.pool_size(),
            node_builder: None,
            processed_tx,
            processed_rx,
            async_tasks: Vec::new(),
        })
    }

    pub fn start(&mut self) {
        if self.node_builder.is_none() {
            self.node_builder = Some(self.scheduler.node_builder());
        }
    }

    /// Cancels any still-outstanding background work, shuts down this Engine's owned executor,
    /// and closes the Cache and Storage it owns (spec.md 4.2). Idempotent.
    pub fn close(&mut self) {
        let outstanding = self.async_tasks.len();
        if outstanding > 0 {
            log::debug!("closing ThreadHybridEngine with {outstanding} background tasks outstanding");
        }
        for task in self.async_tasks.drain(..) {
            task.abort();
        }
        self.executor.shutdown(std::time::Duration::from_secs(5));
        self.cache.close();
        self.storage.close();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.get_stats()
    }

    pub fn execute(&mut self, request: &Sch::ExecutionRequest) -> Result<EngineResult<N>, EngineExecuteError> {
        self.start();
        let batches = self.scheduler.schedule(request);
        match reduce(batches, self) {
            Ok(()) => Ok(EngineResult::Finished(self.scheduler.root_entries(request))),
            Err(ReduceAbort::Task(e)) => Ok(EngineResult::Failure(e)),
            Err(ReduceAbort::Exec(e)) => Err(e),
        }
    }

    fn spawn_cache_fetch(&mut self, step_id: StepId, keyed: Option<hashing::Digest>) {
        let storage = self.storage.clone();
        let cache = self.cache.clone();
        let tx = self.processed_tx.clone();
        let task = self.executor.native_spawn_blocking(move || {
            let hit = keyed
                .and_then(|digest| cache.get(&digest.hash))
                .and_then(|result_hash| get_by_hash::<S, N::Item>(&storage, result_hash).ok().flatten());
            let _ = tx.send((step_id, hit.map(Ok)));
        });
        self.async_tasks.push(task);
    }

    fn spawn_compute(&mut self, step: Step<N>, keyed: Option<hashing::Digest>) {
        let node_builder = self
            .node_builder
            .clone()
            .expect("spawn_compute called before start()");
        let storage = self.storage.clone();
        let cache = self.cache.clone();
        let tx = self.processed_tx.clone();
        let step_id = step.step_id;
        let task = self.executor.native_spawn_blocking(move || {
            let result = step.call(&node_builder);
            if let Ok(ref item) = result {
                let _ = maybe_cache_put::<N, S>(&storage, &cache, keyed, item);
            }
            let _ = tx.send((step_id, Some(result)));
        });
        self.async_tasks.push(task);
    }
}

impl<N: Node, Sch: Scheduler<N>, S: Storage> ConcurrentOps<N> for ThreadHybridEngine<N, Sch, S> {
    fn pool_size(&self) -> usize {
        self.pool_size
    }

    fn submit_until(
        &mut self,
        pending: &mut Pending<N>,
        in_flight: &mut InFlight<N>,
        n: usize,
    ) -> Result<usize, ReduceAbort<N::Error>> {
        let to_submit = pending
            .len()
            .saturating_sub(n)
            .min(self.pool_size.saturating_sub(in_flight.len()));
        let mut submitted = 0;
        for _ in 0..to_submit {
            let Some((step, promise)) = pending.pop_front() else {
                break;
            };
            if step.is_async() {
                if in_flight.contains_key(&step.step_id) {
                    return Err(ReduceAbort::Exec(EngineExecuteError::InFlight(format!(
                        "{} is already in_flight!",
                        step.step_id
                    ))));
                }
                let keyed = if step.is_cacheable() {
                    Some(key_for_request(&self.storage, &step)?)
                } else {
                    None
                };
                let step_id = step.step_id;
                in_flight.insert(step_id, promise);
                self.spawn_cache_fetch(step_id, keyed);
                self.spawn_compute(step, keyed);
                submitted += 1;
            } else {
                let (keyed, hit) = maybe_cache_get::<N, S>(&self.storage, &self.cache, &step)?;
                let node_builder = self
                    .node_builder
                    .clone()
                    .expect("submit_until called before start()");
                let result = match hit {
                    Some(item) => Ok(item),
                    None => step.call(&node_builder),
                };
                match result {
                    Ok(item) => {
                        maybe_cache_put::<N, S>(&self.storage, &self.cache, keyed, &item)?;
                        promise.success(item);
                    }
                    Err(e) => {
                        promise.failure(TaskError(e.clone()));
                        return Err(ReduceAbort::Task(TaskError(e)));
                    }
                }
            }
        }
        Ok(submitted)
    }

    fn await_one(&mut self, in_flight: &mut InFlight<N>) -> Result<(), ReduceAbort<N::Error>> {
        if in_flight.is_empty() {
            return Err(ReduceAbort::Exec(EngineExecuteError::InFlight(
                "Awaited an empty pool!".to_string(),
            )));
        }
        loop {
            let (step_id, maybe_result) = self
                .processed_rx
                .recv()
                .map_err(|_| EngineExecuteError::InFlight("background worker channel closed".to_string()))?;
            let Some(result) = maybe_result else {
                // A cache-miss from the fetch half of the race: drained silently.
                continue;
            };
            if !in_flight.contains_key(&step_id) {
                // The sibling task for this Step already resolved its Promise; this is the loser
                // of the race, arriving late. Drop it.
                continue;
            }
            match result {
                Ok(item) => {
                    in_flight.remove(&step_id).unwrap().success(item);
                    return Ok(());
                }
                Err(e) => {
                    in_flight.remove(&step_id).unwrap().failure(TaskError(e.clone()));
                    return Err(ReduceAbort::Task(TaskError(e)));
                }
            }
        }
    }
}
