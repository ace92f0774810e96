// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use cache::{Cache, CacheStats};
use hashing::Digest;
use parking_lot::Mutex;
use storage::Storage;

use crate::config::EngineConfig;
use crate::core::{maybe_cache_get, maybe_cache_put};
use crate::error::{EngineExecuteError, ReduceAbort, TaskError, WorkerError};
use crate::node::{get_by_hash, resolve_request, Node, Step, StepId};
use crate::reduction::{reduce, ConcurrentOps, InFlight, Pending};
use crate::result::EngineResult;
use crate::scheduler::Scheduler;

/// The state a `StatefulPool` worker needs to execute Steps: a `Node::Builder`, and a Storage
/// handle it can resolve keyed requests against and record results into. Corresponds to
/// `_process_initializer`'s `(node_builder, Storage.clone(storage))` in the original -- the
/// explicit struct here replaces that function's reliance on pickling an implicit closure
/// environment (see SPEC_FULL.md 9: explicit `WorkerInit` in place of a pickling-based
/// initializer).
#[derive(Clone)]
pub struct WorkerInit<N: Node, S: Storage> {
    pub node_builder: N::Builder,
    pub cache: Cache<S>,
}

struct PoolRequest {
    step_id: StepId,
    digest: Digest,
}

struct PoolResponse<E> {
    step_id: StepId,
    outcome: Result<Digest, WorkerError<E>>,
}

/// A fixed-size pool of stateful workers, each initialized exactly once from a `WorkerInit`. Only
/// `Digest`s cross the channel boundary between the engine thread and a worker, in either
/// direction: a request names a keyed Step to re-hydrate and run, and a response names the Digest
/// the computed result was stored under (spec.md 4.2: "IPC bandwidth is bound to the number and
/// size of keys, never to the size of Node values themselves").
///
/// Workers are real OS threads rather than child processes: this crate is generic over a
/// caller-supplied `Node` type, so it cannot ship a concrete, separately-compiled worker binary for
/// a `Node` it does not know about at its own compile time. What the original's process boundary
/// is actually protecting -- that a worker only ever sees keys, never whole dependency graphs of
/// live values -- is preserved by construction here: nothing but `PoolRequest`/`PoolResponse`
/// (both a `StepId` plus a single `Digest`) ever crosses the channel. See DESIGN.md.
pub struct StatefulPool<N: Node, S: Storage> {
    request_tx: mpsc::Sender<PoolRequest>,
    response_rx: mpsc::Receiver<PoolResponse<N::Error>>,
    workers: Vec<JoinHandle<()>>,
}

impl<N: Node, S: Storage> StatefulPool<N, S> {
    pub fn new(pool_size: usize, init: WorkerInit<N, S>, debug: bool) -> Self {
        let (request_tx, request_rx) = mpsc::channel::<PoolRequest>();
        let request_rx = Arc::new(Mutex::new(request_rx));
        let (response_tx, response_rx) = mpsc::channel::<PoolResponse<N::Error>>();

        let workers = (0..pool_size.max(1))
            .map(|worker_index| {
                let request_rx = request_rx.clone();
                let response_tx = response_tx.clone();
                let init = init.clone();
                std::thread::Builder::new()
                    .name(format!("engine-worker-{worker_index}"))
                    .spawn(move || worker_loop::<N, S>(&request_rx, &response_tx, init, debug))
                    .expect("failed to spawn engine worker thread")
            })
            .collect();

        StatefulPool {
            request_tx,
            response_rx,
            workers,
        }
    }

    pub fn submit(&self, step_id: StepId, digest: Digest) {
        let _ = self.request_tx.send(PoolRequest { step_id, digest });
    }

    pub fn await_one_result(&self) -> Result<(StepId, Result<Digest, WorkerError<N::Error>>), EngineExecuteError> {
        let response = self
            .response_rx
            .recv()
            .map_err(|_| EngineExecuteError::InFlight("worker pool channel closed".to_string()))?;
        Ok((response.step_id, response.outcome))
    }

    /// Signals every worker to exit once its current request finishes, and joins them. Idempotent
    /// in the sense that calling `close` twice is safe, but a `StatefulPool` cannot be restarted
    /// once closed.
    pub fn close(self) {
        drop(self.request_tx);
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

fn worker_loop<N: Node, S: Storage>(
    request_rx: &Mutex<mpsc::Receiver<PoolRequest>>,
    response_tx: &mpsc::Sender<PoolResponse<N::Error>>,
    init: WorkerInit<N, S>,
    debug: bool,
) {
    loop {
        let request = {
            let rx = request_rx.lock();
            rx.recv()
        };
        let Ok(request) = request else {
            // The engine side dropped its Sender: no more work is coming.
            return;
        };
        let outcome = execute_one(&init, &request, debug);
        if response_tx
            .send(PoolResponse {
                step_id: request.step_id,
                outcome,
            })
            .is_err()
        {
            return;
        }
    }
}

fn execute_one<N: Node, S: Storage>(
    init: &WorkerInit<N, S>,
    request: &PoolRequest,
    debug: bool,
) -> Result<Digest, WorkerError<N::Error>> {
    let storage = init.cache.storage();
    let (node, dependencies) = resolve_request::<N, S>(storage, &request.digest)
        .map_err(|e| WorkerError::Serialization(e.to_string()))?
        .ok_or_else(|| WorkerError::Serialization("unknown keyed step".to_string()))?;
    let step = Step::new(request.step_id, node, dependencies);

    let run_result = catch_unwind(AssertUnwindSafe(|| step.call(&init.node_builder)));
    let result = match run_result {
        Ok(result) => result,
        Err(payload) => {
            let msg = panic_message(&payload);
            log::error!("worker panicked executing step {}: {msg}", request.step_id);
            return Err(WorkerError::Panicked(msg));
        }
    };

    match result {
        Ok(item) => {
            if debug {
                bincode::serialize(&item).map_err(|e| WorkerError::Serialization(e.to_string()))?;
            }
            let digest = storage::put(storage, &item).map_err(|e| WorkerError::Serialization(e.to_string()))?;
            if step.is_cacheable() {
                init.cache.put(request.digest.hash, digest.hash);
            }
            Ok(digest)
        }
        Err(e) => Err(WorkerError::Task(e)),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked with a non-string payload".to_string()
    }
}

/// Dispatches async-eligible (in this variant, every) Step to a `StatefulPool` on a cache miss,
/// resolving cache hits inline without ever entering `in_flight`. Grounded on
/// `LocalMultiprocessEngine` in the original; see DESIGN.md for the one deliberate departure from
/// it (the original's cache pre-check on this path is effectively dead code, since it tests the
/// truthiness of a 2-tuple that is never `None` -- spec.md's explicit cache-hit-skips-execution
/// invariant is followed here instead).
pub struct MultiprocessEngine<N: Node, Sch: Scheduler<N>, S: Storage> {
    scheduler: Sch,
    storage: S,
    cache: Cache<S>,
    pool_size: usize,
    debug: bool,
    pool: Option<StatefulPool<N, S>>,
}

impl<N: Node, Sch: Scheduler<N>, S: Storage> MultiprocessEngine<N, Sch, S> {
    pub fn new(scheduler: Sch, storage: S, config: EngineConfig) -> Self {
        let cache = Cache::new(storage.clone());
        MultiprocessEngine {
            scheduler,
            storage,
            cache,
            pool_size: config.pool_size(),
            debug: config.debug,
            pool: None,
        }
    }

    /// Starts the worker pool, if it is not already running. Idempotent.
    pub fn start(&mut self) {
        if self.pool.is_some() {
            return;
        }
        log::debug!("starting a {}-worker StatefulPool", self.pool_size);
        let init = WorkerInit {
            node_builder: self.scheduler.node_builder(),
            cache: self.cache.clone(),
        };
        self.pool = Some(StatefulPool::new(self.pool_size, init, self.debug));
    }

    /// Shuts down the worker pool and closes the Cache and Storage this Engine owns (spec.md
    /// 4.2). Idempotent; a later `execute` call will start a fresh pool.
    pub fn close(&mut self) {
        if let Some(pool) = self.pool.take() {
            log::debug!("closing the StatefulPool");
            pool.close();
        }
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
}

impl<N: Node, Sch: Scheduler<N>, S: Storage> ConcurrentOps<N> for MultiprocessEngine<N, Sch, S> {
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
            if in_flight.contains_key(&step.step_id) {
                return Err(ReduceAbort::Exec(EngineExecuteError::InFlight(format!(
                    "{} is already in_flight!",
                    step.step_id
                ))));
            }
            let (keyed, hit) = maybe_cache_get::<N, S>(&self.storage, &self.cache, &step)?;
            match hit {
                Some(item) => promise.success(item),
                None => {
                    let digest = match keyed {
                        Some(digest) => digest,
                        None => crate::node::key_for_request(&self.storage, &step)?,
                    };
                    let step_id = step.step_id;
                    in_flight.insert(step_id, promise);
                    self.pool
                        .as_ref()
                        .expect("submit_until called before start()")
                        .submit(step_id, digest);
                    submitted += 1;
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
        let (step_id, outcome) = self
            .pool
            .as_ref()
            .expect("await_one called before start()")
            .await_one_result()?;
        let promise = in_flight.remove(&step_id).ok_or_else(|| {
            ReduceAbort::Exec(EngineExecuteError::InFlight(format!(
                "Received unexpected work from the Executor: {step_id}"
            )))
        })?;
        match outcome {
            Ok(digest) => {
                let item: N::Item = get_by_hash(&self.storage, digest.hash)?
                    .ok_or_else(|| EngineExecuteError::Serialization("result digest missing from storage".to_string()))?;
                promise.success(item);
                Ok(())
            }
            Err(WorkerError::Task(e)) => {
                promise.failure(TaskError(e.clone()));
                Err(ReduceAbort::Task(TaskError(e)))
            }
            Err(WorkerError::Panicked(msg)) => Err(ReduceAbort::Exec(EngineExecuteError::Serialization(format!(
                "worker panicked: {msg}"
            )))),
            Err(WorkerError::Serialization(msg)) => Err(ReduceAbort::Exec(EngineExecuteError::Serialization(msg))),
        }
    }
}
