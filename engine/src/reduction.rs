// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, VecDeque};

use promise::PromiseSender;

use crate::error::{EngineExecuteError, ReduceAbort, TaskError};
use crate::node::{Node, Step, StepId};
use crate::scheduler::Batch;

pub(crate) type Pending<N> = VecDeque<(Step<N>, PromiseSender<<N as Node>::Item, TaskError<<N as Node>::Error>>)>;
pub(crate) type InFlight<N> = HashMap<StepId, PromiseSender<<N as Node>::Item, TaskError<<N as Node>::Error>>>;

/// The submission/await operations a concurrent Engine variant (`ThreadHybridEngine`,
/// `MultiprocessEngine`) must supply; [`reduce`] drives them through the pool-saturation algorithm
/// shared by both, mirroring `ConcurrentEngine.reduce` in the original.
pub(crate) trait ConcurrentOps<N: Node> {
    /// The maximum number of Steps this Engine variant will allow in flight at once.
    fn pool_size(&self) -> usize;

    /// Submits Steps from the front of `pending` until either `pending` has been drawn down to
    /// `n` entries, or `in_flight` has grown to `pool_size`, whichever comes first. Returns the
    /// number of Steps actually dispatched to background work (a Step resolved inline, without
    /// ever entering `in_flight`, does not count).
    fn submit_until(
        &mut self,
        pending: &mut Pending<N>,
        in_flight: &mut InFlight<N>,
        n: usize,
    ) -> Result<usize, ReduceAbort<N::Error>>;

    /// Blocks until exactly one in-flight Step completes, and resolves its Promise. Raises
    /// `InFlightException` if `in_flight` is empty -- this is expected to be a caller bug, not a
    /// recoverable condition (spec.md 4.2).
    fn await_one(&mut self, in_flight: &mut InFlight<N>) -> Result<(), ReduceAbort<N::Error>>;
}

/// The reduction loop shared by every concurrent Engine variant: batches are consumed from the
/// Scheduler in order, each batch's Steps are pushed onto `pending`, and `submit_until`/`await_one`
/// are driven to keep the worker pool saturated without ever allowing more than `pool_size` Steps
/// in flight. After the Scheduler is exhausted, a final drain waits out whatever remains pending or
/// in flight.
///
/// Returns `Ok(())` once every Step has resolved successfully, or `Err(ReduceAbort::Task(..))` as
/// soon as any single Step fails -- the loop abandons the rest of `pending`/`in_flight` at that
/// point rather than continuing to drain them, matching the original's behavior of letting a
/// `TaskError` propagate straight out of `reduce`.
pub(crate) fn reduce<N: Node>(
    batches: impl Iterator<Item = Batch<N>>,
    ops: &mut impl ConcurrentOps<N>,
) -> Result<(), ReduceAbort<N::Error>> {
    let mut pending: Pending<N> = VecDeque::new();
    let mut in_flight: InFlight<N> = HashMap::new();
    let pool_size = ops.pool_size();

    for batch in batches {
        if batch.is_empty() {
            if pending.is_empty() && in_flight.is_empty() {
                return Err(ReduceAbort::Exec(EngineExecuteError::StepBatch(
                    "Scheduler yielded an empty batch with no work pending or in flight".to_string(),
                )));
            }
        } else {
            pending.extend(batch);
            while ops.submit_until(&mut pending, &mut in_flight, pool_size)? > 0 {
                ops.await_one(&mut in_flight)?;
            }
        }

        // Force at least one submission attempt per batch, then drain one completion if anything
        // is in flight, so that a batch's Steps start making progress before the next batch (which
        // may depend on them) is requested from the Scheduler.
        ops.submit_until(&mut pending, &mut in_flight, 0)?;
        if !in_flight.is_empty() {
            ops.await_one(&mut in_flight)?;
        }
    }

    while !pending.is_empty() || !in_flight.is_empty() {
        ops.submit_until(&mut pending, &mut in_flight, pool_size)?;
        ops.await_one(&mut in_flight)?;
    }

    Ok(())
}
