// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use storage::StorageError;

/// The result of a failed [`crate::node::Step`]: a Node's own `Error` associate type, wrapped so
/// that it can travel through a `Promise` alongside the programmer-error variants below.
#[derive(Clone, Debug)]
pub struct TaskError<E>(pub E);

impl<E: fmt::Display> fmt::Display for TaskError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task failed: {}", self.0)
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for TaskError<E> {}

/// Programmer-error conditions raised by the reduction loop itself, as distinct from a Node's own
/// `Error`: these indicate a broken Scheduler or a broken Engine, not a failed build step, and are
/// never resolved onto a caller's Promise -- they propagate out of `execute` directly.
#[derive(Debug)]
pub enum EngineExecuteError {
    /// A `Step` was submitted while its `step_id` was already in flight, or `await_one` observed a
    /// completion for a `step_id` it was not tracking.
    InFlight(String),
    /// A Scheduler yielded an empty batch while no work was pending or in flight: the scheduler
    /// made no progress and has nothing left to wait on.
    StepBatch(String),
    /// A value could not be encoded/decoded while crossing a storage or worker boundary.
    Serialization(String),
    /// A concurrent Engine variant's background executor (tokio runtime, worker threads) failed
    /// to start.
    ExecutorStart(String),
}

impl fmt::Display for EngineExecuteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineExecuteError::InFlight(msg) => write!(f, "InFlightException: {msg}"),
            EngineExecuteError::StepBatch(msg) => write!(f, "StepBatchException: {msg}"),
            EngineExecuteError::Serialization(msg) => write!(f, "serialization error: {msg}"),
            EngineExecuteError::ExecutorStart(msg) => write!(f, "failed to start executor: {msg}"),
        }
    }
}

impl std::error::Error for EngineExecuteError {}

impl From<StorageError> for EngineExecuteError {
    fn from(e: StorageError) -> Self {
        EngineExecuteError::Serialization(e.to_string())
    }
}

/// The two ways a reduction loop can unwind: a Node reported an ordinary failure (recorded onto
/// the failing Step's Promise and surfaced as `EngineResult::Failure`), or the loop itself hit a
/// programmer error (propagated out of `execute` as an `Err`). Kept crate-private: callers only
/// ever observe `EngineExecuteError` or `EngineResult`.
pub(crate) enum ReduceAbort<E> {
    Exec(EngineExecuteError),
    Task(TaskError<E>),
}

impl<E> From<EngineExecuteError> for ReduceAbort<E> {
    fn from(e: EngineExecuteError) -> Self {
        ReduceAbort::Exec(e)
    }
}

impl<E> From<StorageError> for ReduceAbort<E> {
    fn from(e: StorageError) -> Self {
        ReduceAbort::Exec(e.into())
    }
}

/// An error produced inside a `StatefulPool` worker, crossing the worker/engine boundary alongside
/// (or instead of) a keyed result.
#[derive(Debug)]
pub enum WorkerError<E> {
    /// The Node itself failed.
    Task(E),
    /// The worker thread panicked while running the Node; caught so that a single bad Node cannot
    /// bring down the pool out from under the other in-flight work.
    Panicked(String),
    /// The request or result could not be serialized/resolved via Storage.
    Serialization(String),
}

impl<E: fmt::Display> fmt::Display for WorkerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Task(e) => write!(f, "{e}"),
            WorkerError::Panicked(msg) => write!(f, "worker panicked: {msg}"),
            WorkerError::Serialization(msg) => write!(f, "worker serialization error: {msg}"),
        }
    }
}
