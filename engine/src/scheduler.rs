// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;

use promise::PromiseSender;

use crate::error::TaskError;
use crate::node::{Node, Step};

/// The results of a finished `execute`, keyed by the root Nodes of the request.
pub type RootProducts<N> = HashMap<N, <N as Node>::Item>;

/// A `(Step, PromiseSender)` pair: a unit of work paired with the handle an Engine uses to resolve
/// whoever is awaiting it. Renamed from spec.md's literal `(Step, Promise)` pairing to match this
/// workspace's three-way `Promise`/`PromiseSender`/`PromiseReceiver` split -- the Engine holds only
/// the write side.
pub type Batch<N> = Vec<(Step<N>, PromiseSender<<N as Node>::Item, TaskError<<N as Node>::Error>>)>;

/// Produced the dependency graph and decides what becomes runnable next. A Scheduler yields
/// batches lazily: an implementation is expected to hold a `PromiseReceiver` per in-flight Step,
/// await the receivers of one batch, and use their resolutions to build dependency values for the
/// next. An empty batch yielded while no work is pending or in flight is a scheduler bug (spec.md
/// 4.2: `StepBatchException`).
pub trait Scheduler<N: Node>: Send + Sync {
    type ExecutionRequest: Send + Sync;

    /// Produces the stateless callable Steps of this request will be run against.
    fn node_builder(&self) -> N::Builder;

    /// Lazily yields the batches of Steps needed to satisfy `request`, in dependency order.
    fn schedule<'a>(&'a self, request: &'a Self::ExecutionRequest) -> Box<dyn Iterator<Item = Batch<N>> + 'a>;

    /// The root Nodes of `request` and their resolved results, once every batch has completed
    /// successfully.
    fn root_entries(&self, request: &Self::ExecutionRequest) -> RootProducts<N>;
}
