// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
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

//! Runs a dependency graph of [`Node`]s to completion, reusing results across runs via a
//! content-addressed [`cache::Cache`] and, for the concurrent variants, overlapping independent
//! work across a pool. Three Engine variants share the same `Node`/`Scheduler` contract and are
//! required to produce identical results for the same request (spec.md 8):
//!
//! * [`LocalSerialEngine`] -- the oracle: no pools, no concurrency.
//! * [`ThreadHybridEngine`] -- races a cache-fetch against a compute for every async-eligible Step.
//! * [`MultiprocessEngine`] -- dispatches cache misses to a fixed pool of stateful workers.
//!
//! The sibling `execution_graph` crate in this workspace is an independent DAG executor with no
//! cache and no Engine/Node/Scheduler contract of its own: it schedules arbitrary `Work` closures
//! over an explicit job graph instead.

mod config;
mod core;
mod error;
mod multiprocess;
mod node;
mod reduction;
mod result;
mod scheduler;
mod serial;
mod thread_hybrid;

pub use config::EngineConfig;
pub use error::{EngineExecuteError, TaskError, WorkerError};
pub use multiprocess::{MultiprocessEngine, StatefulPool, WorkerInit};
pub use node::{key_for_request, resolve_request, Node, Step, StepId};
pub use result::EngineResult;
pub use scheduler::{Batch, RootProducts, Scheduler};
pub use serial::LocalSerialEngine;
pub use thread_hybrid::ThreadHybridEngine;

#[cfg(test)]
mod fixtures;
#[cfg(test)]
mod oracle_tests;
