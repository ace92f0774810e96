// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::hash::Hash;

use hashing::{Digest, Fingerprint};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use storage::{Storage, StorageError};

/// The semantic unit of work. A `Node` is plain data: its identity, its cacheability, its
/// async-eligibility, and the computation it names, but not the computation's already-resolved
/// dependencies -- those belong to the enclosing [`Step`]. Mirrors `graph::Node`, but replaces the
/// original's `NodeTracer`/`NodeVisualizer` capability traits (irrelevant to execution itself) with
/// two plain boolean-returning methods, since Rust has no runtime `isinstance` to dispatch on.
pub trait Node: Clone + Eq + Hash + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// The stateless callable a [`Step`] is executed against. One `Builder` value is produced by
    /// a Scheduler and shared across every Step of a run (and, for `MultiprocessEngine`, cloned
    /// once per worker).
    type Builder: Clone + Send + Sync + 'static;
    /// The Node's result type.
    type Item: Clone + Send + Sync + Serialize + DeserializeOwned + 'static;
    /// The Node's failure type.
    type Error: Clone + Send + Sync + std::fmt::Display + Serialize + DeserializeOwned + 'static;

    /// Whether a successful result for this Node may be recorded in, and satisfied from, the
    /// Cache.
    fn is_cacheable(&self) -> bool;

    /// Whether this Node is eligible for background dispatch (a thread in `ThreadHybridEngine`, a
    /// pool worker in `MultiprocessEngine`) rather than inline execution on the engine's own
    /// thread. `LocalSerialEngine` ignores this entirely.
    fn is_async(&self) -> bool;

    /// Runs this Node to completion against already-resolved dependency results.
    fn run(&self, builder: &Self::Builder, dependencies: &[Self::Item]) -> Result<Self::Item, Self::Error>;
}

pub type StepId = u64;

/// A closed unit of computation: a Node plus its already-resolved dependency Results, identified
/// by a process-local `step_id` assigned by the Scheduler that produced it.
#[derive(Clone)]
pub struct Step<N: Node> {
    pub step_id: StepId,
    pub node: N,
    pub dependencies: Vec<N::Item>,
}

impl<N: Node> Step<N> {
    pub fn new(step_id: StepId, node: N, dependencies: Vec<N::Item>) -> Step<N> {
        Step {
            step_id,
            node,
            dependencies,
        }
    }

    pub fn is_cacheable(&self) -> bool {
        self.node.is_cacheable()
    }

    pub fn is_async(&self) -> bool {
        self.node.is_async()
    }

    pub fn call(&self, builder: &N::Builder) -> Result<N::Item, N::Error> {
        self.node.run(builder, &self.dependencies)
    }
}

/// The wire shape a `Step` is reduced to before it can be used as a cache key or sent across a
/// worker boundary: the Node and its dependencies, each already reduced to a Digest. Dependency
/// order is canonicalized by sorting on the resulting hash, so that two Steps differing only in
/// the order their dependencies happened to resolve in hash identically (spec.md: "Keying must be
/// independent of dependency submission order").
#[derive(Serialize, Deserialize)]
struct KeyedStepPayload {
    node: Digest,
    dependencies: Vec<Digest>,
}

/// Reduces a Step to the Digest that keys its Cache entry (and, for `MultiprocessEngine`, the
/// Digest sent to a worker to re-hydrate the Step). Two Steps with the same Node and the same set
/// of dependency values key identically regardless of the order dependencies were listed in.
pub fn key_for_request<N: Node, S: Storage>(storage: &S, step: &Step<N>) -> Result<Digest, StorageError> {
    let node_digest = storage::put(storage, &step.node)?;
    let mut dependency_digests = step
        .dependencies
        .iter()
        .map(|item| storage::put(storage, item))
        .collect::<Result<Vec<_>, _>>()?;
    dependency_digests.sort_by_key(|digest| digest.hash);
    storage::put(
        storage,
        &KeyedStepPayload {
            node: node_digest,
            dependencies: dependency_digests,
        },
    )
}

/// The inverse of [`key_for_request`]: re-hydrates a Node and its dependency values from a keyed
/// Digest. Returns `Ok(None)` if any part of the payload is missing from storage (e.g. the
/// Storage backing a worker has not yet observed a value a sibling worker wrote). Dependency order
/// is whatever canonical (hash-sorted) order `key_for_request` produced, not the original
/// submission order -- callers must not rely on positional correspondence to anything but the
/// Digests actually embedded in the key.
pub fn resolve_request<N: Node, S: Storage>(
    storage: &S,
    digest: &Digest,
) -> Result<Option<(N, Vec<N::Item>)>, StorageError> {
    let Some(payload): Option<KeyedStepPayload> = storage::get(storage, digest)? else {
        return Ok(None);
    };
    let Some(node): Option<N> = storage::get(storage, &payload.node)? else {
        return Ok(None);
    };
    let mut dependencies = Vec::with_capacity(payload.dependencies.len());
    for dependency_digest in &payload.dependencies {
        let Some(value): Option<N::Item> = storage::get(storage, dependency_digest)? else {
            return Ok(None);
        };
        dependencies.push(value);
    }
    Ok(Some((node, dependencies)))
}

/// Fetches and decodes a value stored under a bare Fingerprint, as returned by `Cache::get`. Both
/// `Storage` implementations key `get_bytes` purely on `digest.hash` and never validate
/// `size_bytes` on read, so a placeholder `size_bytes` of `0` is safe here.
pub(crate) fn get_by_hash<S: Storage, V: DeserializeOwned>(
    storage: &S,
    hash: Fingerprint,
) -> Result<Option<V>, StorageError> {
    storage::get(storage, &Digest::new(hash, 0))
}
