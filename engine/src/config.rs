// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

/// Tuning knobs shared by the concurrent Engine variants. Deliberately plain data rather than a
/// dependency on the teacher's `options` crate (see DESIGN.md): this workspace has no CLI/flag
/// surface of its own to integrate with, so a host embedding this crate constructs an
/// `EngineConfig` directly.
#[derive(Clone)]
pub struct EngineConfig {
    /// The maximum number of Steps a concurrent Engine will allow in flight at once. `None` (or
    /// `Some(0)`) defaults to twice the number of logical CPUs, mirroring the original's
    /// `multiprocessing.cpu_count() * 2`.
    pub pool_size: Option<usize>,
    /// Whether a `MultiprocessEngine` worker should additionally round-trip a computed result
    /// through `bincode` before handing it back, to catch non-serializable `Node::Item`s early
    /// rather than only at the point storage actually needs to persist one.
    pub debug: bool,
}

impl EngineConfig {
    pub fn pool_size(&self) -> usize {
        match self.pool_size {
            Some(n) if n > 0 => n,
            _ => 2 * num_cpus::get(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            pool_size: None,
            debug: false,
        }
    }
}
