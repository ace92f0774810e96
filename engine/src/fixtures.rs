// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Test-only Node/Scheduler fixtures shared by every Engine variant's test suite and by the
//! cross-engine oracle tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use promise::{Promise, PromiseReceiver};
use serde_derive::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::node::{Node, Step};
use crate::scheduler::{Batch, RootProducts, Scheduler};

/// An arithmetic Node: `value + sum(dependencies)`, or a canned failure if `fail` is set. Its
/// `Builder` is a shared execution counter, letting tests assert how many times a Node actually
/// ran (e.g. that a cache hit skipped a repeat `run`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct CalcNode {
    pub name: &'static str,
    pub value: i64,
    pub cacheable: bool,
    pub async_eligible: bool,
    pub fail: bool,
}

impl CalcNode {
    pub(crate) fn new(name: &'static str, value: i64) -> CalcNode {
        CalcNode {
            name,
            value,
            cacheable: true,
            async_eligible: false,
            fail: false,
        }
    }

    pub(crate) fn cacheable(mut self, cacheable: bool) -> CalcNode {
        self.cacheable = cacheable;
        self
    }

    pub(crate) fn async_eligible(mut self, async_eligible: bool) -> CalcNode {
        self.async_eligible = async_eligible;
        self
    }

    pub(crate) fn failing(mut self) -> CalcNode {
        self.fail = true;
        self
    }
}

impl Node for CalcNode {
    type Builder = Arc<AtomicUsize>;
    type Item = i64;
    type Error = String;

    fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    fn is_async(&self) -> bool {
        self.async_eligible
    }

    fn run(&self, executions: &Arc<AtomicUsize>, dependencies: &[i64]) -> Result<i64, String> {
        executions.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(format!("{} failed", self.name));
        }
        Ok(self.value + dependencies.iter().sum::<i64>())
    }
}

type CalcReceiver = PromiseReceiver<i64, TaskError<String>>;

struct RunState {
    resolved: Vec<Option<i64>>,
    receivers: Vec<Option<CalcReceiver>>,
}

/// A Scheduler over a fixed, already-known linear chain of Nodes (`nodes[0]` has no dependencies;
/// `nodes[i]` depends on `nodes[i - 1]` for `i > 0`), yielding one single-Step batch per Node in
/// dependency order. Reusable across repeated `execute` calls against the same Engine: each
/// `schedule` call resets the run-local dependency-resolution state.
pub(crate) struct LinearChainScheduler {
    executions: Arc<AtomicUsize>,
    nodes: Vec<CalcNode>,
    state: Mutex<RunState>,
}

impl LinearChainScheduler {
    pub(crate) fn new(nodes: Vec<CalcNode>) -> LinearChainScheduler {
        let n = nodes.len();
        LinearChainScheduler {
            executions: Arc::new(AtomicUsize::new(0)),
            nodes,
            state: Mutex::new(RunState {
                resolved: vec![None; n],
                receivers: (0..n).map(|_| None).collect(),
            }),
        }
    }

    pub(crate) fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    fn resolve(&self, index: usize) -> i64 {
        let mut state = self.state.lock();
        if let Some(value) = state.resolved[index] {
            return value;
        }
        let receiver = state.receivers[index]
            .take()
            .expect("dependency receiver already consumed");
        drop(state);
        let value = futures::executor::block_on(receiver.get())
            .expect("dependency Promise dropped without resolving")
            .expect("dependency Step failed");
        self.state.lock().resolved[index] = Some(value);
        value
    }
}

impl Scheduler<CalcNode> for LinearChainScheduler {
    type ExecutionRequest = ();

    fn node_builder(&self) -> Arc<AtomicUsize> {
        self.executions.clone()
    }

    fn schedule<'a>(&'a self, _request: &'a ()) -> Box<dyn Iterator<Item = Batch<CalcNode>> + 'a> {
        // Reset per-run state: the previous run's resolved values/receivers no longer apply.
        {
            let mut state = self.state.lock();
            let n = self.nodes.len();
            state.resolved = vec![None; n];
            state.receivers = (0..n).map(|_| None).collect();
        }
        Box::new((0..self.nodes.len()).map(move |index| {
            let dependency = if index == 0 { None } else { Some(self.resolve(index - 1)) };
            let node = self.nodes[index].clone();
            let (_promise, sender, receiver) = Promise::new();
            self.state.lock().receivers[index] = Some(receiver);
            let step = Step::new(index as u64 + 1, node, dependency.into_iter().collect());
            vec![(step, sender)]
        }))
    }

    fn root_entries(&self, _request: &()) -> RootProducts<CalcNode> {
        let root = self.nodes.len() - 1;
        let value = self.resolve(root);
        let mut entries = HashMap::new();
        entries.insert(self.nodes[root].clone(), value);
        entries
    }
}

/// A malformed Scheduler, for exercising `StepBatchException`: it yields a single empty batch
/// while reporting no pending or in-flight work, which is always a scheduler bug.
pub(crate) struct EmptyBatchScheduler;

impl Scheduler<CalcNode> for EmptyBatchScheduler {
    type ExecutionRequest = ();

    fn node_builder(&self) -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn schedule<'a>(&'a self, _request: &'a ()) -> Box<dyn Iterator<Item = Batch<CalcNode>> + 'a> {
        Box::new(std::iter::once(Vec::new()))
    }

    fn root_entries(&self, _request: &()) -> RootProducts<CalcNode> {
        HashMap::new()
    }
}

/// A Scheduler with no Steps at all: its batch sequence is empty (not a single empty batch, which
/// would trip `StepBatchException`), and its `root_entries` is the empty map. Exercises spec.md
/// 8's "empty scheduler -> Result.finished({})" boundary case.
pub(crate) struct EmptyScheduler;

impl Scheduler<CalcNode> for EmptyScheduler {
    type ExecutionRequest = ();

    fn node_builder(&self) -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn schedule<'a>(&'a self, _request: &'a ()) -> Box<dyn Iterator<Item = Batch<CalcNode>> + 'a> {
        Box::new(std::iter::empty())
    }

    fn root_entries(&self, _request: &()) -> RootProducts<CalcNode> {
        HashMap::new()
    }
}
