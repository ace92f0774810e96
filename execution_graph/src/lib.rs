// Copyright 2015 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

//! A standalone topological-order DAG runner, independent of the reduction-loop `engine` crate.
//! A [`Job`] is a unit of work plus a list of dependency keys and optional success/failure
//! callbacks; an [`ExecutionGraph`] owns a set of Jobs, validates their shape at construction, and
//! drives them to completion against a caller-supplied [`Pool`], cascading failure as logical
//! cancellation rather than interrupting anything already running.

use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::{Condvar, Mutex};

/// A key identifying a Job within a graph. Declared as a bound rather than a concrete type so
/// hosts can use whatever identifier their build-file/target model already has.
pub trait JobKey: Clone + Eq + Hash + Ord + fmt::Display + fmt::Debug + Send + 'static {}
impl<K: Clone + Eq + Hash + Ord + fmt::Display + fmt::Debug + Send + 'static> JobKey for K {}

/// A unit of work submitted to a [`Pool`]. The original Python pool contract unpacks a tuple of
/// arguments (`work.args_tuples[0]`) before invoking `work.func`; in Rust the closure already
/// closes over its arguments, so `Work` is simply a boxed thunk.
pub struct Work {
    func: Box<dyn FnOnce() + Send>,
}

impl Work {
    pub fn new(func: impl FnOnce() + Send + 'static) -> Work {
        Work {
            func: Box::new(func),
        }
    }

    fn run(self) {
        (self.func)()
    }
}

/// The only contract an `ExecutionGraph` needs from its executor. A real pool runs `work` on some
/// other thread; `execute`'s test double `ImmediatelyExecutingPool` below runs it inline, which is
/// also a valid implementation and is what exercises this crate's own test suite.
pub trait Pool: Send + Sync {
    fn submit_async_work(&self, work: Work);
}

/// A pool that runs submitted work synchronously on the caller's thread, for use in tests that
/// want deterministic, single-threaded execution order.
pub struct ImmediatelyExecutingPool;

impl Pool for ImmediatelyExecutingPool {
    fn submit_async_work(&self, work: Work) {
        work.run();
    }
}

/// A unit of work in the graph: a function to run, the keys it depends on, and optional
/// success/failure callbacks run after the work completes.
pub struct Job<K: JobKey> {
    pub key: K,
    pub work: Box<dyn FnOnce() -> Result<(), String> + Send>,
    pub dependencies: Vec<K>,
    pub on_success: Option<Box<dyn FnOnce() -> Result<(), String> + Send>>,
    pub on_failure: Option<Box<dyn FnOnce() -> Result<(), String> + Send>>,
}

impl<K: JobKey> Job<K> {
    pub fn new(
        key: K,
        work: impl FnOnce() -> Result<(), String> + Send + 'static,
        dependencies: Vec<K>,
    ) -> Job<K> {
        Job {
            key,
            work: Box::new(work),
            dependencies,
            on_success: None,
            on_failure: None,
        }
    }

    pub fn on_success(mut self, cb: impl FnOnce() -> Result<(), String> + Send + 'static) -> Job<K> {
        self.on_success = Some(Box::new(cb));
        self
    }

    pub fn on_failure(mut self, cb: impl FnOnce() -> Result<(), String> + Send + 'static) -> Job<K> {
        self.on_failure = Some(Box::new(cb));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Unstarted,
    Queued,
    Success,
    Failed,
    Canceled,
}

#[derive(Debug)]
pub struct JobExistsError(pub String);

impl fmt::Display for JobExistsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for JobExistsError {}

#[derive(Debug)]
pub struct UnknownJobError(pub String);

impl fmt::Display for UnknownJobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for UnknownJobError {}

#[derive(Debug)]
pub struct NoRootJobError(pub String);

impl fmt::Display for NoRootJobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for NoRootJobError {}

#[derive(Debug)]
pub struct ExecutionFailure(pub String);

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for ExecutionFailure {}

/// Raised by `ExecutionGraph::new` when the job set's shape is unexecutable.
#[derive(Debug)]
pub enum ConstructionError {
    JobExists(JobExistsError),
    UnknownJob(UnknownJobError),
    NoRootJob(NoRootJobError),
}

impl fmt::Display for ConstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstructionError::JobExists(e) => write!(f, "{e}"),
            ConstructionError::UnknownJob(e) => write!(f, "{e}"),
            ConstructionError::NoRootJob(e) => write!(f, "{e}"),
        }
    }
}
impl std::error::Error for ConstructionError {}

struct Entry<K: JobKey> {
    job: Option<Job<K>>,
    state: JobState,
    pending_deps: usize,
    /// Forward edges: keys of jobs that declared `self.key` as a dependency, in declaration order.
    dependents: Vec<K>,
}

struct Shared<K: JobKey> {
    entries: FnvHashMap<K, Entry<K>>,
    ready: VecDeque<K>,
    in_flight: usize,
    failed_keys: Vec<K>,
    callback_errors: Vec<String>,
}

/// An independent DAG of [`Job`]s. Validated eagerly at construction; `execute` then drives every
/// Job to `SUCCESS`, `FAILED`, or `CANCELED` against a caller-supplied [`Pool`].
pub struct ExecutionGraph<K: JobKey> {
    shared: Arc<Mutex<Shared<K>>>,
    completions: Arc<Condvar>,
}

impl<K: JobKey> ExecutionGraph<K> {
    pub fn new(jobs: Vec<Job<K>>) -> Result<ExecutionGraph<K>, ConstructionError> {
        if jobs.is_empty() {
            return Err(ConstructionError::NoRootJob(NoRootJobError(
                "Unexecutable graph: No jobs were scheduled.".to_string(),
            )));
        }

        let mut entries: FnvHashMap<K, Entry<K>> = FnvHashMap::default();
        let mut order: Vec<K> = Vec::with_capacity(jobs.len());
        for job in jobs {
            if entries.contains_key(&job.key) {
                return Err(ConstructionError::JobExists(JobExistsError(format!(
                    "Unexecutable graph: Job already scheduled '{}'",
                    job.key
                ))));
            }
            order.push(job.key.clone());
            let pending_deps = job.dependencies.len();
            entries.insert(
                job.key.clone(),
                Entry {
                    job: Some(job),
                    state: JobState::Unstarted,
                    pending_deps,
                    dependents: Vec::new(),
                },
            );
        }

        let mut unknown: Vec<K> = Vec::new();
        for key in &order {
            let deps = entries[key].job.as_ref().unwrap().dependencies.clone();
            for dep in deps {
                if !entries.contains_key(&dep) {
                    if !unknown.contains(&dep) {
                        unknown.push(dep);
                    }
                } else {
                    entries.get_mut(&dep).unwrap().dependents.push(key.clone());
                }
            }
        }

        if !unknown.is_empty() {
            unknown.sort();
            let keys = unknown
                .iter()
                .map(|k| format!("'{k}'"))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ConstructionError::UnknownJob(UnknownJobError(format!(
                "Unexecutable graph: Undefined dependencies {keys}"
            ))));
        }

        let ready: VecDeque<K> = order
            .iter()
            .filter(|key| entries[*key].pending_deps == 0)
            .cloned()
            .collect();

        if ready.is_empty() {
            return Err(ConstructionError::NoRootJob(NoRootJobError(
                "Unexecutable graph: All scheduled jobs have dependencies. \
                 There must be a circular dependency."
                    .to_string(),
            )));
        }

        Ok(ExecutionGraph {
            shared: Arc::new(Mutex::new(Shared {
                entries,
                ready,
                in_flight: 0,
                failed_keys: Vec::new(),
                callback_errors: Vec::new(),
            })),
            completions: Arc::new(Condvar::new()),
        })
    }

    /// Marks every entry reachable from `key` via forward (dependent) edges as `CANCELED`,
    /// skipping any entry that has already finished or already been canceled. These jobs never
    /// run and never fire their own callbacks.
    fn cascade_cancel(shared: &mut Shared<K>, key: &K) {
        let dependents = shared.entries[key].dependents.clone();
        for dependent in dependents {
            let entry = shared.entries.get_mut(&dependent).unwrap();
            if entry.state == JobState::Unstarted {
                entry.state = JobState::Canceled;
                log::debug!("execution_graph: canceling '{dependent}' (ancestor '{key}' failed)");
                Self::cascade_cancel(shared, &dependent);
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn on_job_finished(
        shared: &Arc<Mutex<Shared<K>>>,
        completions: &Arc<Condvar>,
        key: K,
        outcome: Result<(), String>,
        on_success: Option<Box<dyn FnOnce() -> Result<(), String> + Send>>,
        on_failure: Option<Box<dyn FnOnce() -> Result<(), String> + Send>>,
    ) {
        let mut g = shared.lock();

        match outcome {
            Ok(()) => {
                shared_entry_mut(&mut g, &key).state = JobState::Success;
                if let Some(cb) = on_success {
                    if let Err(msg) = cb() {
                        shared_entry_mut(&mut g, &key).state = JobState::Failed;
                        g.callback_errors
                            .push(format!("Error in on_success for {key}: {msg}"));
                    }
                }
            }
            Err(msg) => {
                log::error!("execution_graph: job '{key}' failed: {msg}");
                shared_entry_mut(&mut g, &key).state = JobState::Failed;
                g.failed_keys.push(key.clone());
                if let Some(cb) = on_failure {
                    if let Err(msg2) = cb() {
                        g.callback_errors
                            .push(format!("Error in on_failure for {key}: {msg2}"));
                    }
                }
            }
        }

        if shared_entry_mut(&mut g, &key).state == JobState::Failed {
            Self::cascade_cancel(&mut g, &key);
        }

        let dependents = shared_entry_mut(&mut g, &key).dependents.clone();
        for dependent in dependents {
            let entry = shared_entry_mut(&mut g, &dependent);
            if entry.state == JobState::Canceled {
                continue;
            }
            entry.pending_deps -= 1;
            if entry.pending_deps == 0 {
                entry.state = JobState::Queued;
                g.ready.push_back(dependent);
            }
        }

        g.in_flight -= 1;
        completions.notify_all();
    }

    /// Seeds the ready queue with root jobs and drives every job to completion against `pool`,
    /// blocking the calling thread until nothing is queued or in flight. Siblings of a failed job
    /// still run, as long as they don't transitively depend on it.
    pub fn execute(&self, pool: &dyn Pool) -> Result<(), ExecutionFailure> {
        loop {
            let next = {
                let mut g = self.shared.lock();
                loop {
                    if let Some(key) = g.ready.pop_front() {
                        break Some(key);
                    }
                    if g.in_flight == 0 {
                        break None;
                    }
                    self.completions.wait(&mut g);
                }
            };

            let key = match next {
                Some(key) => key,
                None => break,
            };

            let job = {
                let mut g = self.shared.lock();
                let entry = shared_entry_mut(&mut g, &key);
                entry.state = JobState::Queued;
                g.in_flight += 1;
                entry.job.take().expect("job already taken")
            };

            let shared = self.shared.clone();
            let completions = self.completions.clone();
            log::debug!("execution_graph: submitting '{key}'");
            let work = Work::new(move || {
                let Job {
                    work,
                    on_success,
                    on_failure,
                    key,
                    ..
                } = job;
                let outcome = work();
                ExecutionGraph::on_job_finished(
                    &shared,
                    &completions,
                    key,
                    outcome,
                    on_success,
                    on_failure,
                );
            });
            pool.submit_async_work(work);
        }

        let g = self.shared.lock();
        if !g.callback_errors.is_empty() {
            return Err(ExecutionFailure(g.callback_errors.join("; ")));
        }
        if !g.failed_keys.is_empty() {
            let keys = g
                .failed_keys
                .iter()
                .map(|k| k.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ExecutionFailure(format!("Failed jobs: {keys}")));
        }
        Ok(())
    }
}

fn shared_entry_mut<'a, K: JobKey>(g: &'a mut Shared<K>, key: &K) -> &'a mut Entry<K> {
    g.entries.get_mut(key).expect("unknown job key")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn passing() -> Result<(), String> {
        Ok(())
    }

    fn raising() -> Result<(), String> {
        Err("I'm an error".to_string())
    }

    struct Recorder {
        jobs_run: Arc<StdMutex<Vec<String>>>,
    }

    impl Recorder {
        fn new() -> Recorder {
            Recorder {
                jobs_run: Arc::new(StdMutex::new(Vec::new())),
            }
        }

        fn job(
            &self,
            name: &str,
            ok: bool,
            dependencies: Vec<&str>,
        ) -> Job<String> {
            let jobs_run = self.jobs_run.clone();
            let name_owned = name.to_string();
            Job::new(
                name.to_string(),
                move || {
                    jobs_run.lock().unwrap().push(name_owned);
                    if ok {
                        passing()
                    } else {
                        raising()
                    }
                },
                dependencies.into_iter().map(|s| s.to_string()).collect(),
            )
        }

        fn run(&self) -> Vec<String> {
            self.jobs_run.lock().unwrap().clone()
        }
    }

    fn execute(graph: &ExecutionGraph<String>) -> Result<(), ExecutionFailure> {
        graph.execute(&ImmediatelyExecutingPool)
    }

    #[test]
    fn single_job() {
        let r = Recorder::new();
        let graph = ExecutionGraph::new(vec![r.job("A", true, vec![])]).unwrap();
        execute(&graph).unwrap();
        assert_eq!(r.run(), vec!["A"]);
    }

    #[test]
    fn single_dependency() {
        let r = Recorder::new();
        let graph = ExecutionGraph::new(vec![r.job("A", true, vec!["B"]), r.job("B", true, vec![])])
            .unwrap();
        execute(&graph).unwrap();
        assert_eq!(r.run(), vec!["B", "A"]);
    }

    #[test]
    fn simple_binary_tree() {
        let r = Recorder::new();
        let graph = ExecutionGraph::new(vec![
            r.job("A", true, vec!["B", "C"]),
            r.job("B", true, vec![]),
            r.job("C", true, vec![]),
        ])
        .unwrap();
        execute(&graph).unwrap();
        assert_eq!(r.run(), vec!["B", "C", "A"]);
    }

    #[test]
    fn simple_linear_dependencies() {
        let r = Recorder::new();
        let graph = ExecutionGraph::new(vec![
            r.job("A", true, vec!["B"]),
            r.job("B", true, vec!["C"]),
            r.job("C", true, vec![]),
        ])
        .unwrap();
        execute(&graph).unwrap();
        assert_eq!(r.run(), vec!["C", "B", "A"]);
    }

    #[test]
    fn simple_unconnected() {
        let r = Recorder::new();
        let graph =
            ExecutionGraph::new(vec![r.job("A", true, vec![]), r.job("B", true, vec![])]).unwrap();
        execute(&graph).unwrap();
        assert_eq!(r.run(), vec!["A", "B"]);
    }

    #[test]
    fn simple_unconnected_tree() {
        let r = Recorder::new();
        let graph = ExecutionGraph::new(vec![
            r.job("A", true, vec!["B"]),
            r.job("B", true, vec![]),
            r.job("C", true, vec![]),
        ])
        .unwrap();
        execute(&graph).unwrap();
        assert_eq!(r.run(), vec!["B", "C", "A"]);
    }

    #[test]
    fn dependee_depends_on_dependency_of_its_dependency() {
        let r = Recorder::new();
        let graph = ExecutionGraph::new(vec![
            r.job("A", true, vec!["B", "C"]),
            r.job("B", true, vec!["C"]),
            r.job("C", true, vec![]),
        ])
        .unwrap();
        execute(&graph).unwrap();
        assert_eq!(r.run(), vec!["C", "B", "A"]);
    }

    #[test]
    fn one_failure_raises_exception() {
        let r = Recorder::new();
        let graph = ExecutionGraph::new(vec![r.job("A", false, vec![])]).unwrap();
        let err = execute(&graph).unwrap_err();
        assert_eq!(err.to_string(), "Failed jobs: A");
    }

    #[test]
    fn failure_of_dependency_does_not_run_dependents() {
        let r = Recorder::new();
        let graph = ExecutionGraph::new(vec![r.job("A", true, vec!["F"]), r.job("F", false, vec![])])
            .unwrap();
        let err = execute(&graph).unwrap_err();
        assert_eq!(r.run(), vec!["F"]);
        assert_eq!(err.to_string(), "Failed jobs: F");
    }

    #[test]
    fn failure_of_dependency_does_not_run_second_order_dependents() {
        let r = Recorder::new();
        let graph = ExecutionGraph::new(vec![
            r.job("A", true, vec!["B"]),
            r.job("B", true, vec!["F"]),
            r.job("F", false, vec![]),
        ])
        .unwrap();
        let err = execute(&graph).unwrap_err();
        assert_eq!(r.run(), vec!["F"]);
        assert_eq!(err.to_string(), "Failed jobs: F");
    }

    #[test]
    fn failure_of_one_leg_of_tree_does_not_cancel_other() {
        let r = Recorder::new();
        let graph = ExecutionGraph::new(vec![
            r.job("B", true, vec![]),
            r.job("F", false, vec!["B"]),
            r.job("A", true, vec!["B"]),
        ])
        .unwrap();
        let err = execute(&graph).unwrap_err();
        assert_eq!(r.run(), vec!["B", "F", "A"]);
        assert_eq!(err.to_string(), "Failed jobs: F");
    }

    #[test]
    fn failure_of_disconnected_job_does_not_cancel_non_dependents() {
        let r = Recorder::new();
        let graph =
            ExecutionGraph::new(vec![r.job("A", true, vec![]), r.job("F", false, vec![])]).unwrap();
        execute(&graph).unwrap_err();
        assert_eq!(r.run(), vec!["A", "F"]);
    }

    #[test]
    fn cycle_in_graph_causes_failure() {
        let err = ExecutionGraph::new(vec![
            Job::new("A".to_string(), passing, vec!["B".to_string()]),
            Job::new("B".to_string(), passing, vec!["A".to_string()]),
        ])
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unexecutable graph: All scheduled jobs have dependencies. \
             There must be a circular dependency."
        );
    }

    #[test]
    fn non_existent_dependency_causes_failure() {
        let err = ExecutionGraph::new(vec![
            Job::new("A".to_string(), passing, vec![]),
            Job::new("B".to_string(), passing, vec!["Z".to_string()]),
        ])
        .unwrap_err();
        assert_eq!(err.to_string(), "Unexecutable graph: Undefined dependencies 'Z'");
    }

    #[test]
    fn on_success_callback_raises_error() {
        let graph = ExecutionGraph::new(vec![Job::new("A".to_string(), passing, vec![])
            .on_success(raising)])
        .unwrap();
        let err = execute(&graph).unwrap_err();
        assert_eq!(err.to_string(), "Error in on_success for A: I'm an error");
    }

    #[test]
    fn on_failure_callback_raises_error() {
        let graph = ExecutionGraph::new(vec![Job::new("A".to_string(), raising, vec![])
            .on_failure(raising)])
        .unwrap();
        let err = execute(&graph).unwrap_err();
        assert_eq!(err.to_string(), "Error in on_failure for A: I'm an error");
    }

    #[test]
    fn same_key_scheduled_twice_is_error() {
        let err = ExecutionGraph::new(vec![
            Job::new("Same".to_string(), passing, vec![]),
            Job::new("Same".to_string(), passing, vec![]),
        ])
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unexecutable graph: Job already scheduled 'Same'"
        );
    }

    #[test]
    fn no_jobs_scheduled_is_error() {
        let err = ExecutionGraph::<String>::new(vec![]).unwrap_err();
        assert_eq!(err.to_string(), "Unexecutable graph: No jobs were scheduled.");
    }
}
