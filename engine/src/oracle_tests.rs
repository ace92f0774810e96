// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Cross-engine tests: every Engine variant must agree with `LocalSerialEngine`, the oracle, for
//! the same Scheduler and the same request (spec.md 8, third quantified invariant). Each test here
//! is parameterized over the three variants rather than duplicated per-module, since the assertion
//! being made is precisely that they behave identically.

use parameterized::parameterized;
use storage::MemoryStorage;

use crate::config::EngineConfig;
use crate::error::EngineExecuteError;
use crate::fixtures::{CalcNode, EmptyBatchScheduler, EmptyScheduler, LinearChainScheduler};
use crate::multiprocess::MultiprocessEngine;
use crate::result::EngineResult;
use crate::serial::LocalSerialEngine;
use crate::thread_hybrid::ThreadHybridEngine;

fn chain() -> Vec<CalcNode> {
    vec![
        CalcNode::new("a", 1),
        CalcNode::new("b", 2),
        CalcNode::new("c", 3).async_eligible(true),
    ]
}

fn run_variant(variant: usize, scheduler: LinearChainScheduler) -> EngineResult<CalcNode> {
    let storage = MemoryStorage::new();
    match variant {
        0 => {
            let mut engine = LocalSerialEngine::new(scheduler, storage);
            engine.execute(&()).unwrap()
        }
        1 => {
            let mut engine =
                ThreadHybridEngine::new(scheduler, storage, EngineConfig { pool_size: Some(2), debug: false })
                    .unwrap();
            let result = engine.execute(&()).unwrap();
            engine.close();
            result
        }
        2 => {
            let mut engine =
                MultiprocessEngine::new(scheduler, storage, EngineConfig { pool_size: Some(2), debug: false });
            let result = engine.execute(&()).unwrap();
            engine.close();
            result
        }
        other => panic!("unknown engine variant {other}"),
    }
}

#[parameterized(variant = {0, 1, 2})]
fn every_variant_agrees_with_the_oracle_on_a_successful_chain(variant: usize) {
    let nodes = chain();
    let root = nodes.last().unwrap().clone();

    let result = run_variant(variant, LinearChainScheduler::new(nodes));

    match result {
        EngineResult::Finished(root_products) => {
            assert_eq!(root_products.get(&root), Some(&6));
        }
        EngineResult::Failure(e) => panic!("variant {variant} failed unexpectedly: {e}"),
    }
}

#[parameterized(variant = {0, 1, 2})]
fn every_variant_surfaces_a_task_failure_as_engineresult_failure(variant: usize) {
    let nodes = vec![CalcNode::new("a", 1), CalcNode::new("boom", 2).failing()];

    let result = run_variant(variant, LinearChainScheduler::new(nodes));

    match result {
        EngineResult::Finished(root_products) => {
            panic!("variant {variant} unexpectedly finished: {root_products:?}")
        }
        EngineResult::Failure(e) => assert_eq!(e.to_string(), "task failed: boom failed"),
    }
}

#[parameterized(variant = {0, 1, 2})]
fn every_variant_mixes_async_and_inline_steps_identically(variant: usize) {
    let nodes = vec![
        CalcNode::new("a", 10).async_eligible(true),
        CalcNode::new("b", 20).async_eligible(false),
        CalcNode::new("c", 30).async_eligible(true),
    ];
    let root = nodes.last().unwrap().clone();

    let result = run_variant(variant, LinearChainScheduler::new(nodes));

    match result {
        EngineResult::Finished(root_products) => {
            assert_eq!(root_products.get(&root), Some(&60));
        }
        EngineResult::Failure(e) => panic!("variant {variant} failed unexpectedly: {e}"),
    }
}

#[test]
fn empty_scheduler_finishes_with_no_root_products() {
    let storage = MemoryStorage::new();
    let mut engine = LocalSerialEngine::new(EmptyScheduler, storage);
    let result = engine.execute(&()).unwrap();
    match result {
        EngineResult::Finished(root_products) => assert!(root_products.is_empty()),
        EngineResult::Failure(e) => panic!("unexpected failure: {e}"),
    }
}

#[test]
fn cacheable_step_is_not_recomputed_on_a_second_run_through_the_same_cache() {
    let nodes = chain();
    let scheduler = LinearChainScheduler::new(nodes);
    let storage = MemoryStorage::new();
    let mut engine = LocalSerialEngine::new(scheduler, storage);

    engine.execute(&()).unwrap();
    let stats_after_first_run = engine.cache_stats();
    assert_eq!(stats_after_first_run.misses, 3);
    assert_eq!(stats_after_first_run.hits, 0);

    engine.execute(&()).unwrap();
    let stats_after_second_run = engine.cache_stats();
    assert_eq!(stats_after_second_run.hits, 3);
    assert_eq!(stats_after_second_run.misses, 3);
}

#[test]
fn thread_hybrid_raises_step_batch_exception_on_empty_batch_with_no_work_pending() {
    let storage = MemoryStorage::new();
    let mut engine = ThreadHybridEngine::new(EmptyBatchScheduler, storage, EngineConfig::default()).unwrap();
    let err = engine.execute(&()).unwrap_err();
    engine.close();
    assert!(matches!(err, EngineExecuteError::StepBatch(_)));
}

#[test]
fn multiprocess_raises_step_batch_exception_on_empty_batch_with_no_work_pending() {
    let storage = MemoryStorage::new();
    let mut engine = MultiprocessEngine::new(EmptyBatchScheduler, storage, EngineConfig::default());
    let err = engine.execute(&()).unwrap_err();
    engine.close();
    assert!(matches!(err, EngineExecuteError::StepBatch(_)));
}
