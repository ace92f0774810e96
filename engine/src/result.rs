// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use crate::error::TaskError;
use crate::node::Node;
use crate::scheduler::RootProducts;

/// The outcome of a completed `execute` call. Distinguished from `Result<_, EngineExecuteError>`:
/// a `Failure` here means a Node legitimately failed (an ordinary, expected outcome a caller must
/// handle), while an `Err` returned from `execute` itself means the Engine or its Scheduler are
/// broken.
pub enum EngineResult<N: Node> {
    Finished(RootProducts<N>),
    Failure(TaskError<N::Error>),
}

impl<N: Node> EngineResult<N> {
    pub fn is_finished(&self) -> bool {
        matches!(self, EngineResult::Finished(_))
    }
}

// A plain `#[derive(Debug)]` here would require `N: Debug` to cover `RootProducts<N>` and
// `TaskError<N::Error>`, but `Node`'s associated `Item`/`Error` types carry no such bound -- so the
// bound is stated explicitly on the impl instead, and only applies when the caller's Node actually
// supports it.
impl<N: Node> fmt::Debug for EngineResult<N>
where
    N: fmt::Debug,
    N::Item: fmt::Debug,
    N::Error: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineResult::Finished(root_products) => {
                f.debug_tuple("Finished").field(root_products).finish()
            }
            EngineResult::Failure(e) => f.debug_tuple("Failure").field(e).finish(),
        }
    }
}
