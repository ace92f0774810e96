// Copyright 2020 Pants project contributors (see CONTRIBUTORS.md).
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

//! A single-assignment result slot awaited by one or more dependents, adapted from
//! `async_value::AsyncValue` to model a terminal success-or-failure outcome (rather than
//! `AsyncValue`'s success-or-abort model): at most one of `success`/`failure` may ever be called,
//! and every receiver observes whichever terminal state was set.

use std::sync::{Arc, Weak};

use tokio::sync::watch;

type Terminal<T, E> = Option<Result<T, E>>;

/// A handle to a Promise's eventual outcome, held by whoever scheduled the work.
pub struct Promise<T: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> {
    outcome_receiver: Weak<watch::Receiver<Terminal<T, E>>>,
}

impl<T: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> Promise<T, E> {
    pub fn new() -> (Promise<T, E>, PromiseSender<T, E>, PromiseReceiver<T, E>) {
        let (outcome_sender, outcome_receiver) = watch::channel(None);
        let outcome_receiver = Arc::new(outcome_receiver);
        (
            Promise {
                outcome_receiver: Arc::downgrade(&outcome_receiver),
            },
            PromiseSender { outcome_sender },
            PromiseReceiver { outcome_receiver },
        )
    }

    /// Returns a receiver for this Promise's outcome, if a receiver is still reachable.
    pub fn receiver(&self) -> Option<PromiseReceiver<T, E>> {
        self.outcome_receiver
            .upgrade()
            .map(|outcome_receiver| PromiseReceiver { outcome_receiver })
    }
}

pub struct PromiseReceiver<T: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> {
    outcome_receiver: Arc<watch::Receiver<Terminal<T, E>>>,
}

impl<T: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> Clone
    for PromiseReceiver<T, E>
{
    fn clone(&self) -> Self {
        PromiseReceiver {
            outcome_receiver: self.outcome_receiver.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> PromiseReceiver<T, E> {
    /// Awaits the terminal state of this Promise. Returns `None` only if every `PromiseSender`
    /// was dropped without resolving the Promise (e.g. the worker handling it panicked).
    pub async fn get(&self) -> Option<Result<T, E>> {
        let mut outcome_receiver = (*self.outcome_receiver).clone();
        loop {
            if let Some(ref outcome) = *outcome_receiver.borrow() {
                return Some(outcome.clone());
            }
            #[allow(clippy::question_mark)]
            if outcome_receiver.changed().await.is_err() {
                return None;
            }
        }
    }
}

pub struct PromiseSender<T: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> {
    outcome_sender: watch::Sender<Terminal<T, E>>,
}

impl<T: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> PromiseSender<T, E> {
    /// Resolves the Promise successfully. At most one of `success`/`failure` may be called; a
    /// second call is a caller bug rather than a recoverable error (`watch::Sender::send` simply
    /// overwrites the already-observed terminal value, which must never happen in practice).
    pub fn success(self, value: T) {
        let _ = self.outcome_sender.send(Some(Ok(value)));
    }

    pub fn failure(self, error: E) {
        let _ = self.outcome_sender.send(Some(Err(error)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn success_is_observed_by_all_receivers() {
        let (promise, sender, receiver_a) = Promise::<i32, String>::new();
        let receiver_b = promise.receiver().unwrap();

        sender.success(7);

        assert_eq!(receiver_a.get().await, Some(Ok(7)));
        assert_eq!(receiver_b.get().await, Some(Ok(7)));
    }

    #[tokio::test]
    async fn failure_is_observed() {
        let (_promise, sender, receiver) = Promise::<i32, String>::new();
        sender.failure("boom".to_string());
        assert_eq!(receiver.get().await, Some(Err("boom".to_string())));
    }

    #[tokio::test]
    async fn get_blocks_until_resolved() {
        let (_promise, sender, receiver) = Promise::<i32, String>::new();
        let waiter = tokio::spawn(async move { receiver.get().await });
        tokio::task::yield_now().await;
        sender.success(1);
        assert_eq!(waiter.await.unwrap(), Some(Ok(1)));
    }

    #[tokio::test]
    async fn receiver_is_none_once_all_receivers_dropped() {
        let (promise, _sender, receiver) = Promise::<i32, String>::new();
        drop(receiver);
        assert!(promise.receiver().is_none());
    }

    #[tokio::test]
    async fn get_returns_none_if_sender_dropped_unresolved() {
        let (_promise, sender, receiver) = Promise::<i32, String>::new();
        drop(sender);
        assert_eq!(receiver.get().await, None);
    }
}
