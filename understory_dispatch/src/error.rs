// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Errors reported by blocking and topology-changing calls.

/// Failure of a dispatch call.
///
/// Posting never fails: an event aimed at a disposed context is dropped.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// `pop()` on a stack that has nothing pushed.
    #[error("cannot pop the bottom queue of a stack")]
    EmptyStack,
    /// A blocking call was made from the dispatch thread it would wait on.
    #[error("blocking call made from the dispatch thread it would block")]
    SelfBlock,
    /// The queue passed to `push` already belongs to a stack.
    #[error("queue already belongs to a stack")]
    AlreadyInStack,
    /// A blocked wait was interrupted. The caller may retry.
    #[error("wait interrupted")]
    Interrupted,
    /// The context was disposed before the work could run.
    #[error("context disposed")]
    Disposed,
    /// The dispatched task or handler panicked.
    #[error("dispatched work panicked: {0}")]
    Panicked(String),
}

/// Result alias for dispatch calls.
pub type Result<T, E = DispatchError> = core::result::Result<T, E>;
