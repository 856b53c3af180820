// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Secondary loops: nested pumps that keep a context's events flowing while a
//! caller blocks.
//!
//! A loop entered on the context's dispatch thread dispatches events itself,
//! recursively inside whatever handler entered it. A loop entered on any other
//! thread makes sure the dispatch thread is running and parks until the loop
//! ends.
//!
//! Each running loop installs a [`LoopFrame`] on its stack. Frames hold the
//! loop's filter and exit flag. While any frames are installed, only events
//! admitted by all of them are dispatched; rejected events stay queued until
//! the restricting loop ends.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use understory_dispatch::{Context, Event, Runtime};
//!
//! let runtime: Runtime<u32, ()> = Runtime::new();
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&seen);
//! let cx = runtime.create_context("modal", move |_: &Context<u32, ()>, _: Event<u32, ()>| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! for _ in 0..3 {
//!     cx.post(Event::other(1, ()));
//! }
//! let probe = Arc::clone(&seen);
//! let modal = cx
//!     .secondary_loop()
//!     .with_predicate(move || probe.load(Ordering::SeqCst) >= 3)
//!     .build();
//! assert!(modal.enter());
//! assert_eq!(seen.load(Ordering::SeqCst), 3);
//! ```

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crate::context::Context;
use crate::event::{Filter, QueuedEvent, Source, panic_message};
use crate::stack::{EventQueue, QueueId};
use crate::thread::{dispatch_next, ensure_thread};

type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;

const IDLE: u8 = 0;
const EXIT_PENDING: u8 = 1;
const ACTIVE: u8 = 2;
const EXITING: u8 = 3;

/// One secondary loop, as seen by the stack it pumps.
pub(crate) struct LoopFrame<S, U> {
    id: u64,
    /// Root queue of the context that entered the loop. The frame follows
    /// this queue when it is pushed or popped.
    pub(crate) queue: QueueId,
    filter: Option<Filter<S, U>>,
    /// One of `IDLE`, `EXIT_PENDING`, `ACTIVE`, `EXITING`.
    state: AtomicU8,
}

impl<S, U> LoopFrame<S, U> {
    /// Whether the loop's filter lets `event` through. A panicking filter
    /// rejects the event.
    pub(crate) fn admits(&self, event: &QueuedEvent<S, U>) -> bool {
        let Some(filter) = &self.filter else {
            return true;
        };
        match catch_unwind(AssertUnwindSafe(|| filter(event))) {
            Ok(admitted) => admitted,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(loop_id = self.id, %message, "secondary loop filter panicked");
                false
            }
        }
    }

    /// Ask the loop to end. Returns whether this call ended a running loop.
    pub(crate) fn request_exit(&self) -> bool {
        let prev = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| match state {
                IDLE => Some(EXIT_PENDING),
                ACTIVE => Some(EXITING),
                _ => None,
            });
        prev == Ok(ACTIVE)
    }

    fn exit_requested(&self) -> bool {
        self.state.load(Ordering::Acquire) == EXITING
    }

    fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) >= ACTIVE
    }
}

/// A reentrant nested event loop on a [`Context`].
///
/// Create one with [`Context::create_secondary_loop`] or
/// [`Context::secondary_loop`]. Clones share the same loop, so a clone can be
/// handed to another thread or handler to [`exit`](SecondaryLoop::exit) it.
pub struct SecondaryLoop<S, U> {
    cx: Context<S, U>,
    frame: Arc<LoopFrame<S, U>>,
    until: Predicate,
    timeout: Option<Duration>,
}

impl<S, U> Clone for SecondaryLoop<S, U> {
    fn clone(&self) -> Self {
        Self {
            cx: self.cx.clone(),
            frame: Arc::clone(&self.frame),
            until: Arc::clone(&self.until),
            timeout: self.timeout,
        }
    }
}

impl<S, U> fmt::Debug for SecondaryLoop<S, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondaryLoop")
            .field("id", &self.frame.id)
            .field("context", &self.cx.name())
            .field("filtered", &self.frame.filter.is_some())
            .field("timeout", &self.timeout)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Removes a loop's frame from whichever stack holds it.
struct Installed<'a, S, U> {
    queue: &'a EventQueue<S, U>,
    frame: &'a LoopFrame<S, U>,
}

impl<S, U> Drop for Installed<'_, S, U> {
    fn drop(&mut self) {
        let id = self.frame.id;
        self.queue.with_stack(|stack, state| {
            state.loops.retain(|frame| frame.id != id);
            stack.cond.notify_all();
        });
        self.frame.state.store(IDLE, Ordering::Release);
    }
}

impl<S, U> SecondaryLoop<S, U> {
    pub(crate) fn new(
        cx: Context<S, U>,
        until: Predicate,
        filter: Option<Filter<S, U>>,
        timeout: Option<Duration>,
    ) -> Self {
        let id = cx.runtime().shared.next_id();
        let queue = cx.queue().id();
        Self {
            cx,
            frame: Arc::new(LoopFrame {
                id,
                queue,
                filter,
                state: AtomicU8::new(IDLE),
            }),
            until,
            timeout,
        }
    }

    /// Whether the loop is currently running.
    pub fn is_active(&self) -> bool {
        self.frame.is_active()
    }
}

impl<S: Source, U: Send + 'static> SecondaryLoop<S, U> {
    /// Run the loop until its predicate holds, [`exit`](Self::exit) is called,
    /// its timeout elapses, or the context is disposed.
    ///
    /// Returns `false` without dispatching anything if the loop is already
    /// running, the context is disposed, or `exit` was called before `enter`
    /// (that early exit is consumed). Returns `true` once the loop ran.
    pub fn enter(&self) -> bool {
        if self.cx.is_disposed() {
            tracing::warn!(context = %self.cx.name(), "secondary loop rejected: context disposed");
            return false;
        }
        match self
            .frame
            .state
            .compare_exchange(IDLE, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(EXIT_PENDING) => {
                let _ = self.frame.state.compare_exchange(
                    EXIT_PENDING,
                    IDLE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                tracing::trace!(loop_id = self.frame.id, "secondary loop exited before entry");
                return false;
            }
            Err(_) => {
                tracing::warn!(loop_id = self.frame.id, "secondary loop rejected: already running");
                return false;
            }
        }

        let queue = self.cx.queue();
        queue.with_stack(|stack, state| {
            state.loops.push(Arc::clone(&self.frame));
            stack.cond.notify_all();
        });
        let _installed = Installed {
            queue: &queue,
            frame: &self.frame,
        };
        tracing::trace!(loop_id = self.frame.id, context = %self.cx.name(), "secondary loop entered");
        self.pump(&queue);
        tracing::trace!(loop_id = self.frame.id, "secondary loop left");
        true
    }

    /// End the loop. Callable from any thread; idempotent.
    ///
    /// Returns `true` if this call ended a running loop. Calling `exit` before `enter`
    /// makes the next `enter` return `false` immediately.
    pub fn exit(&self) -> bool {
        let was_active = self.frame.request_exit();
        self.cx.queue().with_stack(|stack, _| stack.cond.notify_all());
        was_active
    }

    fn pump(&self, queue: &EventQueue<S, U>) {
        let slice = self.cx.runtime().config().wait_slice;
        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            if (self.until)() {
                break;
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::trace!(loop_id = self.frame.id, "secondary loop timed out");
                        break;
                    }
                    slice.min(deadline - now)
                }
                None => slice,
            };
            // The queue's stack is re-resolved on every turn: a handler may have
            // pushed or popped since the last one.
            let done = queue.with_stack(|stack, state| {
                if self.frame.exit_requested() || self.cx.is_disposed() {
                    return true;
                }
                if state.on_dispatch_thread() {
                    if dispatch_next(stack, state) {
                        return false;
                    }
                } else {
                    ensure_thread(stack, state);
                }
                let _ = stack.cond.wait_for(state, wait);
                false
            });
            if done {
                break;
            }
        }
    }
}

/// Builder for [`SecondaryLoop`].
pub struct SecondaryLoopBuilder<S, U> {
    cx: Context<S, U>,
    until: Option<Predicate>,
    filter: Option<Filter<S, U>>,
    timeout: Option<Duration>,
}

impl<S, U> fmt::Debug for SecondaryLoopBuilder<S, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondaryLoopBuilder")
            .field("context", &self.cx.name())
            .field("filtered", &self.filter.is_some())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<S, U> SecondaryLoopBuilder<S, U> {
    pub(crate) fn new(cx: Context<S, U>) -> Self {
        Self {
            cx,
            until: None,
            filter: None,
            timeout: None,
        }
    }

    /// End the loop once `until` returns `true`. Checked before every event.
    #[must_use]
    pub fn with_predicate(mut self, until: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.until = Some(Arc::new(until));
        self
    }

    /// Only dispatch events accepted by `filter` while the loop runs.
    ///
    /// The filter runs under the stack lock and must not post.
    #[must_use]
    pub fn with_filter(
        mut self,
        filter: impl Fn(&QueuedEvent<S, U>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// End the loop after `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Create the loop. Without a predicate it runs until exited.
    pub fn build(self) -> SecondaryLoop<S, U> {
        let until = self.until.unwrap_or_else(|| Arc::new(|| false));
        SecondaryLoop::new(self.cx, until, self.filter, self.timeout)
    }
}
