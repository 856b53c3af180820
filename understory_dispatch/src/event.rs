// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! What travels through a dispatch queue besides user events.
//!
//! User events are wrapped in [`Payload::User`]. The engine adds its own
//! payloads next to them in the same lanes, so tasks and synchronous posts obey
//! the same priority and FIFO rules as input:
//!
//! - [`Payload::Task`]: a closure scheduled with `invoke_later` / `invoke_and_wait`.
//! - [`Payload::Sync`]: a user event posted with `post_and_wait`; it is
//!   delivered to the handler and then releases the waiting caller.
//! - [`Payload::Wakeup`]: a no-op that makes a parked consumer re-read the
//!   stack topology.

use std::any::Any;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use understory_event_queue::{Event, EventBody, MergeHook};

/// Bounds required of event source handles.
pub trait Source: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Copy + Eq + Hash + Debug + Send + Sync + 'static> Source for T {}

/// A closure run on the dispatch thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// An event as stored in a dispatch queue.
pub type QueuedEvent<S, U> = Event<S, Payload<S, U>>;

/// Event filter installed by a secondary loop.
pub type Filter<S, U> = Box<dyn Fn(&QueuedEvent<S, U>) -> bool + Send + Sync>;

/// Payload of [`EventBody::Other`] inside a dispatch queue.
pub enum Payload<S, U> {
    /// A user event.
    User(U),
    /// A scheduled closure.
    Task(Invocation),
    /// A user event whose poster waits for its delivery.
    Sync(SyncDelivery<S, U>),
    /// Makes a parked consumer re-check its state. Never reaches a handler.
    Wakeup,
}

impl<S: Debug, U: Debug> Debug for Payload<S, U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(u) => f.debug_tuple("User").field(u).finish(),
            Self::Task(_) => f.write_str("Task"),
            Self::Sync(d) => f.debug_tuple("Sync").field(&d.event).finish(),
            Self::Wakeup => f.write_str("Wakeup"),
        }
    }
}

impl<S, U> Payload<S, U> {
    /// Borrow the user event, looking through synchronous wrappers.
    pub fn user(&self) -> Option<&U> {
        match self {
            Self::User(u) => Some(u),
            Self::Sync(d) => d.event.body.other(),
            Self::Task(_) | Self::Wakeup => None,
        }
    }

    /// Whether the engine created this payload for its own bookkeeping.
    pub const fn is_wakeup(&self) -> bool {
        matches!(self, Self::Wakeup)
    }
}

/// A scheduled closure plus the caller waiting for it, if any.
pub struct Invocation {
    task: Task,
    notifier: Option<Notifier>,
}

impl Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("waited", &self.notifier.is_some())
            .finish_non_exhaustive()
    }
}

impl Invocation {
    pub(crate) fn new(task: Task, notifier: Option<Notifier>) -> Self {
        Self { task, notifier }
    }

    /// Run the closure, catching a panic and reporting it to the waiter.
    pub(crate) fn run(self) {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(self.task));
        let status = match outcome {
            Ok(()) => Status::Done,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(%message, "task panicked on the dispatch thread");
                Status::Panicked(message)
            }
        };
        if let Some(notifier) = self.notifier {
            notifier.finish(status);
        }
    }
}

/// A user event posted with `post_and_wait`.
pub struct SyncDelivery<S, U> {
    pub(crate) event: Box<Event<S, U>>,
    pub(crate) notifier: Notifier,
}

impl<S: Debug, U: Debug> Debug for SyncDelivery<S, U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncDelivery")
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// How a synchronous post ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The handler ran for the event.
    Dispatched,
    /// The destination went away before the event was dispatched.
    Abandoned,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Status {
    Pending,
    Done,
    Panicked(String),
    Abandoned,
}

/// Completion flag a synchronous caller blocks on.
#[derive(Debug)]
pub(crate) struct Completion {
    status: Mutex<Status>,
    cond: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(Status::Pending),
            cond: Condvar::new(),
        })
    }

    /// Block until the status leaves `Pending`, re-checking `give_up` every
    /// `poll` so a vanished destination or an interrupt never hangs the caller.
    pub(crate) fn wait<E>(
        &self,
        poll: Duration,
        mut give_up: impl FnMut() -> Option<Result<Status, E>>,
    ) -> Result<Status, E> {
        let mut status = self.status.lock();
        loop {
            if *status != Status::Pending {
                return Ok(status.clone());
            }
            if let Some(outcome) = give_up() {
                return outcome;
            }
            let _ = self.cond.wait_for(&mut status, poll);
        }
    }
}

/// Sending half of a [`Completion`].
///
/// Dropping a notifier that never finished releases the waiter with
/// `Abandoned`, so events discarded by disposal never strand their poster.
#[derive(Debug)]
pub(crate) struct Notifier(Arc<Completion>);

impl Notifier {
    pub(crate) fn new(completion: &Arc<Completion>) -> Self {
        Self(Arc::clone(completion))
    }

    pub(crate) fn finish(self, status: Status) {
        self.set(status);
    }

    fn set(&self, status: Status) {
        let mut current = self.0.status.lock();
        if *current == Status::Pending {
            *current = status;
            self.0.cond.notify_all();
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.set(Status::Abandoned);
    }
}

/// Adapts a user [`MergeHook`] to queued payloads: only [`Payload::User`]
/// values coalesce.
pub(crate) struct PayloadMerge<'a, S, U>(pub(crate) &'a (dyn MergeHook<S, U> + Send + Sync));

impl<S, U> MergeHook<S, Payload<S, U>> for PayloadMerge<'_, S, U> {
    fn kind(&self, source: &S, payload: &Payload<S, U>) -> Option<u32> {
        match payload {
            Payload::User(u) => self.0.kind(source, u),
            _ => None,
        }
    }

    fn merge(
        &self,
        source: &S,
        existing: &Payload<S, U>,
        newer: &Payload<S, U>,
    ) -> Option<Payload<S, U>> {
        match (existing, newer) {
            (Payload::User(a), Payload::User(b)) => self.0.merge(source, a, b).map(Payload::User),
            _ => None,
        }
    }
}

/// What the dispatch loop does with a dequeued event.
pub(crate) enum Work<S, U> {
    Deliver(Event<S, U>),
    Task(Invocation),
    Sync(SyncDelivery<S, U>),
    Nothing,
}

/// Split a queued event into user-visible work or engine work.
pub(crate) fn classify<S, U>(event: QueuedEvent<S, U>) -> Work<S, U> {
    let Event {
        source,
        timestamp,
        priority,
        body,
    } = event;
    let body = match body {
        EventBody::Other(Payload::Task(invocation)) => return Work::Task(invocation),
        EventBody::Other(Payload::Sync(delivery)) => return Work::Sync(delivery),
        EventBody::Other(Payload::Wakeup) => return Work::Nothing,
        EventBody::Other(Payload::User(u)) => EventBody::Other(u),
        EventBody::Paint(r) => EventBody::Paint(r),
        EventBody::Update(r) => EventBody::Update(r),
        EventBody::PointerMove(p) => EventBody::PointerMove(p),
        EventBody::PointerDrag(p) => EventBody::PointerDrag(p),
    };
    Work::Deliver(Event {
        source,
        timestamp,
        priority,
        body,
    })
}

/// Wrap a user event for queueing.
pub(crate) fn queued<S, U>(event: Event<S, U>) -> QueuedEvent<S, U> {
    event.map_other(Payload::User)
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
