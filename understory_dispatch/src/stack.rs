// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Queue stacks and the [`EventQueue`] handle.
//!
//! Every queue sits in exactly one stack. A fresh queue is the only member of
//! its own stack; [`EventQueue::push`] moves it on top of another stack and
//! [`EventQueue::pop`] makes it standalone again. Posting to any member of a
//! stack lands in the current top, and one dispatch thread serves the stack.
//!
//! The stack owns its members, the dispatch thread slot, and the installed
//! secondary-loop frames, all behind one mutex. A queue handle only points at
//! its stack; that pointer is re-validated under the stack lock on every
//! access, so a concurrent push or pop is never observed half done.

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;
use understory_event_queue::{Event, EventBody, Lanes};

use crate::context::Home;
use crate::error::{DispatchError, Result};
use crate::event::{Payload, PayloadMerge, QueuedEvent, Source, queued};
use crate::secondary::LoopFrame;
use crate::thread::ensure_thread;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct StackId(pub(crate) u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct QueueId(u64);

/// Lifecycle of the dispatch thread serving a queue's stack.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ThreadState {
    /// No thread has been started yet.
    #[default]
    NotStarted,
    /// The thread is delivering events.
    Running,
    /// The thread is parked on an empty (or fully filtered) queue.
    Idle,
    /// The thread exited. The next post starts a new one.
    Terminated,
}

struct QueueNode<S, U> {
    id: QueueId,
    core: Weak<QueueCore<S, U>>,
    lanes: Lanes<S, Payload<S, U>>,
}

#[derive(Debug, Default)]
pub(crate) struct ThreadSlot {
    pub(crate) state: ThreadState,
    pub(crate) id: Option<ThreadId>,
    pub(crate) spawned: u64,
}

pub(crate) struct StackState<S, U> {
    /// Bottom first. Empty once the stack has been merged into another one.
    queues: Vec<QueueNode<S, U>>,
    pub(crate) thread: ThreadSlot,
    pub(crate) loops: SmallVec<[Arc<LoopFrame<S, U>>; 4]>,
    most_recent_event_time: Option<u64>,
    pub(crate) shutdown: bool,
}

impl<S, U> StackState<S, U> {
    pub(crate) fn is_retired(&self) -> bool {
        self.queues.is_empty()
    }

    pub(crate) fn pending(&self) -> usize {
        self.queues.iter().map(|q| q.lanes.len()).sum()
    }

    fn contains(&self, id: QueueId) -> bool {
        self.queues.iter().any(|q| q.id == id)
    }

    pub(crate) fn on_dispatch_thread(&self) -> bool {
        self.thread.id == Some(thread::current().id())
    }

    /// Remove every pending event of every member.
    pub(crate) fn drain(&mut self) -> Vec<QueuedEvent<S, U>> {
        self.queues
            .iter_mut()
            .rev()
            .flat_map(|q| q.lanes.drain())
            .collect()
    }
}

impl<S: Source, U> StackState<S, U> {
    /// Dequeue the next event of the top queue admitted by every installed loop.
    pub(crate) fn take_next(&mut self) -> Option<QueuedEvent<S, U>> {
        let Self {
            queues,
            loops,
            most_recent_event_time,
            ..
        } = self;
        let loops: &[_] = loops;
        let top = queues.last_mut()?;
        let event = top.lanes.dequeue_where(|e| admits(loops, e))?;
        if let Some(t) = event.timestamp {
            *most_recent_event_time = Some(most_recent_event_time.map_or(t, |m| m.max(t)));
        }
        Some(event)
    }
}

fn admits<S, U>(loops: &[Arc<LoopFrame<S, U>>], event: &QueuedEvent<S, U>) -> bool {
    matches!(&event.body, EventBody::Other(p) if p.is_wakeup())
        || loops.iter().all(|frame| frame.admits(event))
}

pub(crate) struct StackShared<S, U> {
    pub(crate) id: StackId,
    pub(crate) home: Arc<Home<S, U>>,
    pub(crate) state: Mutex<StackState<S, U>>,
    pub(crate) cond: Condvar,
}

impl<S, U> StackShared<S, U> {
    fn new(home: Arc<Home<S, U>>, node: QueueNode<S, U>) -> Arc<Self> {
        let stack = Arc::new(Self {
            id: StackId(home.runtime.next_id()),
            state: Mutex::new(StackState {
                queues: vec![node],
                thread: ThreadSlot::default(),
                loops: SmallVec::new(),
                most_recent_event_time: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
            home,
        });
        stack.home.runtime.register_stack(&stack);
        stack
    }

    /// Publish to the watchdog whether this stack holds events.
    pub(crate) fn sync_pending(&self, state: &StackState<S, U>) {
        self.home
            .runtime
            .watchdog
            .set_pending(self.id, state.pending() > 0);
    }
}

impl<S: Source, U: Send + 'static> StackShared<S, U> {
    /// Queue `event` on the top member. Hands the event back if the stack's
    /// context is disposed.
    fn enqueue(
        self: &Arc<Self>,
        state: &mut StackState<S, U>,
        event: QueuedEvent<S, U>,
    ) -> Option<QueuedEvent<S, U>> {
        if self.home.is_disposed() {
            return Some(event);
        }
        let Some(top) = state.queues.last_mut() else {
            return Some(event);
        };
        top.lanes.enqueue(event, &PayloadMerge(&*self.home.merge));
        state.shutdown = false;
        self.sync_pending(state);
        ensure_thread(self, state);
        self.cond.notify_all();
        None
    }

    pub(crate) fn wakeup(self: &Arc<Self>, is_shutdown: bool) {
        let mut state = self.state.lock();
        self.wakeup_locked(&mut state, is_shutdown);
    }

    fn wakeup_locked(self: &Arc<Self>, state: &mut StackState<S, U>, is_shutdown: bool) {
        if is_shutdown {
            state.shutdown = true;
        } else {
            state.shutdown = false;
            ensure_thread(self, state);
        }
        self.cond.notify_all();
    }
}

/// Lock two stacks in address order.
fn lock_pair<'a, S, U>(
    a: &'a StackShared<S, U>,
    b: &'a StackShared<S, U>,
) -> (
    MutexGuard<'a, StackState<S, U>>,
    MutexGuard<'a, StackState<S, U>>,
) {
    if std::ptr::from_ref(a) < std::ptr::from_ref(b) {
        let ga = a.state.lock();
        let gb = b.state.lock();
        (ga, gb)
    } else {
        let gb = b.state.lock();
        let ga = a.state.lock();
        (ga, gb)
    }
}

pub(crate) struct QueueCore<S, U> {
    id: QueueId,
    home: Arc<Home<S, U>>,
    stack: Mutex<Arc<StackShared<S, U>>>,
}

/// Handle to one event queue.
///
/// Clones refer to the same queue. Queues are created by a
/// [`Context`](crate::Context); events reaching a queue are delivered to the
/// handler of the context that owns the bottom of its stack.
pub struct EventQueue<S, U> {
    core: Arc<QueueCore<S, U>>,
}

impl<S, U> Clone for EventQueue<S, U> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<S, U> fmt::Debug for EventQueue<S, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("id", &self.core.id.0)
            .field("context", &self.core.home.name)
            .finish_non_exhaustive()
    }
}

impl<S, U> EventQueue<S, U> {
    pub(crate) fn new(home: &Arc<Home<S, U>>) -> Self {
        let id = QueueId(home.runtime.next_id());
        let core = Arc::new_cyclic(|core| {
            let node = QueueNode {
                id,
                core: core.clone(),
                lanes: Lanes::new(),
            };
            QueueCore {
                id,
                home: Arc::clone(home),
                stack: Mutex::new(StackShared::new(Arc::clone(home), node)),
            }
        });
        Self { core }
    }

    pub(crate) fn id(&self) -> QueueId {
        self.core.id
    }

    fn stack(&self) -> Arc<StackShared<S, U>> {
        Arc::clone(&self.core.stack.lock())
    }

    /// Run `f` on the stack this queue currently belongs to, under its lock.
    pub(crate) fn with_stack<R>(
        &self,
        f: impl FnOnce(&Arc<StackShared<S, U>>, &mut MutexGuard<'_, StackState<S, U>>) -> R,
    ) -> R {
        loop {
            let stack = self.stack();
            let mut state = stack.state.lock();
            if state.contains(self.core.id) {
                return f(&stack, &mut state);
            }
        }
    }

    /// Whether both handles refer to the same queue.
    pub fn same_queue(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Name of the context that created this queue.
    pub fn context_name(&self) -> &str {
        &self.core.home.name
    }

    /// Number of queues in this queue's stack.
    pub fn depth(&self) -> usize {
        self.with_stack(|_, state| state.queues.len())
    }

    /// Whether this queue is the top of its stack and receives its posts.
    pub fn is_top(&self) -> bool {
        let id = self.core.id;
        self.with_stack(|_, state| state.queues.last().is_some_and(|q| q.id == id))
    }

    /// Number of events pending in this queue's stack.
    pub fn len(&self) -> usize {
        self.with_stack(|_, state| state.pending())
    }

    /// Whether this queue's stack has no pending events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inspect the event that would be dispatched next, ignoring loop filters.
    pub fn peek<R>(&self, f: impl FnOnce(Option<&QueuedEvent<S, U>>) -> R) -> R {
        self.with_stack(|_, state| f(state.queues.last().and_then(|q| q.lanes.peek())))
    }

    /// State of the dispatch thread serving this queue's stack.
    pub fn thread_state(&self) -> ThreadState {
        self.with_stack(|_, state| state.thread.state)
    }

    /// Largest timestamp among events dispatched from this queue's stack.
    pub fn most_recent_event_time(&self) -> Option<u64> {
        self.with_stack(|_, state| state.most_recent_event_time)
    }

    /// Whether the calling thread is the dispatch thread of this queue's stack.
    pub fn is_dispatch_thread(&self) -> bool {
        self.with_stack(|_, state| state.on_dispatch_thread())
    }
}

impl<S: Source, U: Send + 'static> EventQueue<S, U> {
    /// Post an event to the top of this queue's stack.
    ///
    /// Never blocks beyond the stack lock. Posting to a disposed context drops
    /// the event.
    pub fn post(&self, event: Event<S, U>) {
        self.post_queued(queued(event));
    }

    pub(crate) fn post_queued(&self, event: QueuedEvent<S, U>) {
        if let Some(dropped) = self.with_stack(|stack, state| stack.enqueue(state, event)) {
            tracing::trace!(
                context = %self.core.home.name,
                source = ?dropped.source,
                "event dropped by disposed context"
            );
        }
    }

    /// Force the dispatch thread to re-check its state.
    ///
    /// With `is_shutdown` the thread exits as soon as the stack is empty;
    /// otherwise a thread is started if none is running.
    pub fn wakeup(&self, is_shutdown: bool) {
        self.with_stack(|stack, state| stack.wakeup_locked(state, is_shutdown));
    }

    /// Remove pending events of `source` from this queue's stack.
    pub fn remove_source_events(&self, source: S) -> usize {
        self.with_stack(|stack, state| {
            let removed: usize = state
                .queues
                .iter_mut()
                .map(|q| q.lanes.remove_source(&source))
                .sum();
            stack.sync_pending(state);
            removed
        })
    }

    /// Push `new` on top of this queue's stack.
    ///
    /// Events already pending in the stack move into `new` in dispatch order,
    /// and later posts to any member land in `new`. The stack's dispatch
    /// thread now serves `new`.
    ///
    /// Fails with [`DispatchError::AlreadyInStack`] if `new` is this queue, is
    /// already in this stack, or has queues pushed on top of it.
    pub fn push(&self, new: &Self) -> Result<()> {
        if self.same_queue(new) {
            return Err(DispatchError::AlreadyInStack);
        }
        loop {
            let below = self.stack();
            let above = new.stack();
            if Arc::ptr_eq(&below, &above) {
                return Err(DispatchError::AlreadyInStack);
            }
            let (mut lower, mut upper) = lock_pair(&below, &above);
            if !lower.contains(self.core.id) || !upper.contains(new.core.id) {
                continue;
            }
            if upper.queues.len() > 1 {
                return Err(DispatchError::AlreadyInStack);
            }
            let Some(mut node) = upper.queues.pop() else {
                continue;
            };
            let merge = PayloadMerge(&*below.home.merge);
            if let Some(top) = lower.queues.last_mut() {
                for event in top.lanes.drain() {
                    node.lanes.enqueue(event, &merge);
                }
            }
            node.lanes.enqueue(Event::unsourced(Payload::Wakeup), &merge);
            lower.queues.push(node);
            let frames = core::mem::take(&mut upper.loops);
            lower.loops.extend(frames);
            *new.core.stack.lock() = Arc::clone(&below);

            above.sync_pending(&upper);
            below.sync_pending(&lower);
            ensure_thread(&below, &mut lower);
            above.cond.notify_all();
            below.cond.notify_all();
            tracing::debug!(
                context = %below.home.name,
                depth = lower.queues.len(),
                "queue pushed"
            );
            return Ok(());
        }
    }

    /// Pop the top queue of this queue's stack.
    ///
    /// Its pending events move back into the queue below, and the popped
    /// queue becomes standalone. Fails with [`DispatchError::EmptyStack`] if
    /// nothing was pushed.
    pub fn pop(&self) -> Result<()> {
        self.with_stack(|stack, state| {
            if state.queues.len() < 2 {
                return Err(DispatchError::EmptyStack);
            }
            let Some(mut top) = state.queues.pop() else {
                return Err(DispatchError::EmptyStack);
            };
            let merge = PayloadMerge(&*stack.home.merge);
            if let Some(parent) = state.queues.last_mut() {
                for event in top.lanes.drain() {
                    parent.lanes.enqueue(event, &merge);
                }
                parent
                    .lanes
                    .enqueue(Event::unsourced(Payload::Wakeup), &merge);
            }
            // Loops entered through the popped queue leave with it.
            let mut frames = SmallVec::new();
            state.loops.retain(|frame| {
                if frame.queue == top.id {
                    frames.push(Arc::clone(frame));
                    false
                } else {
                    true
                }
            });
            if let Some(core) = top.core.upgrade() {
                let home = Arc::clone(&core.home);
                let standalone = StackShared::new(home, top);
                standalone.state.lock().loops = frames;
                *core.stack.lock() = standalone;
            }
            stack.sync_pending(state);
            ensure_thread(stack, state);
            stack.cond.notify_all();
            tracing::debug!(
                context = %stack.home.name,
                depth = state.queues.len(),
                "queue popped"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Context, DispatchConfig, Runtime};
    use std::sync::mpsc;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn recording() -> (Runtime<u32, &'static str>, Context<u32, &'static str>, Log) {
        let config = DispatchConfig::default()
            .with_idle_grace(Duration::from_millis(20))
            .with_wait_slice(Duration::from_millis(5));
        let runtime = Runtime::with_config(config);
        let log: Log = Arc::default();
        let sink = Arc::clone(&log);
        let cx = runtime.create_context(
            "stack",
            move |_: &Context<u32, &'static str>, e: Event<u32, &'static str>| {
                if let EventBody::Other(name) = e.body {
                    sink.lock().push(name);
                }
            },
        );
        (runtime, cx, log)
    }

    /// Park the dispatch thread until the returned sender fires.
    fn block_dispatch(cx: &Context<u32, &'static str>) -> mpsc::Sender<()> {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        cx.invoke_later(move || {
            let _ = entered_tx.send(());
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        });
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        release_tx
    }

    fn wait_for_len(log: &Log, len: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while log.lock().len() < len && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn pop_without_push_is_an_error() {
        let (_runtime, cx, _) = recording();
        assert_eq!(cx.queue().pop(), Err(DispatchError::EmptyStack));
    }

    #[test]
    fn push_rejects_stacked_queues() {
        let (_runtime, cx, _) = recording();
        let root = cx.queue();
        assert_eq!(root.push(&root), Err(DispatchError::AlreadyInStack));

        let a = cx.create_queue();
        root.push(&a).unwrap();
        assert_eq!(root.push(&a), Err(DispatchError::AlreadyInStack));
        assert_eq!(a.push(&root), Err(DispatchError::AlreadyInStack));
        assert_eq!(root.depth(), 2);
        assert!(a.is_top());
        assert!(!root.is_top());
    }

    #[test]
    fn push_migrates_pending_events_and_pop_restores_them() {
        let (_runtime, cx, log) = recording();
        let root = cx.queue();
        let release = block_dispatch(&cx);

        root.post(Event::other(1, "a"));
        root.post(Event::other(1, "b"));
        let top = cx.create_queue();
        root.push(&top).unwrap();

        // Pending events now live in the pushed queue.
        top.peek(|e| {
            assert_eq!(e.and_then(|e| e.body.other()).and_then(Payload::user), Some(&"a"));
        });
        // Posting to the bottom forwards to the top.
        root.post(Event::other(1, "c"));
        assert_eq!(top.len(), 4);

        root.pop().unwrap();
        assert!(root.is_top());
        assert_eq!(top.depth(), 1);
        assert!(top.is_empty());
        top.post(Event::other(1, "d"));

        release.send(()).unwrap();
        wait_for_len(&log, 4);
        // "d" went to a standalone queue with its own thread, so it may land anywhere.
        let seen = log.lock().clone();
        assert!(seen.contains(&"d"));
        let migrated: Vec<_> = seen.into_iter().filter(|name| *name != "d").collect();
        assert_eq!(migrated, ["a", "b", "c"]);
    }

    #[test]
    fn remove_source_events_clears_pending() {
        let (_runtime, cx, log) = recording();
        let release = block_dispatch(&cx);
        cx.post(Event::other(1, "gone"));
        cx.post(Event::other(2, "kept"));
        assert_eq!(cx.remove_source_events(1), 1);
        release.send(()).unwrap();
        wait_for_len(&log, 1);
        cx.invoke_and_wait(|| ()).unwrap();
        assert_eq!(*log.lock(), vec!["kept"]);
    }

    #[test]
    fn most_recent_event_time_tracks_dispatched_timestamps() {
        let (_runtime, cx, _) = recording();
        assert_eq!(cx.queue().most_recent_event_time(), None);
        cx.post_and_wait(Event::other(1, "late").with_timestamp(40)).unwrap();
        cx.post_and_wait(Event::other(1, "early").with_timestamp(10)).unwrap();
        assert_eq!(cx.queue().most_recent_event_time(), Some(40));
    }

    #[test]
    fn thread_state_follows_lifecycle() {
        let (runtime, cx, _) = recording();
        assert_eq!(cx.queue().thread_state(), ThreadState::NotStarted);
        let inner = cx.clone();
        assert_eq!(cx.invoke_and_wait(move || inner.queue().thread_state()), Ok(ThreadState::Running));
        assert!(runtime.await_termination(Duration::from_secs(5)));
        assert_eq!(cx.queue().thread_state(), ThreadState::Terminated);
    }
}
