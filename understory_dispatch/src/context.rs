// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Isolation contexts: a handler, a root queue, and the sources they own.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use understory_event_queue::{Event, EventBody, MergeHook};

use crate::error::{DispatchError, Result};
use crate::event::{
    Completion, Delivery, Filter, Invocation, Notifier, Payload, QueuedEvent, Source, Status,
    SyncDelivery,
};
use crate::runtime::{Runtime, RuntimeShared};
use crate::secondary::{SecondaryLoop, SecondaryLoopBuilder};
use crate::stack::EventQueue;

/// Receives the events of a [`Context`] on its dispatch thread.
///
/// Closures `Fn(&Context<S, U>, Event<S, U>)` implement this trait.
pub trait Handler<S, U>: Send + Sync + 'static {
    /// Handle one event. Panics are caught and logged by the dispatch loop.
    fn handle(&self, cx: &Context<S, U>, event: Event<S, U>);
}

impl<S, U, F> Handler<S, U> for F
where
    F: Fn(&Context<S, U>, Event<S, U>) + Send + Sync + 'static,
{
    fn handle(&self, cx: &Context<S, U>, event: Event<S, U>) {
        self(cx, event);
    }
}

/// What queues and stacks need from the context that created them.
pub(crate) struct Home<S, U> {
    pub(crate) runtime: Arc<RuntimeShared<S, U>>,
    pub(crate) context: Weak<ContextShared<S, U>>,
    pub(crate) name: String,
    pub(crate) merge: Box<dyn MergeHook<S, U> + Send + Sync>,
    disposed: AtomicBool,
}

impl<S, U> Home<S, U> {
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

pub(crate) struct ContextShared<S, U> {
    home: Arc<Home<S, U>>,
    handler: Box<dyn Handler<S, U>>,
    root: EventQueue<S, U>,
}

impl<S, U> ContextShared<S, U> {
    fn dispose(&self) {
        if self.home.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = self.root.with_stack(|stack, state| {
            for frame in &state.loops {
                frame.request_exit();
            }
            let dropped = state.drain();
            stack.sync_pending(state);
            stack.cond.notify_all();
            dropped
        });
        tracing::debug!(
            context = %self.home.name,
            dropped = dropped.len(),
            "context disposed"
        );
    }
}

impl<S, U> Drop for ContextShared<S, U> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// An isolation context.
///
/// A context owns a root [`EventQueue`] served by one dispatch thread, a
/// [`Handler`] that receives its events, and the event sources it has
/// [adopted](Context::adopt). Posting an event whose source belongs to another
/// context forwards it there.
///
/// Clones share the context. The context is disposed when [`Context::dispose`]
/// is called or the last clone is dropped.
pub struct Context<S, U> {
    shared: Arc<ContextShared<S, U>>,
}

impl<S, U> Clone for Context<S, U> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S, U> fmt::Debug for Context<S, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.shared.home.name)
            .field("disposed", &self.shared.home.is_disposed())
            .finish_non_exhaustive()
    }
}

impl<S, U> Context<S, U> {
    pub(crate) fn new(
        runtime: &Runtime<S, U>,
        name: &str,
        handler: Box<dyn Handler<S, U>>,
        merge: Box<dyn MergeHook<S, U> + Send + Sync>,
    ) -> Self {
        let shared = Arc::new_cyclic(|context| {
            let home = Arc::new(Home {
                runtime: Arc::clone(&runtime.shared),
                context: context.clone(),
                name: name.to_owned(),
                merge,
                disposed: AtomicBool::new(false),
            });
            let root = EventQueue::new(&home);
            ContextShared {
                home,
                handler,
                root,
            }
        });
        tracing::debug!(context = name, "context created");
        Self { shared }
    }

    pub(crate) fn from_shared(shared: Arc<ContextShared<S, U>>) -> Self {
        Self { shared }
    }

    pub(crate) fn handler(&self) -> &dyn Handler<S, U> {
        &*self.shared.handler
    }

    /// Name given at creation.
    pub fn name(&self) -> &str {
        &self.shared.home.name
    }

    /// The runtime this context belongs to.
    pub fn runtime(&self) -> Runtime<S, U> {
        Runtime {
            shared: Arc::clone(&self.shared.home.runtime),
        }
    }

    /// The root queue of this context.
    pub fn queue(&self) -> EventQueue<S, U> {
        self.shared.root.clone()
    }

    /// Create a standalone queue owned by this context, ready to be pushed.
    pub fn create_queue(&self) -> EventQueue<S, U> {
        EventQueue::new(&self.shared.home)
    }

    /// Whether the calling thread is this context's dispatch thread.
    pub fn is_dispatch_thread(&self) -> bool {
        self.shared.root.is_dispatch_thread()
    }

    /// Whether the context has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.shared.home.is_disposed()
    }

    /// Dispose the context.
    ///
    /// Pending events are dropped, callers blocked on them are released, every
    /// secondary loop running on the context exits, and later posts are
    /// silently dropped. Idempotent.
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    /// Whether both handles refer to the same context.
    pub fn same_context(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<S: Source, U: Send + 'static> Context<S, U> {
    /// Claim `source`: events of `source` posted through any context of the
    /// runtime are delivered here.
    pub fn adopt(&self, source: S) {
        self.shared
            .home
            .runtime
            .adopt(source, Arc::downgrade(&self.shared));
    }

    /// Give up `source`. Returns `false` if another context owns it.
    pub fn release(&self, source: S) -> bool {
        self.shared
            .home
            .runtime
            .release(source, &Arc::downgrade(&self.shared))
    }

    /// Context that should receive events of `source`.
    fn route(&self, source: Option<S>) -> Arc<ContextShared<S, U>> {
        source
            .and_then(|s| self.shared.home.runtime.owner_of(s))
            .unwrap_or_else(|| Arc::clone(&self.shared))
    }

    /// Post an event.
    ///
    /// If another live context adopted the event's source, the event goes to
    /// that context's queue; otherwise to this one. Never blocks beyond a stack
    /// lock. Posting to a disposed context drops the event.
    pub fn post(&self, event: Event<S, U>) {
        self.route(event.source).root.post(event);
    }

    /// Post an event and block until it has been dispatched.
    ///
    /// Returns [`Delivery::Abandoned`] if the destination is disposed before the
    /// event is dispatched. Fails with [`DispatchError::SelfBlock`] on the
    /// destination's own dispatch thread, [`DispatchError::Interrupted`] if
    /// the waiting thread is interrupted, and [`DispatchError::Panicked`] if
    /// the handler panics.
    pub fn post_and_wait(&self, event: Event<S, U>) -> Result<Delivery> {
        let dest = self.route(event.source);
        if dest.root.is_dispatch_thread() {
            return Err(DispatchError::SelfBlock);
        }
        if dest.home.is_disposed() {
            tracing::trace!(context = %dest.home.name, "synchronous post to disposed context");
            return Ok(Delivery::Abandoned);
        }
        let completion = Completion::new();
        let wrapper: QueuedEvent<S, U> = Event {
            source: event.source,
            timestamp: event.timestamp,
            priority: event.priority,
            body: EventBody::Other(Payload::Sync(SyncDelivery {
                event: Box::new(event),
                notifier: Notifier::new(&completion),
            })),
        };
        dest.root.post_queued(wrapper);
        let home = &dest.home;
        let status = completion.wait(home.runtime.config.sync_poll_interval, || {
            if home.is_disposed() {
                Some(Ok(Status::Abandoned))
            } else if home.runtime.take_interrupt() {
                Some(Err(DispatchError::Interrupted))
            } else {
                None
            }
        })?;
        match status {
            Status::Done => Ok(Delivery::Dispatched),
            Status::Panicked(message) => Err(DispatchError::Panicked(message)),
            Status::Pending | Status::Abandoned => Ok(Delivery::Abandoned),
        }
    }

    /// Run `task` on the dispatch thread after the events already queued at
    /// [`Priority::Normal`](crate::Priority::Normal).
    pub fn invoke_later(&self, task: impl FnOnce() + Send + 'static) {
        let invocation = Invocation::new(Box::new(task), None);
        self.shared
            .root
            .post_queued(Event::unsourced(Payload::Task(invocation)));
    }

    /// Run `task` on the dispatch thread and return its value.
    ///
    /// Fails with [`DispatchError::SelfBlock`] on the dispatch thread itself,
    /// [`DispatchError::Disposed`] if the context is or becomes disposed,
    /// [`DispatchError::Interrupted`] if the waiting thread is interrupted, and
    /// [`DispatchError::Panicked`] if `task` panics.
    pub fn invoke_and_wait<R, F>(&self, task: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_dispatch_thread() {
            return Err(DispatchError::SelfBlock);
        }
        if self.is_disposed() {
            return Err(DispatchError::Disposed);
        }
        let output = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&output);
        let completion = Completion::new();
        let invocation = Invocation::new(
            Box::new(move || *slot.lock() = Some(task())),
            Some(Notifier::new(&completion)),
        );
        self.shared
            .root
            .post_queued(Event::unsourced(Payload::Task(invocation)));
        let home = &self.shared.home;
        let status = completion.wait(home.runtime.config.sync_poll_interval, || {
            if home.is_disposed() {
                Some(Err(DispatchError::Disposed))
            } else if home.runtime.take_interrupt() {
                Some(Err(DispatchError::Interrupted))
            } else {
                None
            }
        })?;
        match status {
            Status::Done => output.lock().take().ok_or(DispatchError::Disposed),
            Status::Panicked(message) => Err(DispatchError::Panicked(message)),
            Status::Pending | Status::Abandoned => Err(DispatchError::Disposed),
        }
    }

    /// Push `queue` on top of this context's stack. See [`EventQueue::push`].
    pub fn push(&self, queue: &EventQueue<S, U>) -> Result<()> {
        self.shared.root.push(queue)
    }

    /// Pop the top of this context's stack. See [`EventQueue::pop`].
    pub fn pop(&self) -> Result<()> {
        self.shared.root.pop()
    }

    /// Remove pending events of `source` from this context's stack.
    pub fn remove_source_events(&self, source: S) -> usize {
        self.shared.root.remove_source_events(source)
    }

    /// Create a nested event loop on this context.
    ///
    /// The loop ends once `until` returns `true`, [`SecondaryLoop::exit`] is
    /// called, `timeout` elapses, or the context is disposed. While it runs,
    /// only events accepted by `filter` (and by every enclosing loop's filter)
    /// are dispatched.
    pub fn create_secondary_loop(
        &self,
        until: impl Fn() -> bool + Send + Sync + 'static,
        filter: Option<Filter<S, U>>,
        timeout: Option<Duration>,
    ) -> SecondaryLoop<S, U> {
        SecondaryLoop::new(self.clone(), Arc::new(until), filter, timeout)
    }

    /// Start building a nested event loop on this context.
    pub fn secondary_loop(&self) -> SecondaryLoopBuilder<S, U> {
        SecondaryLoopBuilder::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DispatchConfig, Priority};
    use kurbo::{Point, Rect};
    use std::sync::mpsc;
    use std::thread;

    type Msg = &'static str;
    type Cx = Context<u32, Msg>;

    fn quick() -> Runtime<u32, Msg> {
        Runtime::with_config(
            DispatchConfig::default()
                .with_idle_grace(Duration::from_millis(20))
                .with_wait_slice(Duration::from_millis(5))
                .with_sync_poll_interval(Duration::from_millis(5)),
        )
    }

    /// Park the dispatch thread until the returned sender fires.
    fn block_dispatch(cx: &Cx) -> mpsc::Sender<()> {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        cx.invoke_later(move || {
            let _ = entered_tx.send(());
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        });
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        release_tx
    }

    #[test]
    fn posts_follow_source_ownership() {
        let runtime = quick();
        let (tx, rx) = mpsc::channel();
        let tx = Arc::new(Mutex::new(tx));
        let make = |name: &'static str| {
            let tx = Arc::clone(&tx);
            runtime.create_context(name, move |cx: &Cx, e: Event<u32, Msg>| {
                let _ = tx.lock().send((cx.name().to_owned(), e.source));
            })
        };
        let a = make("a");
        let b = make("b");
        b.adopt(5);

        a.post(Event::other(5, "owned by b"));
        a.post(Event::other(6, "unowned"));
        let mut got = vec![
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        got.sort();
        assert_eq!(got, vec![("a".to_owned(), Some(6)), ("b".to_owned(), Some(5))]);

        assert!(b.release(5));
        assert!(!a.release(5));
        a.post(Event::other(5, "back home"));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), ("a".to_owned(), Some(5)));
    }

    #[test]
    fn blocking_calls_reject_the_dispatch_thread() {
        let runtime = quick();
        let cx = runtime.create_context("self", |_: &Cx, _: Event<u32, Msg>| {});
        let inner = cx.clone();
        let nested = cx
            .invoke_and_wait(move || {
                (
                    inner.invoke_and_wait(|| ()),
                    inner.post_and_wait(Event::other(1, "loop")),
                )
            })
            .unwrap();
        assert_eq!(nested.0, Err(DispatchError::SelfBlock));
        assert_eq!(nested.1, Err(DispatchError::SelfBlock));
    }

    #[test]
    fn synchronous_post_to_another_context_from_a_dispatch_thread() {
        let runtime = quick();
        let target = runtime.create_context("target", |_: &Cx, _: Event<u32, Msg>| {});
        target.adopt(9);
        let caller = runtime.create_context("caller", |_: &Cx, _: Event<u32, Msg>| {});
        let via = caller.clone();
        let delivery = caller
            .invoke_and_wait(move || via.post_and_wait(Event::other(9, "cross")))
            .unwrap();
        assert_eq!(delivery, Ok(Delivery::Dispatched));
    }

    #[test]
    fn invoke_and_wait_returns_the_value() {
        let runtime = quick();
        let cx = runtime.create_context("value", |_: &Cx, _: Event<u32, Msg>| {});
        assert_eq!(cx.invoke_and_wait(|| 6 * 7), Ok(42));
        assert_eq!(
            cx.invoke_and_wait(|| -> u8 { panic!("task failed") }),
            Err(DispatchError::Panicked("task failed".to_owned()))
        );
    }

    #[test]
    fn dispose_releases_waiters_and_drops_posts() {
        let runtime = quick();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let cx = runtime.create_context("doomed", move |_: &Cx, e: Event<u32, Msg>| {
            let _ = tx.lock().send(e.body.other().copied());
        });
        let release = block_dispatch(&cx);

        let poster = cx.clone();
        let waiter = thread::spawn(move || poster.post_and_wait(Event::other(1, "queued")));
        while cx.queue().is_empty() {
            thread::yield_now();
        }
        cx.dispose();
        assert_eq!(waiter.join().unwrap(), Ok(Delivery::Abandoned));

        cx.post(Event::other(1, "late"));
        assert!(cx.queue().is_empty());
        assert_eq!(cx.invoke_and_wait(|| ()), Err(DispatchError::Disposed));
        assert_eq!(cx.post_and_wait(Event::other(1, "late")), Ok(Delivery::Abandoned));
        release.send(()).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(runtime.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn interrupt_releases_a_blocked_caller() {
        let runtime = quick();
        let cx = runtime.create_context("slow", |_: &Cx, _: Event<u32, Msg>| {});
        let release = block_dispatch(&cx);

        let caller = cx.clone();
        let waiter = thread::spawn(move || caller.invoke_and_wait(|| ()));
        runtime.interrupt(waiter.thread().id());
        assert_eq!(waiter.join().unwrap(), Err(DispatchError::Interrupted));

        // The wait was interrupted, not the task; the context keeps working.
        release.send(()).unwrap();
        assert_eq!(cx.invoke_and_wait(|| 1), Ok(1));
    }

    type Log = Arc<Mutex<Vec<EventBody<Msg>>>>;

    fn recording(runtime: &Runtime<u32, Msg>, name: &str) -> (Cx, Log) {
        let log: Log = Arc::default();
        let sink = Arc::clone(&log);
        let cx = runtime.create_context(name, move |_: &Cx, e: Event<u32, Msg>| {
            sink.lock().push(e.body);
        });
        (cx, log)
    }

    #[test]
    fn paint_move_paint_dispatches_the_merged_paint_first() {
        let runtime = quick();
        let (cx, log) = recording(&runtime, "canvas");
        let release = block_dispatch(&cx);
        cx.post(Event::paint(1, Rect::new(0.0, 0.0, 10.0, 10.0)));
        cx.post(Event::pointer_move(1, Point::new(5.0, 5.0)));
        cx.post(Event::paint(1, Rect::new(0.0, 0.0, 20.0, 20.0)));
        release.send(()).unwrap();
        cx.post_and_wait(Event::other(1, "end")).unwrap();
        assert_eq!(
            *log.lock(),
            vec![
                EventBody::Paint(Rect::new(0.0, 0.0, 20.0, 20.0)),
                EventBody::PointerMove(Point::new(5.0, 5.0)),
                EventBody::Other("end"),
            ]
        );
    }

    #[test]
    fn lanes_are_fifo_and_high_overtakes_low() {
        let runtime = quick();
        let (cx, log) = recording(&runtime, "lanes");
        let release = block_dispatch(&cx);
        cx.post(Event::other(1, "low").with_priority(Priority::Low));
        cx.post(Event::other(1, "a"));
        cx.post(Event::other(1, "b"));
        cx.post(Event::other(1, "high").with_priority(Priority::High));
        release.send(()).unwrap();
        cx.post_and_wait(Event::other(1, "end").with_priority(Priority::Low))
            .unwrap();
        let order: Vec<Msg> = log.lock().iter().filter_map(|b| b.other().copied()).collect();
        assert_eq!(order, vec!["high", "a", "b", "low", "end"]);
    }

    #[test]
    fn pushed_queue_coalesces_migrated_paints() {
        let runtime = quick();
        let (cx, log) = recording(&runtime, "overlay");
        let release = block_dispatch(&cx);
        cx.post(Event::paint(1, Rect::new(0.0, 0.0, 10.0, 10.0)));
        let overlay = cx.create_queue();
        cx.push(&overlay).unwrap();
        cx.post(Event::paint(1, Rect::new(0.0, 0.0, 20.0, 20.0)));
        release.send(()).unwrap();
        cx.post_and_wait(Event::other(1, "end")).unwrap();
        assert_eq!(
            *log.lock(),
            vec![
                EventBody::Paint(Rect::new(0.0, 0.0, 20.0, 20.0)),
                EventBody::Other("end"),
            ]
        );
    }

    #[test]
    fn dropping_the_last_handle_disposes() {
        let runtime = quick();
        let cx = runtime.create_context("short", |_: &Cx, _: Event<u32, Msg>| {});
        cx.adopt(3);
        let probe = cx.queue();
        drop(cx);
        assert!(runtime.context_of(3).is_none());
        probe.post(Event::other(3, "nobody"));
        assert!(probe.is_empty());
    }
}
