// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The dispatch thread: start, deliver, park, and retire.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;
use understory_event_queue::Event;

use crate::context::{Context, Home};
use crate::event::{QueuedEvent, Source, Status, SyncDelivery, Work, classify, panic_message};
use crate::stack::{StackShared, StackState, ThreadState};

/// Start a dispatch thread for `stack` unless one is alive.
pub(crate) fn ensure_thread<S: Source, U: Send + 'static>(
    stack: &Arc<StackShared<S, U>>,
    state: &mut StackState<S, U>,
) {
    if state.is_retired()
        || stack.home.is_disposed()
        || matches!(state.thread.state, ThreadState::Running | ThreadState::Idle)
    {
        return;
    }
    let runtime = &stack.home.runtime;
    state.thread.spawned += 1;
    let name = format!(
        "{}-{}-{}",
        runtime.config.thread_name_prefix, stack.home.name, state.thread.spawned
    );
    let worker = Arc::clone(stack);
    runtime.watchdog.thread_started();
    match thread::Builder::new().name(name).spawn(move || run(&worker)) {
        Ok(handle) => {
            state.thread.state = ThreadState::Running;
            state.thread.id = Some(handle.thread().id());
            tracing::debug!(
                context = %stack.home.name,
                generation = state.thread.spawned,
                "dispatch thread started"
            );
        }
        Err(err) => {
            runtime.watchdog.thread_exited();
            tracing::error!(context = %stack.home.name, %err, "failed to spawn dispatch thread");
        }
    }
}

fn run<S: Source, U: Send + 'static>(stack: &Arc<StackShared<S, U>>) {
    let _retire = Retire(stack);
    let config = &stack.home.runtime.config;
    let mut idle_since: Option<Instant> = None;
    let mut state = stack.state.lock();
    loop {
        if dispatch_next(stack, &mut state) {
            idle_since = None;
            continue;
        }
        let idle_for = idle_since.get_or_insert_with(Instant::now).elapsed();
        if should_exit(stack, &state, idle_for) {
            break;
        }
        state.thread.state = ThreadState::Idle;
        let _ = stack.cond.wait_for(&mut state, config.wait_slice);
    }
    // Terminated under the same lock that saw the stack empty, so a
    // concurrent post starts a new thread.
    state.thread.state = ThreadState::Terminated;
    state.thread.id = None;
}

/// Releases a dispatch thread's slot and watchdog entry, even when `run`
/// unwinds.
struct Retire<'a, S: Source, U: Send + 'static>(&'a Arc<StackShared<S, U>>);

impl<S: Source, U: Send + 'static> Drop for Retire<'_, S, U> {
    fn drop(&mut self) {
        let stack = self.0;
        let runtime = &stack.home.runtime;
        let unwinding = thread::panicking();
        let mut state = stack.state.lock();
        if state.on_dispatch_thread() {
            state.thread.state = ThreadState::Terminated;
            state.thread.id = None;
            if state.pending() > 0 {
                ensure_thread(stack, &mut state);
            }
        }
        drop(state);
        let _ = runtime.take_interrupt();
        runtime.watchdog.thread_exited();
        if unwinding {
            tracing::error!(context = %stack.home.name, "dispatch thread unwound");
        } else {
            tracing::debug!(context = %stack.home.name, "dispatch thread exited");
        }
    }
}

fn should_exit<S, U>(stack: &StackShared<S, U>, state: &StackState<S, U>, idle_for: Duration) -> bool {
    if state.is_retired() {
        return true;
    }
    if state.pending() > 0 || !state.loops.is_empty() {
        return false;
    }
    let runtime = &stack.home.runtime;
    state.shutdown
        || stack.home.is_disposed()
        || (idle_for >= runtime.config.idle_grace && runtime.watchdog.quiescent())
}

/// Deliver the next admitted event of `stack`.
///
/// The lock is released while the event is delivered and re-acquired before
/// returning. Returns `false` if nothing was admitted.
pub(crate) fn dispatch_next<S: Source, U: Send + 'static>(
    stack: &StackShared<S, U>,
    state: &mut MutexGuard<'_, StackState<S, U>>,
) -> bool {
    let Some(event) = state.take_next() else {
        return false;
    };
    state.thread.state = ThreadState::Running;
    let watchdog = &stack.home.runtime.watchdog;
    // Busy before the stack may read as empty, so no thread sees a false quiescence.
    watchdog.busy();
    stack.sync_pending(state);
    MutexGuard::unlocked(state, || deliver(&stack.home, event));
    watchdog.idle();
    stack.cond.notify_all();
    true
}

fn deliver<S: Source, U: Send + 'static>(home: &Home<S, U>, event: QueuedEvent<S, U>) {
    match classify(event) {
        Work::Nothing => {}
        Work::Task(invocation) => invocation.run(),
        Work::Deliver(event) => {
            let _ = handle(home, event);
        }
        Work::Sync(SyncDelivery { event, notifier }) => {
            let status = handle(home, *event);
            notifier.finish(status);
        }
    }
}

fn handle<S: Source, U: Send + 'static>(home: &Home<S, U>, event: Event<S, U>) -> Status {
    if home.is_disposed() {
        return Status::Abandoned;
    }
    let Some(shared) = home.context.upgrade() else {
        return Status::Abandoned;
    };
    let cx = Context::from_shared(shared);
    match catch_unwind(AssertUnwindSafe(|| cx.handler().handle(&cx, event))) {
        Ok(()) => Status::Done,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(context = %home.name, %message, "event handler panicked");
            Status::Panicked(message)
        }
    }
}
