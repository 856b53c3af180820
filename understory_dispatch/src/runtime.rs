// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The explicit owner of contexts, the source registry, and the watchdog.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use understory_event_queue::{MergeHook, NoMerge};

use crate::config::DispatchConfig;
use crate::context::{Context, ContextShared, Handler};
use crate::event::Source;
use crate::stack::StackShared;
use crate::watchdog::Watchdog;

pub(crate) struct RuntimeShared<S, U> {
    pub(crate) config: DispatchConfig,
    pub(crate) watchdog: Watchdog,
    registry: Mutex<HashMap<S, Weak<ContextShared<S, U>>>>,
    stacks: Mutex<Vec<Weak<StackShared<S, U>>>>,
    interrupts: Mutex<HashSet<ThreadId>>,
    next_id: AtomicU64,
}

impl<S, U> RuntimeShared<S, U> {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_stack(&self, stack: &Arc<StackShared<S, U>>) {
        let mut stacks = self.stacks.lock();
        stacks.retain(|s| s.strong_count() > 0);
        stacks.push(Arc::downgrade(stack));
    }

    /// Consume a pending interrupt of the calling thread.
    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupts.lock().remove(&thread::current().id())
    }
}

impl<S: Source, U> RuntimeShared<S, U> {
    pub(crate) fn owner_of(&self, source: S) -> Option<Arc<ContextShared<S, U>>> {
        let mut registry = self.registry.lock();
        let owner = registry.get(&source)?.upgrade();
        if owner.is_none() {
            registry.remove(&source);
        }
        owner
    }

    pub(crate) fn adopt(&self, source: S, owner: Weak<ContextShared<S, U>>) {
        self.registry.lock().insert(source, owner);
    }

    pub(crate) fn release(&self, source: S, owner: &Weak<ContextShared<S, U>>) -> bool {
        let mut registry = self.registry.lock();
        match registry.get(&source) {
            Some(current) if current.ptr_eq(owner) => {
                registry.remove(&source);
                true
            }
            _ => false,
        }
    }
}

/// Owns a family of [`Context`]s that can post to each other.
///
/// A runtime is a cheap handle; clones share the same registry, watchdog, and
/// configuration. Dispatch threads start lazily and stop once the whole runtime
/// has been idle for [`DispatchConfig::idle_grace`].
///
/// ```rust
/// use std::time::Duration;
/// use understory_dispatch::{Context, Event, Runtime};
///
/// type Msg = &'static str;
///
/// let runtime: Runtime<u32, Msg> = Runtime::new();
/// let cx = runtime.create_context("main", |_cx: &Context<u32, Msg>, event: Event<u32, Msg>| {
///     assert_eq!(event.source, Some(7));
/// });
/// cx.adopt(7);
/// cx.post_and_wait(Event::other(7, "hello")).unwrap();
///
/// runtime.shutdown();
/// assert!(runtime.await_termination(Duration::from_secs(5)));
/// ```
pub struct Runtime<S, U> {
    pub(crate) shared: Arc<RuntimeShared<S, U>>,
}

impl<S, U> Clone for Runtime<S, U> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S, U> fmt::Debug for Runtime<S, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.shared.config)
            .field("live_threads", &self.shared.watchdog.live_threads())
            .finish_non_exhaustive()
    }
}

impl<S: Source, U: Send + 'static> Default for Runtime<S, U> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Source, U: Send + 'static> Runtime<S, U> {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::with_config(DispatchConfig::default())
    }

    /// Create a runtime with `config`.
    pub fn with_config(config: DispatchConfig) -> Self {
        Self {
            shared: Arc::new(RuntimeShared {
                config,
                watchdog: Watchdog::default(),
                registry: Mutex::new(HashMap::new()),
                stacks: Mutex::new(Vec::new()),
                interrupts: Mutex::new(HashSet::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The configuration every context of this runtime uses.
    pub fn config(&self) -> &DispatchConfig {
        &self.shared.config
    }

    /// Create a context whose events are delivered to `handler`.
    ///
    /// Custom payloads never coalesce; see [`Runtime::create_context_with_merge`].
    pub fn create_context(&self, name: &str, handler: impl Handler<S, U>) -> Context<S, U> {
        self.create_context_with_merge(name, handler, NoMerge)
    }

    /// Create a context that coalesces custom payloads with `merge`.
    pub fn create_context_with_merge(
        &self,
        name: &str,
        handler: impl Handler<S, U>,
        merge: impl MergeHook<S, U> + Send + Sync + 'static,
    ) -> Context<S, U> {
        Context::new(self, name, Box::new(handler), Box::new(merge))
    }

    /// The live context that adopted `source`, if any.
    pub fn context_of(&self, source: S) -> Option<Context<S, U>> {
        self.shared.owner_of(source).map(Context::from_shared)
    }

    /// Interrupt a synchronous wait of `thread`.
    ///
    /// The blocked call returns [`DispatchError::Interrupted`] within one
    /// [`DispatchConfig::sync_poll_interval`]. If the thread is not waiting, the
    /// interrupt is kept until its next wait consumes it. Dispatch threads drop
    /// their pending interrupt when they exit; for other threads that may
    /// never wait again, withdraw it with [`Runtime::clear_interrupt`].
    ///
    /// [`DispatchError::Interrupted`]: crate::DispatchError::Interrupted
    pub fn interrupt(&self, thread: ThreadId) {
        self.shared.interrupts.lock().insert(thread);
    }

    /// Withdraw a pending interrupt of `thread`. Returns whether one was pending.
    pub fn clear_interrupt(&self, thread: ThreadId) -> bool {
        self.shared.interrupts.lock().remove(&thread)
    }

    /// Ask every dispatch thread to exit as soon as its stack is empty.
    ///
    /// Posting afterwards starts a fresh thread.
    pub fn shutdown(&self) {
        let stacks: Vec<_> = self
            .shared
            .stacks
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        tracing::debug!(stacks = stacks.len(), "runtime shutdown requested");
        for stack in stacks {
            stack.wakeup(true);
        }
    }

    /// Wait until no dispatch thread of this runtime is alive.
    ///
    /// Returns `false` if threads were still running after `timeout`.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.shared.watchdog.await_termination(timeout)
    }

    /// Number of dispatch threads currently alive.
    pub fn live_threads(&self) -> usize {
        self.shared.watchdog.live_threads()
    }
}
