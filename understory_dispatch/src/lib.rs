// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

// After you edit the crate's doc comment, run this command, then check README.md for any missing links
// cargo rdme --workspace-project=understory_dispatch --heading-base-level=0

//! Understory Dispatch: a single-consumer event dispatch engine.
//!
//! Events are stored in [`understory_event_queue::Lanes`] and delivered by one
//! dispatch thread per queue stack.
//!
//! - [`Runtime`]: owns contexts, the source registry, and the idle watchdog.
//! - [`Context`]: an isolation context with a [`Handler`] and a root
//!   [`EventQueue`]. Posting an event whose source another context
//!   [adopted](Context::adopt) forwards it there.
//! - [`EventQueue`]: a queue inside a stack. [`EventQueue::push`] temporarily
//!   diverts a stack's events into another queue; [`EventQueue::pop`] undoes it.
//! - [`SecondaryLoop`]: a nested pump for modal waits, with event filters that
//!   compose across nesting levels.
//!
//! Dispatch threads start on the first post and exit once the runtime has been
//! idle for [`DispatchConfig::idle_grace`]. Handlers run outside every engine
//! lock, and a panicking handler is logged and skipped.
//!
//! ## Ordering
//!
//! Within one stack, events leave in priority order and FIFO within a
//! priority. Tasks scheduled with [`Context::invoke_later`] share the
//! [`Priority::Normal`] lane with input events. Distinct stacks are unordered
//! with respect to each other.
//!
//! ## Blocking calls
//!
//! [`Context::invoke_and_wait`] and [`Context::post_and_wait`] refuse to run on
//! the dispatch thread they would wait for ([`DispatchError::SelfBlock`]), give
//! up when the destination is disposed, and can be interrupted with
//! [`Runtime::interrupt`].
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use kurbo::Rect;
//! use understory_dispatch::{Context, Event, EventBody, Runtime};
//!
//! let painted = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&painted);
//! let runtime: Runtime<u32, ()> = Runtime::new();
//! let cx = runtime.create_context("window", move |_: &Context<u32, ()>, event: Event<u32, ()>| {
//!     if let EventBody::Paint(rect) = event.body {
//!         sink.lock().unwrap().push(rect);
//!     }
//! });
//!
//! let full = Rect::new(0.0, 0.0, 20.0, 20.0);
//! cx.post(Event::paint(1, Rect::new(0.0, 0.0, 10.0, 10.0)));
//! cx.post_and_wait(Event::paint(1, full)).unwrap();
//! assert_eq!(painted.lock().unwrap().last(), Some(&full));
//!
//! let on_thread = cx.invoke_and_wait({
//!     let cx = cx.clone();
//!     move || cx.is_dispatch_thread()
//! });
//! assert_eq!(on_thread, Ok(true));
//! ```

mod config;
mod context;
mod error;
mod event;
mod runtime;
mod secondary;
mod stack;
mod thread;
mod watchdog;

pub use config::DispatchConfig;
pub use context::{Context, Handler};
pub use error::{DispatchError, Result};
pub use event::{Delivery, Filter, Invocation, Payload, QueuedEvent, Source, SyncDelivery, Task};
pub use runtime::Runtime;
pub use secondary::{SecondaryLoop, SecondaryLoopBuilder};
pub use stack::{EventQueue, ThreadState};

pub use understory_event_queue::{Event, EventBody, EventKind, MergeHook, NoMerge, Priority};
