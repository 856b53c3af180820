// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

// After you edit the crate's doc comment, run this command, then check README.md for any missing links
// cargo rdme --workspace-project=understory_event_queue --heading-base-level=0

//! Understory Event Queue: priority lanes with per-source coalescing.
//!
//! This crate is the storage half of an event dispatch engine. It holds pending
//! events for a single consumer and decides, at enqueue time, whether a new
//! event is redundant with one that is already waiting.
//!
//! - [`Lanes`]: [`Priority::COUNT`] FIFO lanes in one slot arena. Enqueue and
//!   dequeue are O(1) and O(P) respectively, where P is the number of lanes.
//! - [`Event`]: a source handle, an optional timestamp, a [`Priority`], and an
//!   [`EventBody`].
//! - [`MergeHook`]: the policy for coalescing custom payloads.
//!
//! It does not own threads, locks, or handlers. A runtime (for example
//! `understory_dispatch`) wraps [`Lanes`] in its own synchronization and
//! delivery loop.
//!
//! ## Ordering
//!
//! - Within one priority, events leave in the order they arrived.
//! - A higher priority always drains before a lower one, regardless of arrival.
//! - A coalesced event keeps the slot and lane of the event it merged into.
//!
//! ## Coalescing
//!
//! The cache is keyed by `(source, kind)` and only holds events that are still
//! pending. See the [`coalesce`] module for the rules.
//!
//! ```rust
//! use kurbo::Rect;
//! use understory_event_queue::{Event, EventBody, Lanes, NoMerge};
//!
//! let mut lanes: Lanes<u32, ()> = Lanes::new();
//! lanes.enqueue(Event::paint(1, Rect::new(0.0, 0.0, 10.0, 10.0)), &NoMerge);
//! lanes.enqueue(Event::paint(1, Rect::new(0.0, 0.0, 20.0, 20.0)), &NoMerge);
//!
//! // One paint survives, covering both requests.
//! assert_eq!(lanes.len(), 1);
//! let merged = lanes.dequeue().unwrap();
//! assert_eq!(merged.body, EventBody::Paint(Rect::new(0.0, 0.0, 20.0, 20.0)));
//! ```
//!
//! ## Features
//!
//! - `std` (default): enables `std` support for `kurbo`.
//! - `libm`: enables `no_std` builds that rely on `libm` through `kurbo`.
//!
//! This crate is `no_std` and uses `alloc`.

#![no_std]

extern crate alloc;

pub mod coalesce;
mod lanes;
mod types;

pub use coalesce::{MergeHook, NoMerge};
pub use lanes::{Enqueued, Key, Lanes};
pub use types::{Event, EventBody, EventKind, Priority};
