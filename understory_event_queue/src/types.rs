// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Public types for queued events: priorities, bodies, and coalescing kinds.

use kurbo::{Point, Rect};

/// Priority class of a queued event.
///
/// Higher priorities always drain before lower ones; within one priority the
/// queue is strictly FIFO.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Background work, opted into with [`Event::with_priority`]. Drained
    /// after everything else.
    Low,
    /// Input, repaints, tasks, and custom events.
    #[default]
    Normal,
    /// Events that must overtake ordinary input.
    High,
    /// Reserved for the engine's own bookkeeping events.
    Ultimate,
}

impl Priority {
    /// Number of priority lanes.
    pub const COUNT: usize = 4;

    /// All priorities from highest to lowest, in drain order.
    pub const DRAIN_ORDER: [Self; Self::COUNT] =
        [Self::Ultimate, Self::High, Self::Normal, Self::Low];

    pub(crate) const fn lane(self) -> usize {
        self as usize
    }
}

/// The coalescing discriminant of an event.
///
/// Two pending events can only merge when they share a source and a kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A full repaint of a region.
    Paint,
    /// An incremental update of a region.
    Update,
    /// Pointer moved without buttons held.
    PointerMove,
    /// Pointer moved with a button held.
    PointerDrag,
    /// A payload kind assigned by a [`MergeHook`](crate::MergeHook).
    Custom(u32),
}

/// What an event carries.
#[derive(Clone, Debug, PartialEq)]
pub enum EventBody<T> {
    /// Repaint the given region of the source.
    Paint(Rect),
    /// Update the given region of the source.
    Update(Rect),
    /// Latest pointer position, no buttons held.
    PointerMove(Point),
    /// Latest pointer position while dragging.
    PointerDrag(Point),
    /// Anything else; coalesced only through a [`MergeHook`](crate::MergeHook).
    Other(T),
}

impl<T> EventBody<T> {
    /// Built-in coalescing kind, or `None` for [`EventBody::Other`].
    pub const fn builtin_kind(&self) -> Option<EventKind> {
        match self {
            Self::Paint(_) => Some(EventKind::Paint),
            Self::Update(_) => Some(EventKind::Update),
            Self::PointerMove(_) => Some(EventKind::PointerMove),
            Self::PointerDrag(_) => Some(EventKind::PointerDrag),
            Self::Other(_) => None,
        }
    }

    /// Borrow the custom payload, if any.
    pub const fn other(&self) -> Option<&T> {
        match self {
            Self::Other(payload) => Some(payload),
            _ => None,
        }
    }
}

/// An event waiting in (or travelling towards) a queue.
///
/// `S` is the source handle used for coalescing and routing; events without a
/// source never coalesce. `T` is the payload of [`EventBody::Other`].
#[derive(Clone, Debug, PartialEq)]
pub struct Event<S, T> {
    /// Source the event belongs to.
    pub source: Option<S>,
    /// Caller-defined timestamp in milliseconds.
    pub timestamp: Option<u64>,
    /// Lane the event is queued in.
    pub priority: Priority,
    /// Payload.
    pub body: EventBody<T>,
}

impl<S, T> Event<S, T> {
    /// Create an event at [`Priority::Normal`].
    ///
    /// Every body shares one lane by default, so events of one source are
    /// dispatched in posting order.
    pub const fn new(source: Option<S>, body: EventBody<T>) -> Self {
        Self {
            source,
            timestamp: None,
            priority: Priority::Normal,
            body,
        }
    }

    /// Repaint `rect` of `source`.
    pub const fn paint(source: S, rect: Rect) -> Self {
        Self::new(Some(source), EventBody::Paint(rect))
    }

    /// Update `rect` of `source`.
    pub const fn update(source: S, rect: Rect) -> Self {
        Self::new(Some(source), EventBody::Update(rect))
    }

    /// Pointer moved over `source`.
    pub const fn pointer_move(source: S, position: Point) -> Self {
        Self::new(Some(source), EventBody::PointerMove(position))
    }

    /// Pointer dragged over `source`.
    pub const fn pointer_drag(source: S, position: Point) -> Self {
        Self::new(Some(source), EventBody::PointerDrag(position))
    }

    /// A custom payload addressed to `source`.
    pub const fn other(source: S, payload: T) -> Self {
        Self::new(Some(source), EventBody::Other(payload))
    }

    /// A custom payload with no source. Never coalesced.
    pub const fn unsourced(payload: T) -> Self {
        Self::new(None, EventBody::Other(payload))
    }

    /// Override the derived priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, millis: u64) -> Self {
        self.timestamp = Some(millis);
        self
    }

    /// Map the custom payload, keeping source, timestamp, and priority.
    pub fn map_other<U>(self, f: impl FnOnce(T) -> U) -> Event<S, U> {
        let body = match self.body {
            EventBody::Paint(r) => EventBody::Paint(r),
            EventBody::Update(r) => EventBody::Update(r),
            EventBody::PointerMove(p) => EventBody::PointerMove(p),
            EventBody::PointerDrag(p) => EventBody::PointerDrag(p),
            EventBody::Other(payload) => EventBody::Other(f(payload)),
        };
        Event {
            source: self.source,
            timestamp: self.timestamp,
            priority: self.priority,
            body,
        }
    }
}
