// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Coalescing rules applied when an event meets a cached pending event.
//!
//! ## Built-in rules
//!
//! - [`EventBody::Paint`] / [`EventBody::Update`]: when one rectangle contains
//!   the other, the containing one survives in the cached entry's slot.
//!   Otherwise both events are kept.
//! - [`EventBody::PointerMove`] / [`EventBody::PointerDrag`]: the newer event
//!   replaces the cached one. Older positions are obsolete.
//!
//! ## Custom payloads
//!
//! [`EventBody::Other`] payloads only coalesce through a [`MergeHook`]. The hook
//! assigns a kind to payloads that may merge and decides each merge. The hook
//! never sees built-in bodies.

use kurbo::Rect;

use crate::types::{Event, EventBody, EventKind};

/// Source-driven merge policy for [`EventBody::Other`] payloads.
///
/// Both methods have conservative defaults, so an empty impl disables custom
/// coalescing entirely.
pub trait MergeHook<S, T> {
    /// Cache kind for a payload, or `None` if the payload never coalesces.
    fn kind(&self, source: &S, payload: &T) -> Option<u32> {
        let _ = (source, payload);
        None
    }

    /// Merge `newer` into `existing`.
    ///
    /// Return `Some(replacement)` to update the pending event in place, or
    /// `None` to keep both events.
    fn merge(&self, source: &S, existing: &T, newer: &T) -> Option<T> {
        let _ = (source, existing, newer);
        None
    }
}

/// A [`MergeHook`] that never merges custom payloads.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoMerge;

impl<S, T> MergeHook<S, T> for NoMerge {}

impl<S, T, H: MergeHook<S, T> + ?Sized> MergeHook<S, T> for &H {
    fn kind(&self, source: &S, payload: &T) -> Option<u32> {
        (**self).kind(source, payload)
    }

    fn merge(&self, source: &S, existing: &T, newer: &T) -> Option<T> {
        (**self).merge(source, existing, newer)
    }
}

/// Coalescing kind of an event, consulting `hook` for custom payloads.
pub fn kind_of<S, T, H>(event: &Event<S, T>, hook: &H) -> Option<EventKind>
where
    H: MergeHook<S, T> + ?Sized,
{
    let source = event.source.as_ref()?;
    match &event.body {
        EventBody::Other(payload) => hook.kind(source, payload).map(EventKind::Custom),
        body => body.builtin_kind(),
    }
}

/// Outcome of merging a newer event into a cached one.
#[derive(Debug)]
pub(crate) enum Merge<S, T> {
    /// The cached event already covers the newer one; drop the newer.
    KeepExisting,
    /// Replace the cached event in place.
    Replace(Event<S, T>),
    /// No merge; the newer event is queued separately.
    Distinct(Event<S, T>),
}

pub(crate) fn merge<S, T, H>(existing: &Event<S, T>, newer: Event<S, T>, hook: &H) -> Merge<S, T>
where
    H: MergeHook<S, T> + ?Sized,
{
    match (&existing.body, &newer.body) {
        (EventBody::Paint(old), EventBody::Paint(new))
        | (EventBody::Update(old), EventBody::Update(new)) => {
            if contains(*old, *new) {
                Merge::KeepExisting
            } else if contains(*new, *old) {
                Merge::Replace(newer)
            } else {
                Merge::Distinct(newer)
            }
        }
        (EventBody::PointerMove(_), EventBody::PointerMove(_))
        | (EventBody::PointerDrag(_), EventBody::PointerDrag(_)) => Merge::Replace(newer),
        (EventBody::Other(old), EventBody::Other(new)) => {
            let merged = newer
                .source
                .as_ref()
                .and_then(|source| hook.merge(source, old, new));
            match merged {
                Some(payload) => Merge::Replace(Event {
                    body: EventBody::Other(payload),
                    ..newer
                }),
                None => Merge::Distinct(newer),
            }
        }
        _ => Merge::Distinct(newer),
    }
}

/// Edge-inclusive containment; `outer` contains `inner` when it covers every point of it.
#[inline]
pub(crate) fn contains(outer: Rect, inner: Rect) -> bool {
    outer.x0 <= inner.x0 && outer.y0 <= inner.y0 && inner.x1 <= outer.x1 && inner.y1 <= outer.y1
}
