// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Priority lanes: per-priority FIFO lists stored in a shared slot arena.

use alloc::vec::Vec;
use core::fmt::Debug;
use core::hash::Hash;

use hashbrown::HashMap;

use crate::coalesce::{self, Merge, MergeHook};
use crate::types::{Event, EventKind, Priority};

/// Generational handle of a pending event.
///
/// Keys stay valid until the event leaves the queue; a stale key never
/// resolves to a newer event that reused the slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key(u32, u32);

impl Key {
    #[allow(
        clippy::cast_possible_truncation,
        reason = "Slot indices are intentionally 32-bit."
    )]
    const fn new(idx: usize, generation: u32) -> Self {
        Self(idx as u32, generation)
    }

    const fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Result of [`Lanes::enqueue`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// The event was appended to the tail of its lane.
    Appended(Key),
    /// The event merged into the pending event behind this key.
    Coalesced(Key),
}

impl Enqueued {
    /// Key of the pending event that now represents the enqueued one.
    pub const fn key(self) -> Key {
        match self {
            Self::Appended(k) | Self::Coalesced(k) => k,
        }
    }
}

#[derive(Clone, Debug)]
struct Node<S, T> {
    event: Event<S, T>,
    next: Option<usize>,
    cached: Option<EventKind>,
}

#[derive(Clone, Debug)]
struct Slot<S, T> {
    generation: u32,
    node: Option<Node<S, T>>,
}

#[derive(Copy, Clone, Debug, Default)]
struct Lane {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

/// Pending events split into [`Priority::COUNT`] FIFO lanes, with a
/// coalescing cache keyed by `(source, kind)`.
///
/// ## Usage
///
/// - [`Lanes::enqueue`] appends an event or merges it into a cached pending
///   event of the same source and kind. Both paths are O(1).
/// - [`Lanes::dequeue`] pops the head of the highest non-empty lane.
/// - [`Lanes::dequeue_where`] pops the first event accepted by a filter and
///   leaves rejected events where they are.
///
/// A cache slot only exists while its event is pending: dequeuing or removing
/// an event clears its slot, so coalescing never reaches an event that has
/// already been delivered.
pub struct Lanes<S, T> {
    slots: Vec<Slot<S, T>>,
    free_list: Vec<usize>,
    lanes: [Lane; Priority::COUNT],
    cache: HashMap<(S, EventKind), usize>,
    len: usize,
}

impl<S: Debug, T: Debug> Debug for Lanes<S, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Lanes")
            .field("len", &self.len)
            .field("lanes", &self.lanes.map(|l| l.len))
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl<S, T> Default for Lanes<S, T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            lanes: [Lane::default(); Priority::COUNT],
            cache: HashMap::new(),
            len: 0,
        }
    }
}

impl<S, T> Lanes<S, T> {
    /// Create empty lanes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending events across all lanes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether all lanes are empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of pending events at one priority.
    pub const fn count_in(&self, priority: Priority) -> usize {
        self.lanes[priority.lane()].len
    }

    /// The event [`Lanes::dequeue`] would return next.
    pub fn peek(&self) -> Option<&Event<S, T>> {
        Priority::DRAIN_ORDER
            .iter()
            .find_map(|p| self.lanes[p.lane()].head)
            .and_then(|idx| self.node(idx))
            .map(|n| &n.event)
    }

    /// Look up a pending event by key.
    pub fn get(&self, key: Key) -> Option<&Event<S, T>> {
        let slot = self.slots.get(key.idx())?;
        if slot.generation != key.1 {
            return None;
        }
        slot.node.as_ref().map(|n| &n.event)
    }

    /// Iterate pending events in dequeue order.
    pub fn iter(&self) -> impl Iterator<Item = &Event<S, T>> + '_ {
        Priority::DRAIN_ORDER.into_iter().flat_map(move |p| {
            let mut cur = self.lanes[p.lane()].head;
            core::iter::from_fn(move || {
                let node = self.node(cur?)?;
                cur = node.next;
                Some(&node.event)
            })
        })
    }

    fn node(&self, idx: usize) -> Option<&Node<S, T>> {
        self.slots.get(idx).and_then(|s| s.node.as_ref())
    }

    fn key_of(&self, idx: usize) -> Key {
        Key::new(idx, self.slots[idx].generation)
    }

    /// Append to the tail of the event's lane without consulting the cache.
    fn append(&mut self, event: Event<S, T>) -> usize {
        let lane = event.priority.lane();
        let node = Node {
            event,
            next: None,
            cached: None,
        };
        let idx = if let Some(idx) = self.free_list.pop() {
            let slot = &mut self.slots[idx];
            slot.generation = slot.generation.wrapping_add(1);
            slot.node = Some(node);
            idx
        } else {
            self.slots.push(Slot {
                generation: 1,
                node: Some(node),
            });
            self.slots.len() - 1
        };
        let lane = &mut self.lanes[lane];
        match lane.tail {
            Some(tail) => {
                if let Some(t) = self.slots[tail].node.as_mut() {
                    t.next = Some(idx);
                }
            }
            None => lane.head = Some(idx),
        }
        lane.tail = Some(idx);
        lane.len += 1;
        self.len += 1;
        idx
    }

    /// Unlink `idx` from `lane`, given its predecessor, and free its slot.
    fn unlink(&mut self, lane: usize, prev: Option<usize>, idx: usize) -> Node<S, T> {
        let Some(node) = self.slots[idx].node.take() else {
            unreachable!("linked slot {idx} has no node");
        };
        match prev {
            Some(p) => {
                if let Some(pn) = self.slots[p].node.as_mut() {
                    pn.next = node.next;
                }
            }
            None => self.lanes[lane].head = node.next,
        }
        if self.lanes[lane].tail == Some(idx) {
            self.lanes[lane].tail = prev;
        }
        self.lanes[lane].len -= 1;
        self.len -= 1;
        self.free_list.push(idx);
        node
    }

    /// Remove every pending event, in dequeue order.
    pub fn drain(&mut self) -> Vec<Event<S, T>> {
        let mut out = Vec::with_capacity(self.len);
        for p in Priority::DRAIN_ORDER {
            let mut cur = self.lanes[p.lane()].head;
            while let Some(idx) = cur {
                let Some(node) = self.slots[idx].node.take() else {
                    break;
                };
                cur = node.next;
                self.free_list.push(idx);
                out.push(node.event);
            }
            self.lanes[p.lane()] = Lane::default();
        }
        self.cache.clear();
        self.len = 0;
        out
    }

    /// Drop every pending event.
    pub fn clear(&mut self) {
        let _ = self.drain();
    }
}

impl<S: Copy + Eq + Hash, T> Lanes<S, T> {
    /// Queue an event, coalescing it with a cached pending event when possible.
    ///
    /// On a cache hit the pending event is merged or replaced in place and
    /// keeps its position and lane. On a miss the event is appended to the tail
    /// of its lane and, if it has a coalescing kind, registered in the cache.
    pub fn enqueue<H>(&mut self, event: Event<S, T>, hook: &H) -> Enqueued
    where
        H: MergeHook<S, T> + ?Sized,
    {
        let Some(kind) = coalesce::kind_of(&event, hook) else {
            let idx = self.append(event);
            return Enqueued::Appended(self.key_of(idx));
        };
        let Some(source) = event.source else {
            let idx = self.append(event);
            return Enqueued::Appended(self.key_of(idx));
        };
        let cache_key = (source, kind);
        let mut event = event;
        if let Some(&idx) = self.cache.get(&cache_key) {
            if let Some(node) = self.slots[idx].node.as_mut() {
                match coalesce::merge(&node.event, event, hook) {
                    Merge::KeepExisting => return Enqueued::Coalesced(self.key_of(idx)),
                    Merge::Replace(newer) => {
                        let priority = node.event.priority;
                        node.event = Event { priority, ..newer };
                        return Enqueued::Coalesced(self.key_of(idx));
                    }
                    Merge::Distinct(newer) => {
                        node.cached = None;
                        self.cache.remove(&cache_key);
                        event = newer;
                    }
                }
            } else {
                self.cache.remove(&cache_key);
            }
        }
        let idx = self.append(event);
        if let Some(node) = self.slots[idx].node.as_mut() {
            node.cached = Some(kind);
        }
        self.cache.insert(cache_key, idx);
        Enqueued::Appended(self.key_of(idx))
    }

    /// Pop the head of the highest-priority non-empty lane.
    pub fn dequeue(&mut self) -> Option<Event<S, T>> {
        self.dequeue_where(|_| true)
    }

    /// Pop the first event, in priority then FIFO order, accepted by `filter`.
    ///
    /// Rejected events stay queued in their original positions.
    pub fn dequeue_where(
        &mut self,
        mut filter: impl FnMut(&Event<S, T>) -> bool,
    ) -> Option<Event<S, T>> {
        for p in Priority::DRAIN_ORDER {
            let lane = p.lane();
            let mut prev = None;
            let mut cur = self.lanes[lane].head;
            while let Some(idx) = cur {
                let node = self.node(idx)?;
                if filter(&node.event) {
                    let node = self.unlink(lane, prev, idx);
                    self.uncache(idx, &node);
                    return Some(node.event);
                }
                prev = cur;
                cur = node.next;
            }
        }
        None
    }

    /// Remove pending events for which `keep` returns `false`.
    ///
    /// Returns how many events were removed.
    pub fn retain(&mut self, mut keep: impl FnMut(&Event<S, T>) -> bool) -> usize {
        let mut removed = 0;
        for p in Priority::DRAIN_ORDER {
            let lane = p.lane();
            let mut prev = None;
            let mut cur = self.lanes[lane].head;
            while let Some(idx) = cur {
                let Some(node) = self.node(idx) else {
                    break;
                };
                let next = node.next;
                if keep(&node.event) {
                    prev = cur;
                } else {
                    let node = self.unlink(lane, prev, idx);
                    self.uncache(idx, &node);
                    removed += 1;
                }
                cur = next;
            }
        }
        removed
    }

    /// Remove every pending event of `source`.
    pub fn remove_source(&mut self, source: &S) -> usize {
        self.retain(|e| e.source.as_ref() != Some(source))
    }

    fn uncache(&mut self, idx: usize, node: &Node<S, T>) {
        if let (Some(kind), Some(source)) = (node.cached, node.event.source) {
            let cache_key = (source, kind);
            if self.cache.get(&cache_key) == Some(&idx) {
                self.cache.remove(&cache_key);
            }
        }
    }

    /// Whether an event of `source` and `kind` would meet a cached pending event.
    pub fn has_cache_slot(&self, source: S, kind: EventKind) -> bool {
        self.cache.contains_key(&(source, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coalesce::NoMerge;
    use crate::types::EventBody;
    use alloc::vec;
    use kurbo::{Point, Rect};

    type Ev = Event<u32, &'static str>;

    fn named(source: u32, name: &'static str) -> Ev {
        Event::other(source, name)
    }

    fn names(lanes: &mut Lanes<u32, &'static str>) -> Vec<&'static str> {
        core::iter::from_fn(|| lanes.dequeue())
            .filter_map(|e| e.body.other().copied())
            .collect()
    }

    #[test]
    fn fifo_within_a_lane() {
        let mut lanes = Lanes::new();
        lanes.enqueue(named(1, "a"), &NoMerge);
        lanes.enqueue(named(2, "b"), &NoMerge);
        lanes.enqueue(named(1, "c"), &NoMerge);
        assert_eq!(names(&mut lanes), vec!["a", "b", "c"]);
        assert!(lanes.is_empty());
    }

    #[test]
    fn higher_priority_overtakes_queued_lower() {
        let mut lanes = Lanes::new();
        lanes.enqueue(named(1, "low").with_priority(Priority::Low), &NoMerge);
        lanes.enqueue(named(1, "normal"), &NoMerge);
        lanes.enqueue(named(1, "high").with_priority(Priority::High), &NoMerge);
        lanes.enqueue(named(1, "ultimate").with_priority(Priority::Ultimate), &NoMerge);
        assert_eq!(names(&mut lanes), vec!["ultimate", "high", "normal", "low"]);
    }

    #[test]
    fn nested_paints_merge_into_the_union() {
        let mut lanes: Lanes<u32, ()> = Lanes::new();
        let first = lanes.enqueue(Event::paint(1, Rect::new(0.0, 0.0, 10.0, 10.0)), &NoMerge);
        let second = lanes.enqueue(Event::paint(1, Rect::new(0.0, 0.0, 20.0, 20.0)), &NoMerge);
        assert!(matches!(first, Enqueued::Appended(_)));
        assert_eq!(second, Enqueued::Coalesced(first.key()));
        assert_eq!(lanes.len(), 1);
        let e = lanes.dequeue().unwrap();
        assert_eq!(e.body, EventBody::Paint(Rect::new(0.0, 0.0, 20.0, 20.0)));
        assert!(lanes.dequeue().is_none());
    }

    #[test]
    fn paint_move_paint_keeps_slot_order() {
        let mut lanes: Lanes<u32, ()> = Lanes::new();
        lanes.enqueue(Event::paint(1, Rect::new(0.0, 0.0, 10.0, 10.0)), &NoMerge);
        lanes.enqueue(Event::pointer_move(1, Point::new(5.0, 5.0)), &NoMerge);
        lanes.enqueue(Event::paint(1, Rect::new(0.0, 0.0, 20.0, 20.0)), &NoMerge);
        let seq: Vec<_> = core::iter::from_fn(|| lanes.dequeue()).map(|e| e.body).collect();
        assert_eq!(
            seq,
            vec![
                EventBody::Paint(Rect::new(0.0, 0.0, 20.0, 20.0)),
                EventBody::PointerMove(Point::new(5.0, 5.0)),
            ]
        );
    }

    #[test]
    fn disjoint_paints_are_both_delivered_and_the_newer_takes_the_slot() {
        let mut lanes: Lanes<u32, ()> = Lanes::new();
        lanes.enqueue(Event::paint(1, Rect::new(0.0, 0.0, 10.0, 10.0)), &NoMerge);
        lanes.enqueue(Event::paint(1, Rect::new(50.0, 50.0, 60.0, 60.0)), &NoMerge);
        // Contained in the second paint only.
        lanes.enqueue(Event::paint(1, Rect::new(52.0, 52.0, 55.0, 55.0)), &NoMerge);
        assert_eq!(lanes.len(), 2);
    }

    #[test]
    fn pointer_move_replaces_in_place() {
        let mut lanes: Lanes<u32, &'static str> = Lanes::new();
        lanes.enqueue(Event::pointer_move(1, Point::new(1.0, 1.0)), &NoMerge);
        lanes.enqueue(named(1, "between"), &NoMerge);
        lanes.enqueue(Event::pointer_move(1, Point::new(7.0, 8.0)).with_timestamp(9), &NoMerge);
        let first = lanes.dequeue().unwrap();
        assert_eq!(first.body, EventBody::PointerMove(Point::new(7.0, 8.0)));
        assert_eq!(first.timestamp, Some(9));
        assert_eq!(lanes.dequeue().unwrap().body, EventBody::Other("between"));
    }

    #[test]
    fn moves_from_different_sources_do_not_merge() {
        let mut lanes: Lanes<u32, ()> = Lanes::new();
        lanes.enqueue(Event::pointer_move(1, Point::new(1.0, 1.0)), &NoMerge);
        lanes.enqueue(Event::pointer_move(2, Point::new(1.0, 1.0)), &NoMerge);
        lanes.enqueue(Event::pointer_drag(1, Point::new(1.0, 1.0)), &NoMerge);
        assert_eq!(lanes.len(), 3);
    }

    #[test]
    fn coalesced_replacement_keeps_the_cached_lane() {
        let mut lanes: Lanes<u32, ()> = Lanes::new();
        lanes.enqueue(Event::pointer_move(1, Point::ZERO), &NoMerge);
        lanes.enqueue(Event::pointer_move(1, Point::new(3.0, 3.0)).with_priority(Priority::High), &NoMerge);
        assert_eq!(lanes.count_in(Priority::Normal), 1);
        assert_eq!(lanes.count_in(Priority::High), 0);
    }

    #[test]
    fn dequeued_events_leave_the_cache() {
        let mut lanes: Lanes<u32, ()> = Lanes::new();
        lanes.enqueue(Event::pointer_move(1, Point::ZERO), &NoMerge);
        assert!(lanes.has_cache_slot(1, EventKind::PointerMove));
        let _ = lanes.dequeue();
        assert!(!lanes.has_cache_slot(1, EventKind::PointerMove));
        lanes.enqueue(Event::pointer_move(1, Point::new(1.0, 1.0)), &NoMerge);
        assert_eq!(lanes.len(), 1);
    }

    #[test]
    fn custom_payloads_merge_through_the_hook() {
        struct Latest;
        impl MergeHook<u32, &'static str> for Latest {
            fn kind(&self, _source: &u32, payload: &&'static str) -> Option<u32> {
                payload.starts_with("resize").then_some(7)
            }
            fn merge(&self, _source: &u32, _existing: &&'static str, newer: &&'static str) -> Option<&'static str> {
                (*newer != "resize-final").then_some(*newer)
            }
        }

        let mut lanes = Lanes::new();
        lanes.enqueue(named(1, "resize-1"), &Latest);
        lanes.enqueue(named(1, "click"), &Latest);
        lanes.enqueue(named(1, "resize-2"), &Latest);
        // The hook declines this merge: the slot moves to the new event.
        lanes.enqueue(named(1, "resize-final"), &Latest);
        assert!(lanes.has_cache_slot(1, EventKind::Custom(7)));
        assert_eq!(names(&mut lanes), vec!["resize-2", "click", "resize-final"]);
    }

    #[test]
    fn dequeue_where_leaves_rejected_events_in_place() {
        let mut lanes = Lanes::new();
        lanes.enqueue(named(1, "a"), &NoMerge);
        lanes.enqueue(named(2, "b"), &NoMerge);
        lanes.enqueue(named(1, "c"), &NoMerge);
        let only_two = lanes.dequeue_where(|e| e.source == Some(2)).unwrap();
        assert_eq!(only_two.body, EventBody::Other("b"));
        assert!(lanes.dequeue_where(|e| e.source == Some(2)).is_none());
        lanes.enqueue(named(1, "d"), &NoMerge);
        assert_eq!(names(&mut lanes), vec!["a", "c", "d"]);
    }

    #[test]
    fn remove_source_unlinks_head_middle_and_tail() {
        let mut lanes = Lanes::new();
        for (source, name) in [(1, "a"), (2, "b"), (1, "c"), (2, "d"), (1, "e")] {
            lanes.enqueue(named(source, name), &NoMerge);
        }
        assert_eq!(lanes.remove_source(&1), 3);
        lanes.enqueue(named(3, "f"), &NoMerge);
        assert_eq!(names(&mut lanes), vec!["b", "d", "f"]);
    }

    #[test]
    fn stale_keys_do_not_resolve() {
        let mut lanes = Lanes::new();
        let k = lanes.enqueue(named(1, "a"), &NoMerge).key();
        assert!(lanes.get(k).is_some());
        let _ = lanes.dequeue();
        let k2 = lanes.enqueue(named(1, "b"), &NoMerge).key();
        assert!(lanes.get(k).is_none());
        assert_eq!(lanes.get(k2).and_then(|e| e.body.other().copied()), Some("b"));
    }

    #[test]
    fn drain_and_iter_follow_dequeue_order() {
        let mut lanes = Lanes::new();
        lanes.enqueue(named(1, "n1"), &NoMerge);
        lanes.enqueue(named(1, "l1").with_priority(Priority::Low), &NoMerge);
        lanes.enqueue(named(1, "h1").with_priority(Priority::High), &NoMerge);
        lanes.enqueue(named(1, "n2"), &NoMerge);
        let seen: Vec<_> = lanes.iter().filter_map(|e| e.body.other().copied()).collect();
        assert_eq!(seen, vec!["h1", "n1", "n2", "l1"]);
        assert_eq!(lanes.peek().and_then(|e| e.body.other().copied()), Some("h1"));
        let drained: Vec<_> = lanes.drain().into_iter().filter_map(|e| e.body.other().copied()).collect();
        assert_eq!(drained, seen);
        assert!(lanes.is_empty());
        assert!(lanes.peek().is_none());
    }
}
