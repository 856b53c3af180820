// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runtime-wide liveness bookkeeping for dispatch threads.
//!
//! An idle dispatch thread may only exit when nothing else in its runtime is
//! still working: no other dispatch thread is delivering an event and no stack
//! holds pending events. The watchdog answers that question without touching
//! any stack lock.

use std::time::{Duration, Instant};

use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex};

use crate::stack::StackId;

#[derive(Debug, Default)]
struct WatchState {
    live: usize,
    busy: usize,
    pending: HashSet<StackId>,
}

#[derive(Debug, Default)]
pub(crate) struct Watchdog {
    state: Mutex<WatchState>,
    cond: Condvar,
}

impl Watchdog {
    pub(crate) fn thread_started(&self) {
        self.state.lock().live += 1;
    }

    pub(crate) fn thread_exited(&self) {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
        self.cond.notify_all();
    }

    pub(crate) fn busy(&self) {
        self.state.lock().busy += 1;
    }

    pub(crate) fn idle(&self) {
        let mut state = self.state.lock();
        state.busy = state.busy.saturating_sub(1);
        self.cond.notify_all();
    }

    pub(crate) fn set_pending(&self, stack: StackId, pending: bool) {
        let mut state = self.state.lock();
        let changed = if pending {
            state.pending.insert(stack)
        } else {
            state.pending.remove(&stack)
        };
        if changed && !pending {
            self.cond.notify_all();
        }
    }

    /// No thread is delivering and no stack has pending events.
    pub(crate) fn quiescent(&self) -> bool {
        let state = self.state.lock();
        state.busy == 0 && state.pending.is_empty()
    }

    pub(crate) fn live_threads(&self) -> usize {
        self.state.lock().live
    }

    /// Wait until every dispatch thread has exited. Returns `false` on timeout.
    pub(crate) fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.live > 0 {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return state.live == 0;
            }
        }
        true
    }
}
