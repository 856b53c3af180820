// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Timing and naming knobs for a [`Runtime`](crate::Runtime).

use std::borrow::Cow;
use std::time::Duration;

/// Configuration shared by every context of a runtime.
///
/// All waits in the engine are bounded by one of these durations, so a lost
/// wakeup costs at most one slice instead of a hang.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchConfig {
    /// How long a dispatch thread stays parked on an empty queue before it may
    /// exit. It only exits if the whole runtime is quiescent at that point.
    pub idle_grace: Duration,
    /// Upper bound for one parked wait of a dispatch thread or nested loop.
    pub wait_slice: Duration,
    /// How often a synchronous caller re-checks the destination for disposal
    /// and interruption while it waits.
    pub sync_poll_interval: Duration,
    /// Prefix of dispatch thread names: `{prefix}-{context}-{n}`.
    pub thread_name_prefix: Cow<'static, str>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            idle_grace: Duration::from_secs(1),
            wait_slice: Duration::from_millis(100),
            sync_poll_interval: Duration::from_millis(100),
            thread_name_prefix: Cow::Borrowed("understory-dispatch"),
        }
    }
}

impl DispatchConfig {
    /// Set [`DispatchConfig::idle_grace`].
    #[must_use]
    pub fn with_idle_grace(mut self, idle_grace: Duration) -> Self {
        self.idle_grace = idle_grace;
        self
    }

    /// Set [`DispatchConfig::wait_slice`].
    ///
    /// A zero slice is raised to one millisecond.
    #[must_use]
    pub fn with_wait_slice(mut self, wait_slice: Duration) -> Self {
        self.wait_slice = wait_slice.max(Duration::from_millis(1));
        self
    }

    /// Set [`DispatchConfig::sync_poll_interval`].
    ///
    /// A zero interval is raised to one millisecond.
    #[must_use]
    pub fn with_sync_poll_interval(mut self, interval: Duration) -> Self {
        self.sync_poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set [`DispatchConfig::thread_name_prefix`].
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<Cow<'static, str>>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}
