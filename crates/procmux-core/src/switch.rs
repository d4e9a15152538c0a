//! Cooperative cancellation flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared drain request: clones observe the same flag across threads.
///
/// Setting the switch asks a running [`ProcessGroup`](crate::ProcessGroup)
/// to stop admitting work: each live child receives one terminate signal,
/// queued jobs are discarded, and the wait loop still drains remaining
/// output and reaps exits. Set before the wait starts, it prevents queued
/// jobs from ever starting. The switch never resets.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch {
    flag: Arc<AtomicBool>,
}

impl KillSwitch {
    /// Creates an unset switch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a drain. Safe to call from any thread, any number of times.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether a drain has been requested.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
