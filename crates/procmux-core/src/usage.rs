//! External PID accounting hook.

/// Receives the PID of every process a group spawns.
///
/// [`ProcessGroup`](crate::ProcessGroup) calls [`PidTracker::add_pid`]
/// exactly once per spawned child, at spawn time, before the child is first
/// polled. Implementations typically feed an external resource-usage
/// recorder; the engine itself keeps no reference to the PID beyond the
/// child handle.
pub trait PidTracker: Send + Sync {
    /// Records one spawned PID.
    fn add_pid(&self, pid: u32);
}
