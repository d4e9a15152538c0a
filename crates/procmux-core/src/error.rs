//! Error types for the `procmux` engine.

use thiserror::Error;

/// Result type alias using the engine [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Infrastructure errors raised by the engine.
///
/// A child that runs and exits non-zero is not an error: it is recorded and
/// surfaced through the aggregated report returned by
/// [`ProcessGroup::wait_for_finish`](crate::ProcessGroup::wait_for_finish).
#[derive(Debug, Error)]
pub enum Error {
    /// The OS refused to create a child process. Raised synchronously at the
    /// spawn call site; no process state exists afterwards.
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        /// Submission text of the command that failed to start.
        command: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The multiplexed readiness wait itself failed. This is the only error
    /// that aborts a whole batch.
    #[error("Readiness wait failed: {0}")]
    Multiplexing(#[source] std::io::Error),

    /// A submission was structurally invalid (empty argument vector, empty
    /// program name, or blank command line). Raised before any spawn.
    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),
}

/// Converts a raw errno from the OS layer into a [`std::io::Error`].
pub(crate) fn errno_to_io(errno: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno as i32)
}
