//! `procmux` Core Library
//!
//! Bounded-concurrency execution of external commands with multiplexed
//! output handling:
//! - Admission control with a concurrency ceiling and FIFO overflow queue
//! - Non-blocking pipe multiplexing through a single poll-based wait
//! - Per-stream reassembly of byte chunks into text lines
//! - Cooperative cancellation and partial-failure aggregation
//!
//! The engine is synchronous and single-threaded by design: one controller
//! thread owns all process state, and the only blocking call is the bounded
//! readiness wait. Unix only.

pub mod command;
pub mod demux;
pub mod error;
pub mod group;
pub mod process;
pub mod sink;
pub mod switch;
pub mod tracing_init;
pub mod usage;

pub use command::{CommandSpec, JobFailure};
pub use demux::LineDemuxer;
pub use error::{Error, Result};
pub use group::{DEFAULT_MAX_CONCURRENT, DEFAULT_POLL_INTERVAL, GroupConfig, ProcessGroup};
pub use process::{ManagedProcess, StreamKind};
pub use sink::{LineSink, MemorySink, NopSink, SinkLevel, TracingSink};
pub use switch::KillSwitch;
pub use usage::PidTracker;

/// Signal type re-exported for [`ManagedProcess::request_kill`] callers.
pub use nix::sys::signal::Signal;
