//! Bounded-concurrency scheduling across managed processes.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::Signal;
use tracing::{debug, info};

use crate::command::{CommandSpec, JobFailure};
use crate::error::{Error, Result, errno_to_io};
use crate::process::{ManagedProcess, StreamKind};
use crate::sink::{LineSink, NopSink};
use crate::switch::KillSwitch;
use crate::usage::PidTracker;

/// Concurrency ceiling applied when a config asks for zero.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Default upper bound on one multiplexed readiness wait.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Tunables for a [`ProcessGroup`].
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Maximum number of children running at once (0 selects the default).
    pub max_concurrent: usize,
    /// Upper bound on one readiness wait; also the cadence of completion
    /// polling when no output is flowing.
    pub poll_interval: Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A submission waiting for a free slot.
struct PendingJob {
    command: CommandSpec,
    cwd: Option<PathBuf>,
}

/// Bounded scheduler for external commands.
///
/// A group enforces a concurrency ceiling, queues overflow FIFO, multiplexes
/// every live output pipe through one readiness wait, reaps completions and
/// aggregates non-zero exits. All state is owned by the calling thread; the
/// only cross-thread touch points are the injected [`KillSwitch`] and
/// [`PidTracker`].
///
/// A child that fails never aborts the batch — failures are collected and
/// returned by [`ProcessGroup::wait_for_finish`]. Only infrastructure
/// failures (a refused spawn, a failed readiness wait) surface as errors.
pub struct ProcessGroup {
    max_concurrent: usize,
    poll_interval: Duration,
    running: usize,
    waiting: VecDeque<PendingJob>,
    /// Every process ever admitted, kept for final reporting.
    processes: Vec<ManagedProcess>,
    /// Non-zero exits in the order their completions were observed.
    failures: Vec<JobFailure>,
    sink: Arc<dyn LineSink>,
    kill_switch: Option<KillSwitch>,
    pid_tracker: Option<Arc<dyn PidTracker>>,
}

impl ProcessGroup {
    /// Creates a group with the given tunables and a no-op sink.
    pub fn new(config: GroupConfig) -> Self {
        let max_concurrent = if config.max_concurrent == 0 {
            DEFAULT_MAX_CONCURRENT
        } else {
            config.max_concurrent
        };
        Self {
            max_concurrent,
            poll_interval: config.poll_interval,
            running: 0,
            waiting: VecDeque::new(),
            processes: Vec::new(),
            failures: Vec::new(),
            sink: Arc::new(NopSink),
            kill_switch: None,
            pid_tracker: None,
        }
    }

    /// Replaces the sink receiving child output and completion lines.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn LineSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Attaches a cancellation switch shared with other threads.
    #[must_use]
    pub fn with_kill_switch(mut self, switch: KillSwitch) -> Self {
        self.kill_switch = Some(switch);
        self
    }

    /// Attaches a PID registry, notified once per spawned child.
    #[must_use]
    pub fn with_pid_tracker(mut self, tracker: Arc<dyn PidTracker>) -> Self {
        self.pid_tracker = Some(tracker);
        self
    }

    /// Submits one command for execution.
    ///
    /// Validation happens first, synchronously. If the kill switch is
    /// already set the submission is silently dropped. Otherwise the
    /// command starts immediately when a slot is free and queues FIFO when
    /// not.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidSubmission`] for a structurally invalid command;
    /// [`Error::Spawn`] when an immediately admitted command cannot be
    /// started.
    pub fn submit(&mut self, command: CommandSpec, cwd: Option<PathBuf>) -> Result<()> {
        command.validate()?;
        if self.cancel_requested() {
            debug!(command = %command, "kill switch set, dropping submission");
            return Ok(());
        }
        if self.running < self.max_concurrent {
            self.start_job(command, cwd)?;
        } else {
            debug!(command = %command, waiting = self.waiting.len() + 1, "at capacity, queueing");
            self.waiting.push_back(PendingJob { command, cwd });
        }
        Ok(())
    }

    /// Runs the controller loop until every admitted and queued job has
    /// finished or been discarded by cancellation.
    ///
    /// Returns `Ok(None)` when every process that ran exited 0, otherwise
    /// the failures in completion order. The report is cumulative: a group
    /// reused for several submit/wait rounds keeps listing earlier
    /// failures.
    ///
    /// The only blocking call inside the loop is the multiplexed readiness
    /// wait, bounded by the configured poll interval, so cancellation and
    /// quiet completions are observed promptly.
    ///
    /// # Errors
    ///
    /// [`Error::Multiplexing`] when the readiness wait itself fails and
    /// [`Error::Spawn`] when admitting a queued job fails. In-flight
    /// children are not rolled back in either case.
    pub fn wait_for_finish(&mut self) -> Result<Option<Vec<JobFailure>>> {
        while self.running > 0 || !self.waiting.is_empty() {
            if self.cancel_requested() {
                self.sweep_cancelled();
            }
            self.await_readiness()?;
            self.reap_completions();
            self.admit_queued()?;
        }

        if self.failures.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.failures.clone()))
        }
    }

    /// Number of children currently running (started, not completed).
    pub const fn running_count(&self) -> usize {
        self.running
    }

    /// Number of submissions waiting for a free slot.
    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    /// Number of processes ever admitted.
    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Every process ever admitted, in admission order.
    pub fn processes(&self) -> &[ManagedProcess] {
        &self.processes
    }

    /// Configured concurrency ceiling.
    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    fn cancel_requested(&self) -> bool {
        self.kill_switch.as_ref().is_some_and(KillSwitch::is_set)
    }

    /// Spawns and registers one command, consuming a slot.
    fn start_job(&mut self, command: CommandSpec, cwd: Option<PathBuf>) -> Result<()> {
        let process = ManagedProcess::spawn(command, cwd.as_deref(), Arc::clone(&self.sink))?;
        if let Some(tracker) = &self.pid_tracker {
            tracker.add_pid(process.pid());
        }
        self.running += 1;
        self.processes.push(process);
        Ok(())
    }

    /// One cancellation sweep: discard queued jobs, signal live children.
    /// Per-process idempotence makes repeat sweeps free.
    fn sweep_cancelled(&mut self) {
        if !self.waiting.is_empty() {
            info!(dropped = self.waiting.len(), "kill switch set, discarding queued jobs");
            self.waiting.clear();
        }
        for process in &mut self.processes {
            if !process.is_completed() {
                process.request_kill(Signal::SIGTERM);
            }
        }
    }

    /// One multiplexed readiness wait across every open handle of every
    /// live process, bounded by the poll interval, followed by a read on
    /// each handle that became ready. With no open handles this degrades
    /// to a bounded sleep, keeping the loop responsive to quiet exits.
    fn await_readiness(&mut self) -> Result<()> {
        let mut owners: Vec<(usize, StreamKind)> = Vec::new();
        let mut poll_fds: Vec<PollFd<'_>> = Vec::new();
        for (index, process) in self.processes.iter().enumerate() {
            if process.is_completed() {
                continue;
            }
            for (kind, fd) in process.readable_handles() {
                owners.push((index, kind));
                poll_fds.push(PollFd::new(fd, PollFlags::POLLIN));
            }
        }

        let timeout = poll_timeout_for(self.poll_interval);
        match poll(&mut poll_fds, timeout) {
            Ok(_) => {}
            // Interrupted wait: just run the iteration with nothing ready.
            Err(Errno::EINTR) => return Ok(()),
            Err(errno) => return Err(Error::Multiplexing(errno_to_io(errno))),
        }

        let ready: Vec<(usize, StreamKind)> = poll_fds
            .iter()
            .zip(&owners)
            .filter(|(fd, _)| {
                fd.revents().is_some_and(|revents| {
                    revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                })
            })
            .map(|(_, owner)| *owner)
            .collect();
        drop(poll_fds);

        for (index, kind) in ready {
            self.processes[index].consume(kind);
        }
        Ok(())
    }

    /// Completion-polls every live process; a fresh completion releases its
    /// slot and records a non-zero exit in observation order.
    fn reap_completions(&mut self) {
        for process in &mut self.processes {
            if process.is_completed() || !process.poll_completed() {
                continue;
            }
            self.running -= 1;
            if let Some(code) = process.exit_code().filter(|&code| code != 0) {
                self.failures.push(JobFailure {
                    command: process.command().clone(),
                    exit_code: code,
                });
            }
        }
    }

    /// Starts queued jobs in submission order while slots are free.
    fn admit_queued(&mut self) -> Result<()> {
        while self.running < self.max_concurrent && !self.cancel_requested() {
            let Some(job) = self.waiting.pop_front() else {
                break;
            };
            debug!(command = %job.command, "admitting queued job");
            self.start_job(job.command, job.cwd)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("max_concurrent", &self.max_concurrent)
            .field("poll_interval", &self.poll_interval)
            .field("running", &self.running)
            .field("waiting", &self.waiting.len())
            .field("processes", &self.processes.len())
            .field("failures", &self.failures.len())
            .finish_non_exhaustive()
    }
}

/// Converts the configured interval into a `poll(2)` timeout. Intervals
/// beyond `u16::MAX` milliseconds saturate there; with every handle at EOF
/// the poll set is empty and only this timeout wakes the loop, so it must
/// never stretch toward [`PollTimeout::MAX`].
fn poll_timeout_for(interval: Duration) -> PollTimeout {
    PollTimeout::from(u16::try_from(interval.as_millis()).unwrap_or(u16::MAX))
}
