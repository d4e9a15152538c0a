//! One spawned child and its demultiplexed output streams.

use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};
use tracing::{debug, warn};

use crate::command::CommandSpec;
use crate::demux::LineDemuxer;
use crate::error::{Error, Result, errno_to_io};
use crate::sink::LineSink;

/// Bytes read from a pipe per [`ManagedProcess::consume`] call.
const READ_CHUNK: usize = 4096;

/// Which output stream a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Child stdout; lines reach the sink at debug severity.
    Stdout,
    /// Child stderr; lines reach the sink at warn severity.
    Stderr,
}

/// One live output pipe and its line reassembly state.
struct StreamState {
    fd: OwnedFd,
    demux: LineDemuxer,
}

/// A spawned child with piped, non-blocking stdout and stderr.
///
/// The child's stdin is bound to the null device so it can never block on
/// input. Each output stream owns its pipe end and its own [`LineDemuxer`];
/// a stream is retired at EOF, independently of process exit. The exit
/// status is collected exactly once and cached.
pub struct ManagedProcess {
    command: CommandSpec,
    child: Child,
    pid: u32,
    killed: bool,
    completed: bool,
    exit_code: Option<i32>,
    stdout: Option<StreamState>,
    stderr: Option<StreamState>,
    sink: Arc<dyn LineSink>,
}

impl ManagedProcess {
    /// Spawns `command`, optionally in `cwd`.
    ///
    /// Both output pipes are switched to non-blocking mode before the
    /// process is handed back, so reads from them can never stall the
    /// controller loop.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidSubmission`] for a structurally invalid command and
    /// [`Error::Spawn`] when the OS refuses to start it. Failure here is
    /// hard and synchronous: no process state survives.
    pub fn spawn(
        command: CommandSpec,
        cwd: Option<&Path>,
        sink: Arc<dyn LineSink>,
    ) -> Result<Self> {
        let argv = command.exec_argv()?;
        let mut builder = Command::new(&argv[0]);
        builder
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            builder.current_dir(dir);
        }

        let mut child = builder.spawn().map_err(|source| Error::Spawn {
            command: command.to_string(),
            source,
        })?;
        let pid = child.id();

        let (stdout_fd, stderr_fd) = match take_nonblocking_pipes(&mut child) {
            Ok(fds) => fds,
            Err(source) => {
                // The child is already running; reap it before bailing out.
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Spawn {
                    command: command.to_string(),
                    source,
                });
            }
        };

        debug!(pid, command = %command, "spawned process");

        Ok(Self {
            command,
            child,
            pid,
            killed: false,
            completed: false,
            exit_code: None,
            stdout: Some(StreamState {
                fd: stdout_fd,
                demux: LineDemuxer::new(),
            }),
            stderr: Some(StreamState {
                fd: stderr_fd,
                demux: LineDemuxer::new(),
            }),
            sink,
        })
    }

    /// Output handles still open, paired with the stream they belong to.
    ///
    /// Retired streams (EOF already seen) no longer appear here.
    pub fn readable_handles(&self) -> impl Iterator<Item = (StreamKind, BorrowedFd<'_>)> {
        let stdout = self
            .stdout
            .as_ref()
            .map(|s| (StreamKind::Stdout, s.fd.as_fd()));
        let stderr = self
            .stderr
            .as_ref()
            .map(|s| (StreamKind::Stderr, s.fd.as_fd()));
        stdout.into_iter().chain(stderr)
    }

    /// Performs one bounded non-blocking read from the given stream.
    ///
    /// Complete lines go to the sink. A zero-byte read is EOF: the stream's
    /// unterminated remainder (if any) is delivered and the handle retired.
    /// EOF alone does not mark the process completed. A would-block or
    /// interrupted read is a no-op, so spurious wakeups are harmless.
    pub fn consume(&mut self, kind: StreamKind) {
        let slot = match kind {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        };
        let Some(stream) = slot.as_mut() else {
            return;
        };

        let mut chunk = [0_u8; READ_CHUNK];
        match unistd::read(&stream.fd, &mut chunk) {
            Ok(0) => {
                if let Some(rest) = stream.demux.flush() {
                    emit(self.sink.as_ref(), kind, &rest);
                }
                *slot = None;
            }
            Ok(n) => {
                for line in stream.demux.feed(&chunk[..n]) {
                    emit(self.sink.as_ref(), kind, &line);
                }
            }
            Err(Errno::EAGAIN | Errno::EINTR) => {}
            Err(errno) => {
                warn!(pid = self.pid, ?kind, %errno, "read error on child pipe, retiring handle");
                if let Some(rest) = stream.demux.flush() {
                    emit(self.sink.as_ref(), kind, &rest);
                }
                *slot = None;
            }
        }
    }

    /// Non-blocking exit check.
    ///
    /// On the transition to completed this drains whatever both streams
    /// still hold, delivers every demuxer remainder, records the exit code
    /// and emits a single completion line on the sink. Subsequent calls
    /// return the cached result without re-invoking the OS wait.
    pub fn poll_completed(&mut self) -> bool {
        if self.completed {
            return true;
        }
        let status = match self.child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return false,
            Err(err) => {
                warn!(pid = self.pid, %err, "exit poll failed");
                return false;
            }
        };

        self.drain_remaining();
        let code = exit_code_of(status);
        self.exit_code = Some(code);
        self.completed = true;
        self.sink.info(&format!(
            "pid {} `{}` exited with status {}",
            self.pid, self.command, code
        ));
        true
    }

    /// Sends `signal` to the child exactly once.
    ///
    /// Does nothing if the process was already signaled or has completed.
    /// A child that disappeared on its own (`ESRCH`) is left for the
    /// completion poll to reap.
    pub fn request_kill(&mut self, signal: Signal) {
        if self.killed || self.completed {
            return;
        }
        self.killed = true;

        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid::from_raw(self.pid as i32);
        match signal::kill(pid, signal) {
            Ok(()) => debug!(pid = self.pid, %signal, "signaled process"),
            Err(Errno::ESRCH) => {}
            Err(errno) => {
                warn!(pid = self.pid, %signal, %errno, "failed to signal process");
            }
        }
    }

    /// OS process id.
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// The submission this process was spawned from.
    pub const fn command(&self) -> &CommandSpec {
        &self.command
    }

    /// Exit code, once completed. Signal terminations map to
    /// `128 + signal`.
    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Whether the exit status has been collected.
    pub const fn is_completed(&self) -> bool {
        self.completed
    }

    /// Whether a terminate signal was sent.
    pub const fn was_killed(&self) -> bool {
        self.killed
    }

    /// Reads both remaining streams to EOF and delivers their remainders.
    /// Runs once, at the completion transition, so no buffered tail is
    /// lost even when EOF handles were already retired.
    fn drain_remaining(&mut self) {
        for kind in [StreamKind::Stdout, StreamKind::Stderr] {
            let slot = match kind {
                StreamKind::Stdout => &mut self.stdout,
                StreamKind::Stderr => &mut self.stderr,
            };
            let Some(mut stream) = slot.take() else {
                continue;
            };

            let mut chunk = [0_u8; READ_CHUNK];
            loop {
                match unistd::read(&stream.fd, &mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in stream.demux.feed(&chunk[..n]) {
                            emit(self.sink.as_ref(), kind, &line);
                        }
                    }
                    Err(Errno::EINTR) => {}
                    // EAGAIN: something inherited the write end and keeps
                    // it open; everything the child buffered is out.
                    Err(_) => break,
                }
            }
            if let Some(rest) = stream.demux.flush() {
                emit(self.sink.as_ref(), kind, &rest);
            }
        }
    }
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("command", &self.command)
            .field("pid", &self.pid)
            .field("killed", &self.killed)
            .field("completed", &self.completed)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

fn emit(sink: &dyn LineSink, kind: StreamKind, line: &str) {
    match kind {
        StreamKind::Stdout => sink.debug(line),
        StreamKind::Stderr => sink.warn(line),
    }
}

/// Collapses an exit status to a single code; signal deaths follow the
/// shell convention `128 + signal`.
fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Moves both pipe ends out of the child and switches them to
/// non-blocking mode.
fn take_nonblocking_pipes(child: &mut Child) -> std::io::Result<(OwnedFd, OwnedFd)> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("child stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("child stderr was not piped"))?;
    let stdout = OwnedFd::from(stdout);
    let stderr = OwnedFd::from(stderr);
    set_nonblocking(&stdout)?;
    set_nonblocking(&stderr)?;
    Ok((stdout, stderr))
}

fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(errno_to_io)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(errno_to_io)?;
    Ok(())
}
