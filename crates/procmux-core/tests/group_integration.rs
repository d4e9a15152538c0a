#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)] // Integration tests use unwrap for brevity
#![cfg(unix)]

//! End-to-end tests for the process group scheduler.
//!
//! Every test spawns real processes (`/bin/sh`, `sleep`, `true`) and drives
//! them through the public API: admission control, output demultiplexing,
//! cancellation and the aggregated failure report.

use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use procmux_core::{
    CommandSpec, GroupConfig, JobFailure, KillSwitch, LineSink, ManagedProcess, MemorySink,
    PidTracker, ProcessGroup, Signal, SinkLevel,
};

const SIGTERM_EXIT: i32 = 128 + Signal::SIGTERM as i32;

fn quick_config(max_concurrent: usize) -> GroupConfig {
    GroupConfig {
        max_concurrent,
        poll_interval: Duration::from_millis(20),
    }
}

fn group_with_sink(max_concurrent: usize) -> (ProcessGroup, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let group = ProcessGroup::new(quick_config(max_concurrent))
        .with_sink(Arc::clone(&sink) as Arc<dyn LineSink>);
    (group, sink)
}

struct RecordingTracker(Mutex<Vec<u32>>);

impl RecordingTracker {
    fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    fn pids(&self) -> Vec<u32> {
        self.0.lock().unwrap().clone()
    }
}

impl PidTracker for RecordingTracker {
    fn add_pid(&self, pid: u32) {
        self.0.lock().unwrap().push(pid);
    }
}

// ===== Success and failure reporting =====

#[test]
fn single_true_reports_total_success() {
    let (mut group, _sink) = group_with_sink(2);
    group.submit(CommandSpec::args(["true"]), None).unwrap();
    assert_eq!(group.wait_for_finish().unwrap(), None);
    assert_eq!(group.running_count(), 0);
    assert_eq!(group.process_count(), 1);
}

#[test]
fn shell_exit_code_lands_in_the_report() {
    let (mut group, _sink) = group_with_sink(2);
    group.submit(CommandSpec::shell("exit 7"), None).unwrap();

    let failures = group.wait_for_finish().unwrap().expect("one failure");
    assert_eq!(
        failures,
        vec![JobFailure {
            command: CommandSpec::shell("exit 7"),
            exit_code: 7,
        }]
    );
}

#[test]
fn failures_are_ordered_by_completion_not_submission() {
    let (mut group, _sink) = group_with_sink(2);
    group
        .submit(CommandSpec::shell("sleep 1; exit 5"), None)
        .unwrap();
    group.submit(CommandSpec::shell("exit 3"), None).unwrap();

    let failures = group.wait_for_finish().unwrap().expect("two failures");
    assert_eq!(failures[0].command, CommandSpec::shell("exit 3"));
    assert_eq!(failures[0].exit_code, 3);
    assert_eq!(failures[1].command, CommandSpec::shell("sleep 1; exit 5"));
    assert_eq!(failures[1].exit_code, 5);
}

#[test]
fn mixed_batch_reports_only_the_failures() {
    let (mut group, _sink) = group_with_sink(3);
    group.submit(CommandSpec::args(["true"]), None).unwrap();
    group.submit(CommandSpec::shell("exit 9"), None).unwrap();
    group.submit(CommandSpec::args(["true"]), None).unwrap();

    let failures = group.wait_for_finish().unwrap().expect("one failure");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].exit_code, 9);
    assert_eq!(group.process_count(), 3, "every job ran");
}

#[test]
fn reused_group_keeps_a_cumulative_report() {
    let (mut group, _sink) = group_with_sink(2);
    group.submit(CommandSpec::shell("exit 3"), None).unwrap();
    let first = group.wait_for_finish().unwrap().expect("first failure");
    assert_eq!(first.len(), 1);

    group.submit(CommandSpec::shell("exit 4"), None).unwrap();
    let second = group.wait_for_finish().unwrap().expect("both failures");
    assert_eq!(second.len(), 2);
    assert_eq!(second[0].exit_code, 3);
    assert_eq!(second[1].exit_code, 4);
}

#[test]
fn process_list_enumerates_every_job_with_its_exit() {
    let (mut group, _sink) = group_with_sink(2);
    group.submit(CommandSpec::args(["true"]), None).unwrap();
    group.submit(CommandSpec::shell("exit 9"), None).unwrap();
    let failures = group.wait_for_finish().unwrap().expect("exit 9 fails");
    assert_eq!(failures.len(), 1);

    assert!(group.processes().iter().all(ManagedProcess::is_completed));
    let seen: Vec<(String, Option<i32>)> = group
        .processes()
        .iter()
        .map(|process| (process.command().to_string(), process.exit_code()))
        .collect();
    assert_eq!(
        seen,
        vec![("true".to_owned(), Some(0)), ("exit 9".to_owned(), Some(9))]
    );
}

// ===== Concurrency ceiling =====

#[test]
fn ceiling_of_two_batches_five_sleepers() {
    let (mut group, _sink) = group_with_sink(2);
    let started = Instant::now();
    for _ in 0..5 {
        group.submit(CommandSpec::args(["sleep", "1"]), None).unwrap();
    }
    assert_eq!(group.running_count(), 2, "only two may run at once");
    assert_eq!(group.waiting_count(), 3);

    let failures = group.wait_for_finish().unwrap();
    let elapsed = started.elapsed();

    assert!(failures.is_none());
    assert!(
        elapsed >= Duration::from_millis(2900),
        "five one-second jobs at ceiling 2 need three waves, took {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(4500),
        "two jobs must actually run in parallel, took {elapsed:?}"
    );
    assert_eq!(group.running_count(), 0);
    assert_eq!(group.process_count(), 5);
}

#[test]
fn queued_jobs_are_admitted_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let order = dir.path().join("order.txt");

    let (mut group, _sink) = group_with_sink(1);
    for tag in ["first", "second", "third", "fourth"] {
        let line = format!("echo {tag} >> '{}'", order.display());
        group.submit(CommandSpec::shell(line), None).unwrap();
    }
    assert_eq!(group.wait_for_finish().unwrap(), None);

    let recorded = fs::read_to_string(&order).unwrap();
    let tags: Vec<&str> = recorded.lines().collect();
    assert_eq!(tags, vec!["first", "second", "third", "fourth"]);
}

// ===== Output demultiplexing =====

#[test]
fn unterminated_final_lines_are_all_delivered() {
    let (mut group, sink) = group_with_sink(2);
    group
        .submit(CommandSpec::shell("printf 'one\\ntwo\\nthree'"), None)
        .unwrap();
    assert_eq!(group.wait_for_finish().unwrap(), None);
    assert_eq!(
        sink.lines_at(SinkLevel::Debug),
        vec!["one", "two", "three"]
    );
}

#[test]
fn interleaved_partial_writes_keep_stream_attribution() {
    let (mut group, sink) = group_with_sink(1);
    let script = "printf 'out-first '; printf 'err-first ' >&2; \
                  sleep 1; \
                  printf 'out-second\\n'; printf 'err-second\\n' >&2";
    group.submit(CommandSpec::shell(script), None).unwrap();
    assert_eq!(group.wait_for_finish().unwrap(), None);

    assert_eq!(
        sink.lines_at(SinkLevel::Debug),
        vec!["out-first out-second"]
    );
    assert_eq!(
        sink.lines_at(SinkLevel::Warn),
        vec!["err-first err-second"]
    );
}

#[test]
fn every_completion_emits_one_info_line() {
    let (mut group, sink) = group_with_sink(3);
    for _ in 0..3 {
        group.submit(CommandSpec::args(["true"]), None).unwrap();
    }
    assert_eq!(group.wait_for_finish().unwrap(), None);
    assert_eq!(sink.lines_at(SinkLevel::Info).len(), 3);
}

#[test]
fn working_directory_is_honored() {
    let dir = tempfile::tempdir().unwrap();
    let canonical = dir.path().canonicalize().unwrap();

    let (mut group, sink) = group_with_sink(1);
    group
        .submit(CommandSpec::shell("pwd -P"), Some(dir.path().to_path_buf()))
        .unwrap();
    assert_eq!(group.wait_for_finish().unwrap(), None);

    let lines = sink.lines_at(SinkLevel::Debug);
    assert_eq!(lines, vec![canonical.display().to_string()]);
}

// ===== Cancellation =====

#[test]
fn kill_switch_drains_running_and_discards_queued() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("started.txt");
    let switch = KillSwitch::new();

    let mut group = ProcessGroup::new(quick_config(1)).with_kill_switch(switch.clone());
    group.submit(CommandSpec::args(["sleep", "30"]), None).unwrap();
    for tag in ["one", "two"] {
        let line = format!("echo {tag} >> '{}'", marker.display());
        group.submit(CommandSpec::shell(line), None).unwrap();
    }
    assert_eq!(group.running_count(), 1);
    assert_eq!(group.waiting_count(), 2);

    switch.set();
    let started = Instant::now();
    let failures = group.wait_for_finish().unwrap().expect("killed job fails");

    assert!(
        started.elapsed() < Duration::from_secs(10),
        "drain must not wait the sleep out"
    );
    assert!(!marker.exists(), "queued jobs must never start");
    assert_eq!(group.waiting_count(), 0);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].exit_code, SIGTERM_EXIT);
    assert_eq!(failures[0].command, CommandSpec::args(["sleep", "30"]));
}

#[test]
fn switch_set_before_any_submission_prevents_all_starts() {
    let switch = KillSwitch::new();
    switch.set();

    let mut group = ProcessGroup::new(quick_config(2)).with_kill_switch(switch);
    group.submit(CommandSpec::args(["true"]), None).unwrap();
    group.submit(CommandSpec::shell("exit 7"), None).unwrap();

    assert_eq!(group.process_count(), 0);
    assert_eq!(group.wait_for_finish().unwrap(), None, "nothing ran");
}

// ===== PID registry =====

#[test]
fn tracker_sees_every_spawn_exactly_once() {
    let tracker = Arc::new(RecordingTracker::new());
    let mut group = ProcessGroup::new(quick_config(2))
        .with_pid_tracker(Arc::clone(&tracker) as Arc<dyn PidTracker>);

    for _ in 0..5 {
        group.submit(CommandSpec::args(["true"]), None).unwrap();
    }
    assert_eq!(group.wait_for_finish().unwrap(), None);

    let pids = tracker.pids();
    assert_eq!(pids.len(), 5, "one registration per spawn");
    let unique: HashSet<u32> = pids.iter().copied().collect();
    assert_eq!(unique.len(), 5);
}
