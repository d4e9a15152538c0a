//! `procmux` CLI
//!
//! Runs a batch of shell commands with a bounded number of parallel
//! children, streaming their output through the tracing pipeline and
//! reporting every non-zero exit at the end. SIGINT/SIGTERM drain the
//! batch: running jobs get one SIGTERM, queued jobs are discarded.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{error, info, warn};

use procmux_core::{
    CommandSpec, DEFAULT_MAX_CONCURRENT, GroupConfig, JobFailure, KillSwitch, ProcessGroup,
    TracingSink, tracing_init::init_tracing,
};

#[derive(Parser, Debug)]
#[command(name = "procmux")]
#[command(version, about = "Run batches of commands with bounded concurrency")]
struct Args {
    /// Jobs file with one command line per row ("-" reads stdin).
    /// Blank lines and lines starting with '#' are skipped.
    jobs_file: Option<PathBuf>,

    /// Ad-hoc command line to run (repeatable; appended after the file).
    #[arg(short = 'c', long = "command", value_name = "CMD")]
    commands: Vec<String>,

    /// Maximum number of jobs running at once
    #[arg(short = 'j', long = "jobs", default_value_t = DEFAULT_MAX_CONCURRENT, env = "PROCMUX_JOBS")]
    max_parallel: usize,

    /// Upper bound in milliseconds on one scheduler readiness wait
    #[arg(long, default_value_t = 100, env = "PROCMUX_POLL_INTERVAL_MS")]
    poll_interval_ms: u64,

    /// Working directory applied to every job
    #[arg(short = 'd', long, env = "PROCMUX_CWD")]
    cwd: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "PROCMUX_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "PROCMUX_LOG_JSON")]
    log_json: bool,

    /// Print a machine-readable run report on stdout.
    #[arg(long)]
    json: bool,
}

/// Machine-readable run summary printed with `--json`.
#[derive(Serialize)]
struct Report<'a> {
    total: usize,
    failed: &'a [JobFailure],
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("procmux={}", args.log_level);
    init_tracing(&log_filter, args.log_json);

    let jobs = collect_jobs(&args)?;
    anyhow::ensure!(
        !jobs.is_empty(),
        "no jobs given (pass a jobs file, \"-\" for stdin, or -c COMMAND)"
    );
    let total = jobs.len();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        jobs = total,
        max_parallel = args.max_parallel,
        "Starting procmux"
    );

    let switch = KillSwitch::new();
    let mut group = ProcessGroup::new(GroupConfig {
        max_concurrent: args.max_parallel,
        poll_interval: Duration::from_millis(args.poll_interval_ms),
    })
    .with_sink(Arc::new(TracingSink))
    .with_kill_switch(switch.clone());

    for line in jobs {
        group.submit(CommandSpec::shell(line), args.cwd.clone())?;
    }

    let watcher = spawn_signal_watcher(switch);
    let failures = tokio::task::spawn_blocking(move || group.wait_for_finish())
        .await
        .context("scheduler thread panicked")??;
    watcher.abort();

    match failures {
        None => {
            info!(total, "All jobs completed successfully");
            if args.json {
                print_report(&Report { total, failed: &[] })?;
            }
            Ok(())
        }
        Some(failed) => {
            for failure in &failed {
                error!(
                    command = %failure.command,
                    exit_code = failure.exit_code,
                    "Job failed"
                );
            }
            if args.json {
                print_report(&Report {
                    total,
                    failed: &failed,
                })?;
            }
            anyhow::bail!("{}/{total} jobs failed", failed.len())
        }
    }
}

/// Gathers job lines from the jobs file (or stdin) and `-c` flags,
/// in that order.
fn collect_jobs(args: &Args) -> anyhow::Result<Vec<String>> {
    let mut jobs = Vec::new();
    if let Some(path) = &args.jobs_file {
        let contents = if path.as_os_str() == "-" {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading jobs from stdin")?;
            buf
        } else {
            std::fs::read_to_string(path)
                .with_context(|| format!("reading jobs file {}", path.display()))?
        };
        jobs.extend(parse_job_lines(&contents));
    }
    jobs.extend(args.commands.iter().cloned());
    Ok(jobs)
}

/// One command line per row; blanks and '#' comments are skipped.
fn parse_job_lines(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToOwned::to_owned)
        .collect()
}

/// Sets the kill switch on the first SIGINT or SIGTERM, asking the
/// scheduler to drain instead of tearing the batch down.
fn spawn_signal_watcher(switch: KillSwitch) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Ok(mut sigterm) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        else {
            warn!("Could not install SIGTERM handler");
            return;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, draining running jobs");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, draining running jobs");
            }
        }
        switch.set();
    })
}

#[allow(clippy::print_stdout)]
fn print_report(report: &Report<'_>) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string(report).context("serializing run report")?
    );
    Ok(())
}
