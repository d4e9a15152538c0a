//! Command submissions and the failure record they produce.

use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};

/// A command submitted for execution.
///
/// The two forms have distinct execution semantics: [`CommandSpec::Args`]
/// executes the program directly with no shell involved, while
/// [`CommandSpec::Shell`] hands the whole line to `/bin/sh -c`, so shell
/// builtins and shell exit semantics apply (`exit 7` really exits 7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSpec {
    /// Explicit argument vector; element 0 is the program.
    Args(Vec<String>),
    /// A command line run under `/bin/sh -c`.
    Shell(String),
}

impl CommandSpec {
    /// Builds an argument-vector submission.
    pub fn args<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Args(argv.into_iter().map(Into::into).collect())
    }

    /// Builds a shell-string submission.
    pub fn shell(line: impl Into<String>) -> Self {
        Self::Shell(line.into())
    }

    /// Checks that the submission is structurally executable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSubmission`] for an empty argument vector, an
    /// empty program name, or a blank command line.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Args(argv) if argv.is_empty() => {
                Err(Error::InvalidSubmission("empty argument vector".into()))
            }
            Self::Args(argv) if argv.first().is_some_and(String::is_empty) => {
                Err(Error::InvalidSubmission("empty program name".into()))
            }
            Self::Shell(line) if line.trim().is_empty() => {
                Err(Error::InvalidSubmission("blank command line".into()))
            }
            _ => Ok(()),
        }
    }

    /// The argument vector actually handed to the OS.
    pub fn exec_argv(&self) -> Result<Vec<String>> {
        self.validate()?;
        Ok(match self {
            Self::Args(argv) => argv.clone(),
            Self::Shell(line) => vec!["/bin/sh".into(), "-c".into(), line.clone()],
        })
    }
}

/// Displays the submission as originally given, for logs and reports.
impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Args(argv) => f.write_str(&argv.join(" ")),
            Self::Shell(line) => f.write_str(line),
        }
    }
}

/// One non-zero exit, recorded for the final report rather than raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    /// The submission as originally given.
    pub command: CommandSpec,
    /// Exit code; signal terminations map to `128 + signal`.
    pub exit_code: i32,
}
