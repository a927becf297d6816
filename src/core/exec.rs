//! Guarded invocation of external tools.
//!
//! Every external command goes through [`invoke`] (or [`invoke_pipeline`]
//! for `a | b > file` chains). The command line is logged before it runs,
//! and a failure is settled according to its [`Tier`].

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, ChildStdout, Stdio};

use tracing::{debug, error, info, warn};

use crate::context::RunContext;
use crate::core::escalation::Decision;
use crate::error::{BackupError, Result};

/// How a failed step is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Terminate the run.
    Abort,
    /// Ask the escalation policy.
    Escalate,
    /// Log and carry on.
    LogOnly,
}

/// Result of a guarded step that did not terminate the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A program and its arguments.
#[derive(Debug, Clone)]
pub struct Invocation {
    program: String,
    args: Vec<OsString>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    fn std_command(&self) -> std::process::Command {
        let mut command = std::process::Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Run `cmd` to completion and settle a failure according to `tier`.
pub async fn invoke(ctx: &RunContext, step: &str, cmd: &Invocation, tier: Tier) -> Result<Outcome> {
    if ctx.is_interrupted() {
        warn!(step, command = %cmd, "Interrupted, not starting command");
        return Err(BackupError::Interrupted);
    }

    info!(step, command = %cmd, "Running");

    let status = tokio::process::Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .status()
        .await;

    let detail = match status {
        Ok(status) if status.success() => {
            debug!(step, "Command succeeded");
            return Ok(Outcome::Success);
        }
        Ok(status) => format!("`{}` exited with {}", cmd, status),
        Err(e) => format!("could not start `{}`: {}", cmd.program, e),
    };

    fail(ctx, step, tier, detail).await
}

/// Run `stages` as a shell-style pipeline writing the last stage's stdout
/// to `output`. The first stage that fails, in pipeline order, decides the
/// outcome.
pub async fn invoke_pipeline(
    ctx: &RunContext,
    step: &str,
    stages: &[Invocation],
    output: &Path,
    tier: Tier,
) -> Result<Outcome> {
    if ctx.is_interrupted() {
        warn!(step, "Interrupted, not starting pipeline");
        return Err(BackupError::Interrupted);
    }

    let rendered = stages
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ");
    info!(step, command = %format!("{} > {}", rendered, output.display()), "Running");

    let stages = stages.to_vec();
    let output = output.to_path_buf();
    let result = tokio::task::spawn_blocking(move || run_pipeline_blocking(&stages, &output))
        .await
        .map_err(|e| BackupError::StepFailed {
            step: step.to_string(),
            detail: format!("pipeline task failed: {}", e),
        })?;

    match result {
        Ok(()) => {
            debug!(step, "Pipeline succeeded");
            Ok(Outcome::Success)
        }
        Err(detail) => fail(ctx, step, tier, detail).await,
    }
}

/// Settle a failed step that did not come from a process exit status, such
/// as a filesystem check or an in-process copy.
pub async fn fail(ctx: &RunContext, step: &str, tier: Tier, detail: impl Into<String>) -> Result<Outcome> {
    let detail = detail.into();
    match tier {
        Tier::Abort => {
            error!(step, detail = %detail, "Fatal step failure");
            Err(BackupError::StepFailed {
                step: step.to_string(),
                detail,
            })
        }
        Tier::Escalate => {
            warn!(step, detail = %detail, "Step failed");
            let message = format!("{}: {}", step, detail);
            match ctx.escalate(&message).await {
                Decision::Continue => Ok(Outcome::Failed),
                Decision::Abort if ctx.is_interrupted() => Err(BackupError::Interrupted),
                Decision::Abort => Err(BackupError::Aborted(message)),
            }
        }
        Tier::LogOnly => {
            warn!(step, detail = %detail, "Best-effort step failed");
            Ok(Outcome::Failed)
        }
    }
}

/// Blocking, log-only invocation for contexts without a runtime, such as
/// teardown from `Drop`. Returns whether the command succeeded.
pub fn run_logged_blocking(cmd: &Invocation) -> bool {
    debug!(command = %cmd, "Running");
    match cmd.std_command().stdin(Stdio::null()).status() {
        Ok(status) if status.success() => true,
        Ok(status) => {
            warn!(command = %cmd, %status, "Command failed");
            false
        }
        Err(e) => {
            warn!(command = %cmd, error = %e, "Could not start command");
            false
        }
    }
}

fn run_pipeline_blocking(stages: &[Invocation], output: &Path) -> std::result::Result<(), String> {
    let Some(last) = stages.len().checked_sub(1) else {
        return Ok(());
    };

    let sink = File::create(output)
        .map_err(|e| format!("could not create {}: {}", output.display(), e))?;
    let mut sink = Some(sink);

    let mut children: Vec<(&Invocation, Child)> = Vec::with_capacity(stages.len());
    let mut upstream: Option<ChildStdout> = None;
    let mut spawn_error = None;

    for (i, stage) in stages.iter().enumerate() {
        let mut command = stage.std_command();
        command.stdin(match upstream.take() {
            Some(stdout) => Stdio::from(stdout),
            None => Stdio::null(),
        });
        match (i == last).then(|| sink.take()).flatten() {
            Some(file) => command.stdout(Stdio::from(file)),
            None => command.stdout(Stdio::piped()),
        };

        match command.spawn() {
            Ok(mut child) => {
                upstream = child.stdout.take();
                children.push((stage, child));
            }
            Err(e) => {
                spawn_error = Some(format!("could not start `{}`: {}", stage.program, e));
                break;
            }
        }
    }
    // Close any dangling read end so earlier stages see EPIPE and exit.
    drop(upstream);

    // A stage killed by SIGPIPE only reflects a reader that went away; the
    // reader's own failure is the one worth reporting.
    let mut first_failure = None;
    let mut broken_pipe = None;
    for (stage, mut child) in children {
        match child.wait() {
            Ok(status) if status.success() => {}
            Ok(status) if status.signal() == Some(libc::SIGPIPE) => {
                broken_pipe.get_or_insert_with(|| format!("`{}` exited with {}", stage, status));
            }
            Ok(status) => {
                first_failure.get_or_insert_with(|| format!("`{}` exited with {}", stage, status));
            }
            Err(e) => {
                first_failure.get_or_insert_with(|| format!("failed to wait for `{}`: {}", stage, e));
            }
        }
    }

    match spawn_error.or(first_failure).or(broken_pipe) {
        Some(detail) => Err(detail),
        None => Ok(()),
    }
}
