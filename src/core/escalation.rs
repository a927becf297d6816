//! Central decision point for recoverable failures.
//!
//! Every recoverable failure in a run is routed through
//! [`EscalationPolicy::escalate`], which either counts it silently
//! (non-interactive), asks the operator (interactive), or aborts.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Abort,
}

/// Count of non-fatal failures seen during one run.
///
/// Cloned handles share the same counter, so pool workers can record
/// failures concurrently.
#[derive(Debug, Clone, Default)]
pub struct ErrorLedger {
    count: Arc<AtomicU64>,
}

impl ErrorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure and return the new total.
    pub fn record(&self) -> u64 {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }
}

/// Source of operator answers in interactive mode.
pub trait Prompt: Send + Sync {
    /// Show `message` and return one line of input, or `None` at end of input.
    fn ask(&self, message: &str) -> io::Result<Option<String>>;
}

/// Prompts on stderr and reads the answer from stdin.
pub struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn ask(&self, message: &str) -> io::Result<Option<String>> {
        let mut stderr = io::stderr().lock();
        write!(stderr, "\n{}\nContinue anyway? [y/n] ", message)?;
        stderr.flush()?;

        let mut input = String::new();
        if io::stdin().lock().read_line(&mut input)? == 0 {
            return Ok(None);
        }
        Ok(Some(input))
    }
}

/// Replays canned answers. Used for unattended simulations and tests.
#[derive(Default)]
pub struct ScriptedPrompt {
    answers: StdMutex<VecDeque<String>>,
    asked: AtomicUsize,
}

impl ScriptedPrompt {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: StdMutex::new(answers.into_iter().map(Into::into).collect()),
            asked: AtomicUsize::new(0),
        }
    }

    /// Number of times the prompt was shown.
    pub fn times_asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

impl Prompt for ScriptedPrompt {
    fn ask(&self, _message: &str) -> io::Result<Option<String>> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        let mut answers = self
            .answers
            .lock()
            .map_err(|_| io::Error::other("prompt script poisoned"))?;
        Ok(answers.pop_front())
    }
}

/// Decides between continuing and aborting after a recoverable failure.
///
/// When `non_interactive` is set the policy never prompts; the outcome is
/// then fixed by `abort_on_error`. An open prompt is abandoned as soon as
/// the run is interrupted.
pub struct EscalationPolicy {
    ledger: ErrorLedger,
    non_interactive: bool,
    abort_on_error: bool,
    prompt: Arc<dyn Prompt>,
    // One question on the terminal at a time.
    gate: Mutex<()>,
    shutdown: CancellationToken,
}

impl EscalationPolicy {
    pub fn new(
        ledger: ErrorLedger,
        non_interactive: bool,
        abort_on_error: bool,
        prompt: Arc<dyn Prompt>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ledger,
            non_interactive,
            abort_on_error,
            prompt,
            gate: Mutex::new(()),
            shutdown,
        }
    }

    pub fn ledger(&self) -> &ErrorLedger {
        &self.ledger
    }

    pub async fn escalate(&self, message: &str) -> Decision {
        if self.non_interactive {
            let total = self.ledger.record();
            if self.abort_on_error {
                warn!(errors = total, failure = %message, "Aborting run on error");
                return Decision::Abort;
            }
            warn!(errors = total, failure = %message, "Failure suppressed, continuing");
            return Decision::Continue;
        }

        let _gate = self.gate.lock().await;

        loop {
            if self.shutdown.is_cancelled() {
                warn!(failure = %message, "Interrupted, not prompting");
                return Decision::Abort;
            }

            let answer = tokio::select! {
                answer = self.ask_detached(message) => answer,
                _ = self.shutdown.cancelled() => {
                    warn!(failure = %message, "Interrupted while waiting for an answer");
                    return Decision::Abort;
                }
            };

            let Some(answer) = answer else {
                warn!(failure = %message, "No answer available, aborting");
                return Decision::Abort;
            };

            match parse_answer(&answer) {
                Some(true) => {
                    let total = self.ledger.record();
                    info!(errors = total, failure = %message, "Operator chose to continue");
                    return Decision::Continue;
                }
                Some(false) => {
                    info!(failure = %message, "Operator chose to abort");
                    return Decision::Abort;
                }
                None => continue,
            }
        }
    }

    /// Ask on a plain thread so a reader stuck on stdin never holds up
    /// runtime shutdown.
    async fn ask_detached(&self, message: &str) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        let prompt = Arc::clone(&self.prompt);
        let question = message.to_string();

        let spawned = std::thread::Builder::new()
            .name("bkpipe-prompt".to_string())
            .spawn(move || {
                let _ = tx.send(prompt.ask(&question));
            });
        if let Err(e) = spawned {
            warn!(error = %e, "Failed to start prompt thread");
            return None;
        }

        match rx.await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to read answer");
                None
            }
            Err(_) => {
                warn!("Prompt thread exited without an answer");
                None
            }
        }
    }
}

fn parse_answer(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}
