use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::escalation::{Decision, ErrorLedger, EscalationPolicy, Prompt};
use crate::core::models::Epoch;
use crate::core::tools::Toolbox;

/// State shared by every stage of one run.
///
/// Cheap to clone; clones handed to cloud workers observe the same ledger,
/// policy and shutdown token.
#[derive(Clone)]
pub struct RunContext {
    pub config: Arc<AppConfig>,
    pub epoch: Epoch,
    pub tools: Arc<Toolbox>,
    pub policy: Arc<EscalationPolicy>,
    pub shutdown: CancellationToken,
}

impl RunContext {
    pub fn new(config: AppConfig, epoch: Epoch, tools: Toolbox, prompt: Arc<dyn Prompt>) -> Self {
        let shutdown = CancellationToken::new();
        let policy = EscalationPolicy::new(
            ErrorLedger::new(),
            config.non_interactive,
            config.abort_on_error,
            prompt,
            shutdown.clone(),
        );

        Self {
            config: Arc::new(config),
            epoch,
            tools: Arc::new(tools),
            policy: Arc::new(policy),
            shutdown,
        }
    }

    pub async fn escalate(&self, message: &str) -> Decision {
        self.policy.escalate(message).await
    }

    pub fn ledger(&self) -> &ErrorLedger {
        self.policy.ledger()
    }

    pub fn is_interrupted(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::core::escalation::ScriptedPrompt;
    use crate::core::tools::Tool;

    /// A non-interactive context with no tools marked available.
    pub(crate) fn unattended(abort_on_error: bool) -> RunContext {
        with_config(AppConfig {
            non_interactive: true,
            abort_on_error,
            ..Default::default()
        })
    }

    pub(crate) fn with_config(config: AppConfig) -> RunContext {
        with_tools(config, &[])
    }

    pub(crate) fn with_tools(config: AppConfig, available: &[Tool]) -> RunContext {
        let tools = Toolbox::with_available(&config.tools, config.compressor, available.iter().copied());
        RunContext::new(config, Epoch::now(), tools, Arc::new(ScriptedPrompt::default()))
    }

    /// Write an executable `/bin/sh` script and return its path.
    pub(crate) fn stub_tool(dir: &std::path::Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }
}
