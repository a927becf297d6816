//! Decides which configured destinations a run will actually attempt.
//!
//! Runs after the tool probe and before anything is dispatched. A
//! synchronizing destination without `rsync` falls back to a plain remote
//! copy when `ssh` is available; any class whose tool is missing is
//! escalated once and dropped for the rest of the run.

use tracing::info;

use crate::context::RunContext;
use crate::core::exec::{self, Tier};
use crate::core::models::{Destination, DestinationClass};
use crate::core::tools::{Tool, Toolbox};
use crate::error::Result;

const STEP: &str = "plan";

/// Tools each class needs. Local copies work without any of them.
pub fn required_tools(class: DestinationClass) -> &'static [Tool] {
    match class {
        DestinationClass::Local => &[],
        DestinationClass::RemoteCopy => &[Tool::Scp],
        DestinationClass::SyncCopy => &[Tool::Rsync, Tool::Ssh],
        DestinationClass::CloudCopy => &[Tool::Rclone],
    }
}

/// Rewrite and filter `destinations` against the probed toolbox.
///
/// Pure. Alongside the plan, returns each dropped class once with the
/// programs it was missing, for [`plan`] to escalate.
pub fn rewrite(destinations: Vec<Destination>, tools: &Toolbox) -> (Vec<Destination>, Vec<(DestinationClass, Vec<String>)>) {
    let mut planned = Vec::with_capacity(destinations.len());
    let mut dropped: Vec<(DestinationClass, Vec<String>)> = Vec::new();

    for destination in destinations {
        let destination = match destination {
            Destination::SyncCopy(address) if !tools.has(Tool::Rsync) && tools.has(Tool::Ssh) => {
                info!(address = %address, "rsync unavailable, falling back to remote copy");
                Destination::RemoteCopy(address)
            }
            other => other,
        };

        let class = destination.class();
        let missing: Vec<String> = required_tools(class)
            .iter()
            .filter(|tool| !tools.has(**tool))
            .map(|tool| tools.program(*tool).to_string())
            .collect();

        if missing.is_empty() {
            planned.push(destination);
        } else if !dropped.iter().any(|(c, _)| *c == class) {
            dropped.push((class, missing));
        }
    }

    (planned, dropped)
}

/// Build the dispatch plan for this run, escalating every dropped class.
pub async fn plan(ctx: &RunContext) -> Result<Vec<Destination>> {
    let configured = ctx.config.destinations.to_destinations();
    let (planned, dropped) = rewrite(configured, &ctx.tools);

    for (class, missing) in dropped {
        exec::fail(
            ctx,
            STEP,
            Tier::Escalate,
            format!(
                "{} destinations skipped, missing {}",
                class,
                missing.join(", ")
            ),
        )
        .await?;
    }

    info!(destinations = planned.len(), "Destination plan ready");
    Ok(planned)
}
