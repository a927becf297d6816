pub mod dispatcher;
pub mod escalation;
pub mod exec;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod planner;
pub mod redundancy;
pub mod retention;
pub mod tools;
pub mod transfer_engine;
pub mod verifier;
pub mod workspace;

pub use dispatcher::{DispatchReport, TargetDispatcher};
pub use escalation::{Decision, ErrorLedger, EscalationPolicy, Prompt, StdinPrompt};
pub use exec::{Invocation, Outcome, Tier};
pub use models::{ArchiveArtifact, Destination, DestinationClass, Epoch};
pub use orchestrator::{Orchestrator, RunSummary};
pub use retention::RetentionCleaner;
pub use tools::{Tool, Toolbox};
pub use transfer_engine::{EngineSet, TransferEngine};
pub use workspace::{Cleanup, Workspace};
