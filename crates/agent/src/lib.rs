pub mod approval;
pub mod auditing;
pub mod cancel;
pub mod delegation;
pub mod mailbox;
pub mod responder;
pub mod runner;
pub mod system;
pub mod tool_loop;

pub use approval::{ApprovalDecision, PendingApprovals};
pub use auditing::{AuditingExecutor, SharedAudit};
pub use cancel::CancellationRegistry;
pub use delegation::{AbsorbedReport, DelegationTracker};
pub use mailbox::{AgentKey, Envelope, EnvelopeKind, Mailbox, DELEGATION_CHANNEL, INTERNAL_CHANNEL};
pub use responder::{ChannelResponder, Responder};
pub use runner::{CycleOutcome, Runner, RunnerEnv, RunnerState};
pub use system::{AgentSystem, InboundRequest, ProviderFactory, SystemBuilder};
pub use tool_loop::{LoopInput, LoopResult, StopReason, ToolLoop};
