pub mod agents;
pub mod audit;
pub mod messages;
pub mod store;
pub mod tasks;

pub use agents::{Agent, AgentKind};
pub use audit::{AuditEvent, AuditLogger};
pub use messages::{HistoryPolicy, StoredMessage, MASK_PREVIEW_CHARS, MASK_THRESHOLD, RECENT_RAW};
pub use store::Store;
pub use tasks::{
    DelegationContext, DelegationRecord, DelegationStatus, NewTask, PendingDelta, Task, TaskStatus,
};
