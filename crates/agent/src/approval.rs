use relaycell_core::types::ApprovalRequest;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// The requester's answer to an approval request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// The action was approved and carried out; `outcome` is what it produced.
    Approved { outcome: String },
    Rejected { reason: String },
}

impl ApprovalDecision {
    /// Message the parked agent resumes with.
    pub fn resume_message(&self, request: &ApprovalRequest) -> String {
        match self {
            ApprovalDecision::Approved { outcome } => format!(
                "Approved: '{}' ({}) was carried out. Result: {}",
                request.tool_name, request.payload, outcome
            ),
            ApprovalDecision::Rejected { reason } => format!(
                "Not approved: '{}' ({}) was rejected: {}. Finish the request without it.",
                request.tool_name, request.payload, reason
            ),
        }
    }
}

/// Tasks parked on an approval, keyed by task id. Each entry is taken at
/// most once, so a task resumes at most once per request.
#[derive(Default)]
pub struct PendingApprovals {
    parked: Mutex<HashMap<String, ApprovalRequest>>,
}

impl PendingApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&self, task_id: &str, request: ApprovalRequest) {
        if let Ok(mut parked) = self.parked.lock() {
            debug!(task_id = %task_id, tool = %request.tool_name, "Task parked for approval");
            parked.insert(task_id.to_string(), request);
        }
    }

    pub fn take(&self, task_id: &str) -> Option<ApprovalRequest> {
        self.parked.lock().ok()?.remove(task_id)
    }

    pub fn is_parked(&self, task_id: &str) -> bool {
        self.parked
            .lock()
            .map(|parked| parked.contains_key(task_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.parked.lock().map(|parked| parked.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            tool_name: "wire_money".to_string(),
            call_id: "c1".to_string(),
            payload: "send 100 EUR".to_string(),
        }
    }

    #[test]
    fn test_take_is_once() {
        let approvals = PendingApprovals::new();
        approvals.park("t1", request());
        assert!(approvals.is_parked("t1"));
        assert_eq!(approvals.take("t1").unwrap().call_id, "c1");
        assert!(approvals.take("t1").is_none());
        assert!(approvals.is_empty());
    }

    #[test]
    fn test_resume_messages() {
        let approved = ApprovalDecision::Approved {
            outcome: "sent".to_string(),
        }
        .resume_message(&request());
        assert!(approved.starts_with("Approved: 'wire_money'"));
        assert!(approved.ends_with("Result: sent"));

        let rejected = ApprovalDecision::Rejected {
            reason: "too much".to_string(),
        }
        .resume_message(&request());
        assert!(rejected.contains("rejected: too much"));
    }
}
