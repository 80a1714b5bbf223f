use chrono::Utc;
use relaycell_core::{Paths, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::error;

const RESULT_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    ToolCall {
        agent: String,
        task_id: String,
        tool_name: String,
        params: serde_json::Value,
        result_preview: String,
        timestamp_ms: i64,
        duration_ms: Option<u64>,
    },
    Delegation {
        parent_task_id: String,
        child_task_id: String,
        from: String,
        to: String,
        timestamp_ms: i64,
    },
    TaskFinalized {
        task_id: String,
        agent: String,
        /// answered, cancelled, failed or reported
        outcome: String,
        timestamp_ms: i64,
    },
}

/// Append-only JSONL audit trail, one file per UTC day under `audit_dir`.
pub struct AuditLogger {
    paths: Paths,
    current_date: String,
}

impl AuditLogger {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            current_date: Utc::now().format("%Y-%m-%d").to_string(),
        }
    }

    pub fn log_tool_call(
        &mut self,
        agent: &str,
        task_id: &str,
        tool_name: &str,
        params: serde_json::Value,
        result: &str,
        duration_ms: Option<u64>,
    ) -> Result<()> {
        let event = AuditEvent::ToolCall {
            agent: agent.to_string(),
            task_id: task_id.to_string(),
            tool_name: tool_name.to_string(),
            params,
            result_preview: result.chars().take(RESULT_PREVIEW_CHARS).collect(),
            timestamp_ms: Utc::now().timestamp_millis(),
            duration_ms,
        };
        self.write_event(event)
    }

    pub fn log_delegation(
        &mut self,
        parent_task_id: &str,
        child_task_id: &str,
        from: &str,
        to: &str,
    ) -> Result<()> {
        let event = AuditEvent::Delegation {
            parent_task_id: parent_task_id.to_string(),
            child_task_id: child_task_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        self.write_event(event)
    }

    pub fn log_task_finalized(&mut self, task_id: &str, agent: &str, outcome: &str) -> Result<()> {
        let event = AuditEvent::TaskFinalized {
            task_id: task_id.to_string(),
            agent: agent.to_string(),
            outcome: outcome.to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        self.write_event(event)
    }

    fn write_event(&mut self, event: AuditEvent) -> Result<()> {
        let log_file = self.current_log_file_path();
        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;
        let json = serde_json::to_string(&event)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    fn current_log_file_path(&mut self) -> PathBuf {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if today != self.current_date {
            self.current_date = today;
        }
        self.paths.audit_dir().join(format!("{}.jsonl", self.current_date))
    }

    pub fn read_events(&self, date: &str) -> Result<Vec<AuditEvent>> {
        let log_file = self.paths.audit_dir().join(format!("{}.jsonl", date));
        if !log_file.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&log_file)?;
        let mut events = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => error!(error = %e, line = %line, "Failed to parse audit event"),
            }
        }
        Ok(events)
    }

    pub fn read_today(&self) -> Result<Vec<AuditEvent>> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        self.read_events(&today)
    }
}
