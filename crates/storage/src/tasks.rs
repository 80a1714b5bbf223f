use chrono::Utc;
use relaycell_core::{Error, Result, StoreError};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::{store_err, Store};

const TASK_COLUMNS: &str = "task_id, requester, requester_channel, context_id, original_request, \
     delegated_to, delegation_context, parent_task_id, pending_delegations, status, result, \
     created_at, completed_at";

pub const DEFAULT_CONTEXT_ID: &str = "default";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Pending,
    Completed,
}

/// One child delegation issued on behalf of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DelegationRecord {
    pub child_task_id: String,
    pub agent: String,
    pub message: String,
    pub status: DelegationStatus,
    #[serde(default)]
    pub result: Option<String>,
    pub delegated_at: String,
    #[serde(default)]
    pub completed_at: Option<String>,
}

impl DelegationRecord {
    pub fn new(child_task_id: &str, agent: &str, message: &str) -> Self {
        Self {
            child_task_id: child_task_id.to_string(),
            agent: agent.to_string(),
            message: message.to_string(),
            status: DelegationStatus::Pending,
            result: None,
            delegated_at: Utc::now().to_rfc3339(),
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == DelegationStatus::Completed
    }
}

/// The JSON blob stored in `tasks.delegation_context`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DelegationContext {
    #[serde(default)]
    pub delegations: Vec<DelegationRecord>,
}

impl DelegationContext {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).map_err(|e| {
            Error::Store(StoreError::Corrupt(format!("delegation_context: {}", e)))
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn push(&mut self, record: DelegationRecord) {
        self.delegations.push(record);
    }

    /// Point every record naming `old` at `new`. Returns true if any changed.
    pub fn rename_agent(&mut self, old: &str, new: &str) -> bool {
        let mut changed = false;
        for record in self.delegations.iter_mut().filter(|r| r.agent == old) {
            record.agent = new.to_string();
            changed = true;
        }
        changed
    }

    pub fn record(&self, child_task_id: &str) -> Option<&DelegationRecord> {
        self.delegations
            .iter()
            .find(|r| r.child_task_id == child_task_id)
    }

    /// Mark a child as reported. Returns false when the child is unknown or
    /// was already completed, so a duplicate report changes nothing.
    pub fn complete(&mut self, child_task_id: &str, result: &str) -> bool {
        match self
            .delegations
            .iter_mut()
            .find(|r| r.child_task_id == child_task_id)
        {
            Some(record) if !record.is_completed() => {
                record.status = DelegationStatus::Completed;
                record.result = Some(result.to_string());
                record.completed_at = Some(Utc::now().to_rfc3339());
                true
            }
            _ => false,
        }
    }

    pub fn completed(&self) -> impl Iterator<Item = &DelegationRecord> {
        self.delegations.iter().filter(|r| r.is_completed())
    }

    pub fn outstanding(&self) -> usize {
        self.delegations.iter().filter(|r| !r.is_completed()).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub requester: String,
    pub requester_channel: String,
    pub context_id: String,
    pub original_request: String,
    pub delegated_to: String,
    pub delegation_context: DelegationContext,
    pub parent_task_id: Option<String>,
    pub pending_delegations: i64,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl Task {
    /// Root tasks answer a requester channel; child tasks report to a parent.
    pub fn is_root(&self) -> bool {
        self.parent_task_id.is_none()
    }
}

/// Parameters for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: Option<String>,
    pub requester: String,
    pub requester_channel: String,
    pub context_id: String,
    pub original_request: String,
    pub delegated_to: String,
    pub parent_task_id: Option<String>,
}

impl NewTask {
    pub fn root(requester: &str, requester_channel: &str, delegated_to: &str, request: &str) -> Self {
        Self {
            task_id: None,
            requester: requester.to_string(),
            requester_channel: requester_channel.to_string(),
            context_id: DEFAULT_CONTEXT_ID.to_string(),
            original_request: request.to_string(),
            delegated_to: delegated_to.to_string(),
            parent_task_id: None,
        }
    }

    pub fn child(parent: &Task, delegated_to: &str, request: &str) -> Self {
        Self {
            task_id: None,
            requester: parent.delegated_to.clone(),
            requester_channel: parent.requester_channel.clone(),
            context_id: parent.context_id.clone(),
            original_request: request.to_string(),
            delegated_to: delegated_to.to_string(),
            parent_task_id: Some(parent.task_id.clone()),
        }
    }

    pub fn with_context(mut self, context_id: &str) -> Self {
        self.context_id = context_id.to_string();
        self
    }

    pub fn with_id(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }
}

/// How a delegation-context mutation moves the pending counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingDelta {
    Increment,
    Decrement,
    Unchanged,
}

struct TaskRow {
    task: Task,
    raw_context: String,
    raw_status: String,
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        task: Task {
            task_id: row.get("task_id")?,
            requester: row.get("requester")?,
            requester_channel: row.get("requester_channel")?,
            context_id: row.get("context_id")?,
            original_request: row.get("original_request")?,
            delegated_to: row.get("delegated_to")?,
            delegation_context: DelegationContext::default(),
            parent_task_id: row.get("parent_task_id")?,
            pending_delegations: row.get("pending_delegations")?,
            status: TaskStatus::Pending,
            result: row.get("result")?,
            created_at: row.get("created_at")?,
            completed_at: row.get("completed_at")?,
        },
        raw_context: row.get("delegation_context")?,
        raw_status: row.get("status")?,
    })
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let mut task = self.task;
        task.delegation_context = DelegationContext::parse(&self.raw_context)?;
        task.status = TaskStatus::parse(&self.raw_status).ok_or_else(|| {
            Error::Store(StoreError::Corrupt(format!(
                "task {} has unknown status '{}'",
                task.task_id, self.raw_status
            )))
        })?;
        Ok(task)
    }
}

impl Store {
    /// Create a task. A child's parent must exist at creation time.
    pub fn create_task(&self, new: NewTask) -> Result<Task> {
        let task_id = new
            .task_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Utc::now().to_rfc3339();
        let context = DelegationContext::default().to_json()?;

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| store_err("Begin create task error", e))?;

        if let Some(parent) = new.parent_task_id.as_deref() {
            let status: Option<String> = tx
                .query_row(
                    "SELECT status FROM tasks WHERE task_id = ?1",
                    params![parent],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| store_err("Parent lookup error", e))?;
            match status.as_deref() {
                None => {
                    return Err(Error::Store(StoreError::NotFound(format!(
                        "parent task {}",
                        parent
                    ))))
                }
                Some("pending") => {}
                Some(_) => {
                    return Err(Error::Cancelled(format!("parent task {} was cancelled", parent)))
                }
            }
        }

        tx.execute(
            "INSERT INTO tasks (task_id, requester, requester_channel, context_id, original_request,
                delegated_to, delegation_context, parent_task_id, pending_delegations, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 'pending', ?9)",
            params![
                task_id,
                new.requester,
                new.requester_channel,
                new.context_id,
                new.original_request,
                new.delegated_to,
                context,
                new.parent_task_id,
                now
            ],
        )
        .map_err(|e| store_err("Insert task error", e))?;
        tx.commit().map_err(|e| store_err("Commit task error", e))?;

        debug!(
            task_id = %task_id,
            delegated_to = %new.delegated_to,
            parent = ?new.parent_task_id,
            "Task created"
        );

        Ok(Task {
            task_id,
            requester: new.requester,
            requester_channel: new.requester_channel,
            context_id: new.context_id,
            original_request: new.original_request,
            delegated_to: new.delegated_to,
            delegation_context: DelegationContext::default(),
            parent_task_id: new.parent_task_id,
            pending_delegations: 0,
            status: TaskStatus::Pending,
            result: None,
            created_at: now,
            completed_at: None,
        })
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let row = {
            let conn = self.conn()?;
            conn.query_row(
                &format!("SELECT {} FROM tasks WHERE task_id = ?1", TASK_COLUMNS),
                params![task_id],
                row_to_task,
            )
            .optional()
            .map_err(|e| store_err("Get task error", e))?
        };
        row.map(TaskRow::into_task).transpose()
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!("SELECT {} FROM tasks ORDER BY created_at, task_id", TASK_COLUMNS),
            None,
        )
    }

    pub fn children_of(&self, parent_task_id: &str) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE parent_task_id = ?1 ORDER BY created_at, task_id",
                TASK_COLUMNS
            ),
            Some(parent_task_id),
        )
    }

    fn query_tasks(&self, sql: &str, arg: Option<&str>) -> Result<Vec<Task>> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| store_err("Prepare task query error", e))?;
            let mapped = match arg {
                Some(a) => stmt.query_map(params![a], row_to_task),
                None => stmt.query_map([], row_to_task),
            }
            .map_err(|e| store_err("Task query error", e))?;
            mapped
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| store_err("Task query error", e))?
        };
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Finish a task by deleting it. Returns false when it was already gone
    /// or has been cancelled; a cancelled row is kept.
    pub fn complete_task(&self, task_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM tasks WHERE task_id = ?1 AND status = 'pending'",
                params![task_id],
            )
            .map_err(|e| store_err("Complete task error", e))?;
        if deleted > 0 {
            info!(task_id = %task_id, "Task completed");
        } else {
            debug!(task_id = %task_id, "Complete requested for missing task");
        }
        Ok(deleted > 0)
    }

    pub fn mark_task_cancelled(&self, task_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE tasks SET status = 'cancelled', completed_at = ?1
                 WHERE task_id = ?2 AND status = 'pending'",
                params![Utc::now().to_rfc3339(), task_id],
            )
            .map_err(|e| store_err("Cancel task error", e))?;
        Ok(updated > 0)
    }

    /// Cancel every pending task routed to a requester channel handle, roots
    /// and children alike, in one transaction. Returns the tasks this call
    /// moved to cancelled; tasks created afterwards on the same handle are
    /// unaffected.
    pub fn cancel_tasks_for_channel(&self, handle: &str) -> Result<Vec<Task>> {
        let now = Utc::now().to_rfc3339();
        let rows = {
            let mut conn = self.conn()?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| store_err("Begin cancel error", e))?;
            let rows = {
                let mut stmt = tx
                    .prepare(&format!(
                        "SELECT {} FROM tasks WHERE requester_channel = ?1 AND status = 'pending'
                         ORDER BY created_at, task_id",
                        TASK_COLUMNS
                    ))
                    .map_err(|e| store_err("Prepare cancel query error", e))?;
                let mapped = stmt
                    .query_map(params![handle], row_to_task)
                    .map_err(|e| store_err("Cancel query error", e))?;
                mapped
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|e| store_err("Cancel query error", e))?
            };
            tx.execute(
                "UPDATE tasks SET status = 'cancelled', completed_at = ?1
                 WHERE requester_channel = ?2 AND status = 'pending'",
                params![now, handle],
            )
            .map_err(|e| store_err("Cancel tasks error", e))?;
            tx.commit().map_err(|e| store_err("Commit cancel error", e))?;
            rows
        };

        let mut tasks = rows
            .into_iter()
            .map(TaskRow::into_task)
            .collect::<Result<Vec<_>>>()?;
        for task in &mut tasks {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(now.clone());
        }
        if !tasks.is_empty() {
            info!(handle = %handle, count = tasks.len(), "Tasks cancelled");
        }
        Ok(tasks)
    }

    /// Overwrite a task's delegation context and optionally bump its counter.
    /// Returns the new pending count.
    pub fn update_delegation_context(
        &self,
        task_id: &str,
        context: &DelegationContext,
        increment_pending: bool,
    ) -> Result<i64> {
        let delta = if increment_pending {
            PendingDelta::Increment
        } else {
            PendingDelta::Unchanged
        };
        let (_, pending) = self.modify_delegation_context(task_id, |ctx| {
            *ctx = context.clone();
            Ok(delta)
        })?;
        Ok(pending)
    }

    /// Overwrite a task's delegation context and decrement its counter,
    /// never below zero. Returns the remaining count.
    pub fn decrement_pending_and_update_context(
        &self,
        task_id: &str,
        context: &DelegationContext,
    ) -> Result<i64> {
        let (_, remaining) = self.modify_delegation_context(task_id, |ctx| {
            *ctx = context.clone();
            Ok(PendingDelta::Decrement)
        })?;
        Ok(remaining)
    }

    /// Atomic read-modify-write of a task's delegation context and counter.
    ///
    /// Runs under `BEGIN EXCLUSIVE`: no other writer, in this process or
    /// another, can touch the row between the read and the write. `f` sees
    /// the current context, edits it in place and says how the counter moves.
    /// Any error from `f` or from SQLite rolls the whole change back.
    pub fn modify_delegation_context<F>(
        &self,
        task_id: &str,
        f: F,
    ) -> Result<(DelegationContext, i64)>
    where
        F: FnOnce(&mut DelegationContext) -> Result<PendingDelta>,
    {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)
            .map_err(|e| store_err("Begin exclusive error", e))?;

        let (raw, pending): (String, i64) = tx
            .query_row(
                "SELECT delegation_context, pending_delegations FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| store_err("Read delegation context error", e))?
            .ok_or_else(|| Error::Store(StoreError::NotFound(format!("task {}", task_id))))?;

        let mut context = DelegationContext::parse(&raw)?;
        let delta = f(&mut context)?;

        let new_pending = match delta {
            PendingDelta::Increment => pending + 1,
            PendingDelta::Decrement if pending == 0 => {
                warn!(task_id = %task_id, "Decrement on a task with no pending delegations");
                0
            }
            PendingDelta::Decrement => pending - 1,
            PendingDelta::Unchanged => pending,
        };

        tx.execute(
            "UPDATE tasks SET delegation_context = ?1, pending_delegations = ?2 WHERE task_id = ?3",
            params![context.to_json()?, new_pending, task_id],
        )
        .map_err(|e| store_err("Write delegation context error", e))?;
        tx.commit()
            .map_err(|e| store_err("Commit delegation context error", e))?;

        debug!(task_id = %task_id, ?delta, pending = new_pending, "Delegation context updated");
        Ok((context, new_pending))
    }
}
