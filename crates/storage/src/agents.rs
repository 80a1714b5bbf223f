use chrono::Utc;
use relaycell_core::{Error, Result, StoreError};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::store::{store_err, Store};
use crate::tasks::DelegationContext;

/// Kind of participant an agent row represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Human,
    AiAgent,
    System,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Human => "human",
            AgentKind::AiAgent => "ai_agent",
            AgentKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "human" => Some(AgentKind::Human),
            "ai_agent" => Some(AgentKind::AiAgent),
            "system" => Some(AgentKind::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: i64,
    pub name: String,
    pub kind: AgentKind,
    pub created_at: String,
}

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let kind: String = row.get("kind")?;
    Ok(Agent {
        id: row.get("id")?,
        name: row.get("name")?,
        // The CHECK constraint keeps unknown kinds out of the table
        kind: AgentKind::parse(&kind).unwrap_or(AgentKind::AiAgent),
        created_at: row.get("created_at")?,
    })
}

impl Store {
    /// Create an agent, or return the id of the existing one with that name.
    pub fn create_agent(&self, name: &str, kind: AgentKind) -> Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("agent name must not be empty".to_string()));
        }

        let conn = self.conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO agents (name, kind, created_at) VALUES (?1, ?2, ?3)",
                params![name, kind.as_str(), Utc::now().to_rfc3339()],
            )
            .map_err(|e| store_err("Insert agent error", e))?;

        let id: i64 = conn
            .query_row("SELECT id FROM agents WHERE name = ?1", params![name], |row| {
                row.get(0)
            })
            .map_err(|e| store_err("Lookup agent error", e))?;

        if inserted > 0 {
            debug!(agent = %name, id, kind = kind.as_str(), "Agent created");
        }
        Ok(id)
    }

    pub fn get_agent(&self, name: &str) -> Result<Option<Agent>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, kind, created_at FROM agents WHERE name = ?1",
            params![name],
            row_to_agent,
        )
        .optional()
        .map_err(|e| store_err("Get agent error", e))
    }

    pub fn get_agent_by_id(&self, id: i64) -> Result<Option<Agent>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, kind, created_at FROM agents WHERE id = ?1",
            params![id],
            row_to_agent,
        )
        .optional()
        .map_err(|e| store_err("Get agent error", e))
    }

    pub fn agent_name(&self, id: i64) -> Result<Option<String>> {
        Ok(self.get_agent_by_id(id)?.map(|a| a.name))
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, name, kind, created_at FROM agents ORDER BY id")
            .map_err(|e| store_err("Prepare list agents error", e))?;
        let rows = stmt
            .query_map([], row_to_agent)
            .map_err(|e| store_err("List agents error", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| store_err("List agents error", e))
    }

    /// Rename an agent and rewrite every task row that refers to it by name.
    /// Messages reference agents by id and are unaffected.
    pub fn rename_agent(&self, old_name: &str, new_name: &str) -> Result<()> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(Error::Validation("agent name must not be empty".to_string()));
        }

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| store_err("Begin rename error", e))?;

        let updated = tx
            .execute(
                "UPDATE agents SET name = ?1 WHERE name = ?2",
                params![new_name, old_name],
            )
            .map_err(|e| store_err("Rename agent error", e))?;
        if updated == 0 {
            return Err(Error::Store(StoreError::NotFound(format!("agent {}", old_name))));
        }

        let requester_rows = tx
            .execute(
                "UPDATE tasks SET requester = ?1 WHERE requester = ?2",
                params![new_name, old_name],
            )
            .map_err(|e| store_err("Rename task requester error", e))?;
        let assignee_rows = tx
            .execute(
                "UPDATE tasks SET delegated_to = ?1 WHERE delegated_to = ?2",
                params![new_name, old_name],
            )
            .map_err(|e| store_err("Rename task assignee error", e))?;

        let contexts: Vec<(String, String)> = {
            let mut stmt = tx
                .prepare("SELECT task_id, delegation_context FROM tasks WHERE delegation_context LIKE ?1")
                .map_err(|e| store_err("Prepare context scan error", e))?;
            let rows = stmt
                .query_map(params![format!("%{}%", old_name)], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .map_err(|e| store_err("Context scan error", e))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| store_err("Context scan error", e))?
        };
        let mut context_rows = 0;
        for (task_id, raw) in contexts {
            let mut context = DelegationContext::parse(&raw)?;
            if !context.rename_agent(old_name, new_name) {
                continue;
            }
            tx.execute(
                "UPDATE tasks SET delegation_context = ?1 WHERE task_id = ?2",
                params![context.to_json()?, task_id],
            )
            .map_err(|e| store_err("Rename delegation records error", e))?;
            context_rows += 1;
        }

        tx.commit().map_err(|e| store_err("Commit rename error", e))?;
        info!(
            from = %old_name,
            to = %new_name,
            requester_rows,
            assignee_rows,
            context_rows,
            "Agent renamed"
        );
        Ok(())
    }
}
