use chrono::Utc;
use relaycell_core::Result;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::store::{store_err, Store};

/// Number of newest turns `history_for` returns verbatim.
pub const RECENT_RAW: usize = 2;
/// Older turns above this many characters are replaced by a placeholder.
pub const MASK_THRESHOLD: usize = 500;
/// Characters of the original content kept in a placeholder.
pub const MASK_PREVIEW_CHARS: usize = 100;

/// Observation-masking policy applied to conversation history reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPolicy {
    pub recent_raw: usize,
    pub mask_threshold: usize,
    pub preview_chars: usize,
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self {
            recent_raw: RECENT_RAW,
            mask_threshold: MASK_THRESHOLD,
            preview_chars: MASK_PREVIEW_CHARS,
        }
    }
}

impl HistoryPolicy {
    pub fn new(recent_raw: usize, mask_threshold: usize) -> Self {
        Self {
            recent_raw,
            mask_threshold,
            ..Self::default()
        }
    }

    /// Placeholder for `content` if it is long enough to be masked.
    pub fn mask(&self, content: &str) -> Option<String> {
        let len = content.chars().count();
        if len <= self.mask_threshold {
            return None;
        }
        let preview: String = content.chars().take(self.preview_chars).collect();
        Some(format!(
            "[masked earlier message, {} chars] {}...",
            len,
            preview.replace('\n', " ")
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub from_agent_id: i64,
    pub to_agent_id: i64,
    pub content: String,
    pub tool_calls: Option<Value>,
    pub channel: String,
    pub created_at: String,
    /// True when `content` is a placeholder rather than the stored text.
    #[serde(default)]
    pub masked: bool,
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let tool_calls: Option<String> = row.get("tool_calls")?;
    Ok(StoredMessage {
        id: row.get("id")?,
        from_agent_id: row.get("from_agent_id")?,
        to_agent_id: row.get("to_agent_id")?,
        content: row.get("content")?,
        tool_calls: tool_calls.and_then(|raw| serde_json::from_str(&raw).ok()),
        channel: row.get("channel")?,
        created_at: row.get("created_at")?,
        masked: false,
    })
}

impl Store {
    pub fn save_message(&self, from: i64, to: i64, content: &str, channel: &str) -> Result<i64> {
        self.save_message_with_tool_calls(from, to, content, channel, None)
    }

    pub fn save_message_with_tool_calls(
        &self,
        from: i64,
        to: i64,
        content: &str,
        channel: &str,
        tool_calls: Option<&Value>,
    ) -> Result<i64> {
        let tool_calls = tool_calls.map(|v| v.to_string());
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (from_agent_id, to_agent_id, content, tool_calls, channel, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![from, to, content, tool_calls, channel, Utc::now().to_rfc3339()],
        )
        .map_err(|e| store_err("Insert message error", e))?;
        let id = conn.last_insert_rowid();
        debug!(id, from, to, channel = %channel, "Message saved");
        Ok(id)
    }

    /// Conversation between two agents, oldest first, at most `limit` turns.
    ///
    /// The newest `recent_raw` turns are returned verbatim. Earlier turns longer
    /// than `mask_threshold` characters come back as a one-line placeholder that
    /// keeps a short preview and the original length.
    pub fn history_for(&self, agent_a: i64, agent_b: i64, limit: usize) -> Result<Vec<StoredMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut newest_first = {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, from_agent_id, to_agent_id, content, tool_calls, channel, created_at
                     FROM messages
                     WHERE (from_agent_id = ?1 AND to_agent_id = ?2)
                        OR (from_agent_id = ?2 AND to_agent_id = ?1)
                     ORDER BY id DESC
                     LIMIT ?3",
                )
                .map_err(|e| store_err("Prepare history error", e))?;
            let rows = stmt
                .query_map(params![agent_a, agent_b, limit as i64], row_to_message)
                .map_err(|e| store_err("History query error", e))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| store_err("History query error", e))?
        };

        for msg in newest_first.iter_mut().skip(self.policy.recent_raw) {
            if let Some(placeholder) = self.policy.mask(&msg.content) {
                msg.content = placeholder;
                msg.masked = true;
            }
        }

        newest_first.reverse();
        Ok(newest_first)
    }

    /// Delete the whole conversation between two agents.
    pub fn clear_history(&self, agent_a: i64, agent_b: i64) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM messages
                 WHERE (from_agent_id = ?1 AND to_agent_id = ?2)
                    OR (from_agent_id = ?2 AND to_agent_id = ?1)",
                params![agent_a, agent_b],
            )
            .map_err(|e| store_err("Clear history error", e))?;
        info!(agent_a, agent_b, deleted, "Conversation history cleared");
        Ok(deleted)
    }
}
