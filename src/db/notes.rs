//! Task notes and the informal event log.
//!
//! The event log is display history only; the audit trail lives in
//! `task_transitions`.

use super::tasks::require_task;
use super::{Database, format_ts, now, parse_ts};
use crate::error::{BoardError, Result};
use crate::types::{TaskLogEntry, TaskNote};
use rusqlite::{Row, params};

fn parse_note_row(row: &Row) -> rusqlite::Result<TaskNote> {
    let created_at: String = row.get("created_at")?;
    Ok(TaskNote {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        content: row.get("content")?,
        author: row.get("author")?,
        created_at: parse_ts(0, &created_at)?,
    })
}

fn parse_log_row(row: &Row) -> rusqlite::Result<TaskLogEntry> {
    let created_at: String = row.get("created_at")?;
    Ok(TaskLogEntry {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        source: row.get("source")?,
        event_type: row.get("event_type")?,
        summary: row.get("summary")?,
        details: row.get("details")?,
        created_at: parse_ts(0, &created_at)?,
    })
}

impl Database {
    /// Attach a note to a task.
    pub fn add_note(&self, task_id: &str, content: &str, author: &str) -> Result<TaskNote> {
        if content.trim().is_empty() {
            return Err(BoardError::missing_field("content"));
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            require_task(&tx, task_id)?;

            let at = now();
            tx.execute(
                "INSERT INTO task_notes (task_id, content, author, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![task_id, content, author, format_ts(at)],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            Ok(TaskNote {
                id,
                task_id: task_id.to_string(),
                content: content.to_string(),
                author: author.to_string(),
                created_at: at,
            })
        })
    }

    /// Notes for a task, oldest first.
    pub fn list_notes(&self, task_id: &str) -> Result<Vec<TaskNote>> {
        self.with_conn(|conn| {
            require_task(conn, task_id)?;
            let mut stmt = conn.prepare(
                "SELECT id, task_id, content, author, created_at
                 FROM task_notes WHERE task_id = ?1 ORDER BY id",
            )?;
            let notes = stmt
                .query_map(params![task_id], parse_note_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(notes)
        })
    }

    /// Append an informal event log entry. `task_id` may be `None` for
    /// board-wide entries such as sweep summaries.
    pub fn log_event(
        &self,
        task_id: Option<&str>,
        source: &str,
        event_type: &str,
        summary: &str,
        details: &str,
    ) -> Result<TaskLogEntry> {
        self.with_conn(|conn| {
            if let Some(id) = task_id {
                require_task(conn, id)?;
            }
            let at = now();
            conn.execute(
                "INSERT INTO task_events (task_id, source, event_type, summary, details, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![task_id, source, event_type, summary, details, format_ts(at)],
            )?;
            Ok(TaskLogEntry {
                id: conn.last_insert_rowid(),
                task_id: task_id.map(str::to_string),
                source: source.to_string(),
                event_type: event_type.to_string(),
                summary: summary.to_string(),
                details: details.to_string(),
                created_at: at,
            })
        })
    }

    /// Event log entries, newest first. With a task id, only that task's.
    pub fn list_event_log(&self, task_id: Option<&str>, limit: usize) -> Result<Vec<TaskLogEntry>> {
        self.with_conn(|conn| {
            let limit = limit as i64;
            let entries = match task_id {
                Some(id) => {
                    require_task(conn, id)?;
                    let mut stmt = conn.prepare(
                        "SELECT * FROM task_events WHERE task_id = ?1
                         ORDER BY id DESC LIMIT ?2",
                    )?;
                    stmt.query_map(params![id, limit], parse_log_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let mut stmt =
                        conn.prepare("SELECT * FROM task_events ORDER BY id DESC LIMIT ?1")?;
                    stmt.query_map(params![limit], parse_log_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(entries)
        })
    }
}
