//! Validated state transitions and the append-only audit trail.

use super::leases::set_assignment_status;
use super::tasks::require_task;
use super::{Database, format_ts, now, parse_column, parse_ts};
use crate::error::Result;
use crate::states::{TaskState, validate_transition};
use crate::types::{AssignmentStatus, StateTransition};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

/// Append one audit record. Callers run this inside the same transaction
/// as the state write it describes.
pub(crate) fn record_state_transition(
    conn: &Connection,
    task_id: &str,
    from: TaskState,
    to: TaskState,
    reason: &str,
    executor: &str,
    at: DateTime<Utc>,
) -> Result<StateTransition> {
    conn.execute(
        "INSERT INTO task_transitions (task_id, from_state, to_state, reason, executor, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![task_id, from.as_str(), to.as_str(), reason, executor, format_ts(at)],
    )?;

    Ok(StateTransition {
        id: conn.last_insert_rowid(),
        task_id: task_id.to_string(),
        from_state: from,
        to_state: to,
        reason: reason.to_string(),
        executor: executor.to_string(),
        timestamp: at,
    })
}

impl Database {
    /// Move a task along the transition table.
    ///
    /// The state write and its audit record commit together or not at all;
    /// a rejected move leaves the task and its history untouched. A claimed
    /// task leaving running drops its lease and closes its assignment.
    pub fn transition_task(
        &self,
        task_id: &str,
        to: TaskState,
        reason: &str,
        executor: &str,
    ) -> Result<StateTransition> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let task = require_task(&tx, task_id)?;

            validate_transition(task_id, task.state, to)?;

            let at = now();
            tx.execute(
                "UPDATE tasks SET state = ?1, updated_at = ?2 WHERE id = ?3",
                params![to.as_str(), format_ts(at), task_id],
            )?;
            let record = record_state_transition(&tx, task_id, task.state, to, reason, executor, at)?;

            // Leaving running through the table ends the holder's lease.
            if task.state == TaskState::Running && task.is_claimed() {
                tx.execute(
                    "UPDATE tasks SET claimed_by = NULL, lease_expires_at = NULL WHERE id = ?1",
                    params![task_id],
                )?;
                let status = if to == TaskState::Done {
                    AssignmentStatus::Completed
                } else {
                    AssignmentStatus::Released
                };
                set_assignment_status(&tx, task_id, status)?;
            }

            tx.commit()?;
            Ok(record)
        })
    }

    /// Get the transition history for a task, oldest first.
    pub fn get_task_history(&self, task_id: &str) -> Result<Vec<StateTransition>> {
        self.with_conn(|conn| {
            require_task(conn, task_id)?;

            let mut stmt = conn.prepare(
                "SELECT id, task_id, from_state, to_state, reason, executor, timestamp
                 FROM task_transitions
                 WHERE task_id = ?1
                 ORDER BY id ASC",
            )?;

            let history = stmt
                .query_map(params![task_id], |row| {
                    let from: String = row.get(2)?;
                    let to: String = row.get(3)?;
                    let timestamp: String = row.get(6)?;
                    Ok(StateTransition {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        from_state: parse_column(2, &from)?,
                        to_state: parse_column(3, &to)?,
                        reason: row.get(4)?,
                        executor: row.get(5)?,
                        timestamp: parse_ts(6, &timestamp)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(history)
        })
    }
}
