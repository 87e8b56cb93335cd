//! Lease manager: claim, release, complete and expiry on top of the task
//! ownership fields, with the per-task assignment record kept in step.
//!
//! Ownership edges bypass the transition table:
//! - claim: inbox/planned/blocked -> running (running stays running on reclaim)
//! - release: -> planned (graceful) or -> blocked (with a reason)
//! - complete: -> done
//! - expiry: -> planned
//! Each state change still appends an audit record.

use super::state_transitions::record_state_transition;
use super::tasks::require_task;
use super::{Database, format_ts, now, parse_ts};
use crate::error::{BoardError, Result};
use crate::retry::RetryPolicies;
use crate::router::ActiveClaims;
use crate::states::TaskState;
use crate::types::{AssignmentStatus, StateChange, Task, TaskAssignment};
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::time::Duration;

/// Executor recorded for sweeper-driven releases.
pub const SWEEPER_EXECUTOR: &str = "lease-sweeper";

/// `last_error` written when a lease runs out.
pub const LEASE_EXPIRED_REASON: &str = "lease expired";

fn parse_assignment_row(row: &Row) -> rusqlite::Result<TaskAssignment> {
    let claimed_at: String = row.get("claimed_at")?;
    let expires_at: String = row.get("expires_at")?;
    let status: String = row.get("status")?;
    let attempt: i64 = row.get("attempt")?;
    let max_retry: i64 = row.get("max_retry")?;

    let status = AssignmentStatus::from_str(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown assignment status '{}'", status).into(),
        )
    })?;

    Ok(TaskAssignment {
        task_id: row.get("task_id")?,
        worker_id: row.get("worker_id")?,
        claimed_at: parse_ts(0, &claimed_at)?,
        expires_at: parse_ts(0, &expires_at)?,
        attempt: attempt.max(0) as u32,
        max_retry: max_retry.max(0) as u32,
        status,
    })
}

fn get_assignment_internal(conn: &Connection, task_id: &str) -> Result<Option<TaskAssignment>> {
    let assignment = conn
        .query_row(
            "SELECT * FROM task_assignments WHERE task_id = ?1",
            params![task_id],
            parse_assignment_row,
        )
        .optional()?;
    Ok(assignment)
}

pub(crate) fn set_assignment_status(conn: &Connection, task_id: &str, status: AssignmentStatus) -> Result<()> {
    conn.execute(
        "UPDATE task_assignments SET status = ?1 WHERE task_id = ?2",
        params![status.as_str(), task_id],
    )?;
    Ok(())
}

/// Reject unless `worker_id` is the current holder.
fn require_holder(task: &Task, worker_id: &str) -> Result<()> {
    if task.claimed_by.as_deref() == Some(worker_id) {
        Ok(())
    } else {
        Err(BoardError::NotOwner {
            task_id: task.id.clone(),
            worker_id: worker_id.to_string(),
            holder: task.claimed_by.clone(),
        })
    }
}

fn lease_too_large() -> BoardError {
    BoardError::validation("lease", "lease duration is too large")
}

fn lease_delta(lease: Duration) -> Result<TimeDelta> {
    TimeDelta::from_std(lease).map_err(|_| lease_too_large())
}

/// Expiry for a lease taken at `at`, rejecting sums outside the timestamp range.
fn lease_expiry(at: DateTime<Utc>, lease: TimeDelta) -> Result<DateTime<Utc>> {
    at.checked_add_signed(lease).ok_or_else(lease_too_large)
}

/// Clear ownership and move the task, recording the change when the state moves.
fn release_internal(
    conn: &Connection,
    task: &Task,
    to: TaskState,
    last_error: &str,
    reason: &str,
    executor: &str,
    at: DateTime<Utc>,
) -> Result<StateChange> {
    conn.execute(
        "UPDATE tasks SET claimed_by = NULL, lease_expires_at = NULL,
            state = ?1, last_error = ?2, updated_at = ?3
         WHERE id = ?4",
        params![to.as_str(), last_error, format_ts(at), task.id],
    )?;
    if task.state != to {
        record_state_transition(conn, &task.id, task.state, to, reason, executor, at)?;
    }
    Ok(StateChange {
        from: task.state,
        to,
    })
}

impl Database {
    /// Claim a task for a worker with a lease.
    ///
    /// Fails with `AlreadyClaimed` while another worker holds a live lease.
    /// An unclaimed task, an expired foreign lease, or the worker's own lease
    /// can be claimed; the task ends up running with a fresh expiry.
    /// Renewing one's own live lease does not count as a new attempt.
    pub fn claim_task(
        &self,
        task_id: &str,
        worker_id: &str,
        lease: Duration,
        policies: &RetryPolicies,
    ) -> Result<TaskAssignment> {
        if worker_id.trim().is_empty() {
            return Err(BoardError::missing_field("worker_id"));
        }
        let lease = lease_delta(lease)?;
        lease_expiry(now(), lease)?;

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let task = require_task(&tx, task_id)?;
            let at = now();
            let expires_at = lease_expiry(at, lease)?;

            if let Some(ref holder) = task.claimed_by
                && holder != worker_id
                && task.has_live_lease(at)
            {
                return Err(BoardError::AlreadyClaimed {
                    task_id: task_id.to_string(),
                    holder: holder.clone(),
                    expires_at: task.lease_expires_at.map(format_ts).unwrap_or_default(),
                });
            }

            if task.state != TaskState::Running && !task.state.can_transition_to(TaskState::Running) {
                return Err(BoardError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: task.state,
                    to: TaskState::Running,
                });
            }

            let renewal =
                task.claimed_by.as_deref() == Some(worker_id) && task.has_live_lease(at);
            let attempts = if renewal { task.attempts } else { task.attempts + 1 };

            tx.execute(
                "UPDATE tasks SET claimed_by = ?1, lease_expires_at = ?2,
                    claim_count = claim_count + 1, attempts = ?3, state = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    worker_id,
                    format_ts(expires_at),
                    attempts,
                    TaskState::Running.as_str(),
                    format_ts(at),
                    task_id,
                ],
            )?;

            if task.state != TaskState::Running {
                record_state_transition(&tx, task_id, task.state, TaskState::Running, "claimed", worker_id, at)?;
            }

            let previous = get_assignment_internal(&tx, task_id)?;
            let assignment = match previous {
                Some(prev) if renewal && prev.worker_id == worker_id && prev.status.is_active() => {
                    tx.execute(
                        "UPDATE task_assignments SET expires_at = ?1 WHERE task_id = ?2",
                        params![format_ts(expires_at), task_id],
                    )?;
                    TaskAssignment { expires_at, ..prev }
                }
                _ => {
                    let assignment = TaskAssignment {
                        task_id: task_id.to_string(),
                        worker_id: worker_id.to_string(),
                        claimed_at: at,
                        expires_at,
                        attempt: attempts,
                        max_retry: policies.get_policy(&task.category).max_attempts,
                        status: AssignmentStatus::Claimed,
                    };
                    tx.execute(
                        "INSERT OR REPLACE INTO task_assignments
                            (task_id, worker_id, claimed_at, expires_at, attempt, max_retry, status)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            task_id,
                            worker_id,
                            format_ts(at),
                            format_ts(expires_at),
                            assignment.attempt,
                            assignment.max_retry,
                            assignment.status.as_str(),
                        ],
                    )?;
                    assignment
                }
            };

            tx.commit()?;
            Ok(assignment)
        })
    }

    /// Mark the holder's assignment as executing.
    pub fn begin_execution(&self, task_id: &str, worker_id: &str) -> Result<TaskAssignment> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let task = require_task(&tx, task_id)?;
            require_holder(&task, worker_id)?;

            set_assignment_status(&tx, task_id, AssignmentStatus::Executing)?;
            let assignment = get_assignment_internal(&tx, task_id)?.ok_or_else(|| {
                BoardError::internal(format!("task {} is claimed but has no assignment", task_id))
            })?;

            tx.commit()?;
            Ok(assignment)
        })
    }

    /// Hand a task back.
    ///
    /// An empty `reason` returns it to planned; a non-empty one moves it to
    /// blocked and records the reason as `last_error`. Returns `None` when the
    /// task is not claimed (nothing to release).
    pub fn release_task(
        &self,
        task_id: &str,
        worker_id: &str,
        reason: &str,
    ) -> Result<Option<StateChange>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let task = require_task(&tx, task_id)?;

            if !task.is_claimed() {
                return Ok(None);
            }
            require_holder(&task, worker_id)?;

            let (to, status, audit_reason) = if reason.is_empty() {
                (TaskState::Planned, AssignmentStatus::Released, "released")
            } else {
                (TaskState::Blocked, AssignmentStatus::Failed, reason)
            };

            let change = release_internal(&tx, &task, to, reason, audit_reason, worker_id, now())?;
            set_assignment_status(&tx, task_id, status)?;

            tx.commit()?;
            Ok(Some(change))
        })
    }

    /// Record a failed attempt by the holder: release to blocked with the
    /// reason as both `last_error` and `last_failure_reason`.
    ///
    /// Returns the assignment as it stood for the failed attempt.
    pub fn fail_task(&self, task_id: &str, worker_id: &str, reason: &str) -> Result<(TaskAssignment, StateChange)> {
        if reason.trim().is_empty() {
            return Err(BoardError::missing_field("reason"));
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let task = require_task(&tx, task_id)?;
            require_holder(&task, worker_id)?;

            let assignment = get_assignment_internal(&tx, task_id)?.ok_or_else(|| {
                BoardError::internal(format!("task {} is claimed but has no assignment", task_id))
            })?;

            let change = release_internal(&tx, &task, TaskState::Blocked, reason, reason, worker_id, now())?;
            tx.execute(
                "UPDATE tasks SET last_failure_reason = ?1 WHERE id = ?2",
                params![reason, task_id],
            )?;
            set_assignment_status(&tx, task_id, AssignmentStatus::Failed)?;

            tx.commit()?;
            Ok((
                TaskAssignment {
                    status: AssignmentStatus::Failed,
                    ..assignment
                },
                change,
            ))
        })
    }

    /// Finish a task: clear ownership and `last_error`, move it to done.
    pub fn complete_task(&self, task_id: &str, worker_id: &str) -> Result<StateChange> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let task = require_task(&tx, task_id)?;
            require_holder(&task, worker_id)?;

            let change = release_internal(&tx, &task, TaskState::Done, "", "completed", worker_id, now())?;
            set_assignment_status(&tx, task_id, AssignmentStatus::Completed)?;

            tx.commit()?;
            Ok(change)
        })
    }

    /// Force-release every lease whose expiry is strictly in the past. Done
    /// tasks are never pulled back.
    ///
    /// Tasks go back to planned with `last_error = "lease expired"`.
    /// Returns the ids released; a second run with no new claims returns none.
    pub fn cleanup_expired(&self) -> Result<Vec<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let at = now();

            let expired: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM tasks
                     WHERE claimed_by IS NOT NULL AND lease_expires_at IS NOT NULL
                       AND lease_expires_at < ?1 AND state != ?2
                     ORDER BY id",
                )?;
                stmt.query_map(params![format_ts(at), TaskState::Done.as_str()], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };

            for task_id in &expired {
                let task = require_task(&tx, task_id)?;
                release_internal(
                    &tx,
                    &task,
                    TaskState::Planned,
                    LEASE_EXPIRED_REASON,
                    LEASE_EXPIRED_REASON,
                    SWEEPER_EXECUTOR,
                    at,
                )?;
                set_assignment_status(&tx, task_id, AssignmentStatus::Expired)?;
            }

            tx.commit()?;
            Ok(expired)
        })
    }

    /// Current assignment record for a task, if it was ever claimed.
    pub fn get_assignment(&self, task_id: &str) -> Result<Option<TaskAssignment>> {
        self.with_conn(|conn| {
            require_task(conn, task_id)?;
            get_assignment_internal(conn, task_id)
        })
    }

    /// Assignments that are claimed or executing.
    pub fn active_assignments(&self) -> Result<Vec<TaskAssignment>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM task_assignments
                 WHERE status IN ('claimed', 'executing')
                 ORDER BY claimed_at, task_id",
            )?;
            let assignments = stmt
                .query_map([], parse_assignment_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(assignments)
        })
    }

    /// Number of claimed or executing assignments held by a worker.
    pub fn active_claim_count(&self, worker_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM task_assignments
                 WHERE worker_id = ?1 AND status IN ('claimed', 'executing')",
                params![worker_id],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as usize)
        })
    }
}

impl ActiveClaims for Database {
    fn active_claims(&self, worker_id: &str) -> Result<usize> {
        self.active_claim_count(worker_id)
    }
}
