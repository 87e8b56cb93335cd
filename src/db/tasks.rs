//! Task CRUD: identity allocation, lookup, filtered listing, whitelisted
//! field updates and cascading delete.

use super::{Database, format_opt_ts, format_ts, now, parse_column, parse_opt_ts, parse_ts};
use crate::error::{BoardError, Result};
use crate::states::TaskState;
use crate::types::{FieldUpdate, NewTask, SOURCE_MANUAL, Task, TaskFilters, UNCATEGORIZED};
use rusqlite::{Connection, OptionalExtension, Row, ToSql, params};

/// Prefix of allocated task identities.
pub const TASK_ID_PREFIX: &str = "TASK-";

/// Cap applied when a listing does not name a limit.
pub const DEFAULT_LIST_LIMIT: usize = 500;

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let state: String = row.get("state")?;
    let priority: String = row.get("priority")?;
    let tags_json: String = row.get("tags")?;
    let attempts: i64 = row.get("attempts")?;
    let claim_count: i64 = row.get("claim_count")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    let tags: Vec<String> = serde_json::from_str(&tags_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Task {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        state: parse_column(0, &state)?,
        category: row.get("category")?,
        source: row.get("source")?,
        priority: parse_column(0, &priority)?,
        tags,
        assignee: row.get("assignee")?,
        project: row.get("project")?,
        attempts: attempts.max(0) as u32,
        last_failure_reason: row.get("last_failure_reason")?,
        last_error: row.get("last_error")?,
        execution_log_url: row.get("execution_log_url")?,
        summary: row.get("summary")?,
        claimed_by: row.get("claimed_by")?,
        lease_expires_at: parse_opt_ts(0, row.get("lease_expires_at")?)?,
        claim_count: claim_count.max(0) as u32,
        external_ref: row.get("external_ref")?,
        created_at: parse_ts(0, &created_at)?,
        updated_at: parse_ts(0, &updated_at)?,
        due_date: parse_opt_ts(0, row.get("due_date")?)?,
    })
}

/// Internal helper to get a task using an existing connection (avoids deadlock).
pub(crate) fn get_task_internal(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            "SELECT * FROM tasks WHERE id = ?1",
            params![task_id],
            parse_task_row,
        )
        .optional()?;
    Ok(task)
}

/// Like `get_task_internal`, but a missing task is an error.
pub(crate) fn require_task(conn: &Connection, task_id: &str) -> Result<Task> {
    get_task_internal(conn, task_id)?.ok_or_else(|| BoardError::NotFound(task_id.to_string()))
}

/// Next `TASK-NNN` identity, one past the numeric maximum in use.
///
/// Must run under the store lock so concurrent creates are serialized.
fn next_task_id(conn: &Connection) -> Result<String> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(CAST(SUBSTR(id, 6) AS INTEGER)) FROM tasks
         WHERE id LIKE 'TASK-%' AND SUBSTR(id, 6) GLOB '[0-9]*'",
        [],
        |row| row.get(0),
    )?;
    Ok(format_task_id(max.unwrap_or(0) + 1))
}

/// Render a numeric suffix as a task identity (at least three digits).
pub fn format_task_id(n: i64) -> String {
    format!("{}{:03}", TASK_ID_PREFIX, n)
}

impl Database {
    /// Create a new task.
    /// Allocates an id when none is given and fills defaults
    /// (state inbox, priority normal, category uncategorized).
    pub fn create_task(&self, input: NewTask) -> Result<Task> {
        let title = input.title.trim().to_string();
        if title.is_empty() {
            return Err(BoardError::missing_field("title"));
        }
        let state = input.state.unwrap_or(TaskState::Inbox);
        if state == TaskState::Running {
            return Err(BoardError::validation(
                "state",
                "tasks enter running only through a claim",
            ));
        }
        let category = input
            .category
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| UNCATEGORIZED.to_string());
        let source = input
            .source
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| SOURCE_MANUAL.to_string());
        let priority = input.priority.unwrap_or_default();
        let external_ref = input.external_ref.filter(|r| !r.is_empty());
        let tags_json = serde_json::to_string(&input.tags)?;
        let now = now();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let task_id = match input.id.filter(|id| !id.trim().is_empty()) {
                Some(id) => {
                    if get_task_internal(&tx, &id)?.is_some() {
                        return Err(BoardError::validation(
                            "id",
                            format!("task {} already exists", id),
                        ));
                    }
                    id
                }
                None => next_task_id(&tx)?,
            };

            if let Some(ref r) = external_ref {
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT id FROM tasks WHERE external_ref = ?1",
                        params![r],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(owner) = existing {
                    return Err(BoardError::validation(
                        "external_ref",
                        format!("external reference {} already belongs to {}", r, owner),
                    ));
                }
            }

            tx.execute(
                "INSERT INTO tasks (
                    id, title, description, state, category, source, priority, tags,
                    assignee, project, summary, external_ref, created_at, updated_at, due_date
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    &task_id,
                    &title,
                    &input.description,
                    state.as_str(),
                    &category,
                    &source,
                    priority.as_str(),
                    &tags_json,
                    &input.assignee,
                    &input.project,
                    &input.summary,
                    &external_ref,
                    format_ts(now),
                    format_ts(now),
                    format_opt_ts(input.due_date),
                ],
            )?;

            let task = require_task(&tx, &task_id)?;
            tx.commit()?;
            Ok(task)
        })
    }

    /// Get a task by ID.
    pub fn get_task(&self, task_id: &str) -> Result<Task> {
        self.with_conn(|conn| require_task(conn, task_id))
    }

    /// Look up a task by its external reference.
    /// Returns `None` (not an error) when nothing matches.
    pub fn get_task_by_external_ref(&self, external_ref: &str) -> Result<Option<Task>> {
        if external_ref.is_empty() {
            return Ok(None);
        }
        self.with_conn(|conn| {
            let task = conn
                .query_row(
                    "SELECT * FROM tasks WHERE external_ref = ?1",
                    params![external_ref],
                    parse_task_row,
                )
                .optional()?;
            Ok(task)
        })
    }

    /// List tasks matching all given filters, most recently updated first.
    pub fn list_tasks(&self, filters: &TaskFilters) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut sql = String::from("SELECT * FROM tasks WHERE 1=1");
            let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

            if let Some(state) = filters.state {
                sql.push_str(" AND state = ?");
                params_vec.push(Box::new(state.as_str()));
            }
            if let Some(ref category) = filters.category {
                sql.push_str(" AND category = ?");
                params_vec.push(Box::new(category.clone()));
            }
            if let Some(ref source) = filters.source {
                sql.push_str(" AND source = ?");
                params_vec.push(Box::new(source.clone()));
            }
            if let Some(ref project) = filters.project {
                sql.push_str(" AND project = ?");
                params_vec.push(Box::new(project.clone()));
            }
            if filters.exclude_terminal {
                sql.push_str(" AND state != ?");
                params_vec.push(Box::new(TaskState::Done.as_str()));
            }

            let limit = filters.limit.filter(|&n| n > 0).unwrap_or(DEFAULT_LIST_LIMIT);
            sql.push_str(&format!(" ORDER BY updated_at DESC, id DESC LIMIT {}", limit));

            let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();

            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map(params_refs.as_slice(), parse_task_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(tasks)
        })
    }

    /// Apply a whitelisted partial update.
    ///
    /// Returns `false` without touching the store when `updates` is empty.
    pub fn update_task(&self, task_id: &str, updates: &[FieldUpdate]) -> Result<bool> {
        if updates.is_empty() {
            return Ok(false);
        }

        let mut set_clauses: Vec<String> = Vec::new();
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();
        for update in updates {
            let value: Box<dyn ToSql> = match update {
                FieldUpdate::Title(title) => {
                    let title = title.trim();
                    if title.is_empty() {
                        return Err(BoardError::missing_field("title"));
                    }
                    Box::new(title.to_string())
                }
                FieldUpdate::Category(category) => {
                    let category = category.trim();
                    Box::new(if category.is_empty() {
                        UNCATEGORIZED.to_string()
                    } else {
                        category.to_string()
                    })
                }
                FieldUpdate::Priority(priority) => Box::new(priority.as_str()),
                FieldUpdate::Tags(tags) => Box::new(serde_json::to_string(tags)?),
                FieldUpdate::DueDate(due) => Box::new(format_opt_ts(*due)),
                FieldUpdate::ExternalRef(r) => Box::new(r.clone()),
                FieldUpdate::Description(s)
                | FieldUpdate::Assignee(s)
                | FieldUpdate::Project(s)
                | FieldUpdate::Summary(s)
                | FieldUpdate::ExecutionLogUrl(s)
                | FieldUpdate::LastError(s)
                | FieldUpdate::LastFailureReason(s) => Box::new(s.clone()),
            };
            set_clauses.push(format!("{} = ?", update.column()));
            params_vec.push(value);
        }

        set_clauses.push("updated_at = ?".to_string());
        params_vec.push(Box::new(format_ts(now())));
        params_vec.push(Box::new(task_id.to_string()));

        let sql = format!("UPDATE tasks SET {} WHERE id = ?", set_clauses.join(", "));

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            require_task(&tx, task_id)?;

            let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
            tx.execute(&sql, params_refs.as_slice())
                .map_err(|e| map_external_ref_conflict(e, updates))?;

            tx.commit()?;
            Ok(true)
        })
    }

    /// Remove a task with its transitions, assignment, notes and log entries.
    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            require_task(&tx, task_id)?;

            tx.execute("DELETE FROM task_transitions WHERE task_id = ?1", params![task_id])?;
            tx.execute("DELETE FROM task_assignments WHERE task_id = ?1", params![task_id])?;
            tx.execute("DELETE FROM task_notes WHERE task_id = ?1", params![task_id])?;
            tx.execute("DELETE FROM task_events WHERE task_id = ?1", params![task_id])?;
            tx.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;

            tx.commit()?;
            Ok(())
        })
    }
}

/// The unique index on `external_ref` surfaces as a constraint violation;
/// report it as a validation problem on that field.
fn map_external_ref_conflict(err: rusqlite::Error, updates: &[FieldUpdate]) -> BoardError {
    let touches_ref = updates
        .iter()
        .any(|u| matches!(u, FieldUpdate::ExternalRef(Some(_))));
    match err {
        rusqlite::Error::SqliteFailure(ref e, _)
            if touches_ref && e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            BoardError::validation("external_ref", "external reference already in use")
        }
        other => BoardError::Database(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_zero_padded_to_three_digits() {
        assert_eq!(format_task_id(1), "TASK-001");
        assert_eq!(format_task_id(42), "TASK-042");
        assert_eq!(format_task_id(1000), "TASK-1000");
    }

    #[test]
    fn id_allocation_uses_numeric_maximum() {
        let db = Database::open_in_memory().unwrap();
        let mut input = NewTask::new("explicit");
        input.id = Some("TASK-999".into());
        db.create_task(input).unwrap();

        let next = db.create_task(NewTask::new("allocated")).unwrap();
        assert_eq!(next.id, "TASK-1000");

        let after = db.create_task(NewTask::new("allocated again")).unwrap();
        assert_eq!(after.id, "TASK-1001");
    }

    #[test]
    fn foreign_ids_do_not_disturb_allocation() {
        let db = Database::open_in_memory().unwrap();
        let mut input = NewTask::new("imported");
        input.id = Some("JIRA-77".into());
        db.create_task(input).unwrap();

        assert_eq!(db.create_task(NewTask::new("first")).unwrap().id, "TASK-001");
    }
}
