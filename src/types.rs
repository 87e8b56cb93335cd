//! Core types for the task board.

use crate::error::{BoardError, Result};
use crate::states::TaskState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Category assigned when the creator supplies none.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Source tag assigned when the creator supplies none.
pub const SOURCE_MANUAL: &str = "manual";

/// Advisory task priority. Not consulted by the router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" | "medium" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(BoardError::validation(
                "priority",
                format!("unknown priority '{}'; expected low, normal, high or critical", other),
            )),
        }
    }
}

/// A task card on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub state: TaskState,
    pub category: String,
    pub source: String,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub assignee: String,
    pub project: String,

    // Execution tracking
    pub attempts: u32,
    pub last_failure_reason: String,
    pub last_error: String,
    pub execution_log_url: String,
    pub summary: String,

    // Ownership, written only by the lease manager
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub claim_count: u32,

    /// Stable identity in an external system, for idempotent upserts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }

    /// True when a holder is set and its lease has not yet run out at `now`.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        match (&self.claimed_by, self.lease_expires_at) {
            (Some(_), Some(expires)) => now < expires,
            _ => false,
        }
    }
}

/// Input for creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewTask {
    /// Explicit id; allocated as `TASK-NNN` when absent.
    pub id: Option<String>,
    pub title: String,
    pub description: String,
    pub state: Option<TaskState>,
    pub category: Option<String>,
    pub source: Option<String>,
    pub priority: Option<Priority>,
    pub tags: Vec<String>,
    pub assignee: String,
    pub project: String,
    pub external_ref: Option<String>,
    pub summary: String,
    pub due_date: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_external_ref(mut self, external_ref: impl Into<String>) -> Self {
        self.external_ref = Some(external_ref.into());
        self
    }
}

/// Conjunctive filters for listing tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFilters {
    pub state: Option<TaskState>,
    pub category: Option<String>,
    pub source: Option<String>,
    pub project: Option<String>,
    /// Skip tasks in the terminal state.
    pub exclude_terminal: bool,
    pub limit: Option<usize>,
}

/// One accepted state change. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub id: i64,
    pub task_id: String,
    pub from_state: TaskState,
    pub to_state: TaskState,
    pub reason: String,
    pub executor: String,
    pub timestamp: DateTime<Utc>,
}

/// State change performed by the lease manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: TaskState,
    pub to: TaskState,
}

/// Status of a lease-tracking record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Claimed,
    Executing,
    Completed,
    Failed,
    Expired,
    Released,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Claimed => "claimed",
            AssignmentStatus::Executing => "executing",
            AssignmentStatus::Completed => "completed",
            AssignmentStatus::Failed => "failed",
            AssignmentStatus::Expired => "expired",
            AssignmentStatus::Released => "released",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "claimed" => Some(AssignmentStatus::Claimed),
            "executing" => Some(AssignmentStatus::Executing),
            "completed" => Some(AssignmentStatus::Completed),
            "failed" => Some(AssignmentStatus::Failed),
            "expired" => Some(AssignmentStatus::Expired),
            "released" => Some(AssignmentStatus::Released),
            _ => None,
        }
    }

    /// Counts against a worker's concurrency limit.
    pub fn is_active(&self) -> bool {
        matches!(self, AssignmentStatus::Claimed | AssignmentStatus::Executing)
    }
}

/// Lease-tracking record, one per task, replaced on each fresh claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: String,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempt: u32,
    pub max_retry: u32,
    pub status: AssignmentStatus,
}

/// Free-text note attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNote {
    pub id: i64,
    pub task_id: String,
    pub content: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

/// Informal history entry, used for display only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub id: i64,
    pub task_id: Option<String>,
    pub source: String,
    pub event_type: String,
    pub summary: String,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

/// Board-level counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardStats {
    pub total: i64,
    /// Count per state; every state is present, zero when empty.
    pub by_state: BTreeMap<String, i64>,
}

/// One typed change to a mutable task field.
///
/// Ownership fields (`claimed_by`, `lease_expires_at`, `claim_count`) are
/// deliberately absent: only the lease manager writes them.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Title(String),
    Description(String),
    Category(String),
    Priority(Priority),
    Assignee(String),
    Project(String),
    Tags(Vec<String>),
    DueDate(Option<DateTime<Utc>>),
    Summary(String),
    ExecutionLogUrl(String),
    ExternalRef(Option<String>),
    LastError(String),
    LastFailureReason(String),
}

/// Keys that name ownership fields. Recognised so they can be dropped loudly.
pub const OWNERSHIP_FIELDS: &[&str] = &["claimed_by", "lease_expires_at", "claim_count"];

impl FieldUpdate {
    /// Column written by this update.
    pub fn column(&self) -> &'static str {
        match self {
            FieldUpdate::Title(_) => "title",
            FieldUpdate::Description(_) => "description",
            FieldUpdate::Category(_) => "category",
            FieldUpdate::Priority(_) => "priority",
            FieldUpdate::Assignee(_) => "assignee",
            FieldUpdate::Project(_) => "project",
            FieldUpdate::Tags(_) => "tags",
            FieldUpdate::DueDate(_) => "due_date",
            FieldUpdate::Summary(_) => "summary",
            FieldUpdate::ExecutionLogUrl(_) => "execution_log_url",
            FieldUpdate::ExternalRef(_) => "external_ref",
            FieldUpdate::LastError(_) => "last_error",
            FieldUpdate::LastFailureReason(_) => "last_failure_reason",
        }
    }

    /// Parse one `key: value` pair. Unknown keys yield `None`.
    pub fn from_json(key: &str, value: &Value) -> Result<Option<Self>> {
        let update = match key {
            "title" => FieldUpdate::Title(expect_string(key, value)?),
            "description" => FieldUpdate::Description(expect_string(key, value)?),
            "category" => FieldUpdate::Category(expect_string(key, value)?),
            "priority" => FieldUpdate::Priority(expect_string(key, value)?.parse()?),
            "assignee" => FieldUpdate::Assignee(expect_string(key, value)?),
            "project" => FieldUpdate::Project(expect_string(key, value)?),
            "tags" => FieldUpdate::Tags(serde_json::from_value(value.clone()).map_err(|_| {
                BoardError::validation(key, "expected a list of strings")
            })?),
            "due_date" => FieldUpdate::DueDate(expect_optional_time(key, value)?),
            "summary" => FieldUpdate::Summary(expect_string(key, value)?),
            "execution_log_url" => FieldUpdate::ExecutionLogUrl(expect_string(key, value)?),
            "external_ref" => FieldUpdate::ExternalRef(
                expect_optional_string(key, value)?.filter(|s| !s.is_empty()),
            ),
            "last_error" => FieldUpdate::LastError(expect_string(key, value)?),
            "last_failure_reason" => FieldUpdate::LastFailureReason(expect_string(key, value)?),
            _ => return Ok(None),
        };
        Ok(Some(update))
    }

    /// Parse a whitelist dictionary, silently skipping keys that are not
    /// mutable fields.
    pub fn parse_map(map: &serde_json::Map<String, Value>) -> Result<Vec<Self>> {
        let mut updates = Vec::new();
        for (key, value) in map {
            if let Some(update) = Self::from_json(key, value)? {
                updates.push(update);
            }
        }
        Ok(updates)
    }
}

fn expect_string(key: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Null => Ok(String::new()),
        _ => Err(BoardError::validation(key, "expected a string")),
    }
}

fn expect_optional_string(key: &str, value: &Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        _ => Err(BoardError::validation(key, "expected a string or null")),
    }
}

fn expect_optional_time(key: &str, value: &Value) -> Result<Option<DateTime<Utc>>> {
    match expect_optional_string(key, value)? {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| BoardError::validation(key, format!("expected an RFC 3339 timestamp: {}", e))),
    }
}
