//! `TaskBoard`: the service facade over the store, lease manager, router,
//! retry engine and event bus.
//!
//! Every mutation commits in the database first; lifecycle events are
//! published only after a successful commit.

use crate::config::Config;
use crate::db::Database;
use crate::db::leases::SWEEPER_EXECUTOR;
use crate::error::{BoardError, Result};
use crate::events::{EventBus, TaskEvent};
use crate::retry::{RetryDecision, RetryPolicies};
use crate::router::{AgentCapability, CapabilityRouter};
use crate::states::TaskState;
use crate::types::{
    BoardStats, FieldUpdate, NewTask, StateChange, StateTransition, Task, TaskAssignment,
    TaskFilters, TaskLogEntry, TaskNote,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default lease when a caller does not pass one.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

/// What happened to a task after a reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// Budget remains; the task is blocked and may be retried after `backoff`.
    Retry {
        attempt: u32,
        #[serde(rename = "backoff_seconds", with = "crate::retry::duration_secs")]
        backoff: Duration,
    },
    /// Budget exhausted; surfaced as `task.escalated`.
    Escalated { attempt: u32 },
    /// Budget exhausted and the policy does not escalate.
    Exhausted { attempt: u32 },
}

pub struct TaskBoard {
    db: Database,
    router: CapabilityRouter,
    retry: RetryPolicies,
    events: EventBus,
    default_lease: Duration,
    list_limit: usize,
}

impl TaskBoard {
    /// Board over `db` with an empty router and default policies.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            router: CapabilityRouter::new(),
            retry: RetryPolicies::default(),
            events: EventBus::default(),
            default_lease: DEFAULT_LEASE,
            list_limit: crate::db::tasks::DEFAULT_LIST_LIMIT,
        }
    }

    /// Open the configured database and register the configured agents.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.ensure_db_dir()?;
        let db = Database::open(&config.server.db_path)?;
        Ok(Self::with_config(db, config))
    }

    /// Apply a configuration to an already opened database.
    pub fn with_config(db: Database, config: &Config) -> Self {
        Self::new(db)
            .with_router(CapabilityRouter::with_agents(config.agents.iter().cloned()))
            .with_retry_policies(config.retry.policies())
            .with_event_bus(EventBus::new(config.events.capacity))
            .with_default_lease(config.leases.default_lease())
            .with_list_limit(config.leases.list_limit)
    }

    pub fn with_router(mut self, router: CapabilityRouter) -> Self {
        self.router = router;
        self
    }

    pub fn with_retry_policies(mut self, retry: RetryPolicies) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_default_lease(mut self, lease: Duration) -> Self {
        self.default_lease = lease;
        self
    }

    pub fn with_list_limit(mut self, limit: usize) -> Self {
        self.list_limit = limit.max(1);
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn router(&self) -> &CapabilityRouter {
        &self.router
    }

    pub fn retry_policies(&self) -> &RetryPolicies {
        &self.retry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn default_lease(&self) -> Duration {
        self.default_lease
    }

    // ------------------------------------------------------------------
    // Task store
    // ------------------------------------------------------------------

    pub fn create(&self, input: NewTask) -> Result<Task> {
        let task = self.db.create_task(input)?;
        info!(task_id = %task.id, category = %task.category, state = %task.state, "task created");
        self.events.publish(TaskEvent::Created {
            task_id: task.id.clone(),
            state: task.state,
            category: task.category.clone(),
        });
        Ok(task)
    }

    pub fn get(&self, task_id: &str) -> Result<Task> {
        self.db.get_task(task_id)
    }

    pub fn get_by_external_ref(&self, external_ref: &str) -> Result<Option<Task>> {
        self.db.get_task_by_external_ref(external_ref)
    }

    /// Create unless a task with the same external reference exists.
    ///
    /// Returns the task and whether it was created by this call.
    pub fn upsert_by_external_ref(&self, mut input: NewTask) -> Result<(Task, bool)> {
        let external_ref = input
            .external_ref
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| BoardError::missing_field("external_ref"))?
            .to_string();
        input.external_ref = Some(external_ref.clone());

        if let Some(existing) = self.db.get_task_by_external_ref(&external_ref)? {
            debug!(task_id = %existing.id, external_ref = %external_ref, "external ref already known");
            return Ok((existing, false));
        }

        match self.create(input) {
            Ok(task) => Ok((task, true)),
            // Lost a race with a concurrent creator; hand back the winner.
            Err(BoardError::Validation { ref field, .. }) if field == "external_ref" => self
                .db
                .get_task_by_external_ref(&external_ref)?
                .map(|task| (task, false))
                .ok_or_else(|| BoardError::NotFound(external_ref)),
            Err(e) => Err(e),
        }
    }

    /// List with the board's default cap when the filters name no limit.
    pub fn list(&self, filters: &TaskFilters) -> Result<Vec<Task>> {
        let mut filters = filters.clone();
        filters.limit = Some(filters.limit.filter(|&n| n > 0).unwrap_or(self.list_limit));
        self.db.list_tasks(&filters)
    }

    pub fn update(&self, task_id: &str, updates: &[FieldUpdate]) -> Result<bool> {
        let changed = self.db.update_task(task_id, updates)?;
        if changed {
            let fields: Vec<String> = updates.iter().map(|u| u.column().to_string()).collect();
            info!(task_id, fields = ?fields, "task updated");
            self.events.publish(TaskEvent::Updated {
                task_id: task_id.to_string(),
                from: None,
                to: None,
                fields,
                reason: String::new(),
                executor: String::new(),
            });
        } else {
            debug!(task_id, "update with no mutable fields ignored");
        }
        Ok(changed)
    }

    /// Whitelist update from a string-keyed map; unknown keys are skipped.
    pub fn update_fields(&self, task_id: &str, fields: &Map<String, Value>) -> Result<bool> {
        let updates = FieldUpdate::parse_map(fields)?;
        self.update(task_id, &updates)
    }

    pub fn delete(&self, task_id: &str) -> Result<()> {
        self.db.delete_task(task_id)?;
        info!(task_id, "task deleted");
        self.events.publish(TaskEvent::Deleted {
            task_id: task_id.to_string(),
        });
        Ok(())
    }

    pub fn transition(
        &self,
        task_id: &str,
        to: TaskState,
        reason: &str,
        executor: &str,
    ) -> Result<StateTransition> {
        let record = self.db.transition_task(task_id, to, reason, executor)?;
        info!(
            task_id,
            from = %record.from_state,
            to = %record.to_state,
            executor,
            "task transitioned"
        );
        self.events.publish(TaskEvent::for_transition(
            task_id,
            record.from_state,
            record.to_state,
            reason,
            executor,
        ));
        Ok(record)
    }

    pub fn history(&self, task_id: &str) -> Result<Vec<StateTransition>> {
        self.db.get_task_history(task_id)
    }

    pub fn stats(&self) -> Result<BoardStats> {
        self.db.board_stats()
    }

    pub fn category_stats(&self) -> Result<BTreeMap<String, i64>> {
        self.db.category_stats()
    }

    // ------------------------------------------------------------------
    // Lease manager
    // ------------------------------------------------------------------

    /// Claim with `lease`, or the board default when `None`.
    pub fn claim(&self, task_id: &str, worker_id: &str, lease: Option<Duration>) -> Result<TaskAssignment> {
        let lease = lease.unwrap_or(self.default_lease);
        let assignment = self.db.claim_task(task_id, worker_id, lease, &self.retry)?;
        info!(
            task_id,
            worker_id,
            attempt = assignment.attempt,
            expires_at = %assignment.expires_at,
            "task claimed"
        );
        self.events.publish(TaskEvent::Claimed {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            expires_at: assignment.expires_at,
            attempt: assignment.attempt,
        });
        Ok(assignment)
    }

    pub fn begin_execution(&self, task_id: &str, worker_id: &str) -> Result<TaskAssignment> {
        let assignment = self.db.begin_execution(task_id, worker_id)?;
        debug!(task_id, worker_id, "execution started");
        Ok(assignment)
    }

    /// Hand a task back. Unclaimed tasks are left alone and yield `None`.
    pub fn release(&self, task_id: &str, worker_id: &str, reason: &str) -> Result<Option<StateChange>> {
        let Some(change) = self.db.release_task(task_id, worker_id, reason)? else {
            debug!(task_id, worker_id, "release of unclaimed task ignored");
            return Ok(None);
        };

        if reason.is_empty() {
            info!(task_id, worker_id, to = %change.to, "task released");
            self.events.publish(TaskEvent::Released {
                task_id: task_id.to_string(),
                worker_id: worker_id.to_string(),
                from: change.from,
                to: change.to,
            });
        } else {
            info!(task_id, worker_id, reason, "task released with failure");
            self.events.publish(TaskEvent::Failed {
                task_id: task_id.to_string(),
                from: change.from,
                reason: reason.to_string(),
                executor: worker_id.to_string(),
            });
        }
        Ok(Some(change))
    }

    pub fn complete(&self, task_id: &str, worker_id: &str) -> Result<StateChange> {
        let change = self.db.complete_task(task_id, worker_id)?;
        info!(task_id, worker_id, "task completed");
        self.events.publish(TaskEvent::Completed {
            task_id: task_id.to_string(),
            from: change.from,
            executor: worker_id.to_string(),
        });
        Ok(change)
    }

    /// Report a failed attempt by the holder and apply the retry policy.
    ///
    /// The task always ends up blocked. An exhausted budget with an
    /// escalating policy additionally publishes `task.escalated`.
    pub fn fail(&self, task_id: &str, worker_id: &str, reason: &str) -> Result<FailureOutcome> {
        let (assignment, change) = self.db.fail_task(task_id, worker_id, reason)?;
        let task = self.db.get_task(task_id)?;

        self.events.publish(TaskEvent::Failed {
            task_id: task_id.to_string(),
            from: change.from,
            reason: reason.to_string(),
            executor: worker_id.to_string(),
        });

        let outcome = match self.retry.evaluate(&task.category, &assignment) {
            RetryDecision::Retry { attempt, backoff } => {
                info!(task_id, worker_id, attempt, backoff_secs = backoff.as_secs(), "task failed, will retry");
                FailureOutcome::Retry { attempt, backoff }
            }
            RetryDecision::Escalate { attempt } => {
                warn!(task_id, worker_id, attempt, reason, "retry budget exhausted, escalating");
                self.db.log_event(
                    Some(task_id),
                    worker_id,
                    "escalated",
                    &format!("escalated after {} attempts", attempt),
                    reason,
                )?;
                self.events.publish(TaskEvent::Escalated {
                    task_id: task_id.to_string(),
                    worker_id: worker_id.to_string(),
                    attempt,
                    reason: reason.to_string(),
                });
                FailureOutcome::Escalated { attempt }
            }
            RetryDecision::GiveUp { attempt } => {
                warn!(task_id, worker_id, attempt, reason, "retry budget exhausted");
                FailureOutcome::Exhausted { attempt }
            }
        };
        Ok(outcome)
    }

    /// Force-release expired leases. Publishes `task.lease_expired` when
    /// anything was reclaimed.
    pub fn cleanup_expired(&self) -> Result<Vec<String>> {
        let expired = self.db.cleanup_expired()?;
        if !expired.is_empty() {
            warn!(count = expired.len(), task_ids = ?expired, "expired leases released");
            self.db.log_event(
                None,
                SWEEPER_EXECUTOR,
                "lease_expired",
                &format!("released {} expired lease(s)", expired.len()),
                &expired.join(","),
            )?;
            self.events.publish(TaskEvent::LeaseExpired {
                count: expired.len(),
                task_ids: expired.clone(),
            });
        }
        Ok(expired)
    }

    pub fn assignment(&self, task_id: &str) -> Result<Option<TaskAssignment>> {
        self.db.get_assignment(task_id)
    }

    pub fn active_assignments(&self) -> Result<Vec<TaskAssignment>> {
        self.db.active_assignments()
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    pub fn register_agent(&self, capability: AgentCapability) {
        self.router.register_agent(capability);
    }

    pub fn unregister_agent(&self, worker_id: &str) -> bool {
        self.router.unregister_agent(worker_id)
    }

    /// Suggest a worker for `category`. Does not claim.
    pub fn route(&self, category: &str) -> Result<String> {
        self.router.route_task(category, &self.db)
    }

    /// Route by the task's category and claim for the chosen worker.
    pub fn dispatch(&self, task_id: &str, lease: Option<Duration>) -> Result<TaskAssignment> {
        let task = self.db.get_task(task_id)?;
        let worker_id = self.route(&task.category)?;
        debug!(task_id, worker_id = %worker_id, category = %task.category, "task routed");
        self.claim(task_id, &worker_id, lease)
    }

    // ------------------------------------------------------------------
    // Notes and informal history
    // ------------------------------------------------------------------

    pub fn add_note(&self, task_id: &str, content: &str, author: &str) -> Result<TaskNote> {
        self.db.add_note(task_id, content, author)
    }

    pub fn notes(&self, task_id: &str) -> Result<Vec<TaskNote>> {
        self.db.list_notes(task_id)
    }

    pub fn log_event(
        &self,
        task_id: Option<&str>,
        source: &str,
        event_type: &str,
        summary: &str,
        details: &str,
    ) -> Result<TaskLogEntry> {
        self.db.log_event(task_id, source, event_type, summary, details)
    }

    pub fn events_for(&self, task_id: Option<&str>, limit: usize) -> Result<Vec<TaskLogEntry>> {
        self.db.list_event_log(task_id, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> TaskBoard {
        TaskBoard::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn list_applies_board_limit_by_default() {
        let board = board().with_list_limit(2);
        for i in 0..3 {
            board.create(NewTask::new(format!("task {}", i))).unwrap();
        }
        assert_eq!(board.list(&TaskFilters::default()).unwrap().len(), 2);
        let explicit = TaskFilters {
            limit: Some(10),
            ..Default::default()
        };
        assert_eq!(board.list(&explicit).unwrap().len(), 3);
    }

    #[test]
    fn upsert_requires_external_ref() {
        let err = board().upsert_by_external_ref(NewTask::new("no ref")).unwrap_err();
        assert!(matches!(err, BoardError::Validation { .. }));
    }

    #[test]
    fn upsert_returns_existing_task() {
        let board = board();
        let (first, created) = board
            .upsert_by_external_ref(NewTask::new("Issue 42").with_external_ref("gh-42"))
            .unwrap();
        assert!(created);
        let (second, created) = board
            .upsert_by_external_ref(NewTask::new("Issue 42 again").with_external_ref("gh-42"))
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.title, "Issue 42");
    }

    #[test]
    fn update_fields_skips_unknown_keys() {
        let board = board();
        let task = board.create(NewTask::new("Original")).unwrap();
        let fields = serde_json::json!({"nonsense": 1});
        assert!(!board.update_fields(&task.id, fields.as_object().unwrap()).unwrap());

        let fields = serde_json::json!({"title": "Renamed", "nonsense": 1});
        assert!(board.update_fields(&task.id, fields.as_object().unwrap()).unwrap());
        assert_eq!(board.get(&task.id).unwrap().title, "Renamed");
    }

    #[test]
    fn failure_outcome_serializes_backoff_in_seconds() {
        let outcome = FailureOutcome::Retry {
            attempt: 1,
            backoff: Duration::from_secs(5),
        };
        let json = serde_json::to_value(outcome).unwrap();
        assert_eq!(json["outcome"], "retry");
        assert_eq!(json["backoff_seconds"], 5);
    }
}
