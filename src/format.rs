//! Human-readable rendering for CLI output.

use crate::db::format_ts;
use crate::types::{BoardStats, StateTransition, Task, TaskAssignment, TaskNote};
use std::collections::BTreeMap;

/// One line per task, for listings.
pub fn format_task_row(task: &Task) -> String {
    let owner = task
        .claimed_by
        .as_deref()
        .map(|w| format!(" [{}]", w))
        .unwrap_or_default();
    format!(
        "{:<10} {:<8} {:<14} {:<8} {}{}",
        task.id,
        task.state.as_str(),
        task.category,
        task.priority.as_str(),
        task.title,
        owner
    )
}

pub fn format_task_list(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "No tasks.".to_string();
    }
    tasks.iter().map(format_task_row).collect::<Vec<_>>().join("\n")
}

/// Full task card.
pub fn format_task(task: &Task) -> String {
    let mut out = String::new();

    out.push_str(&format!("{}: {}\n", task.id, task.title));
    out.push_str(&format!("  state:     {}\n", task.state));
    out.push_str(&format!("  category:  {}\n", task.category));
    out.push_str(&format!("  priority:  {}\n", task.priority));
    out.push_str(&format!("  source:    {}\n", task.source));

    if !task.project.is_empty() {
        out.push_str(&format!("  project:   {}\n", task.project));
    }
    if !task.assignee.is_empty() {
        out.push_str(&format!("  assignee:  {}\n", task.assignee));
    }
    if !task.tags.is_empty() {
        out.push_str(&format!("  tags:      {}\n", task.tags.join(", ")));
    }
    if let Some(ref holder) = task.claimed_by {
        let expires = task.lease_expires_at.map(format_ts).unwrap_or_default();
        out.push_str(&format!("  claimed:   {} until {}\n", holder, expires));
    }
    out.push_str(&format!(
        "  attempts:  {} (claims {})\n",
        task.attempts, task.claim_count
    ));
    if !task.last_error.is_empty() {
        out.push_str(&format!("  error:     {}\n", task.last_error));
    }
    if let Some(ref external_ref) = task.external_ref {
        out.push_str(&format!("  ref:       {}\n", external_ref));
    }
    if let Some(due) = task.due_date {
        out.push_str(&format!("  due:       {}\n", format_ts(due)));
    }
    out.push_str(&format!("  updated:   {}\n", format_ts(task.updated_at)));

    if !task.description.is_empty() {
        out.push('\n');
        out.push_str(&task.description);
        out.push('\n');
    }

    out
}

pub fn format_assignment(assignment: &TaskAssignment) -> String {
    format!(
        "{} held by {} ({}), attempt {}/{}, expires {}",
        assignment.task_id,
        assignment.worker_id,
        assignment.status.as_str(),
        assignment.attempt,
        assignment.max_retry,
        format_ts(assignment.expires_at)
    )
}

pub fn format_history(history: &[StateTransition]) -> String {
    if history.is_empty() {
        return "No transitions.".to_string();
    }
    history
        .iter()
        .map(|t| {
            let mut line = format!(
                "{}  {} -> {}  by {}",
                format_ts(t.timestamp),
                t.from_state,
                t.to_state,
                if t.executor.is_empty() { "-" } else { t.executor.as_str() }
            );
            if !t.reason.is_empty() {
                line.push_str(&format!(" ({})", t.reason));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_notes(notes: &[TaskNote]) -> String {
    notes
        .iter()
        .map(|n| format!("{}  {}: {}", format_ts(n.created_at), n.author, n.content))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_stats(stats: &BoardStats, categories: &BTreeMap<String, i64>) -> String {
    let mut out = format!("Total: {}\n", stats.total);
    for state in crate::states::TaskState::ALL {
        let count = stats.by_state.get(state.as_str()).copied().unwrap_or(0);
        out.push_str(&format!("  {:<8} {}\n", state.as_str(), count));
    }
    if !categories.is_empty() {
        out.push_str("Open by category:\n");
        for (category, count) in categories {
            out.push_str(&format!("  {:<14} {}\n", category, count));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::TaskState;
    use crate::types::Priority;
    use chrono::Utc;

    fn task() -> Task {
        let now = Utc::now();
        Task {
            id: "TASK-007".into(),
            title: "Fix login".into(),
            description: String::new(),
            state: TaskState::Running,
            category: "bug".into(),
            source: "manual".into(),
            priority: Priority::High,
            tags: vec![],
            assignee: String::new(),
            project: String::new(),
            attempts: 1,
            last_failure_reason: String::new(),
            last_error: String::new(),
            execution_log_url: String::new(),
            summary: String::new(),
            claimed_by: Some("bot-a".into()),
            lease_expires_at: Some(now),
            claim_count: 1,
            external_ref: None,
            created_at: now,
            updated_at: now,
            due_date: None,
        }
    }

    #[test]
    fn row_shows_holder() {
        let row = format_task_row(&task());
        assert!(row.starts_with("TASK-007"));
        assert!(row.contains("running"));
        assert!(row.ends_with("[bot-a]"));
    }

    #[test]
    fn card_includes_claim_line() {
        let card = format_task(&task());
        assert!(card.contains("claimed:   bot-a until"));
        assert!(!card.contains("error:"));
    }

    #[test]
    fn stats_list_every_state() {
        let stats = BoardStats::default();
        let out = format_stats(&stats, &BTreeMap::new());
        for state in TaskState::ALL {
            assert!(out.contains(state.as_str()));
        }
    }
}
