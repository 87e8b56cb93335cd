//! Command execution.

use super::{Command, CreateArgs, ListArgs, parse_assignments};
use crate::board::TaskBoard;
use crate::error::{BoardError, Result};
use crate::events::EventBusError;
use crate::format;
use crate::sweeper::LeaseSweeper;
use crate::types::{NewTask, TaskFilters};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Print `value` as JSON, or the text rendering.
fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

/// Execute one command. `sweep_interval` is used by `serve`.
pub async fn run(board: Arc<TaskBoard>, command: Command, sweep_interval: Duration, json: bool) -> Result<()> {
    match command {
        Command::Serve => serve(board, sweep_interval).await,

        Command::Create(args) => create(&board, args, json),

        Command::List(args) => list(&board, args, json),

        Command::Show { id } => {
            let task = board.get(&id)?;
            let assignment = board.assignment(&id)?;
            let history = board.history(&id)?;
            let notes = board.notes(&id)?;
            let value = json!({
                "task": task,
                "assignment": assignment,
                "history": history,
                "notes": notes,
            });
            emit(json, &value, || {
                let mut out = format::format_task(&task);
                if let Some(ref a) = assignment {
                    out.push_str(&format!("\nAssignment: {}\n", format::format_assignment(a)));
                }
                out.push_str(&format!("\nHistory:\n{}\n", format::format_history(&history)));
                if !notes.is_empty() {
                    out.push_str(&format!("\nNotes:\n{}\n", format::format_notes(&notes)));
                }
                out
            })
        }

        Command::Update { id, set } => {
            let fields = parse_assignments(&set)?;
            let changed = board.update_fields(&id, &fields)?;
            emit(json, &json!({ "task_id": id, "updated": changed }), || {
                if changed {
                    format!("Updated {}", id)
                } else {
                    format!("No mutable fields given; {} unchanged", id)
                }
            })
        }

        Command::Transition {
            id,
            state,
            reason,
            executor,
        } => {
            let record = board.transition(&id, state, &reason, &executor)?;
            emit(json, &record, || {
                format!("{}: {} -> {}", id, record.from_state, record.to_state)
            })
        }

        Command::Claim {
            id,
            worker,
            lease_seconds,
        } => {
            let assignment = board.claim(&id, &worker, lease_seconds.map(Duration::from_secs))?;
            emit(json, &assignment, || format::format_assignment(&assignment))
        }

        Command::Release { id, worker, reason } => {
            let change = board.release(&id, &worker, &reason)?;
            emit(json, &json!({ "task_id": id, "change": change }), || match change {
                Some(c) => format!("{}: {} -> {}", id, c.from, c.to),
                None => format!("{} was not claimed; nothing to release", id),
            })
        }

        Command::Complete { id, worker } => {
            let change = board.complete(&id, &worker)?;
            emit(json, &change, || format!("{}: {} -> {}", id, change.from, change.to))
        }

        Command::Fail { id, worker, reason } => {
            let outcome = board.fail(&id, &worker, &reason)?;
            emit(json, &outcome, || format!("{}: {:?}", id, outcome))
        }

        Command::Route { category } => {
            let worker = board.route(&category)?;
            emit(json, &json!({ "category": category, "worker_id": worker }), || worker.clone())
        }

        Command::Dispatch { id, lease_seconds } => {
            let assignment = board.dispatch(&id, lease_seconds.map(Duration::from_secs))?;
            emit(json, &assignment, || format::format_assignment(&assignment))
        }

        Command::Sweep => {
            let released = board.cleanup_expired()?;
            emit(json, &json!({ "count": released.len(), "task_ids": released }), || {
                format!("Released {} expired lease(s)", released.len())
            })
        }

        Command::Stats => {
            let stats = board.stats()?;
            let categories = board.category_stats()?;
            let value = json!({ "total": stats.total, "by_state": stats.by_state, "open_by_category": categories });
            emit(json, &value, || format::format_stats(&stats, &categories))
        }

        Command::History { id } => {
            let history = board.history(&id)?;
            emit(json, &history, || format::format_history(&history))
        }

        Command::Note { id, content, author } => {
            let note = board.add_note(&id, &content, &author)?;
            emit(json, &note, || format!("Added note {} to {}", note.id, id))
        }

        Command::Delete { id } => {
            board.delete(&id)?;
            emit(json, &json!({ "task_id": id, "deleted": true }), || format!("Deleted {}", id))
        }
    }
}

fn create(board: &TaskBoard, args: CreateArgs, json: bool) -> Result<()> {
    let input = NewTask {
        id: args.id,
        title: args.title,
        description: args.description,
        state: args.state,
        category: args.category,
        source: args.source,
        priority: args.priority,
        tags: args.tags,
        project: args.project,
        external_ref: args.external_ref,
        ..Default::default()
    };

    let (task, created) = if input.external_ref.is_some() {
        board.upsert_by_external_ref(input)?
    } else {
        (board.create(input)?, true)
    };

    emit(json, &task, || {
        if created {
            format!("Created {}: {}", task.id, task.title)
        } else {
            format!("Exists {}: {}", task.id, task.title)
        }
    })
}

fn list(board: &TaskBoard, args: ListArgs, json: bool) -> Result<()> {
    let filters = TaskFilters {
        state: args.state,
        category: args.category,
        source: args.source,
        project: args.project,
        exclude_terminal: args.open,
        limit: args.limit,
    };
    let tasks = board.list(&filters)?;
    emit(json, &tasks, || format::format_task_list(&tasks))
}

/// Run the sweeper and log lifecycle events until Ctrl-C.
async fn serve(board: Arc<TaskBoard>, sweep_interval: Duration) -> Result<()> {
    let mut events = board.events().subscribe();
    let sweeper = Arc::new(LeaseSweeper::new(Arc::clone(&board), sweep_interval));
    let shutdown = sweeper.shutdown_token();
    let handle = sweeper.start();

    let watcher_shutdown = shutdown.clone();
    let watcher = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = watcher_shutdown.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => info!(event_type = event.event_type(), task_id = ?event.task_id(), "event"),
                    Err(EventBusError::Lagged(_)) => continue,
                    Err(_) => break,
                },
            }
        }
    });

    info!("task board serving; press Ctrl-C to stop");
    let signal = tokio::signal::ctrl_c().await;
    shutdown.cancel();

    if let Err(e) = handle.await {
        warn!("lease sweeper task ended abnormally: {}", e);
    }
    if let Err(e) = watcher.await {
        warn!("event watcher task ended abnormally: {}", e);
    }

    signal.map_err(BoardError::internal)
}
