//! CLI command definitions for task-board.
//!
//! The main entry point is the `Cli` struct; `run` executes a parsed command
//! against a `TaskBoard`.

pub mod run;

use crate::error::{BoardError, Result};
use crate::states::TaskState;
use crate::types::Priority;
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;

pub use run::run;

/// Task board: state machine, leases, routing and retries for agent swarms
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the lease sweeper until interrupted (default if no subcommand given)
    Serve,

    /// Create a task
    Create(CreateArgs),

    /// List tasks, most recently updated first
    List(ListArgs),

    /// Show one task with its assignment, history and notes
    Show { id: String },

    /// Update mutable fields (unknown keys are ignored)
    Update {
        id: String,
        /// Field assignment, e.g. --set title="New title" --set tags=a,b
        #[arg(long = "set", value_name = "KEY=VALUE", required = true)]
        set: Vec<String>,
    },

    /// Move a task along the transition table
    Transition {
        id: String,
        #[arg(value_parser = parse_state)]
        state: TaskState,
        #[arg(long, default_value = "")]
        reason: String,
        #[arg(long, default_value = "cli")]
        executor: String,
    },

    /// Claim a task for a worker
    Claim {
        id: String,
        worker: String,
        /// Lease length in seconds (default from config)
        #[arg(long)]
        lease_seconds: Option<u64>,
    },

    /// Release a claimed task (a reason marks it blocked)
    Release {
        id: String,
        worker: String,
        #[arg(long, default_value = "")]
        reason: String,
    },

    /// Complete a claimed task
    Complete { id: String, worker: String },

    /// Report a failed attempt and apply the retry policy
    Fail {
        id: String,
        worker: String,
        reason: String,
    },

    /// Suggest a worker for a category
    Route { category: String },

    /// Route a task by its category and claim it for the chosen worker
    Dispatch {
        id: String,
        #[arg(long)]
        lease_seconds: Option<u64>,
    },

    /// Release every expired lease once
    Sweep,

    /// Board counts per state and open counts per category
    Stats,

    /// State transition audit trail for a task
    History { id: String },

    /// Attach a note to a task
    Note {
        id: String,
        content: String,
        #[arg(long, default_value = "cli")]
        author: String,
    },

    /// Delete a task and everything attached to it
    Delete { id: String },
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    pub title: String,
    #[arg(long)]
    pub id: Option<String>,
    #[arg(long, default_value = "")]
    pub description: String,
    #[arg(long, value_parser = parse_state)]
    pub state: Option<TaskState>,
    #[arg(long)]
    pub category: Option<String>,
    #[arg(long)]
    pub source: Option<String>,
    #[arg(long, value_parser = parse_priority)]
    pub priority: Option<Priority>,
    #[arg(long, default_value = "")]
    pub project: String,
    /// Repeatable
    #[arg(long = "tag")]
    pub tags: Vec<String>,
    /// Reuse the existing task when this reference is already known
    #[arg(long)]
    pub external_ref: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long, value_parser = parse_state)]
    pub state: Option<TaskState>,
    #[arg(long)]
    pub category: Option<String>,
    #[arg(long)]
    pub source: Option<String>,
    #[arg(long)]
    pub project: Option<String>,
    /// Hide done tasks
    #[arg(long)]
    pub open: bool,
    #[arg(long)]
    pub limit: Option<usize>,
}

fn parse_state(s: &str) -> std::result::Result<TaskState, String> {
    s.parse().map_err(|e: BoardError| e.to_string())
}

fn parse_priority(s: &str) -> std::result::Result<Priority, String> {
    s.parse().map_err(|e: BoardError| e.to_string())
}

/// Turn `--set key=value` pairs into an update map.
///
/// `tags` takes a comma-separated list or a JSON array; `null` clears
/// optional fields; anything else is a string.
pub fn parse_assignments(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| BoardError::validation("set", format!("expected KEY=VALUE, got '{}'", pair)))?;
        let key = key.trim();
        let value = match (key, raw) {
            (_, "null") => Value::Null,
            ("tags", raw) if raw.trim_start().starts_with('[') => serde_json::from_str(raw)?,
            ("tags", raw) => Value::Array(
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(|t| Value::String(t.to_string()))
                    .collect(),
            ),
            (_, raw) => Value::String(raw.to_string()),
        };
        map.insert(key.to_string(), value);
    }
    Ok(map)
}
