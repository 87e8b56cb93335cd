//! Task orchestration engine for agent swarms.
//!
//! A task store with a fixed state machine and append-only audit trail, a
//! lease manager for crash-tolerant claiming, a capability router, a retry
//! policy engine and a background lease sweeper. [`board::TaskBoard`] ties
//! them together and publishes lifecycle events.

pub mod board;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod format;
pub mod logging;
pub mod retry;
pub mod router;
pub mod states;
pub mod sweeper;
pub mod types;

pub use board::{FailureOutcome, TaskBoard};
pub use error::{BoardError, ErrorCode, Result};
pub use states::TaskState;
