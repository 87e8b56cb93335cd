//! Lifecycle events and the in-process broadcast bus.
//!
//! Events are published after the store commits, so a subscriber never sees
//! a change that was rolled back. With no subscribers they are dropped.

use crate::states::TaskState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default number of buffered events before slow receivers lag.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A lifecycle event for external consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskEvent {
    #[serde(rename = "task.created")]
    Created {
        task_id: String,
        state: TaskState,
        category: String,
    },
    #[serde(rename = "task.updated")]
    Updated {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<TaskState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<TaskState>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        fields: Vec<String>,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        executor: String,
    },
    #[serde(rename = "task.completed")]
    Completed {
        task_id: String,
        from: TaskState,
        executor: String,
    },
    #[serde(rename = "task.failed")]
    Failed {
        task_id: String,
        from: TaskState,
        reason: String,
        executor: String,
    },
    #[serde(rename = "task.claimed")]
    Claimed {
        task_id: String,
        worker_id: String,
        expires_at: DateTime<Utc>,
        attempt: u32,
    },
    #[serde(rename = "task.released")]
    Released {
        task_id: String,
        worker_id: String,
        from: TaskState,
        to: TaskState,
    },
    #[serde(rename = "task.deleted")]
    Deleted { task_id: String },
    #[serde(rename = "task.lease_expired")]
    LeaseExpired { count: usize, task_ids: Vec<String> },
    #[serde(rename = "task.escalated")]
    Escalated {
        task_id: String,
        worker_id: String,
        attempt: u32,
        reason: String,
    },
}

impl TaskEvent {
    /// Wire name, e.g. `task.claimed`.
    pub fn event_type(&self) -> &'static str {
        match self {
            TaskEvent::Created { .. } => "task.created",
            TaskEvent::Updated { .. } => "task.updated",
            TaskEvent::Completed { .. } => "task.completed",
            TaskEvent::Failed { .. } => "task.failed",
            TaskEvent::Claimed { .. } => "task.claimed",
            TaskEvent::Released { .. } => "task.released",
            TaskEvent::Deleted { .. } => "task.deleted",
            TaskEvent::LeaseExpired { .. } => "task.lease_expired",
            TaskEvent::Escalated { .. } => "task.escalated",
        }
    }

    /// Subject task, absent for board-wide events.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            TaskEvent::Created { task_id, .. }
            | TaskEvent::Updated { task_id, .. }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Failed { task_id, .. }
            | TaskEvent::Claimed { task_id, .. }
            | TaskEvent::Released { task_id, .. }
            | TaskEvent::Deleted { task_id }
            | TaskEvent::Escalated { task_id, .. } => Some(task_id),
            TaskEvent::LeaseExpired { .. } => None,
        }
    }

    /// Event for an accepted table transition, typed by destination.
    pub fn for_transition(
        task_id: &str,
        from: TaskState,
        to: TaskState,
        reason: &str,
        executor: &str,
    ) -> Self {
        match to {
            TaskState::Done => TaskEvent::Completed {
                task_id: task_id.to_string(),
                from,
                executor: executor.to_string(),
            },
            TaskState::Blocked => TaskEvent::Failed {
                task_id: task_id.to_string(),
                from,
                reason: reason.to_string(),
                executor: executor.to_string(),
            },
            _ => TaskEvent::Updated {
                task_id: task_id.to_string(),
                from: Some(from),
                to: Some(to),
                fields: Vec::new(),
                reason: reason.to_string(),
                executor: executor.to_string(),
            },
        }
    }
}

/// Broadcast bus for [`TaskEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<TaskEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Publish to all current subscribers.
    pub fn publish(&self, event: TaskEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(receivers) => debug!(event_type, receivers, "event published"),
            Err(_) => debug!(event_type, "no subscribers listening to event"),
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Receiving end of the bus.
pub struct EventReceiver {
    receiver: broadcast::Receiver<TaskEvent>,
}

impl EventReceiver {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Result<TaskEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    pub fn try_recv(&mut self) -> Result<TaskEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("event bus is closed")]
    Closed,

    #[error("no events available")]
    Empty,

    #[error("receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
