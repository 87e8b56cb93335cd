//! Background lease sweeper.
//!
//! The only actor allowed to force-release a lease without the holder's
//! consent. Runs `cleanup_expired` on a fixed interval until cancelled.

use crate::board::TaskBoard;
use crate::error::{BoardError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default sweep period.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct LeaseSweeper {
    board: Arc<TaskBoard>,
    interval: Duration,
    shutdown_token: CancellationToken,
}

impl LeaseSweeper {
    pub fn new(board: Arc<TaskBoard>, interval: Duration) -> Self {
        Self {
            board,
            interval: interval.max(Duration::from_millis(1)),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Token that stops the loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Spawn the sweep loop.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Sweep every interval until the shutdown token fires. The first sweep
    /// happens immediately. A failed sweep is logged and the loop goes on.
    pub async fn run(&self) {
        info!(interval_ms = self.interval.as_millis() as u64, "lease sweeper started");

        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    info!("shutdown signal received, stopping lease sweeper");
                    break;
                }
                _ = tick.tick() => {
                    match self.sweep_once().await {
                        Ok(released) if released.is_empty() => debug!("lease sweep found nothing to release"),
                        Ok(released) => info!(count = released.len(), "lease sweep released expired leases"),
                        Err(e) => warn!("lease sweep failed: {}", e),
                    }
                }
            }
        }

        info!("lease sweeper stopped");
    }

    /// One sweep, run off the async workers since the store blocks.
    pub async fn sweep_once(&self) -> Result<Vec<String>> {
        let board = Arc::clone(&self.board);
        tokio::task::spawn_blocking(move || board.cleanup_expired())
            .await
            .map_err(BoardError::internal)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::types::NewTask;

    #[tokio::test]
    async fn cancelled_sweeper_stops_promptly() {
        let board = Arc::new(TaskBoard::new(Database::open_in_memory().unwrap()));
        let sweeper = Arc::new(LeaseSweeper::new(board, Duration::from_secs(3600)));
        let token = sweeper.shutdown_token();
        let handle = sweeper.start();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn sweep_once_releases_expired_lease() {
        let board = Arc::new(TaskBoard::new(Database::open_in_memory().unwrap()));
        let task = board.create(NewTask::new("Short lease")).unwrap();
        board.claim(&task.id, "bot-a", Some(Duration::from_millis(10))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sweeper = LeaseSweeper::new(Arc::clone(&board), DEFAULT_SWEEP_INTERVAL);
        assert_eq!(sweeper.sweep_once().await.unwrap(), vec![task.id.clone()]);
        assert!(sweeper.sweep_once().await.unwrap().is_empty());
    }
}
