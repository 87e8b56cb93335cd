//! End-to-end tests through the `TaskBoard` facade: routing, leases,
//! retries, events and the background sweeper.

use std::sync::Arc;
use std::time::Duration;
use task_board::board::{FailureOutcome, TaskBoard};
use task_board::config::Config;
use task_board::db::Database;
use task_board::error::BoardError;
use task_board::events::TaskEvent;
use task_board::retry::{RetryPolicies, RetryPolicy};
use task_board::router::AgentCapability;
use task_board::states::TaskState;
use task_board::sweeper::LeaseSweeper;
use task_board::types::NewTask;

fn setup_board() -> TaskBoard {
    TaskBoard::new(Database::open_in_memory().expect("Failed to create in-memory database"))
}

/// Drain everything currently buffered for a receiver.
fn drain(rx: &mut task_board::events::EventReceiver) -> Vec<TaskEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

mod scenarios {
    use super::*;

    #[test]
    fn route_claim_complete() {
        let board = setup_board();
        board.register_agent(AgentCapability::new("bug-bot", &["bug"]));
        let task = board.create(NewTask::new("Crash on save").with_category("bug")).unwrap();

        let worker = board.route("bug").unwrap();
        assert_eq!(worker, "bug-bot");

        board
            .claim(&task.id, &worker, Some(Duration::from_secs(300)))
            .unwrap();
        assert_eq!(board.get(&task.id).unwrap().state, TaskState::Running);

        board.complete(&task.id, &worker).unwrap();
        let task = board.get(&task.id).unwrap();
        assert_eq!(task.state, TaskState::Done);
        assert!(task.claimed_by.is_none());
    }

    #[test]
    fn expired_lease_is_reclaimed_by_another_worker() {
        let board = setup_board();
        let task = board.create(NewTask::new("Long job")).unwrap();

        board
            .claim(&task.id, "worker-1", Some(Duration::from_secs(1)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        board
            .claim(&task.id, "worker-2", Some(Duration::from_secs(300)))
            .unwrap();

        let task = board.get(&task.id).unwrap();
        assert_eq!(task.claimed_by.as_deref(), Some("worker-2"));
        assert_eq!(task.attempts, 2);
    }

    #[test]
    fn done_task_cannot_be_replanned() {
        let board = setup_board();
        let task = board.create(NewTask::new("Shipped")).unwrap();
        board.transition(&task.id, TaskState::Done, "released", "ops").unwrap();

        let err = board
            .transition(&task.id, TaskState::Planned, "reopen", "ops")
            .unwrap_err();
        assert!(matches!(err, BoardError::InvalidTransition { .. }));
        assert_eq!(board.get(&task.id).unwrap().state, TaskState::Done);
    }
}

mod routing {
    use super::*;

    #[test]
    fn full_worker_is_skipped_in_favour_of_spare_capacity() {
        let board = setup_board();
        board.register_agent(
            AgentCapability::new("primary", &["bug"])
                .with_max_concurrent(2)
                .with_priority(10),
        );
        board.register_agent(AgentCapability::new("backup", &["*"]).with_priority(1));

        for i in 0..2 {
            let task = board.create(NewTask::new(format!("bug {}", i)).with_category("bug")).unwrap();
            board.claim(&task.id, "primary", None).unwrap();
        }

        assert_eq!(board.route("bug").unwrap(), "backup");
    }

    #[test]
    fn sole_worker_at_limit_means_no_agent_available() {
        let board = setup_board();
        board.register_agent(AgentCapability::new("solo", &["bug"]).with_max_concurrent(1));

        let first = board.create(NewTask::new("first").with_category("bug")).unwrap();
        board.claim(&first.id, "solo", None).unwrap();

        let err = board.route("bug").unwrap_err();
        assert!(matches!(err, BoardError::NoAgentAvailable { ref category } if category == "bug"));

        board.complete(&first.id, "solo").unwrap();
        assert_eq!(board.route("bug").unwrap(), "solo");
    }

    #[test]
    fn manual_finish_returns_worker_capacity() {
        let board = setup_board();
        board.register_agent(AgentCapability::new("solo", &["bug"]).with_max_concurrent(1));

        let task = board.create(NewTask::new("hand-closed").with_category("bug")).unwrap();
        board.claim(&task.id, "solo", None).unwrap();
        board.transition(&task.id, TaskState::Done, "closed by operator", "operator").unwrap();

        assert_eq!(board.route("bug").unwrap(), "solo");
    }

    #[test]
    fn dispatch_routes_by_task_category() {
        let board = setup_board();
        board.register_agent(AgentCapability::new("docs-bot", &["docs"]));
        board.register_agent(AgentCapability::new("bug-bot", &["bug"]));
        let task = board.create(NewTask::new("Write guide").with_category("docs")).unwrap();

        let assignment = board.dispatch(&task.id, None).unwrap();
        assert_eq!(assignment.worker_id, "docs-bot");
        assert_eq!(
            board.get(&task.id).unwrap().claimed_by.as_deref(),
            Some("docs-bot")
        );
    }

    #[test]
    fn dispatch_without_handler_leaves_task_unclaimed() {
        let board = setup_board();
        let task = board.create(NewTask::new("Orphan").with_category("legal")).unwrap();
        assert!(board.dispatch(&task.id, None).is_err());
        assert!(board.get(&task.id).unwrap().claimed_by.is_none());
    }
}

mod retries {
    use super::*;

    #[test]
    fn failures_back_off_then_escalate() {
        let board = setup_board();
        let mut rx = board.events().subscribe();
        let task = board.create(NewTask::new("Flaky deploy")).unwrap();

        board.claim(&task.id, "bot", None).unwrap();
        assert_eq!(
            board.fail(&task.id, "bot", "timeout").unwrap(),
            FailureOutcome::Retry {
                attempt: 1,
                backoff: Duration::from_secs(5)
            }
        );
        assert_eq!(board.get(&task.id).unwrap().state, TaskState::Blocked);

        board.claim(&task.id, "bot", None).unwrap();
        assert_eq!(
            board.fail(&task.id, "bot", "timeout").unwrap(),
            FailureOutcome::Retry {
                attempt: 2,
                backoff: Duration::from_secs(10)
            }
        );

        board.claim(&task.id, "bot", None).unwrap();
        assert_eq!(
            board.fail(&task.id, "bot", "timeout").unwrap(),
            FailureOutcome::Escalated { attempt: 3 }
        );

        let events = drain(&mut rx);
        assert!(
            events
                .iter()
                .any(|e| matches!(e, TaskEvent::Escalated { attempt: 3, .. }))
        );
        let task = board.get(&task.id).unwrap();
        assert_eq!(task.last_failure_reason, "timeout");
        assert_eq!(task.attempts, 3);
    }

    #[test]
    fn non_escalating_policy_reports_exhaustion() {
        let policies = RetryPolicies::new(RetryPolicy {
            max_attempts: 1,
            escalate: false,
            ..Default::default()
        });
        let board = setup_board().with_retry_policies(policies);
        let task = board.create(NewTask::new("One shot")).unwrap();
        board.claim(&task.id, "bot", None).unwrap();

        assert_eq!(
            board.fail(&task.id, "bot", "nope").unwrap(),
            FailureOutcome::Exhausted { attempt: 1 }
        );
    }

    #[test]
    fn fail_requires_holder_and_reason() {
        let board = setup_board();
        let task = board.create(NewTask::new("Guarded")).unwrap();
        board.claim(&task.id, "bot", None).unwrap();

        assert!(matches!(
            board.fail(&task.id, "intruder", "boom"),
            Err(BoardError::NotOwner { .. })
        ));
        assert!(matches!(
            board.fail(&task.id, "bot", ""),
            Err(BoardError::Validation { .. })
        ));
        assert_eq!(board.get(&task.id).unwrap().state, TaskState::Running);
    }
}

mod events {
    use super::*;

    #[test]
    fn lifecycle_emits_expected_event_types() {
        let board = setup_board();
        let mut rx = board.events().subscribe();

        let task = board.create(NewTask::new("Observed")).unwrap();
        board.transition(&task.id, TaskState::Planned, "triaged", "pm").unwrap();
        board.claim(&task.id, "bot", None).unwrap();
        board.release(&task.id, "bot", "").unwrap();
        board.claim(&task.id, "bot", None).unwrap();
        board.release(&task.id, "bot", "stuck").unwrap();
        board.transition(&task.id, TaskState::Running, "retry", "pm").unwrap();
        board.transition(&task.id, TaskState::Done, "", "pm").unwrap();
        board.delete(&task.id).unwrap();

        let types: Vec<_> = drain(&mut rx).iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                "task.created",
                "task.updated",
                "task.claimed",
                "task.released",
                "task.claimed",
                "task.failed",
                "task.updated",
                "task.completed",
                "task.deleted",
            ]
        );
    }

    #[test]
    fn rejected_operations_publish_nothing() {
        let board = setup_board();
        let task = board.create(NewTask::new("Quiet")).unwrap();
        let mut rx = board.events().subscribe();

        assert!(board.transition(&task.id, TaskState::Review, "", "x").is_err());
        assert_eq!(board.release(&task.id, "bot", "").unwrap(), None);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn sweep_publishes_count_of_released_leases() {
        let board = setup_board();
        let a = board.create(NewTask::new("a")).unwrap();
        let b = board.create(NewTask::new("b")).unwrap();
        board.claim(&a.id, "bot", Some(Duration::from_millis(10))).unwrap();
        board.claim(&b.id, "bot", Some(Duration::from_millis(10))).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let mut rx = board.events().subscribe();
        assert_eq!(board.cleanup_expired().unwrap().len(), 2);

        match drain(&mut rx).as_slice() {
            [TaskEvent::LeaseExpired { count, task_ids }] => {
                assert_eq!(*count, 2);
                assert_eq!(task_ids, &vec![a.id.clone(), b.id.clone()]);
            }
            other => panic!("unexpected events: {:?}", other),
        }

        let log = board.events_for(None, 10).unwrap();
        assert_eq!(log[0].event_type, "lease_expired");
    }
}

mod sweeper {
    use super::*;

    #[tokio::test]
    async fn background_sweeper_reclaims_abandoned_work() {
        let board = Arc::new(setup_board());
        let task = board.create(NewTask::new("Abandoned")).unwrap();
        board
            .claim(&task.id, "crashed-bot", Some(Duration::from_millis(20)))
            .unwrap();

        let sweeper = Arc::new(LeaseSweeper::new(Arc::clone(&board), Duration::from_millis(25)));
        let token = sweeper.shutdown_token();
        let handle = sweeper.start();

        let mut released = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            if board.get(&task.id).unwrap().claimed_by.is_none() {
                released = true;
                break;
            }
        }
        token.cancel();
        handle.await.unwrap();

        assert!(released, "sweeper never released the expired lease");
        let task = board.get(&task.id).unwrap();
        assert_eq!(task.state, TaskState::Planned);
        assert_eq!(task.last_error, "lease expired");
    }
}

mod configuration {
    use super::*;

    #[test]
    fn board_from_config_registers_agents_and_policies() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_yaml(
            r#"
leases:
  default_lease_seconds: 120
retry:
  categories:
    deploy:
      max_attempts: 5
agents:
  - worker_id: deployer
    categories: [deploy]
"#,
        )
        .unwrap();
        config.server.db_path = dir.path().join("nested").join("tasks.db");

        let board = TaskBoard::from_config(&config).unwrap();
        assert!(config.server.db_path.exists());
        assert_eq!(board.default_lease(), Duration::from_secs(120));

        let task = board.create(NewTask::new("Roll out").with_category("deploy")).unwrap();
        let assignment = board.dispatch(&task.id, None).unwrap();
        assert_eq!(assignment.worker_id, "deployer");
        assert_eq!(assignment.max_retry, 5);
        assert_eq!(
            (assignment.expires_at - assignment.claimed_at).num_seconds(),
            120
        );
    }
}
