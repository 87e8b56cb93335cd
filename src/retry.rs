//! Retry policy engine: decides whether a failed attempt is retried,
//! how long to back off, and when to escalate.

use crate::types::TaskAssignment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// How failures in one task category are handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Base delay before the first retry.
    #[serde(rename = "backoff_seconds", with = "duration_secs")]
    pub backoff: Duration,
    #[serde(rename = "max_backoff_seconds", with = "duration_secs")]
    pub max_backoff: Duration,
    /// Surface the final failure for human attention.
    pub escalate: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            escalate: true,
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before retrying after `attempt` (1-indexed):
    /// `backoff * 2^(attempt - 1)`, capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.backoff.saturating_mul(1u32 << exponent);
        delay.min(self.max_backoff)
    }
}

/// Outcome of evaluating a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetryDecision {
    /// Budget remains; the task may be claimed again after `backoff`.
    Retry {
        attempt: u32,
        #[serde(with = "duration_secs")]
        backoff: Duration,
    },
    /// Budget exhausted and the policy asks for escalation.
    Escalate { attempt: u32 },
    /// Budget exhausted, no escalation requested.
    GiveUp { attempt: u32 },
}

/// Registry of per-category policies over a process-wide default.
///
/// Categories resolve only to policies registered for them explicitly;
/// anything else gets the default.
#[derive(Debug, Default)]
pub struct RetryPolicies {
    default: RetryPolicy,
    by_category: RwLock<HashMap<String, RetryPolicy>>,
}

impl RetryPolicies {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            by_category: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_categories(
        default: RetryPolicy,
        categories: impl IntoIterator<Item = (String, RetryPolicy)>,
    ) -> Self {
        Self {
            default,
            by_category: RwLock::new(categories.into_iter().collect()),
        }
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default
    }

    /// Register (or replace) the policy for a category.
    pub fn set_policy(&self, category: impl Into<String>, policy: RetryPolicy) {
        let mut map = self.by_category.write().unwrap_or_else(|e| e.into_inner());
        map.insert(category.into(), policy);
    }

    pub fn get_policy(&self, category: &str) -> RetryPolicy {
        let map = self.by_category.read().unwrap_or_else(|e| e.into_inner());
        map.get(category).cloned().unwrap_or_else(|| self.default.clone())
    }

    /// True while the assignment's attempt is below its resolved budget.
    pub fn should_retry(&self, assignment: &TaskAssignment) -> bool {
        assignment.attempt < assignment.max_retry
    }

    /// Decide what happens after `assignment` failed.
    pub fn evaluate(&self, category: &str, assignment: &TaskAssignment) -> RetryDecision {
        let policy = self.get_policy(category);
        let attempt = assignment.attempt;
        if self.should_retry(assignment) {
            RetryDecision::Retry {
                attempt,
                backoff: policy.backoff_for(attempt),
            }
        } else if policy.escalate {
            RetryDecision::Escalate { attempt }
        } else {
            RetryDecision::GiveUp { attempt }
        }
    }
}

/// Serialize durations as whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssignmentStatus;
    use chrono::Utc;

    fn assignment(attempt: u32, max_retry: u32) -> TaskAssignment {
        let now = Utc::now();
        TaskAssignment {
            task_id: "TASK-001".into(),
            worker_id: "bot-a".into(),
            claimed_at: now,
            expires_at: now,
            attempt,
            max_retry,
            status: AssignmentStatus::Failed,
        }
    }

    #[test]
    fn default_policy_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff, Duration::from_secs(5));
        assert_eq!(policy.max_backoff, Duration::from_secs(60));
        assert!(policy.escalate);
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(10));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(20));
        assert_eq!(policy.backoff_for(5), Duration::from_secs(60));
        assert_eq!(policy.backoff_for(100), Duration::from_secs(60));
    }

    #[test]
    fn unregistered_category_falls_back_to_default() {
        let policies = RetryPolicies::default();
        policies.set_policy(
            "ops",
            RetryPolicy {
                max_attempts: 5,
                ..RetryPolicy::default()
            },
        );
        assert_eq!(policies.get_policy("ops").max_attempts, 5);
        assert_eq!(policies.get_policy("bug"), RetryPolicy::default());
    }

    #[test]
    fn should_retry_compares_attempt_with_budget() {
        let policies = RetryPolicies::default();
        assert!(policies.should_retry(&assignment(1, 3)));
        assert!(policies.should_retry(&assignment(2, 3)));
        assert!(!policies.should_retry(&assignment(3, 3)));
    }

    #[test]
    fn exhausted_budget_escalates_or_gives_up() {
        let policies = RetryPolicies::default();
        assert_eq!(
            policies.evaluate("bug", &assignment(3, 3)),
            RetryDecision::Escalate { attempt: 3 }
        );

        policies.set_policy(
            "chore",
            RetryPolicy {
                escalate: false,
                ..RetryPolicy::default()
            },
        );
        assert_eq!(
            policies.evaluate("chore", &assignment(3, 3)),
            RetryDecision::GiveUp { attempt: 3 }
        );
        assert_eq!(
            policies.evaluate("chore", &assignment(1, 3)),
            RetryDecision::Retry {
                attempt: 1,
                backoff: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn policy_reads_seconds_from_yaml() {
        let policy: RetryPolicy =
            serde_yaml::from_str("max_attempts: 4\nbackoff_seconds: 2\nescalate: false\n").unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.backoff, Duration::from_secs(2));
        assert_eq!(policy.max_backoff, Duration::from_secs(60));
        assert!(!policy.escalate);
    }
}
