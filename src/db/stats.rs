//! Aggregation queries for board statistics.

use super::Database;
use crate::error::Result;
use crate::states::TaskState;
use crate::types::BoardStats;
use std::collections::BTreeMap;

impl Database {
    /// Task counts per state. Every state appears, zero when empty.
    pub fn board_stats(&self) -> Result<BoardStats> {
        self.with_conn(|conn| {
            let mut by_state: BTreeMap<String, i64> = TaskState::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), 0))
                .collect();

            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM tasks GROUP BY state")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

            let mut total = 0;
            for row in rows {
                let (state, count) = row?;
                total += count;
                *by_state.entry(state).or_insert(0) += count;
            }

            Ok(BoardStats { total, by_state })
        })
    }

    /// Open (non-terminal) task counts per category.
    pub fn category_stats(&self) -> Result<BTreeMap<String, i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT category, COUNT(*) FROM tasks WHERE state != ?1 GROUP BY category",
            )?;
            let counts = stmt
                .query_map([TaskState::Done.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<BTreeMap<String, i64>>>()?;
            Ok(counts)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewTask;

    #[test]
    fn empty_board_reports_every_state_at_zero() {
        let db = Database::open_in_memory().unwrap();
        let stats = db.board_stats().unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.by_state.len(), TaskState::ALL.len());
        assert!(stats.by_state.values().all(|&n| n == 0));
    }

    #[test]
    fn counts_follow_states_and_categories() {
        let db = Database::open_in_memory().unwrap();
        db.create_task(NewTask::new("a").with_category("dev")).unwrap();
        db.create_task(NewTask::new("b").with_category("dev")).unwrap();
        let c = db.create_task(NewTask::new("c").with_category("ops")).unwrap();
        db.transition_task(&c.id, TaskState::Done, "shipped", "tester").unwrap();

        let stats = db.board_stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_state["inbox"], 2);
        assert_eq!(stats.by_state["done"], 1);

        let categories = db.category_stats().unwrap();
        assert_eq!(categories.get("dev"), Some(&2));
        assert_eq!(categories.get("ops"), None);
    }
}
