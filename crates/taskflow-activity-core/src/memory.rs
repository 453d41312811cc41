use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::{
    Activity, ActivityError, ActivityFilter, ActivityShard, OpContext, Predicate, Result,
    ShardPage,
};

/// Process-local shard that keeps rows in memory. Same contract as a database
/// shard, so routing and fan-out can run without any storage engine.
#[derive(Debug)]
pub struct MemoryShard {
    index: usize,
    name: Option<String>,
    rows: RwLock<Vec<Activity>>,
    closed: AtomicBool,
}

impl MemoryShard {
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            index,
            name: None,
            rows: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn named(index: usize, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(index)
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().map_or(0, |rows| rows.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ActivityError::ShardClosed { shard: self.index });
        }
        Ok(())
    }

    fn poisoned(&self, operation: &'static str) -> ActivityError {
        ActivityError::Query {
            operation,
            shard: self.index,
            message: "row lock poisoned".to_string(),
        }
    }
}

fn matches(activity: &Activity, predicate: &Predicate, filter: &ActivityFilter) -> bool {
    let selected = match predicate {
        Predicate::User(user_id) => activity.user_id == *user_id,
        Predicate::Entity {
            entity_type,
            entity_id,
        } => activity.entity_type == *entity_type && activity.entity_id == *entity_id,
        Predicate::All => true,
    };

    selected
        && !filter.from.is_some_and(|from| activity.created_at < from)
        && !filter.to.is_some_and(|to| activity.created_at > to)
}

impl ActivityShard for MemoryShard {
    fn index(&self) -> usize {
        self.index
    }

    fn name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("shard-{}", self.index))
    }

    fn insert(&self, ctx: &OpContext, activity: &Activity) -> Result<()> {
        self.ensure_open()?;
        ctx.check("insert_activity")?;

        let mut rows = self
            .rows
            .write()
            .map_err(|_| self.poisoned("insert_activity"))?;
        if rows.iter().any(|row| row.id == activity.id) {
            return Err(ActivityError::Query {
                operation: "insert_activity",
                shard: self.index,
                message: format!("activity {} already exists", activity.id),
            });
        }
        rows.push(activity.clone());
        Ok(())
    }

    fn query(
        &self,
        ctx: &OpContext,
        predicate: &Predicate,
        filter: &ActivityFilter,
    ) -> Result<ShardPage> {
        self.ensure_open()?;
        ctx.check("query_activities")?;

        let rows = self
            .rows
            .read()
            .map_err(|_| self.poisoned("query_activities"))?;
        let mut selected: Vec<&Activity> = rows
            .iter()
            .filter(|row| matches(row, predicate, filter))
            .collect();
        selected.sort_by(|lhs, rhs| {
            rhs.created_at
                .cmp(&lhs.created_at)
                .then_with(|| rhs.id.cmp(&lhs.id))
        });

        let matched = u64::try_from(selected.len()).unwrap_or(u64::MAX);
        let limit = filter.effective_limit().unwrap_or(usize::MAX);
        let activities = selected
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .cloned()
            .collect();

        Ok(ShardPage {
            activities,
            matched,
        })
    }

    fn count_all(&self, ctx: &OpContext) -> Result<u64> {
        self.ensure_open()?;
        ctx.check("count_activities")?;
        let rows = self
            .rows
            .read()
            .map_err(|_| self.poisoned("count_activities"))?;
        Ok(u64::try_from(rows.len()).unwrap_or(u64::MAX))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_rfc3339_utc, Action, EntityType};

    fn row(id: &str, user_id: &str, at: &str) -> Activity {
        Activity {
            id: id.to_string(),
            user_id: user_id.to_string(),
            entity_type: EntityType::User,
            entity_id: user_id.to_string(),
            action: Action::Created,
            metadata: "{}".to_string(),
            created_at: match parse_rfc3339_utc(at) {
                Ok(value) => value,
                Err(err) => panic!("bad fixture timestamp: {err}"),
            },
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let shard = MemoryShard::new(0);
        let ctx = OpContext::background();
        assert!(shard.insert(&ctx, &row("a", "u", "2026-01-01T00:00:00Z")).is_ok());
        assert!(matches!(
            shard.insert(&ctx, &row("a", "u", "2026-01-02T00:00:00Z")),
            Err(ActivityError::Query { shard: 0, .. })
        ));
        assert_eq!(shard.len(), 1);
    }

    #[test]
    fn time_bounds_are_inclusive() {
        let shard = MemoryShard::named(3, "local");
        let ctx = OpContext::background();
        for (id, at) in [
            ("a", "2026-01-01T00:00:00Z"),
            ("b", "2026-01-02T00:00:00Z"),
            ("c", "2026-01-03T00:00:00Z"),
        ] {
            assert!(shard.insert(&ctx, &row(id, "u", at)).is_ok());
        }

        let filter = ActivityFilter::default().between(
            parse_rfc3339_utc("2026-01-02T00:00:00Z").ok(),
            parse_rfc3339_utc("2026-01-03T00:00:00Z").ok(),
        );
        let page = match shard.query(&ctx, &Predicate::All, &filter) {
            Ok(page) => page,
            Err(err) => panic!("query failed: {err}"),
        };
        let ids: Vec<&str> = page.activities.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert_eq!(shard.name(), "local");
    }

    #[test]
    fn closed_shard_refuses_work() {
        let shard = MemoryShard::new(1);
        shard.close();
        assert_eq!(
            shard.count_all(&OpContext::background()),
            Err(ActivityError::ShardClosed { shard: 1 })
        );
    }
}
