use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    Activity, ActivityError, ActivityFilter, ActivityPage, ActivityShard, BucketMap,
    BucketRouter, EntityPagination, EntityType, OpContext, Predicate, Result, ShardPage,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardStats {
    pub index: usize,
    pub name: String,
    pub buckets: Vec<usize>,
    pub row_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopologyReport {
    pub contract_version: String,
    pub shard_count: usize,
    pub bucket_count: usize,
    pub entity_pagination: EntityPagination,
    pub total_rows: u64,
    pub shards: Vec<ShardStats>,
}

/// Routes writes by partition key and answers reads across every shard.
pub struct ShardedActivityStore {
    shards: Vec<Arc<dyn ActivityShard>>,
    router: BucketRouter,
    entity_pagination: EntityPagination,
    closed: AtomicBool,
}

impl std::fmt::Debug for ShardedActivityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedActivityStore")
            .field("shards", &self.shards.len())
            .field("router", &self.router)
            .field("entity_pagination", &self.entity_pagination)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl ShardedActivityStore {
    /// Assembles a store over an ordered shard list.
    ///
    /// # Errors
    /// Returns [`ActivityError::InvalidShardTopology`] when the shard list does
    /// not match the bucket map's shard count, or a shard reports an index that
    /// differs from its position.
    pub fn new(shards: Vec<Arc<dyn ActivityShard>>, map: BucketMap) -> Result<Self> {
        if shards.len() != map.shard_count() {
            return Err(ActivityError::InvalidShardTopology(format!(
                "bucket map addresses {} shards but {} were supplied",
                map.shard_count(),
                shards.len()
            )));
        }
        for (position, shard) in shards.iter().enumerate() {
            if shard.index() != position {
                return Err(ActivityError::InvalidShardTopology(format!(
                    "shard at position {position} reports index {}",
                    shard.index()
                )));
            }
        }

        Ok(Self {
            shards,
            router: BucketRouter::new(map),
            entity_pagination: EntityPagination::default(),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn with_entity_pagination(mut self, entity_pagination: EntityPagination) -> Self {
        self.entity_pagination = entity_pagination;
        self
    }

    #[must_use]
    pub fn router(&self) -> &BucketRouter {
        &self.router
    }

    #[must_use]
    pub fn shard_for(&self, user_id: &str) -> usize {
        self.router.shard_for(user_id)
    }

    #[must_use]
    pub fn bucket_for(&self, user_id: &str) -> usize {
        self.router.bucket_for(user_id)
    }

    #[must_use]
    pub fn shard_at(&self, index: usize) -> Option<&Arc<dyn ActivityShard>> {
        self.shards.get(index)
    }

    #[must_use]
    pub fn all_shards(&self) -> &[Arc<dyn ActivityShard>] {
        &self.shards
    }

    /// Writes one activity to the shard owning its `user_id`.
    ///
    /// # Errors
    /// Returns a validation error for malformed rows, a cancellation error, or
    /// the owning shard's insert error.
    pub fn insert(&self, ctx: &OpContext, activity: &Activity) -> Result<()> {
        activity.validate()?;
        ctx.check("insert_activity")?;
        let shard = self.route(&activity.user_id)?;
        shard.insert(ctx, activity)
    }

    /// Activities of one user, served entirely by the shard owning that user.
    ///
    /// # Errors
    /// Returns a validation, cancellation or shard query error.
    pub fn by_user(
        &self,
        ctx: &OpContext,
        user_id: &str,
        filter: &ActivityFilter,
    ) -> Result<ActivityPage> {
        if user_id.trim().is_empty() {
            return Err(ActivityError::Validation(
                "user_id MUST be provided".to_string(),
            ));
        }
        filter.validate()?;
        ctx.check("query_by_user")?;

        let shard = self.route(user_id)?;
        let page = shard.query(ctx, &Predicate::User(user_id.to_string()), filter)?;
        Ok(page.into())
    }

    /// Activities touching one entity, gathered from every shard.
    ///
    /// # Errors
    /// Fails as a whole when any shard fails.
    pub fn by_entity(
        &self,
        ctx: &OpContext,
        entity_type: EntityType,
        entity_id: &str,
        filter: &ActivityFilter,
    ) -> Result<ActivityPage> {
        if entity_id.trim().is_empty() {
            return Err(ActivityError::Validation(
                "entity_id MUST be provided".to_string(),
            ));
        }
        filter.validate()?;

        let predicate = Predicate::Entity {
            entity_type,
            entity_id: entity_id.to_string(),
        };

        match self.entity_pagination {
            EntityPagination::Global => {
                let window = filter.merge_window();
                let pages = self.fan_out(ctx, "query_by_entity", |shard, shard_ctx| {
                    shard.query(shard_ctx, &predicate, &window)
                })?;
                Ok(merge_sorted(pages, filter))
            }
            EntityPagination::PerShard => {
                let pages = self.fan_out(ctx, "query_by_entity", |shard, shard_ctx| {
                    shard.query(shard_ctx, &predicate, filter)
                })?;
                Ok(concatenate(pages))
            }
        }
    }

    /// Every activity in the time window, newest first across all shards.
    ///
    /// Cost grows with the number of matching rows on every shard when no
    /// limit is given.
    ///
    /// # Errors
    /// Fails as a whole when any shard fails.
    pub fn all(&self, ctx: &OpContext, filter: &ActivityFilter) -> Result<ActivityPage> {
        filter.validate()?;
        let window = filter.merge_window();
        let pages = self.fan_out(ctx, "query_all", |shard, shard_ctx| {
            shard.query(shard_ctx, &Predicate::All, &window)
        })?;
        Ok(merge_sorted(pages, filter))
    }

    /// Bucket ownership and row counts per shard.
    ///
    /// # Errors
    /// Fails as a whole when any shard cannot be counted.
    pub fn topology(&self, ctx: &OpContext) -> Result<TopologyReport> {
        let shards = self.shard_stats(ctx)?;
        let map = self.router.map();
        Ok(TopologyReport {
            contract_version: "shard_topology.v1".to_string(),
            shard_count: map.shard_count(),
            bucket_count: map.bucket_count(),
            entity_pagination: self.entity_pagination,
            total_rows: shards.iter().map(|item| item.row_count).sum(),
            shards,
        })
    }

    /// # Errors
    /// Fails as a whole when any shard cannot be counted.
    pub fn shard_stats(&self, ctx: &OpContext) -> Result<Vec<ShardStats>> {
        let counts = self.fan_out(ctx, "count_activities", |shard, shard_ctx| {
            shard.count_all(shard_ctx)
        })?;

        let map = self.router.map();
        Ok(self
            .shards
            .iter()
            .zip(counts)
            .map(|(shard, row_count)| ShardStats {
                index: shard.index(),
                name: shard.name(),
                buckets: map.buckets_for_shard(shard.index()),
                row_count,
            })
            .collect())
    }

    /// Closes every shard. Later calls are no-ops; the store is unusable after.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for shard in &self.shards {
            shard.close();
        }
        info!(shards = self.shards.len(), "closed sharded activity store");
    }

    fn route(&self, user_id: &str) -> Result<&Arc<dyn ActivityShard>> {
        let index = self.router.shard_for(user_id);
        self.shards.get(index).ok_or_else(|| {
            ActivityError::InvalidShardTopology(format!("bucket map routed to missing shard {index}"))
        })
    }

    /// Runs `query` once per shard on scoped threads and returns the results in
    /// shard order. The first failure cancels the remaining shards.
    fn fan_out<T, F>(&self, ctx: &OpContext, operation: &'static str, query: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&dyn ActivityShard, &OpContext) -> Result<T> + Sync,
    {
        ctx.check(operation)?;
        let fan_ctx = ctx.child();

        let results: Vec<Result<T>> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .shards
                .iter()
                .map(|shard| {
                    let fan_ctx = &fan_ctx;
                    let query = &query;
                    scope.spawn(move || {
                        let result = query(shard.as_ref(), fan_ctx);
                        if result.is_err() {
                            fan_ctx.cancel();
                        }
                        result
                    })
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(shard, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        fan_ctx.cancel();
                        Err(ActivityError::Query {
                            operation,
                            shard,
                            message: "shard worker panicked".to_string(),
                        })
                    })
                })
                .collect()
        });

        let mut values = Vec::with_capacity(results.len());
        let mut first_cancellation = None;
        let mut root_cause = None;
        for result in results {
            match result {
                Ok(value) => values.push(value),
                Err(err) if err.is_cancellation() => {
                    first_cancellation.get_or_insert(err);
                }
                Err(err) => {
                    warn!(operation, shard = err.shard(), error = %err, "shard failed during fan-out");
                    root_cause.get_or_insert(err);
                }
            }
        }

        if let Some(err) = root_cause.or(first_cancellation) {
            return Err(err);
        }

        debug!(operation, shards = values.len(), "fan-out complete");
        Ok(values)
    }
}

/// Concatenates shard pages in shard order, sorts newest first and applies the
/// caller's offset and limit once. The sort is stable, so equal timestamps
/// keep shard order and then per-shard order.
fn merge_sorted(pages: Vec<ShardPage>, filter: &ActivityFilter) -> ActivityPage {
    let mut page = concatenate(pages);
    page.activities
        .sort_by(|lhs, rhs| rhs.created_at.cmp(&lhs.created_at));

    let limit = filter.effective_limit().unwrap_or(usize::MAX);
    page.activities = page
        .activities
        .into_iter()
        .skip(filter.offset)
        .take(limit)
        .collect();
    page
}

fn concatenate(pages: Vec<ShardPage>) -> ActivityPage {
    let mut merged = ActivityPage::default();
    for page in pages {
        merged.total = merged.total.saturating_add(page.matched);
        merged.activities.extend(page.activities);
    }
    merged
}
