use crate::{Activity, ActivityFilter, OpContext, Predicate, Result, ShardPage};

/// One independently addressable activity backend.
///
/// Implementations attribute their errors to [`index`](Self::index) so that a
/// failed fan-out names the shard that broke it.
pub trait ActivityShard: Send + Sync {
    fn index(&self) -> usize;

    fn name(&self) -> String {
        format!("shard-{}", self.index())
    }

    /// Stores one activity.
    ///
    /// # Errors
    /// Fails with [`ActivityError::Query`](crate::ActivityError::Query) when the
    /// row cannot be written (including a duplicate id), with
    /// [`ActivityError::ShardClosed`](crate::ActivityError::ShardClosed) after
    /// [`close`](Self::close), or with the context's cancellation error.
    fn insert(&self, ctx: &OpContext, activity: &Activity) -> Result<()>;

    /// Rows matching `predicate` and the filter's time bounds, newest first,
    /// paginated by the filter; `matched` ignores pagination.
    ///
    /// # Errors
    /// Same failure modes as [`insert`](Self::insert) for a read.
    fn query(
        &self,
        ctx: &OpContext,
        predicate: &Predicate,
        filter: &ActivityFilter,
    ) -> Result<ShardPage>;

    /// Every row on the shard, ignoring any filter.
    ///
    /// # Errors
    /// Same failure modes as [`query`](Self::query).
    fn count_all(&self, ctx: &OpContext) -> Result<u64>;

    fn close(&self);
}
