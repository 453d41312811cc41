//! Domain model and routing layer for the sharded activity store.
//!
//! Storage backends plug in through [`ActivityShard`]; everything above a
//! single shard (bucket routing, fan-out, merge and pagination) lives here so
//! it can be exercised against in-memory shards as well as `SQLite` ones.

use time::{OffsetDateTime, UtcOffset};

mod config;
mod context;
mod memory;
mod model;
mod recorder;
mod routing;
mod shard;
mod store;

pub use config::{EntityPagination, ShardConfig, ShardingConfig};
pub use context::OpContext;
pub use memory::MemoryShard;
pub use model::{
    Action, Activity, ActivityFilter, ActivityPage, EntityType, Predicate, ShardPage,
};
pub use recorder::{
    ActivityQuery, ActivityQueryService, DomainEvent, Recorder, TaskCreatedEvent,
    TaskUpdatedEvent, UserCreatedEvent, UserUpdatedEvent,
};
pub use routing::{fnv1a_32, BucketMap, BucketRouter};
pub use shard::ActivityShard;
pub use store::{ShardStats, ShardedActivityStore, TopologyReport};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ActivityError {
    #[error("invalid shard topology: {0}")]
    InvalidShardTopology(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("failed to connect to shard {shard}: {message}")]
    Connection { shard: usize, message: String },
    #[error("failed to initialize schema on shard {shard}: {message}")]
    Schema { shard: usize, message: String },
    #[error("{operation} failed on shard {shard}: {message}")]
    Query {
        operation: &'static str,
        shard: usize,
        message: String,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },
    #[error("{operation} exceeded its deadline")]
    DeadlineExceeded { operation: &'static str },
    #[error("shard {shard} is closed")]
    ShardClosed { shard: usize },
}

impl ActivityError {
    /// Shard index the error is attributed to, when there is one.
    #[must_use]
    pub fn shard(&self) -> Option<usize> {
        match self {
            Self::Connection { shard, .. }
            | Self::Schema { shard, .. }
            | Self::Query { shard, .. }
            | Self::ShardClosed { shard } => Some(*shard),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::DeadlineExceeded { .. })
    }
}

pub type Result<T, E = ActivityError> = std::result::Result<T, E>;

/// Parses an RFC3339 timestamp and normalizes it to UTC.
///
/// # Errors
/// Returns [`ActivityError::Validation`] when parsing fails.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ActivityError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    Ok(parsed.to_offset(UtcOffset::UTC))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ActivityError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ActivityError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Encodes a timestamp as the signed nanosecond count stored by shards.
///
/// # Errors
/// Returns [`ActivityError::Validation`] when the instant does not fit in an `i64`.
pub fn to_unix_nanos(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos()).map_err(|_| {
        ActivityError::Validation(format!("timestamp out of storable range: {value}"))
    })
}

/// Nanosecond count for a query bound, saturating at the `i64` range so an
/// instant no row can hold still compares correctly against stored values.
#[must_use]
pub fn saturating_unix_nanos(value: OffsetDateTime) -> i64 {
    let nanos = value.unix_timestamp_nanos();
    i64::try_from(nanos).unwrap_or(if nanos < 0 { i64::MIN } else { i64::MAX })
}

/// Decodes a stored nanosecond count back into a UTC timestamp.
///
/// # Errors
/// Returns [`ActivityError::Validation`] when the value is outside the supported range.
pub fn from_unix_nanos(value: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value))
        .map_err(|err| ActivityError::Validation(format!("invalid stored timestamp {value}: {err}")))
}
