use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{to_unix_nanos, ActivityError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    User,
    Team,
    Task,
}

impl EntityType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Team => "team",
            Self::Task => "task",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "team" => Some(Self::Team),
            "task" => Some(Self::Task),
            _ => None,
        }
    }
}

impl Display for EntityType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Created,
    Updated,
    Deleted,
}

impl Action {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable "who did what to which entity, when" record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Activity {
    pub id: String,
    pub user_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: Action,
    pub metadata: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Activity {
    /// Validates a row before it is routed to a shard.
    ///
    /// # Errors
    /// Returns [`ActivityError::Validation`] when identifiers are blank or the
    /// timestamp cannot be stored.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("id", &self.id),
            ("user_id", &self.user_id),
            ("entity_id", &self.entity_id),
        ] {
            if value.trim().is_empty() {
                return Err(ActivityError::Validation(format!(
                    "{name} MUST be provided for every activity"
                )));
            }
        }

        to_unix_nanos(self.created_at)?;
        Ok(())
    }
}

/// Time window and pagination for a read. Bounds are inclusive.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityFilter {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub to: Option<OffsetDateTime>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl ActivityFilter {
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn between(mut self, from: Option<OffsetDateTime>, to: Option<OffsetDateTime>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    /// Positive limit, if any. `Some(0)` is treated as unlimited.
    #[must_use]
    pub fn effective_limit(&self) -> Option<usize> {
        self.limit.filter(|value| *value > 0)
    }

    /// Same time window, no pagination.
    #[must_use]
    pub fn unpaginated(&self) -> Self {
        Self {
            from: self.from,
            to: self.to,
            limit: None,
            offset: 0,
        }
    }

    /// Window a single shard must return so that a global merge can still
    /// honour this filter's offset and limit.
    #[must_use]
    pub fn merge_window(&self) -> Self {
        Self {
            from: self.from,
            to: self.to,
            limit: self
                .effective_limit()
                .map(|limit| limit.saturating_add(self.offset)),
            offset: 0,
        }
    }

    /// # Errors
    /// Returns [`ActivityError::Validation`] when `from` is after `to`.
    pub fn validate(&self) -> Result<()> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(ActivityError::Validation(
                    "from MUST NOT be after to".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Row selection applied by a single shard before time bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    User(String),
    Entity {
        entity_type: EntityType,
        entity_id: String,
    },
    All,
}

/// What one shard returns for one query: the requested page plus the number
/// of rows on that shard matching predicate and time bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardPage {
    pub activities: Vec<Activity>,
    pub matched: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityPage {
    pub activities: Vec<Activity>,
    pub total: u64,
}

impl From<ShardPage> for ActivityPage {
    fn from(page: ShardPage) -> Self {
        Self {
            activities: page.activities,
            total: page.matched,
        }
    }
}
