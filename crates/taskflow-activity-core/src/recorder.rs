use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

use crate::{
    now_utc, Action, Activity, ActivityError, ActivityFilter, ActivityPage, EntityType, OpContext,
    Result, ShardedActivityStore,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserCreatedEvent {
    pub user_id: String,
    pub email: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserUpdatedEvent {
    pub user_id: String,
    pub email: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskCreatedEvent {
    pub task_id: String,
    pub title: String,
    pub creator_id: String,
    #[serde(default)]
    pub assignee_id: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskUpdatedEvent {
    pub task_id: String,
    pub user_id: String,
    pub field: String,
    #[serde(default)]
    pub old_value: String,
    #[serde(default)]
    pub new_value: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Upstream event as it appears on an ingest feed, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    UserCreated(UserCreatedEvent),
    UserUpdated(UserUpdatedEvent),
    TaskCreated(TaskCreatedEvent),
    TaskUpdated(TaskUpdatedEvent),
}

/// Turns domain events into activities and writes them through the store.
#[derive(Debug, Clone, Copy)]
pub struct Recorder<'a> {
    store: &'a ShardedActivityStore,
}

impl<'a> Recorder<'a> {
    #[must_use]
    pub fn new(store: &'a ShardedActivityStore) -> Self {
        Self { store }
    }

    /// Records any supported event and returns the stored activity.
    ///
    /// # Errors
    /// Returns the store's insert error.
    pub fn record(&self, ctx: &OpContext, event: &DomainEvent) -> Result<Activity> {
        match event {
            DomainEvent::UserCreated(inner) => self.user_created(ctx, inner),
            DomainEvent::UserUpdated(inner) => self.user_updated(ctx, inner),
            DomainEvent::TaskCreated(inner) => self.task_created(ctx, inner),
            DomainEvent::TaskUpdated(inner) => self.task_updated(ctx, inner),
        }
    }

    /// # Errors
    /// Returns the store's insert error.
    pub fn user_created(&self, ctx: &OpContext, event: &UserCreatedEvent) -> Result<Activity> {
        let activity = Activity {
            id: Ulid::new().to_string(),
            user_id: event.user_id.clone(),
            entity_type: EntityType::User,
            entity_id: event.user_id.clone(),
            action: Action::Created,
            metadata: event_metadata(event)?,
            created_at: event.created_at,
        };
        self.write(ctx, activity)
    }

    /// # Errors
    /// Returns the store's insert error.
    pub fn user_updated(&self, ctx: &OpContext, event: &UserUpdatedEvent) -> Result<Activity> {
        let activity = Activity {
            id: Ulid::new().to_string(),
            user_id: event.user_id.clone(),
            entity_type: EntityType::User,
            entity_id: event.user_id.clone(),
            action: Action::Updated,
            metadata: event_metadata(event)?,
            created_at: event.updated_at,
        };
        self.write(ctx, activity)
    }

    /// Task creations are partitioned by their creator.
    ///
    /// # Errors
    /// Returns the store's insert error.
    pub fn task_created(&self, ctx: &OpContext, event: &TaskCreatedEvent) -> Result<Activity> {
        let activity = Activity {
            id: Ulid::new().to_string(),
            user_id: event.creator_id.clone(),
            entity_type: EntityType::Task,
            entity_id: event.task_id.clone(),
            action: Action::Created,
            metadata: event_metadata(event)?,
            created_at: event.created_at,
        };
        self.write(ctx, activity)
    }

    /// Task updates are partitioned by the user who made the change.
    ///
    /// # Errors
    /// Returns the store's insert error.
    pub fn task_updated(&self, ctx: &OpContext, event: &TaskUpdatedEvent) -> Result<Activity> {
        let activity = Activity {
            id: Ulid::new().to_string(),
            user_id: event.user_id.clone(),
            entity_type: EntityType::Task,
            entity_id: event.task_id.clone(),
            action: Action::Updated,
            metadata: event_metadata(event)?,
            created_at: event.updated_at,
        };
        self.write(ctx, activity)
    }

    /// Records a free-form activity stamped with the current time.
    ///
    /// # Errors
    /// Returns the store's insert error.
    pub fn record_activity(
        &self,
        ctx: &OpContext,
        user_id: &str,
        entity_type: EntityType,
        entity_id: &str,
        action: Action,
        metadata: &str,
    ) -> Result<Activity> {
        let activity = Activity {
            id: Ulid::new().to_string(),
            user_id: user_id.to_string(),
            entity_type,
            entity_id: entity_id.to_string(),
            action,
            metadata: metadata.to_string(),
            created_at: now_utc(),
        };
        self.write(ctx, activity)
    }

    fn write(&self, ctx: &OpContext, activity: Activity) -> Result<Activity> {
        self.store.insert(ctx, &activity)?;
        debug!(
            id = %activity.id,
            entity_type = %activity.entity_type,
            action = %activity.action,
            "recorded activity"
        );
        Ok(activity)
    }
}

fn event_metadata<T: Serialize>(event: &T) -> Result<String> {
    serde_json::to_string(event)
        .map_err(|err| ActivityError::Validation(format!("failed to encode event metadata: {err}")))
}

/// Read-side parameters shared by every activity listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivityQuery {
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl ActivityQuery {
    #[must_use]
    pub fn filter(&self) -> ActivityFilter {
        ActivityFilter {
            from: self.from,
            to: self.to,
            limit: self.limit,
            offset: self.offset,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ActivityQueryService<'a> {
    store: &'a ShardedActivityStore,
}

impl<'a> ActivityQueryService<'a> {
    #[must_use]
    pub fn new(store: &'a ShardedActivityStore) -> Self {
        Self { store }
    }

    /// # Errors
    /// Returns the store's read error.
    pub fn user_activities(
        &self,
        ctx: &OpContext,
        user_id: &str,
        query: &ActivityQuery,
    ) -> Result<ActivityPage> {
        self.store.by_user(ctx, user_id, &query.filter())
    }

    /// Entity listing when both type and id are given, the global listing
    /// otherwise.
    ///
    /// # Errors
    /// Returns the store's read error.
    pub fn activities(
        &self,
        ctx: &OpContext,
        entity_type: Option<EntityType>,
        entity_id: Option<&str>,
        query: &ActivityQuery,
    ) -> Result<ActivityPage> {
        let entity_id = entity_id.filter(|value| !value.is_empty());
        match (entity_type, entity_id) {
            (Some(entity_type), Some(entity_id)) => {
                self.store
                    .by_entity(ctx, entity_type, entity_id, &query.filter())
            }
            _ => self.store.all(ctx, &query.filter()),
        }
    }
}
