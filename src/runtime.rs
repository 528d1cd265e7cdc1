//! Opaque host actor-runtime interface
//!
//! The core never talks to the actor runtime directly; these traits are the
//! seam a host plugs its grain addressing, timers, and durable reminders
//! into. Short waits use ephemeral timers; anything at or beyond the
//! reminder threshold should survive a deactivation and uses a durable
//! reminder instead.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::MachinaResult;

/// Durations at or above this prefer a durable reminder over a timer
pub const DURABLE_REMINDER_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Which scheduling primitive fits a duration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePreference {
    /// In-memory timer; lost on deactivation
    EphemeralTimer,
    /// Durable reminder; survives deactivation
    DurableReminder,
}

impl SchedulePreference {
    /// Pick the primitive for `duration` using the default threshold
    pub fn for_duration(duration: Duration) -> Self {
        Self::for_duration_with_threshold(duration, DURABLE_REMINDER_THRESHOLD)
    }

    /// Pick the primitive for `duration` against an explicit threshold
    pub fn for_duration_with_threshold(duration: Duration, threshold: Duration) -> Self {
        if duration >= threshold {
            Self::DurableReminder
        } else {
            Self::EphemeralTimer
        }
    }
}

/// Address of one entity in the host runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    /// Entity type name
    pub type_name: String,
    /// Entity identifier
    pub entity_id: String,
}

impl EntityRef {
    /// Address an entity by type and id
    pub fn new(type_name: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            entity_id: entity_id.into(),
        }
    }
}

/// Entity addressing and lifecycle, supplied by the host runtime
#[async_trait]
pub trait EntityRuntime: Send + Sync {
    /// Resolve an addressable reference to an entity
    async fn get_entity(&self, type_name: &str, entity_id: &str) -> MachinaResult<EntityRef>;

    /// Ensure the entity is activated and ready to receive calls
    async fn activate_entity(&self, type_name: &str, entity_id: &str) -> MachinaResult<()>;

    /// Deactivate the entity, flushing any pending state
    async fn deactivate_entity(&self, type_name: &str, entity_id: &str) -> MachinaResult<()>;
}

/// Optional fan-out of events onto a host pub/sub stream
#[async_trait]
pub trait StreamPublisher: Send + Sync {
    /// Publish one event into `(namespace, stream_id)`
    async fn publish(
        &self,
        namespace: &str,
        stream_id: &str,
        event: &crate::eventlog::EventRecord,
    ) -> MachinaResult<()>;
}

/// Timers and durable reminders, supplied by the host runtime
#[async_trait]
pub trait TimerService: Send + Sync {
    /// Schedule an ephemeral timer; returns a cancellation handle
    async fn schedule_timer(
        &self,
        entity_id: &str,
        duration: Duration,
        payload: Value,
    ) -> MachinaResult<Uuid>;

    /// Cancel a previously scheduled timer
    async fn cancel_timer(&self, handle: Uuid) -> MachinaResult<()>;

    /// Schedule a named durable reminder
    async fn schedule_reminder(
        &self,
        entity_id: &str,
        name: &str,
        duration: Duration,
    ) -> MachinaResult<()>;

    /// Cancel a named durable reminder
    async fn cancel_reminder(&self, entity_id: &str, name: &str) -> MachinaResult<()>;
}
