// Copyright 2025 Machina Contributors.

//! Persisted event layouts
//!
//! Every field here round-trips through serde; triggers and states are
//! persisted as their stable symbol names, never as erased objects.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::version::Version;

/// A state change caused by a fired trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TransitionEvent {
    /// Entity the transition belongs to
    pub entity_id: String,
    /// Dense per-entity sequence number, assigned on append
    pub seq: u64,
    /// State name before the trigger
    pub from_state: String,
    /// State name after the trigger
    pub to_state: String,
    /// Trigger symbol name
    pub trigger: String,
    /// When the transition happened
    pub timestamp_utc: DateTime<Utc>,
    /// Correlation identifier threaded from the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Deduplication token supplied with the fire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    /// Machine definition version the entity ran at append time
    pub fsm_version: Version,
    /// Trigger argument payload, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A fire that was accepted but ignored (no state change)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NonTransitionEvent {
    /// Entity the fire was addressed to
    pub entity_id: String,
    /// Dense per-entity sequence number, assigned on append
    pub seq: u64,
    /// State the entity stayed in
    pub state: String,
    /// Trigger symbol name
    pub trigger: String,
    /// When the fire happened
    pub timestamp_utc: DateTime<Utc>,
    /// Correlation identifier threaded from the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Machine definition version the entity ran at append time
    pub fsm_version: Version,
}

/// Kind of saga event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum SagaEventKind {
    /// A step began executing
    StepStart,
    /// A step finished, successfully or not
    StepEnd,
    /// A compensation attempt began
    CompStart,
    /// A compensation attempt finished
    CompEnd,
    /// The saga's status machine transitioned
    StatusChange,
}

/// One event in a saga's own stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SagaEventRecord {
    /// Saga the event belongs to
    pub saga_id: Uuid,
    /// Dense per-saga sequence number, assigned on append
    pub seq: u64,
    /// What happened
    pub kind: SagaEventKind,
    /// Step name for step/compensation events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    /// 1-based attempt number for step events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Outcome label for end/status events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// When the event happened
    pub timestamp_utc: DateTime<Utc>,
    /// Correlation identifier the saga runs under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Business transaction identifier assigned at saga start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_tx_id: Option<String>,
}

/// Terminal outcome of a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum MigrationEventOutcome {
    /// The upgrade took effect
    Committed,
    /// The snapshot was restored after a failure
    RolledBack,
    /// A hook declined the upgrade before it started
    Aborted,
}

/// Record of one migration attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MigrationEvent {
    /// Entity that was migrated
    pub entity_id: String,
    /// Dense per-entity sequence number, assigned on append
    pub seq: u64,
    /// Version before the migration
    pub from_version: Version,
    /// Version the migration targeted
    pub to_version: Version,
    /// Strategy label
    pub strategy: String,
    /// Stage the migration ended in
    pub stage: String,
    /// When the migration finished
    pub timestamp_utc: DateTime<Utc>,
    /// Terminal outcome
    pub outcome: MigrationEventOutcome,
    /// Failure cause, when not committed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Any record the event log can hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "record_type")]
pub enum EventRecord {
    /// State-changing transition
    Transition(TransitionEvent),
    /// Accepted but ignored trigger
    NonTransition(NonTransitionEvent),
    /// Saga step/compensation/status event
    Saga(SagaEventRecord),
    /// Migration attempt record
    Migration(MigrationEvent),
}

impl EventRecord {
    /// The record's sequence number
    pub fn seq(&self) -> u64 {
        match self {
            EventRecord::Transition(e) => e.seq,
            EventRecord::NonTransition(e) => e.seq,
            EventRecord::Saga(e) => e.seq,
            EventRecord::Migration(e) => e.seq,
        }
    }

    pub(crate) fn set_seq(&mut self, seq: u64) {
        match self {
            EventRecord::Transition(e) => e.seq = seq,
            EventRecord::NonTransition(e) => e.seq = seq,
            EventRecord::Saga(e) => e.seq = seq,
            EventRecord::Migration(e) => e.seq = seq,
        }
    }

    /// The record's timestamp
    pub fn timestamp_utc(&self) -> DateTime<Utc> {
        match self {
            EventRecord::Transition(e) => e.timestamp_utc,
            EventRecord::NonTransition(e) => e.timestamp_utc,
            EventRecord::Saga(e) => e.timestamp_utc,
            EventRecord::Migration(e) => e.timestamp_utc,
        }
    }

    /// The transition inside, if this is a transition record
    pub fn as_transition(&self) -> Option<&TransitionEvent> {
        match self {
            EventRecord::Transition(e) => Some(e),
            _ => None,
        }
    }

    /// The saga event inside, if this is a saga record
    pub fn as_saga(&self) -> Option<&SagaEventRecord> {
        match self {
            EventRecord::Saga(e) => Some(e),
            _ => None,
        }
    }

    /// The migration event inside, if this is a migration record
    pub fn as_migration(&self) -> Option<&MigrationEvent> {
        match self {
            EventRecord::Migration(e) => Some(e),
            _ => None,
        }
    }
}

/// Periodic checkpoint of an entity's state, bounding replay cost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StateSnapshot {
    /// Name of the state the entity was in
    pub state: String,
    /// Sequence number of the last event folded into the snapshot
    pub seq: u64,
    /// Machine definition version at snapshot time
    pub fsm_version: Version,
    /// Custom state blob carried by the entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_state: Option<Value>,
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
}
