//! Event-sourced, versioned entity driver
//!
//! [`EventSourcedFsm`] composes the capabilities an addressable entity
//! needs: the live machine, the append-only event log, deduplication,
//! periodic snapshots, and the versioning surface (upgrade, shadow
//! evaluation). The capabilities are aggregated explicitly rather than
//! layered through inheritance; shared state flows through this one value.
//!
//! Every accepted trigger appends exactly one event with a dense sequence
//! number. Activation replays the latest snapshot plus the event tail, so
//! replaying any prefix of the stream reproduces the corresponding state.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::{MachinaError, MachinaResult};
use crate::eventlog::{
    DedupeCache, EventLog, EventRecord, NonTransitionEvent, SnapshotPolicy, StateSnapshot,
    TransitionEvent, DEFAULT_DEDUPE_CAPACITY,
};
use crate::machine::{State, StateMachine, Trigger};
use crate::migration::{MigrationController, MigrationReport, MigrationStrategy, MigrationTarget};
use crate::registry::MachineRegistry;
use crate::shadow::{ShadowComparison, ShadowEvaluator};
use crate::version::Version;

/// Per-fire options: correlation, deduplication, trigger arguments
#[derive(Debug, Clone, Default)]
pub struct FireOptions {
    /// Correlation identifier recorded on the event
    pub correlation_id: Option<String>,
    /// Deduplication token; a repeat within the window is a no-op
    pub dedupe_key: Option<String>,
    /// Argument payload visible to guards, selectors, and actions
    pub args: Option<Value>,
}

impl FireOptions {
    /// Options carrying only a dedupe key
    pub fn deduped(key: impl Into<String>) -> Self {
        Self {
            dedupe_key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Options carrying only a correlation id
    pub fn correlated(id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(id.into()),
            ..Self::default()
        }
    }
}

/// Outcome of an accepted fire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FireOutcome<S> {
    /// State before the trigger
    pub from: S,
    /// State after the trigger
    pub to: S,
    /// Whether the trigger was configured as ignored
    pub ignored: bool,
    /// Stream sequence of the appended event; unchanged for ignored
    /// triggers that are not recorded
    pub seq: u64,
    /// Whether this outcome was served from the dedupe cache
    pub deduplicated: bool,
}

/// Entity construction knobs
#[derive(Debug, Clone)]
pub struct EntityConfig {
    /// Snapshot cadence
    pub snapshot_policy: SnapshotPolicy,
    /// Dedupe cache capacity
    pub dedupe_capacity: usize,
    /// Whether ignored-trigger fires append a non-transition event
    pub record_ignored: bool,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            snapshot_policy: SnapshotPolicy::default(),
            dedupe_capacity: DEFAULT_DEDUPE_CAPACITY,
            record_ignored: false,
        }
    }
}

/// A versioned, event-sourced state machine entity
pub struct EventSourcedFsm<S: State, T: Trigger> {
    entity_id: String,
    entity_type: String,
    machine: StateMachine<S, T>,
    version: Version,
    custom_state: Value,
    registry: Arc<MachineRegistry>,
    log: Arc<dyn EventLog>,
    last_seq: u64,
    dedupe: DedupeCache<FireOutcome<S>>,
    config: EntityConfig,
    events_since_snapshot: u64,
    snapshot_retry_pending: bool,
}

impl<S: State, T: Trigger> EventSourcedFsm<S, T> {
    /// Activate an entity: load the latest snapshot, replay the tail, and
    /// bind the machine version the stream ends at
    ///
    /// A fresh entity (empty stream) starts at the registry's latest
    /// version in that machine's initial state.
    pub async fn activate(
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        registry: Arc<MachineRegistry>,
        log: Arc<dyn EventLog>,
        config: EntityConfig,
    ) -> MachinaResult<Self> {
        let entity_id = entity_id.into();
        let entity_type = entity_type.into();

        let snapshot = log
            .read_latest_snapshot(&entity_id)
            .await
            .map_err(MachinaError::from)?;

        let (mut machine, mut version, custom_state, mut last_seq) = match &snapshot {
            Some(snap) => {
                let mut machine = registry
                    .build::<S, T>(&entity_type, &snap.fsm_version)
                    .await?;
                let anchor = machine
                    .state_by_name(&snap.state)
                    .ok_or_else(|| MachinaError::UnknownState(snap.state.clone()))?;
                machine.anchor(anchor)?;
                (
                    machine,
                    snap.fsm_version.clone(),
                    snap.custom_state.clone().unwrap_or(Value::Null),
                    snap.seq,
                )
            }
            None => {
                let (version, machine) = registry.latest::<S, T>(&entity_type).await?;
                (machine, version, Value::Null, 0)
            }
        };

        let mut dedupe = DedupeCache::with_capacity(config.dedupe_capacity);
        let mut events_since_snapshot = 0u64;

        // Replay the tail in order; transitions anchor, committed
        // migrations rebind the machine version
        let mut after = last_seq;
        loop {
            let batch = log
                .read(&entity_id, after, 256)
                .await
                .map_err(MachinaError::from)?;
            if batch.is_empty() {
                break;
            }
            for record in &batch {
                after = record.seq();
                last_seq = record.seq();
                events_since_snapshot += 1;
                match record {
                    EventRecord::Transition(event) => {
                        let state = machine
                            .state_by_name(&event.to_state)
                            .ok_or_else(|| MachinaError::UnknownState(event.to_state.clone()))?;
                        machine.anchor(state.clone())?;
                        if let Some(key) = &event.dedupe_key {
                            let from = machine
                                .state_by_name(&event.from_state)
                                .ok_or_else(|| {
                                    MachinaError::UnknownState(event.from_state.clone())
                                })?;
                            dedupe.insert(
                                key.clone(),
                                FireOutcome {
                                    from,
                                    to: state,
                                    ignored: false,
                                    seq: event.seq,
                                    deduplicated: false,
                                },
                            );
                        }
                    }
                    EventRecord::Migration(event)
                        if event.outcome
                            == crate::eventlog::MigrationEventOutcome::Committed =>
                    {
                        let current = machine.state().name().to_string();
                        let mut next = registry
                            .build::<S, T>(&entity_type, &event.to_version)
                            .await?;
                        let anchor = next
                            .state_by_name(&current)
                            .ok_or_else(|| MachinaError::UnknownState(current))?;
                        next.anchor(anchor)?;
                        machine = next;
                        version = event.to_version.clone();
                    }
                    _ => {}
                }
            }
        }

        info!(
            entity_id = %entity_id,
            entity_type = %entity_type,
            version = %version,
            state = machine.state().name(),
            last_seq,
            replayed = events_since_snapshot,
            snapshot = snapshot.is_some(),
            "entity activated"
        );

        Ok(Self {
            entity_id,
            entity_type,
            machine,
            version,
            custom_state,
            registry,
            log,
            last_seq,
            dedupe,
            config,
            events_since_snapshot,
            snapshot_retry_pending: false,
        })
    }

    /// Entity identifier (also the event stream id)
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Entity type name in the registry
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Current state
    pub fn state(&self) -> &S {
        self.machine.state()
    }

    /// Current machine definition version
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Custom state blob carried across migrations
    pub fn custom_state(&self) -> &Value {
        &self.custom_state
    }

    /// Replace the custom state blob
    pub fn set_custom_state(&mut self, value: Value) {
        self.custom_state = value;
    }

    /// Last appended stream sequence
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Whether `trigger` would currently be accepted
    pub fn can_fire(&self, trigger: &T) -> bool {
        self.machine.can_fire(trigger)
    }

    /// Triggers currently accepted, guards evaluated
    pub fn permitted_triggers(&self) -> Vec<T> {
        self.machine.permitted_triggers()
    }

    /// Whether the entity is in `state` or one of its substates
    pub fn in_state_or_substate(&self, state: &S) -> bool {
        self.machine.in_state_or_substate(state)
    }

    /// Borrow the live machine for introspection
    pub fn machine(&self) -> &StateMachine<S, T> {
        &self.machine
    }

    /// Fire a trigger with default options
    pub async fn fire(&mut self, trigger: T) -> MachinaResult<FireOutcome<S>> {
        self.fire_with(trigger, FireOptions::default()).await
    }

    /// Fire a trigger with correlation, dedupe, and argument options
    ///
    /// Exactly one event is appended per accepted state change. A dedupe
    /// key seen before returns the cached outcome without touching the
    /// machine or the log.
    pub async fn fire_with(
        &mut self,
        trigger: T,
        opts: FireOptions,
    ) -> MachinaResult<FireOutcome<S>> {
        if let Some(key) = &opts.dedupe_key {
            if let Some(mut hit) = self.dedupe.get(key) {
                debug!(entity_id = %self.entity_id, key = %key, "fire deduplicated");
                hit.deduplicated = true;
                return Ok(hit);
            }
        }

        let fired = self.machine.fire_with(trigger, opts.args.clone())?;

        let outcome = if fired.ignored {
            let seq = if self.config.record_ignored {
                let event = EventRecord::NonTransition(NonTransitionEvent {
                    entity_id: self.entity_id.clone(),
                    seq: 0,
                    state: fired.source.name().to_string(),
                    trigger: fired.trigger.name().to_string(),
                    timestamp_utc: Utc::now(),
                    correlation_id: opts.correlation_id.clone(),
                    fsm_version: self.version.clone(),
                });
                self.append_with_retry(event).await?
            } else {
                self.last_seq
            };
            FireOutcome {
                from: fired.source,
                to: fired.destination,
                ignored: true,
                seq,
                deduplicated: false,
            }
        } else {
            let event = EventRecord::Transition(TransitionEvent {
                entity_id: self.entity_id.clone(),
                seq: 0,
                from_state: fired.source.name().to_string(),
                to_state: fired.destination.name().to_string(),
                trigger: fired.trigger.name().to_string(),
                timestamp_utc: Utc::now(),
                correlation_id: opts.correlation_id.clone(),
                dedupe_key: opts.dedupe_key.clone(),
                fsm_version: self.version.clone(),
                params: opts.args.clone(),
            });
            let appended = self.append_with_retry(event).await;
            match appended {
                Ok(seq) => FireOutcome {
                    from: fired.source,
                    to: fired.destination,
                    ignored: false,
                    seq,
                    deduplicated: false,
                },
                Err(err) => {
                    // The machine moved but the event could not be made
                    // durable; put the machine back before surfacing
                    self.machine.anchor(fired.source)?;
                    return Err(err);
                }
            }
        };

        self.maybe_snapshot().await;

        if let Some(key) = opts.dedupe_key {
            self.dedupe.insert(key, outcome.clone());
        }
        Ok(outcome)
    }

    /// Append one event, retrying a stale-sequence conflict once
    async fn append_with_retry(&mut self, event: EventRecord) -> MachinaResult<u64> {
        match self
            .log
            .append(&self.entity_id, vec![event.clone()], Some(self.last_seq))
            .await
        {
            Ok(seq) => {
                self.last_seq = seq;
                self.events_since_snapshot += 1;
                Ok(seq)
            }
            Err(crate::eventlog::EventLogError::ConcurrencyConflict { .. }) => {
                let actual = self
                    .log
                    .last_seq(&self.entity_id)
                    .await
                    .map_err(MachinaError::from)?;
                warn!(
                    entity_id = %self.entity_id,
                    expected = self.last_seq,
                    actual,
                    "append conflict; retrying once with refreshed sequence"
                );
                let seq = self
                    .log
                    .append(&self.entity_id, vec![event], Some(actual))
                    .await
                    .map_err(MachinaError::from)?;
                self.last_seq = seq;
                self.events_since_snapshot += 1;
                Ok(seq)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Write a snapshot when one is due; failures never fail the fire
    async fn maybe_snapshot(&mut self) {
        let due = self.snapshot_retry_pending
            || self.config.snapshot_policy.is_due(self.events_since_snapshot);
        if !due {
            return;
        }

        let snapshot = StateSnapshot {
            state: self.machine.state().name().to_string(),
            seq: self.last_seq,
            fsm_version: self.version.clone(),
            custom_state: if self.custom_state.is_null() {
                None
            } else {
                Some(self.custom_state.clone())
            },
            taken_at: Utc::now(),
        };

        match self.log.write_snapshot(&self.entity_id, snapshot).await {
            Ok(()) => {
                self.events_since_snapshot = 0;
                self.snapshot_retry_pending = false;
                debug!(entity_id = %self.entity_id, seq = self.last_seq, "snapshot written");
            }
            Err(err) => {
                // Retried at the next interval boundary
                self.snapshot_retry_pending = true;
                warn!(entity_id = %self.entity_id, error = %err, "snapshot write failed");
            }
        }
    }

    /// Versions registered for this entity type, newest first
    pub async fn available_versions(&self) -> MachinaResult<Vec<Version>> {
        self.registry.available_versions(&self.entity_type).await
    }

    /// Upgrade this entity in place using `controller`
    pub async fn upgrade_to(
        &mut self,
        controller: &MigrationController,
        to: &Version,
        strategy: MigrationStrategy,
    ) -> MachinaResult<MigrationReport> {
        let report = controller
            .upgrade(
                MigrationTarget {
                    entity_id: &self.entity_id,
                    entity_type: &self.entity_type,
                    machine: &mut self.machine,
                    version: &mut self.version,
                    custom_state: &mut self.custom_state,
                },
                to,
                strategy,
            )
            .await?;
        // The controller appended migration events to this stream
        self.last_seq = self
            .log
            .last_seq(&self.entity_id)
            .await
            .map_err(MachinaError::from)?;
        // Checkpoint the new version and blob so replay does not depend on
        // re-running the migration
        if report.outcome == crate::eventlog::MigrationEventOutcome::Committed {
            self.snapshot_retry_pending = true;
            self.maybe_snapshot().await;
        }
        Ok(report)
    }

    /// Shadow-evaluate `trigger` against the given versions (all registered
    /// versions when `versions` is empty) without touching live state
    pub async fn run_shadow(
        &self,
        trigger: &T,
        versions: &[Version],
    ) -> MachinaResult<ShadowComparison<S>> {
        let versions = if versions.is_empty() {
            self.registry.available_versions(&self.entity_type).await?
        } else {
            versions.to_vec()
        };
        ShadowEvaluator::new()
            .evaluate_registered(
                &self.registry,
                &self.entity_type,
                self.machine.state(),
                trigger,
                &versions,
                &self.version,
            )
            .await
    }
}

impl<S: State, T: Trigger> std::fmt::Debug for EventSourcedFsm<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSourcedFsm")
            .field("entity_id", &self.entity_id)
            .field("entity_type", &self.entity_type)
            .field("state", &self.machine.state().name())
            .field("version", &self.version)
            .field("last_seq", &self.last_seq)
            .finish()
    }
}
