// Copyright (c) 2025 - Machina Contributors.

//! # Machina
//!
//! Versioned, event-sourced finite state machines for single-threaded,
//! addressable entities.
//!
//! This crate provides the building blocks for running a host actor
//! runtime's grains as versioned FSMs:
//! - **Machine**: an FSM primitive over closed state/trigger enumerations
//!   with hierarchy, opaque guards, and tracked configuration
//! - **Introspection**: immutable configuration graphs, structural diffs,
//!   side-effect-free outcome prediction, and configuration-level cloning
//! - **Registry**: versioned machine definitions per entity type, with
//!   metadata and type-identity checking
//! - **Compatibility**: upgrade classification, breaking-change analysis,
//!   bounded migration-path search, and deployment planning
//! - **Shadow evaluation**: per-version predicted outcomes with a
//!   consensus verdict, never mutating live state
//! - **Migration**: in-place upgrades with ordered hooks, snapshots, and
//!   rollback
//! - **Saga**: linear typed steps with per-step timeout and retry, and
//!   compensation in reverse order on failure
//! - **Event log**: append-only per-entity streams with dense sequence
//!   numbers, deduplication, and periodic snapshots
//!
//! ## Design principles
//!
//! 1. **Closed domains**: states and triggers are finite enumerations known
//!    at registration time
//! 2. **Append-only truth**: every state change is an event; replay
//!    reconstructs state exactly
//! 3. **Composition over inheritance**: entities aggregate capabilities
//!    (machine, log, versioning, saga) through one explicit driver
//! 4. **Explicit services**: the registry, checker, and controller are
//!    values passed at construction, never process-wide singletons
//! 5. **Contained user code**: guards, actions, hooks, and steps never
//!    panic into the core

#![warn(missing_docs)]

mod compatibility;
mod entity;
mod errors;
mod eventlog;
mod registry;
mod runtime;
mod shadow;
mod version;

pub mod introspection;
pub mod machine;
pub mod migration;
pub mod saga;

pub use compatibility::{
    BreakingChange, BreakingChangeKind, CompatibilityChecker, CompatibilityLevel,
    CompatibilityResult, DeploymentIssue, DeploymentStrategy, DeploymentValidation, EffortLevel,
    ImpactLevel, PathSearchConfig, RecommendationType, UpgradeRecommendation,
};
pub use entity::{EntityConfig, EventSourcedFsm, FireOptions, FireOutcome};
pub use errors::{MachinaError, MachinaResult};
pub use eventlog::{
    DedupeCache, EventLog, EventLogError, EventRecord, EventStream, InMemoryEventLog,
    MigrationEvent, MigrationEventOutcome, NonTransitionEvent, SagaEventKind, SagaEventRecord,
    SnapshotPolicy, StateSnapshot, TransitionEvent, DEFAULT_DEDUPE_CAPACITY,
};
pub use machine::{
    FiredTransition, MachineInfo, State, StateConfigurator, StateInfo, StateMachine, Trigger,
    TransitionContext, TransitionRecord,
};
pub use migration::{
    MigrationContext, MigrationController, MigrationHook, MigrationPath, MigrationReport,
    MigrationRule, MigrationSnapshot, MigrationStage, MigrationStep, MigrationStepKind,
    MigrationStrategy, MigrationTarget,
};
pub use registry::{MachineFactory, MachineRegistry, VersionMetadata};
pub use runtime::{
    EntityRef, EntityRuntime, SchedulePreference, StreamPublisher, TimerService,
    DURABLE_REMINDER_THRESHOLD,
};
pub use saga::{
    CompensationRecord, CompensationResult, SagaConfig, SagaOrchestrator, SagaResult, SagaSignal,
    SagaStatus, SagaStep, StepContext, StepExecution, StepOutcome, StepResult,
};
pub use shadow::{ConsensusType, ShadowComparison, ShadowEvaluationResult, ShadowEvaluator};
pub use version::Version;
