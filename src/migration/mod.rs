// Copyright 2025 Machina Contributors.

//! In-place version migration with hooks and rollback
//!
//! The controller upgrades a live entity from its current machine version
//! to a target version. Every upgrade backs up the entity first; any
//! failure after the migration starts restores the backup and runs the
//! rollback hooks in descending priority. Stages run sequentially and a
//! cancellation request is only observed between stages.

mod hooks;
mod plan;

pub use hooks::{MigrationContext, MigrationHook, MigrationSnapshot};
pub use plan::{
    MigrationPath, MigrationRule, MigrationStep, MigrationStepKind, StateTransformFn,
};

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::compatibility::{CompatibilityChecker, CompatibilityResult};
use crate::errors::{MachinaError, MachinaResult};
use crate::eventlog::{EventLog, EventRecord, MigrationEvent, MigrationEventOutcome};
use crate::machine::{State, StateMachine, Trigger};
use crate::version::Version;

/// How an upgrade is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStrategy {
    /// Rebind the machine at the current state
    Automatic,
    /// Apply the migration path's state transformations, then rebind
    Custom,
    /// Build and verify the target machine alongside, then swap
    BlueGreen,
    /// Run validation and hooks, then restore; nothing is rebound
    DryRun,
}

impl MigrationStrategy {
    /// Stable label used in persisted events
    pub fn label(&self) -> &'static str {
        match self {
            Self::Automatic => "Automatic",
            Self::Custom => "Custom",
            Self::BlueGreen => "BlueGreen",
            Self::DryRun => "DryRun",
        }
    }
}

/// Stages an upgrade passes through, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStage {
    /// Compatibility resolution
    Validating,
    /// Backup of version, state, and custom blob
    Snapshotting,
    /// `before_migrate` hooks
    BeforeHooks,
    /// The migration proper
    Migrating,
    /// `after_migrate` hooks
    AfterHooks,
    /// Terminal: the upgrade took effect
    Committed,
    /// Terminal: the backup was restored
    RolledBack,
    /// Terminal: a hook or cancellation declined the upgrade
    Aborted,
}

impl MigrationStage {
    /// Stable label used in persisted events
    pub fn label(&self) -> &'static str {
        match self {
            Self::Validating => "Validating",
            Self::Snapshotting => "Snapshotting",
            Self::BeforeHooks => "BeforeHooks",
            Self::Migrating => "Migrating",
            Self::AfterHooks => "AfterHooks",
            Self::Committed => "Committed",
            Self::RolledBack => "RolledBack",
            Self::Aborted => "Aborted",
        }
    }
}

/// Mutable view of the entity pieces an upgrade touches
#[derive(Debug)]
pub struct MigrationTarget<'a, S: State, T: Trigger> {
    /// Entity identifier (also the event stream id)
    pub entity_id: &'a str,
    /// Entity type name in the registry
    pub entity_type: &'a str,
    /// The live machine, replaced on commit
    pub machine: &'a mut StateMachine<S, T>,
    /// The entity's current version, replaced on commit
    pub version: &'a mut Version,
    /// The entity's custom state blob
    pub custom_state: &'a mut Value,
}

/// Report returned by a finished upgrade
#[derive(Debug, Clone)]
pub struct MigrationReport {
    /// Entity that was upgraded
    pub entity_id: String,
    /// Version the upgrade started from
    pub from: Version,
    /// Version the upgrade targeted
    pub to: Version,
    /// Strategy that ran
    pub strategy: MigrationStrategy,
    /// Terminal outcome
    pub outcome: MigrationEventOutcome,
    /// Stages that ran, in order
    pub stages: Vec<MigrationStage>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Whether this was a dry run (the backup is always restored then)
    pub dry_run: bool,
}

/// Controller executing upgrades against live entities
pub struct MigrationController {
    checker: Arc<CompatibilityChecker>,
    log: Arc<dyn EventLog>,
    hooks: Vec<Arc<dyn MigrationHook>>,
}

impl MigrationController {
    /// Create a controller over a compatibility checker and an event log
    pub fn new(checker: Arc<CompatibilityChecker>, log: Arc<dyn EventLog>) -> Self {
        Self {
            checker,
            log,
            hooks: Vec::new(),
        }
    }

    /// Register a hook; hooks run ordered by ascending priority
    pub fn add_hook(&mut self, hook: Arc<dyn MigrationHook>) {
        self.hooks.push(hook);
        self.hooks.sort_by_key(|h| h.priority());
    }

    /// Upgrade `target` to `to` using `strategy`
    pub async fn upgrade<S: State, T: Trigger>(
        &self,
        target: MigrationTarget<'_, S, T>,
        to: &Version,
        strategy: MigrationStrategy,
    ) -> MachinaResult<MigrationReport> {
        self.upgrade_inner(target, to, strategy, None).await
    }

    /// Upgrade with a cancellation flag, observed only between stages
    pub async fn upgrade_with_cancellation<S: State, T: Trigger>(
        &self,
        target: MigrationTarget<'_, S, T>,
        to: &Version,
        strategy: MigrationStrategy,
        cancel: Arc<AtomicBool>,
    ) -> MachinaResult<MigrationReport> {
        self.upgrade_inner(target, to, strategy, Some(cancel)).await
    }

    async fn upgrade_inner<S: State, T: Trigger>(
        &self,
        mut target: MigrationTarget<'_, S, T>,
        to: &Version,
        strategy: MigrationStrategy,
        cancel: Option<Arc<AtomicBool>>,
    ) -> MachinaResult<MigrationReport> {
        let started = std::time::Instant::now();
        let from = target.version.clone();
        let mut stages = vec![MigrationStage::Validating];

        info!(
            entity_id = target.entity_id,
            entity_type = target.entity_type,
            from = %from,
            to = %to,
            strategy = strategy.label(),
            "upgrade requested"
        );

        // Validating
        let compatibility = self
            .checker
            .check_compatibility::<S, T>(target.entity_type, &from, to)
            .await?;
        if !compatibility.is_compatible && strategy != MigrationStrategy::Custom {
            let cause = MachinaError::VersionIncompatible {
                from: from.to_string(),
                to: to.to_string(),
                reason: format!("compatibility level {:?}", compatibility.level),
            };
            self.emit(
                target.entity_id,
                &from,
                to,
                strategy,
                MigrationStage::Validating,
                MigrationEventOutcome::RolledBack,
                Some(cause.to_string()),
            )
            .await;
            return Err(cause);
        }

        // Snapshotting
        stages.push(MigrationStage::Snapshotting);
        let snapshot = MigrationSnapshot {
            version: from.clone(),
            state: target.machine.state().name().to_string(),
            custom_state: target.custom_state.clone(),
        };
        let mut ctx = MigrationContext {
            entity_id: target.entity_id.to_string(),
            entity_type: target.entity_type.to_string(),
            from_version: from.clone(),
            to_version: to.clone(),
            strategy,
            snapshot: snapshot.clone(),
            shared: Default::default(),
        };

        if self.cancelled(&cancel) {
            return self
                .finish_aborted(&mut target, &snapshot, stages, strategy, started, "cancelled between stages")
                .await;
        }

        // BeforeHooks, ascending priority; a `false` is a planned abort
        stages.push(MigrationStage::BeforeHooks);
        for hook in &self.hooks {
            let outcome = AssertUnwindSafe(hook.before_migrate(&mut ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(MachinaError::internal(format!(
                        "hook {} panicked in before_migrate",
                        hook.name()
                    )))
                });
            match outcome {
                Ok(true) => {}
                Ok(false) => {
                    info!(hook = hook.name(), "before_migrate declined; aborting");
                    return self
                        .finish_aborted(&mut target, &snapshot, stages, strategy, started, hook.name())
                        .await;
                }
                Err(err) => {
                    return self
                        .rollback(&mut target, &mut ctx, &snapshot, stages, strategy, err)
                        .await;
                }
            }
        }

        if self.cancelled(&cancel) {
            return self
                .finish_aborted(&mut target, &snapshot, stages, strategy, started, "cancelled between stages")
                .await;
        }

        // Migrating
        stages.push(MigrationStage::Migrating);
        let dry_run = strategy == MigrationStrategy::DryRun;
        let migrated = self
            .migrate_proper(&mut target, to, strategy, &compatibility)
            .await;
        if let Err(err) = migrated {
            return self
                .rollback(&mut target, &mut ctx, &snapshot, stages, strategy, err)
                .await;
        }

        if self.cancelled(&cancel) {
            return self
                .finish_aborted(&mut target, &snapshot, stages, strategy, started, "cancelled between stages")
                .await;
        }

        // AfterHooks, ascending priority
        stages.push(MigrationStage::AfterHooks);
        for hook in &self.hooks {
            let outcome = AssertUnwindSafe(hook.after_migrate(&mut ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(MachinaError::internal(format!(
                        "hook {} panicked in after_migrate",
                        hook.name()
                    )))
                });
            if let Err(err) = outcome {
                return self
                    .rollback(&mut target, &mut ctx, &snapshot, stages, strategy, err)
                    .await;
            }
        }

        if dry_run {
            // A dry run validates everything and always restores the backup
            self.restore(&mut target, &snapshot).await?;
            stages.push(MigrationStage::RolledBack);
            self.emit(
                target.entity_id,
                &from,
                to,
                strategy,
                MigrationStage::RolledBack,
                MigrationEventOutcome::RolledBack,
                None,
            )
            .await;
            return Ok(MigrationReport {
                entity_id: target.entity_id.to_string(),
                from,
                to: to.clone(),
                strategy,
                outcome: MigrationEventOutcome::RolledBack,
                stages,
                duration_ms: started.elapsed().as_millis() as u64,
                dry_run: true,
            });
        }

        stages.push(MigrationStage::Committed);
        self.emit(
            target.entity_id,
            &from,
            to,
            strategy,
            MigrationStage::Committed,
            MigrationEventOutcome::Committed,
            None,
        )
        .await;
        info!(
            entity_id = target.entity_id,
            from = %from,
            to = %to,
            "upgrade committed"
        );

        Ok(MigrationReport {
            entity_id: target.entity_id.to_string(),
            from,
            to: to.clone(),
            strategy,
            outcome: MigrationEventOutcome::Committed,
            stages,
            duration_ms: started.elapsed().as_millis() as u64,
            dry_run: false,
        })
    }

    fn cancelled(&self, cancel: &Option<Arc<AtomicBool>>) -> bool {
        cancel
            .as_ref()
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn migrate_proper<S: State, T: Trigger>(
        &self,
        target: &mut MigrationTarget<'_, S, T>,
        to: &Version,
        strategy: MigrationStrategy,
        compatibility: &CompatibilityResult,
    ) -> MachinaResult<()> {
        let current_state = target.machine.state().name().to_string();
        match strategy {
            MigrationStrategy::Automatic | MigrationStrategy::BlueGreen => {
                // The target machine is built and anchored fully before the
                // live one is touched; the swap itself is one assignment
                let machine = self
                    .build_anchored::<S, T>(target.entity_type, to, &current_state)
                    .await?;
                *target.machine = machine;
                *target.version = to.clone();
                Ok(())
            }
            MigrationStrategy::Custom => {
                let path = compatibility.migration_path.clone().ok_or_else(|| {
                    MachinaError::MigrationFailure {
                        cause: format!(
                            "custom migration requires a path from {} to {}",
                            target.version, to
                        ),
                    }
                })?;
                let mut blob = target.custom_state.clone();
                for step in &path.steps {
                    if let Some(transform) = &step.transform {
                        blob = transform(blob).map_err(|err| MachinaError::MigrationFailure {
                            cause: format!("step {} failed: {err}", step.name),
                        })?;
                    }
                }
                let machine = self
                    .build_anchored::<S, T>(target.entity_type, to, &current_state)
                    .await?;
                *target.machine = machine;
                *target.version = to.clone();
                *target.custom_state = blob;
                Ok(())
            }
            MigrationStrategy::DryRun => {
                // Validate that the rebind would succeed, then leave the
                // live machine alone
                self.build_anchored::<S, T>(target.entity_type, to, &current_state)
                    .await
                    .map(|_| ())
            }
        }
    }

    async fn build_anchored<S: State, T: Trigger>(
        &self,
        entity_type: &str,
        version: &Version,
        state_name: &str,
    ) -> MachinaResult<StateMachine<S, T>> {
        let mut machine = self
            .checker
            .registry()
            .build::<S, T>(entity_type, version)
            .await?;
        let anchor = machine
            .state_by_name(state_name)
            .ok_or_else(|| MachinaError::MigrationFailure {
                cause: format!("state {state_name} does not exist in version {version}"),
            })?;
        machine.anchor(anchor)?;
        Ok(machine)
    }

    async fn restore<S: State, T: Trigger>(
        &self,
        target: &mut MigrationTarget<'_, S, T>,
        snapshot: &MigrationSnapshot,
    ) -> MachinaResult<()> {
        let machine = self
            .build_anchored::<S, T>(target.entity_type, &snapshot.version, &snapshot.state)
            .await?;
        *target.machine = machine;
        *target.version = snapshot.version.clone();
        *target.custom_state = snapshot.custom_state.clone();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_aborted<S: State, T: Trigger>(
        &self,
        target: &mut MigrationTarget<'_, S, T>,
        snapshot: &MigrationSnapshot,
        mut stages: Vec<MigrationStage>,
        strategy: MigrationStrategy,
        started: std::time::Instant,
        reason: &str,
    ) -> MachinaResult<MigrationReport> {
        // A planned abort restores the backup but never runs rollback
        // hooks: the migration proper never started
        self.restore(target, snapshot).await?;
        stages.push(MigrationStage::Aborted);
        let from = snapshot.version.clone();
        self.emit(
            target.entity_id,
            &from,
            &from,
            strategy,
            MigrationStage::Aborted,
            MigrationEventOutcome::Aborted,
            Some(reason.to_string()),
        )
        .await;
        Ok(MigrationReport {
            entity_id: target.entity_id.to_string(),
            from: from.clone(),
            to: from,
            strategy,
            outcome: MigrationEventOutcome::Aborted,
            stages,
            duration_ms: started.elapsed().as_millis() as u64,
            dry_run: strategy == MigrationStrategy::DryRun,
        })
    }

    async fn rollback<S: State, T: Trigger>(
        &self,
        target: &mut MigrationTarget<'_, S, T>,
        ctx: &mut MigrationContext,
        snapshot: &MigrationSnapshot,
        mut stages: Vec<MigrationStage>,
        strategy: MigrationStrategy,
        cause: MachinaError,
    ) -> MachinaResult<MigrationReport> {
        warn!(
            entity_id = target.entity_id,
            cause = %cause,
            "migration failed; rolling back"
        );

        // Rollback hooks run in descending priority
        for hook in self.hooks.iter().rev() {
            if AssertUnwindSafe(hook.on_rollback(ctx, &cause))
                .catch_unwind()
                .await
                .is_err()
            {
                warn!(hook = hook.name(), "on_rollback panicked; continuing");
            }
        }

        if let Err(err) = self.restore(target, snapshot).await {
            warn!(error = %err, "snapshot restore failed during rollback");
        }

        stages.push(MigrationStage::RolledBack);
        self.emit(
            target.entity_id,
            &snapshot.version,
            &ctx.to_version,
            strategy,
            MigrationStage::RolledBack,
            MigrationEventOutcome::RolledBack,
            Some(cause.to_string()),
        )
        .await;

        Err(MachinaError::MigrationFailure {
            cause: cause.to_string(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit(
        &self,
        entity_id: &str,
        from: &Version,
        to: &Version,
        strategy: MigrationStrategy,
        stage: MigrationStage,
        outcome: MigrationEventOutcome,
        cause: Option<String>,
    ) {
        let event = EventRecord::Migration(MigrationEvent {
            entity_id: entity_id.to_string(),
            seq: 0,
            from_version: from.clone(),
            to_version: to.clone(),
            strategy: strategy.label().to_string(),
            stage: stage.label().to_string(),
            timestamp_utc: Utc::now(),
            outcome,
            cause,
        });
        if let Err(err) = self.log.append(entity_id, vec![event], None).await {
            warn!(entity_id, error = %err, "failed to append migration event");
        }
    }
}

impl std::fmt::Debug for MigrationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationController")
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}
