// Copyright 2025 Machina Contributors.

//! Migration hooks and the context they share
//!
//! Hooks run as an ordered sequence around every upgrade: `before_migrate`
//! in ascending priority, `after_migrate` in ascending priority, and
//! `on_rollback` in descending priority when a later stage fails. Hooks
//! communicate through the context's shared bag; writes are visible to
//! every subsequent hook of the same upgrade.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::errors::{MachinaError, MachinaResult};
use crate::version::Version;

use super::MigrationStrategy;

/// Pre-migration backup used for rollback
#[derive(Debug, Clone)]
pub struct MigrationSnapshot {
    /// Version the entity ran before the upgrade
    pub version: Version,
    /// Name of the state the entity was in
    pub state: String,
    /// Custom state blob at snapshot time
    pub custom_state: Value,
}

/// Context threaded through every hook of one upgrade
#[derive(Debug)]
pub struct MigrationContext {
    /// Entity being upgraded
    pub entity_id: String,
    /// Entity type being upgraded
    pub entity_type: String,
    /// Version the upgrade starts from
    pub from_version: Version,
    /// Version the upgrade targets
    pub to_version: Version,
    /// Strategy in effect
    pub strategy: MigrationStrategy,
    /// Backup taken before any hook ran
    pub snapshot: MigrationSnapshot,
    /// Bag shared across hooks of this upgrade, in execution order
    pub shared: HashMap<String, Value>,
}

/// Ordered participant in the migration lifecycle
///
/// A hook must not fire triggers on the entity being upgraded.
#[async_trait]
pub trait MigrationHook: Send + Sync {
    /// Hook name for logs and events
    fn name(&self) -> &str;

    /// Execution order; smaller runs earlier
    fn priority(&self) -> i32 {
        0
    }

    /// Runs before the migration proper; returning `false` aborts the
    /// upgrade cleanly (no rollback hooks run, the snapshot is restored)
    async fn before_migrate(&self, _ctx: &mut MigrationContext) -> MachinaResult<bool> {
        Ok(true)
    }

    /// Runs after the migration proper; an error here rolls the upgrade back
    async fn after_migrate(&self, _ctx: &mut MigrationContext) -> MachinaResult<()> {
        Ok(())
    }

    /// Runs, in descending priority, when a started migration fails
    async fn on_rollback(&self, _ctx: &mut MigrationContext, _cause: &MachinaError) {}
}
