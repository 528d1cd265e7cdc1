// Copyright 2025 Machina Contributors.

//! Versioned machine definition registry
//!
//! The registry is the catalog of machine definitions: for every entity
//! type it maps version triples to factories that produce freshly
//! configured machines, together with registration metadata. It is an
//! explicit service handed to consumers at construction time, never a
//! process-wide singleton.
//!
//! One registry holds many entity types with different state/trigger
//! domains. The `(StateType, TriggerType)` pair is bound to the entity type
//! on first registration and checked on every access; a mismatch is a
//! structured error, not a panic.
//!
//! Reads clone an `Arc` of the per-type catalog under a briefly-held lock
//! and then work lock-free; writes copy the catalog, mutate the copy, and
//! swap it in, so the last concurrent writer of a `(type, version)` key
//! wins.

use chrono::{DateTime, Utc};
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::{MachinaError, MachinaResult};
use crate::introspection::{extract, Configuration};
use crate::machine::{State, StateMachine, Trigger};
use crate::version::Version;

/// Factory producing a freshly configured machine for one version
pub type MachineFactory<S, T> = Arc<dyn Fn() -> StateMachine<S, T> + Send + Sync>;

/// Metadata attached to a registered machine version
#[derive(Debug, Clone, Default)]
pub struct VersionMetadata {
    /// Human-readable description of the version
    pub description: Option<String>,
    /// Author of the version
    pub author: Option<String>,
    /// When the definition was created (as opposed to registered)
    pub created_at: Option<DateTime<Utc>>,
    /// Whether new entities should avoid this version
    pub is_deprecated: bool,
    /// Whether this version is no longer supported at all
    pub is_unsupported: bool,
    /// Oldest version still upgradeable to this one
    pub min_supported_version: Option<Version>,
    /// Breaking-change notes carried with the version
    pub breaking_changes: Vec<String>,
    /// Feature notes carried with the version
    pub features: Vec<String>,
}

impl VersionMetadata {
    /// Metadata with only a description set
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Self::default()
        }
    }

    /// Mark the version deprecated
    pub fn deprecated(mut self) -> Self {
        self.is_deprecated = true;
        self
    }

    /// Mark the version unsupported
    pub fn unsupported(mut self) -> Self {
        self.is_unsupported = true;
        self
    }

    /// Set the minimum supported source version
    pub fn with_min_supported(mut self, version: Version) -> Self {
        self.min_supported_version = Some(version);
        self
    }

    /// Record a breaking-change note
    pub fn with_breaking_change(mut self, note: impl Into<String>) -> Self {
        self.breaking_changes.push(note.into());
        self
    }

    /// Record a feature note
    pub fn with_feature(mut self, note: impl Into<String>) -> Self {
        self.features.push(note.into());
        self
    }
}

struct VersionRecord {
    factory: Arc<dyn Any + Send + Sync>,
    metadata: VersionMetadata,
    registered_at: DateTime<Utc>,
}

struct TypeCatalog {
    state_type: TypeId,
    trigger_type: TypeId,
    state_type_name: &'static str,
    trigger_type_name: &'static str,
    versions: BTreeMap<Version, Arc<VersionRecord>>,
}

impl TypeCatalog {
    fn check_types<S: State, T: Trigger>(&self, entity_type: &str) -> MachinaResult<()> {
        if self.state_type != TypeId::of::<S>() || self.trigger_type != TypeId::of::<T>() {
            return Err(MachinaError::TypeMismatch {
                entity_type: entity_type.to_string(),
                registered_state: self.state_type_name.to_string(),
                registered_trigger: self.trigger_type_name.to_string(),
                requested_state: std::any::type_name::<S>().to_string(),
                requested_trigger: std::any::type_name::<T>().to_string(),
            });
        }
        Ok(())
    }
}

/// Registry of versioned machine definitions, keyed by entity type
pub struct MachineRegistry {
    catalogs: RwLock<HashMap<String, Arc<TypeCatalog>>>,
}

impl Default for MachineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            catalogs: RwLock::new(HashMap::new()),
        }
    }

    /// Register a machine factory under `(entity_type, version)`
    ///
    /// The factory is invoked once immediately so that structurally invalid
    /// configurations are rejected at registration time. Re-registering an
    /// existing `(entity_type, version)` replaces the previous entry.
    pub async fn register<S: State, T: Trigger>(
        &self,
        entity_type: impl Into<String>,
        version: Version,
        factory: impl Fn() -> StateMachine<S, T> + Send + Sync + 'static,
        metadata: VersionMetadata,
    ) -> MachinaResult<()> {
        let entity_type = entity_type.into();
        let factory: MachineFactory<S, T> = Arc::new(factory);

        // Probe the factory once; a defective configuration never enters
        // the catalog
        factory().validate()?;

        let record = Arc::new(VersionRecord {
            factory: Arc::new(factory),
            metadata,
            registered_at: Utc::now(),
        });

        let mut catalogs = self.catalogs.write().await;
        let next = match catalogs.get(&entity_type) {
            Some(existing) => {
                existing.check_types::<S, T>(&entity_type)?;
                let mut versions = existing.versions.clone();
                versions.insert(version.clone(), record);
                TypeCatalog {
                    state_type: existing.state_type,
                    trigger_type: existing.trigger_type,
                    state_type_name: existing.state_type_name,
                    trigger_type_name: existing.trigger_type_name,
                    versions,
                }
            }
            None => {
                let mut versions = BTreeMap::new();
                versions.insert(version.clone(), record);
                TypeCatalog {
                    state_type: TypeId::of::<S>(),
                    trigger_type: TypeId::of::<T>(),
                    state_type_name: std::any::type_name::<S>(),
                    trigger_type_name: std::any::type_name::<T>(),
                    versions,
                }
            }
        };
        catalogs.insert(entity_type.clone(), Arc::new(next));

        info!(entity_type = %entity_type, version = %version, "machine version registered");
        Ok(())
    }

    async fn catalog(&self, entity_type: &str) -> MachinaResult<Arc<TypeCatalog>> {
        let catalogs = self.catalogs.read().await;
        catalogs
            .get(entity_type)
            .cloned()
            .ok_or_else(|| MachinaError::EntityTypeNotFound(entity_type.to_string()))
    }

    /// Build a freshly configured machine for `(entity_type, version)`
    pub async fn build<S: State, T: Trigger>(
        &self,
        entity_type: &str,
        version: &Version,
    ) -> MachinaResult<StateMachine<S, T>> {
        let catalog = self.catalog(entity_type).await?;
        catalog.check_types::<S, T>(entity_type)?;
        let record = catalog
            .versions
            .get(version)
            .ok_or_else(|| MachinaError::VersionNotFound {
                entity_type: entity_type.to_string(),
                version: version.to_string(),
            })?;
        let factory = record
            .factory
            .downcast_ref::<MachineFactory<S, T>>()
            .ok_or_else(|| MachinaError::internal("factory type lost after type check"))?;
        debug!(entity_type, version = %version, "building machine from factory");
        Ok(factory())
    }

    /// Extract the configuration of `(entity_type, version)`
    pub async fn configuration<S: State, T: Trigger>(
        &self,
        entity_type: &str,
        version: &Version,
    ) -> MachinaResult<Configuration<S, T>> {
        Ok(extract(&self.build::<S, T>(entity_type, version).await?))
    }

    /// Latest registered version and a machine built from it
    pub async fn latest<S: State, T: Trigger>(
        &self,
        entity_type: &str,
    ) -> MachinaResult<(Version, StateMachine<S, T>)> {
        let version = self
            .latest_version(entity_type)
            .await?
            .ok_or_else(|| MachinaError::EntityTypeNotFound(entity_type.to_string()))?;
        let machine = self.build(entity_type, &version).await?;
        Ok((version, machine))
    }

    /// Latest registered version for an entity type, if any
    pub async fn latest_version(&self, entity_type: &str) -> MachinaResult<Option<Version>> {
        let catalog = self.catalog(entity_type).await?;
        Ok(catalog.versions.keys().next_back().cloned())
    }

    /// All registered versions, newest first
    pub async fn available_versions(&self, entity_type: &str) -> MachinaResult<Vec<Version>> {
        let catalog = self.catalog(entity_type).await?;
        Ok(catalog.versions.keys().rev().cloned().collect())
    }

    /// Whether `(entity_type, version)` exists
    pub async fn has_version(&self, entity_type: &str, version: &Version) -> bool {
        match self.catalog(entity_type).await {
            Ok(catalog) => catalog.versions.contains_key(version),
            Err(_) => false,
        }
    }

    /// Metadata registered with `(entity_type, version)`
    pub async fn metadata(
        &self,
        entity_type: &str,
        version: &Version,
    ) -> MachinaResult<VersionMetadata> {
        let catalog = self.catalog(entity_type).await?;
        catalog
            .versions
            .get(version)
            .map(|r| r.metadata.clone())
            .ok_or_else(|| MachinaError::VersionNotFound {
                entity_type: entity_type.to_string(),
                version: version.to_string(),
            })
    }

    /// When `(entity_type, version)` was registered
    pub async fn registered_at(
        &self,
        entity_type: &str,
        version: &Version,
    ) -> MachinaResult<DateTime<Utc>> {
        let catalog = self.catalog(entity_type).await?;
        catalog
            .versions
            .get(version)
            .map(|r| r.registered_at)
            .ok_or_else(|| MachinaError::VersionNotFound {
                entity_type: entity_type.to_string(),
                version: version.to_string(),
            })
    }

    /// Whether a version is usable for new activations
    ///
    /// A version is compatible when it exists, is neither deprecated nor
    /// unsupported, and satisfies the latest entry's minimum supported
    /// version, if one is declared.
    pub async fn is_compatible(&self, entity_type: &str, version: &Version) -> bool {
        let Ok(catalog) = self.catalog(entity_type).await else {
            return false;
        };
        let Some(record) = catalog.versions.get(version) else {
            return false;
        };
        if record.metadata.is_deprecated || record.metadata.is_unsupported {
            return false;
        }
        if let Some((_, latest)) = catalog.versions.iter().next_back() {
            if let Some(min) = &latest.metadata.min_supported_version {
                return version >= min;
            }
        }
        true
    }

    /// Entity types with at least one registered version
    pub async fn entity_types(&self) -> Vec<String> {
        let catalogs = self.catalogs.read().await;
        catalogs.keys().cloned().collect()
    }
}

impl std::fmt::Debug for MachineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineRegistry").finish_non_exhaustive()
    }
}
