// Copyright 2025 Machina Contributors.

//! Upgrade compatibility analysis and migration planning
//!
//! The checker classifies `(from, to)` upgrades, enumerates breaking
//! changes from both the version triples and the configuration diff, finds
//! bounded migration paths through registered rules, and plans deployment
//! strategies for mixed-version fleets.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::{MachinaError, MachinaResult};
use crate::introspection::diff;
use crate::machine::{State, Trigger};
use crate::migration::{MigrationPath, MigrationRule};
use crate::registry::MachineRegistry;
use crate::version::Version;

/// Classification of a `(from, to)` upgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CompatibilityLevel {
    /// The upgrade cannot be performed
    Incompatible,
    /// The upgrade crosses a major boundary and needs a migration
    RequiresMigration,
    /// Additive change within the same major version
    BackwardCompatible,
    /// Same major and minor version
    FullyCompatible,
}

/// Severity attached to a breaking change or deployment concern
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImpactLevel {
    /// Negligible impact
    Low,
    /// Needs review
    Medium,
    /// Likely to break consumers
    High,
    /// Certain to break consumers
    VeryHigh,
}

/// Category of a breaking change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakingChangeKind {
    /// The target's major version exceeds the source's
    MajorVersionIncrease,
    /// A state present in the source is gone in the target
    StateRemoved,
    /// A trigger permitted in the source is gone in the target
    TransitionRemoved,
    /// A fixed transition points somewhere else in the target
    TransitionRetargeted,
}

/// One identified breaking change
#[derive(Debug, Clone)]
pub struct BreakingChange {
    /// Category of the change
    pub kind: BreakingChangeKind,
    /// Human-readable description
    pub description: String,
    /// Estimated impact
    pub impact: ImpactLevel,
}

/// Outcome of a compatibility check
#[derive(Debug, Clone)]
pub struct CompatibilityResult {
    /// Entity type checked
    pub entity_type: String,
    /// Source version
    pub from: Version,
    /// Target version
    pub to: Version,
    /// Classification of the upgrade
    pub level: CompatibilityLevel,
    /// Whether the upgrade may proceed
    pub is_compatible: bool,
    /// Breaking changes identified between the versions
    pub breaking_changes: Vec<BreakingChange>,
    /// Discovered migration path, if any rules connect the versions
    pub migration_path: Option<MigrationPath>,
}

/// How strongly an upgrade is recommended
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecommendationType {
    /// Safe and beneficial; upgrade at will
    HighlyRecommended,
    /// Beneficial with modest effort
    Recommended,
    /// Needs planning before attempting
    ConsiderWithCaution,
    /// Do not upgrade along this edge
    NotRecommended,
}

/// Coarse effort estimate for an upgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EffortLevel {
    /// Minutes of work
    Low,
    /// Hours of work
    Medium,
    /// Days of work
    High,
    /// A project of its own
    VeryHigh,
}

/// One upgrade recommendation for an available target version
#[derive(Debug, Clone)]
pub struct UpgradeRecommendation {
    /// Version being upgraded from
    pub from: Version,
    /// Version being upgraded to
    pub to: Version,
    /// How strongly the upgrade is recommended
    pub recommendation: RecommendationType,
    /// Estimated effort
    pub estimated_effort: EffortLevel,
    /// Estimated risk
    pub risk_level: ImpactLevel,
    /// Feature notes the target version brings
    pub benefits: Vec<String>,
    /// What must be handled before upgrading
    pub prerequisites: Vec<String>,
}

/// Strategy selected for deploying a new version into a mixed fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStrategy {
    /// Replace instances gradually; versions interoperate
    RollingUpdate,
    /// Stand the new version up alongside and cut over
    BlueGreenDeployment,
    /// The new version cannot be deployed against the existing fleet
    CannotDeploy,
}

/// One concern raised by deployment validation
#[derive(Debug, Clone)]
pub struct DeploymentIssue {
    /// Severity of the concern
    pub severity: ImpactLevel,
    /// Description of the concern
    pub message: String,
}

/// Result of validating a new version against existing deployed versions
#[derive(Debug, Clone)]
pub struct DeploymentValidation {
    /// Whether deployment may proceed at all
    pub can_deploy: bool,
    /// Blocking issues
    pub issues: Vec<DeploymentIssue>,
    /// Non-blocking warnings
    pub warnings: Vec<String>,
    /// Selected strategy
    pub strategy: DeploymentStrategy,
}

/// Bounds for the migration-path search
#[derive(Debug, Clone, Copy)]
pub struct PathSearchConfig {
    /// Hard ceiling on path length; guards against rule cycles
    pub max_len: usize,
}

impl Default for PathSearchConfig {
    fn default() -> Self {
        Self { max_len: 10 }
    }
}

/// Compatibility checker over a registry and a set of migration rules
pub struct CompatibilityChecker {
    registry: Arc<MachineRegistry>,
    rules: RwLock<HashMap<String, Vec<MigrationRule>>>,
    search: PathSearchConfig,
}

impl CompatibilityChecker {
    /// Create a checker over `registry` with default search bounds
    pub fn new(registry: Arc<MachineRegistry>) -> Self {
        Self::with_search_config(registry, PathSearchConfig::default())
    }

    /// Create a checker with explicit search bounds
    pub fn with_search_config(registry: Arc<MachineRegistry>, search: PathSearchConfig) -> Self {
        Self {
            registry,
            rules: RwLock::new(HashMap::new()),
            search,
        }
    }

    /// The registry this checker consults
    pub fn registry(&self) -> &Arc<MachineRegistry> {
        &self.registry
    }

    /// Register a migration rule for an entity type
    pub async fn add_migration_rule(&self, entity_type: impl Into<String>, rule: MigrationRule) {
        let mut rules = self.rules.write().await;
        rules.entry(entity_type.into()).or_default().push(rule);
    }

    /// Classify the pure version relationship of an upgrade
    pub fn analyze_version_compatibility(from: &Version, to: &Version) -> CompatibilityLevel {
        if from >= to {
            return CompatibilityLevel::Incompatible;
        }
        if from.major == to.major {
            if from.minor == to.minor {
                CompatibilityLevel::FullyCompatible
            } else {
                CompatibilityLevel::BackwardCompatible
            }
        } else {
            CompatibilityLevel::RequiresMigration
        }
    }

    /// Enumerate breaking changes between two registered versions
    ///
    /// Combines the version-triple predicate with removals and retargets
    /// found by diffing the two configurations.
    pub async fn analyze_breaking_changes<S: State, T: Trigger>(
        &self,
        entity_type: &str,
        from: &Version,
        to: &Version,
    ) -> MachinaResult<Vec<BreakingChange>> {
        let mut changes = Vec::new();

        if to.is_breaking_change_from(from) {
            changes.push(BreakingChange {
                kind: BreakingChangeKind::MajorVersionIncrease,
                description: format!("major version increases from {} to {}", from.major, to.major),
                impact: ImpactLevel::High,
            });
        }

        let old = self.registry.configuration::<S, T>(entity_type, from).await?;
        let new = self.registry.configuration::<S, T>(entity_type, to).await?;
        let d = diff(&old, &new);

        for state in &d.removed_states {
            changes.push(BreakingChange {
                kind: BreakingChangeKind::StateRemoved,
                description: format!("state {} was removed", state.name()),
                impact: ImpactLevel::VeryHigh,
            });
        }
        for change in &d.removed_transitions {
            changes.push(BreakingChange {
                kind: BreakingChangeKind::TransitionRemoved,
                description: format!(
                    "trigger {} is no longer permitted in state {}",
                    change.trigger.name(),
                    change.state.name()
                ),
                impact: ImpactLevel::High,
            });
        }
        for modified in &d.modified_transitions {
            changes.push(BreakingChange {
                kind: BreakingChangeKind::TransitionRetargeted,
                description: format!(
                    "{} -{}-> now leads to {} instead of {}",
                    modified.state.name(),
                    modified.trigger.name(),
                    modified.new_destination.name(),
                    modified.old_destination.name()
                ),
                impact: ImpactLevel::High,
            });
        }

        Ok(changes)
    }

    /// Find a migration path from `from` to `to` through registered rules
    ///
    /// A direct rule wins. Otherwise a greedy walk repeatedly picks the
    /// unvisited rule whose target is numerically closest to `to`, bounded
    /// by [`PathSearchConfig::max_len`] steps.
    pub async fn migration_path(
        &self,
        entity_type: &str,
        from: &Version,
        to: &Version,
    ) -> Option<MigrationPath> {
        let rules = self.rules.read().await;
        let rules = rules.get(entity_type)?;

        if let Some(direct) = rules.iter().find(|r| &r.from == from && &r.to == to) {
            return Some(MigrationPath {
                from: from.clone(),
                to: to.clone(),
                steps: vec![direct.step.clone()],
            });
        }

        let mut steps = Vec::new();
        let mut visited = vec![from.clone()];
        let mut current = from.clone();

        for _ in 0..self.search.max_len {
            let next = rules
                .iter()
                .filter(|r| r.from == current && !visited.contains(&r.to))
                .min_by_key(|r| r.to.distance(to))?;

            steps.push(next.step.clone());
            visited.push(next.to.clone());
            current = next.to.clone();

            if &current == to {
                debug!(entity_type, from = %from, to = %to, steps = steps.len(), "migration path found");
                return Some(MigrationPath {
                    from: from.clone(),
                    to: to.clone(),
                    steps,
                });
            }
        }

        None
    }

    /// Full compatibility check for upgrading `entity_type` from `from` to `to`
    pub async fn check_compatibility<S: State, T: Trigger>(
        &self,
        entity_type: &str,
        from: &Version,
        to: &Version,
    ) -> MachinaResult<CompatibilityResult> {
        for version in [from, to] {
            if !self.registry.has_version(entity_type, version).await {
                return Err(MachinaError::VersionNotFound {
                    entity_type: entity_type.to_string(),
                    version: version.to_string(),
                });
            }
        }

        let mut level = Self::analyze_version_compatibility(from, to);
        let breaking_changes = self
            .analyze_breaking_changes::<S, T>(entity_type, from, to)
            .await?;

        // Structural breakage (removals, retargets) demotes the level
        // regardless of what the triples say
        let structural = breaking_changes
            .iter()
            .any(|c| c.kind != BreakingChangeKind::MajorVersionIncrease);
        if structural {
            level = CompatibilityLevel::Incompatible;
        }

        let migration_path = self.migration_path(entity_type, from, to).await;
        let is_compatible = level != CompatibilityLevel::Incompatible
            && (migration_path.is_some() || breaking_changes.is_empty());

        Ok(CompatibilityResult {
            entity_type: entity_type.to_string(),
            from: from.clone(),
            to: to.clone(),
            level,
            is_compatible,
            breaking_changes,
            migration_path,
        })
    }

    /// Produce sorted upgrade recommendations for every registered version
    /// newer than `current`
    pub async fn upgrade_recommendations<S: State, T: Trigger>(
        &self,
        entity_type: &str,
        current: &Version,
    ) -> MachinaResult<Vec<UpgradeRecommendation>> {
        let available = self.registry.available_versions(entity_type).await?;
        let mut recommendations = Vec::new();

        for target in available.into_iter().filter(|v| v > current) {
            let result = self
                .check_compatibility::<S, T>(entity_type, current, &target)
                .await?;
            let high_impact = result
                .breaking_changes
                .iter()
                .any(|c| c.impact >= ImpactLevel::High);

            let (recommendation, estimated_effort, risk_level) = if !result.is_compatible {
                (RecommendationType::NotRecommended, EffortLevel::VeryHigh, ImpactLevel::VeryHigh)
            } else if result.level == CompatibilityLevel::FullyCompatible {
                (RecommendationType::HighlyRecommended, EffortLevel::Low, ImpactLevel::Low)
            } else if result.breaking_changes.is_empty() {
                let risk = if high_impact { ImpactLevel::Medium } else { ImpactLevel::Low };
                (RecommendationType::Recommended, EffortLevel::Medium, risk)
            } else {
                let risk = if high_impact { ImpactLevel::High } else { ImpactLevel::Medium };
                (RecommendationType::ConsiderWithCaution, EffortLevel::High, risk)
            };

            let benefits = self
                .registry
                .metadata(entity_type, &target)
                .await
                .map(|m| m.features)
                .unwrap_or_default();
            let mut prerequisites: Vec<String> = result
                .breaking_changes
                .iter()
                .map(|c| c.description.clone())
                .collect();
            if let Some(path) = &result.migration_path {
                prerequisites.push(format!(
                    "apply {}-step migration path (~{} ms)",
                    path.len(),
                    path.estimated_duration_ms()
                ));
            }

            recommendations.push(UpgradeRecommendation {
                from: current.clone(),
                to: target,
                recommendation,
                estimated_effort,
                risk_level,
                benefits,
                prerequisites,
            });
        }

        recommendations.sort_by(|a, b| {
            a.recommendation
                .cmp(&b.recommendation)
                .then(a.risk_level.cmp(&b.risk_level))
                .then(a.to.cmp(&b.to))
        });
        Ok(recommendations)
    }

    /// Validate deploying `new_version` into a fleet running `existing`
    /// versions, checking interoperability in both directions
    pub async fn validate_deployment_compatibility(
        &self,
        entity_type: &str,
        new_version: &Version,
        existing: &[Version],
    ) -> MachinaResult<DeploymentValidation> {
        if !self.registry.has_version(entity_type, new_version).await {
            return Err(MachinaError::VersionNotFound {
                entity_type: entity_type.to_string(),
                version: new_version.to_string(),
            });
        }

        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        for deployed in existing {
            // Deploying something older than the fleet already runs is a
            // backward incompatibility and blocks the rollout
            if new_version < deployed {
                issues.push(DeploymentIssue {
                    severity: ImpactLevel::High,
                    message: format!(
                        "deployed version {deployed} is newer than candidate {new_version}"
                    ),
                });
                continue;
            }
            if new_version.is_breaking_change_from(deployed) {
                warnings.push(format!(
                    "candidate {new_version} is a breaking change from deployed {deployed}; \
                     a side-by-side rollout with per-entity migration is advised"
                ));
            }
        }

        let blocked = issues.iter().any(|i| i.severity >= ImpactLevel::High);
        let strategy = if blocked {
            DeploymentStrategy::CannotDeploy
        } else if existing
            .iter()
            .any(|deployed| new_version.is_breaking_change_from(deployed))
        {
            DeploymentStrategy::BlueGreenDeployment
        } else {
            DeploymentStrategy::RollingUpdate
        };

        Ok(DeploymentValidation {
            can_deploy: !blocked,
            issues,
            warnings,
            strategy,
        })
    }
}

impl std::fmt::Debug for CompatibilityChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompatibilityChecker")
            .field("max_path_len", &self.search.max_len)
            .finish_non_exhaustive()
    }
}
