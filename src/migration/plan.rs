// Copyright 2025 Machina Contributors.

//! Migration rules, steps, and discovered paths

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::MachinaResult;
use crate::version::Version;

/// Transformation applied to an entity's custom state blob
pub type StateTransformFn = Arc<dyn Fn(Value) -> MachinaResult<Value> + Send + Sync>;

/// How a migration step does its work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStepKind {
    /// Rebind the machine; no state transformation needed
    Automatic,
    /// Caller-supplied transformation logic
    Custom,
    /// Pure transformation of the custom state blob
    StateTransformation,
    /// Rebuild state by replaying the event log
    EventReplay,
    /// Requires operator intervention; never executed automatically
    Manual,
}

/// One step of a migration between two adjacent versions
#[derive(Clone)]
pub struct MigrationStep {
    /// Step name for logs and events
    pub name: String,
    /// What the step does
    pub description: String,
    /// Execution kind
    pub kind: MigrationStepKind,
    /// Rough duration estimate in milliseconds
    pub estimated_duration_ms: u64,
    /// Optional transformation of the custom state blob
    pub transform: Option<StateTransformFn>,
    /// Free-form step parameters
    pub parameters: HashMap<String, Value>,
}

impl MigrationStep {
    /// A step that only rebinds the machine
    pub fn automatic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind: MigrationStepKind::Automatic,
            estimated_duration_ms: 0,
            transform: None,
            parameters: HashMap::new(),
        }
    }

    /// A step that transforms the custom state blob
    pub fn transforming(
        name: impl Into<String>,
        transform: impl Fn(Value) -> MachinaResult<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind: MigrationStepKind::StateTransformation,
            estimated_duration_ms: 0,
            transform: Some(Arc::new(transform)),
            parameters: HashMap::new(),
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the duration estimate
    pub fn with_estimated_duration_ms(mut self, ms: u64) -> Self {
        self.estimated_duration_ms = ms;
        self
    }

    /// Set a step parameter
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("estimated_duration_ms", &self.estimated_duration_ms)
            .field("has_transform", &self.transform.is_some())
            .finish()
    }
}

/// A registered rule: one step taking `from` to `to`
#[derive(Debug, Clone)]
pub struct MigrationRule {
    /// Source version of the rule
    pub from: Version,
    /// Target version of the rule
    pub to: Version,
    /// The step executed when the rule is applied
    pub step: MigrationStep,
}

impl MigrationRule {
    /// Create a rule from one version to another
    pub fn new(from: Version, to: Version, step: MigrationStep) -> Self {
        Self { from, to, step }
    }
}

/// An ordered sequence of steps from one version to another
#[derive(Debug, Clone)]
pub struct MigrationPath {
    /// Version the path starts at
    pub from: Version,
    /// Version the path ends at
    pub to: Version,
    /// Steps in execution order
    pub steps: Vec<MigrationStep>,
}

impl MigrationPath {
    /// Sum of the steps' duration estimates
    pub fn estimated_duration_ms(&self) -> u64 {
        self.steps.iter().map(|s| s.estimated_duration_ms).sum()
    }

    /// Number of steps in the path
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the path has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_builders() {
        let step = MigrationStep::automatic("rebind")
            .with_description("swap the machine")
            .with_estimated_duration_ms(50)
            .with_parameter("dry", Value::Bool(false));
        assert_eq!(step.kind, MigrationStepKind::Automatic);
        assert_eq!(step.estimated_duration_ms, 50);
        assert!(step.transform.is_none());
        assert_eq!(step.parameters.len(), 1);
    }

    #[test]
    fn test_transforming_step_applies() {
        let step = MigrationStep::transforming("rename-field", |mut v| {
            if let Some(obj) = v.as_object_mut() {
                if let Some(old) = obj.remove("qty") {
                    obj.insert("quantity".to_string(), old);
                }
            }
            Ok(v)
        });
        let out = (step.transform.as_ref().unwrap())(serde_json::json!({"qty": 3})).unwrap();
        assert_eq!(out, serde_json::json!({"quantity": 3}));
    }

    #[test]
    fn test_path_duration_is_sum() {
        let path = MigrationPath {
            from: Version::new(1, 0, 0),
            to: Version::new(3, 0, 0),
            steps: vec![
                MigrationStep::automatic("a").with_estimated_duration_ms(10),
                MigrationStep::automatic("b").with_estimated_duration_ms(15),
            ],
        };
        assert_eq!(path.estimated_duration_ms(), 25);
        assert_eq!(path.len(), 2);
    }
}
