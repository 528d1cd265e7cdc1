// Copyright 2025 Machina Contributors.

//! Shadow evaluation of triggers across machine versions
//!
//! Shadow evaluation answers "what would version X do with this trigger
//! from my current state" without mutating any live machine. Each candidate
//! version is rebuilt from its configuration, anchored at the current
//! state, and predicted against.
//!
//! Guards are not evaluated in shadow machines. When a prediction is
//! guard-dependent, the first possible destination is taken as the nominal
//! prediction and the result is flagged, which is a documented imprecision
//! of shadow evaluation.

use std::time::{Duration, Instant};
use tracing::debug;

use crate::errors::MachinaResult;
use crate::introspection::{clone_from_configuration, extract, predict};
use crate::machine::{State, StateMachine, Trigger};
use crate::registry::MachineRegistry;
use crate::version::Version;

/// Predicted outcome of one version for the evaluated trigger
#[derive(Debug, Clone)]
pub struct ShadowEvaluationResult<S> {
    /// Version the prediction was made against
    pub version: Version,
    /// Whether the trigger would be accepted
    pub would_succeed: bool,
    /// Nominal predicted state (first possible destination when guarded)
    pub predicted_state: Option<S>,
    /// Whether the prediction depends on an unevaluated guard
    pub is_guard_dependent: bool,
    /// Time spent evaluating this version
    pub duration: Duration,
    /// Why the evaluation could not run, when it could not
    pub error: Option<String>,
}

/// Agreement classification across the evaluated versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusType {
    /// Nothing was evaluated
    NoResults,
    /// Every version accepts and predicts the same state
    AllSuccess,
    /// Every version accepts but predictions differ
    SuccessWithDivergence,
    /// Every version rejects the trigger
    AllFailure,
    /// Some versions accept, some reject
    Mixed,
}

/// Comparison of one trigger's predicted outcome across versions
#[derive(Debug, Clone)]
pub struct ShadowComparison<S> {
    /// State the evaluation started from
    pub current_state: S,
    /// Version the live entity currently runs
    pub current_version: Version,
    /// Trigger symbol name that was evaluated
    pub trigger: String,
    /// Per-version results, in the order supplied
    pub results: Vec<ShadowEvaluationResult<S>>,
    /// Mixed success/failure, or successful predictions disagree
    pub has_divergent_behavior: bool,
    /// Agreement classification
    pub consensus: ConsensusType,
    /// The agreed prediction, only for [`ConsensusType::AllSuccess`]
    pub consensus_prediction: Option<S>,
}

/// Evaluator producing [`ShadowComparison`]s
#[derive(Debug, Default)]
pub struct ShadowEvaluator;

impl ShadowEvaluator {
    /// Create an evaluator
    pub fn new() -> Self {
        Self
    }

    /// Evaluate `trigger` from `current_state` against each supplied
    /// versioned machine
    pub fn evaluate_across_versions<S: State, T: Trigger>(
        &self,
        current_state: &S,
        trigger: &T,
        machines: &[(Version, &StateMachine<S, T>)],
        current_version: &Version,
    ) -> ShadowComparison<S> {
        let mut results = Vec::with_capacity(machines.len());

        for (version, machine) in machines {
            let started = Instant::now();
            let cfg = extract(machine);

            // Anchor a shadow clone at the current state; a version that
            // does not know the state cannot evaluate at all
            if let Err(err) = clone_from_configuration(&cfg, Some(current_state.clone())) {
                results.push(ShadowEvaluationResult {
                    version: version.clone(),
                    would_succeed: false,
                    predicted_state: None,
                    is_guard_dependent: false,
                    duration: started.elapsed(),
                    error: Some(err.to_string()),
                });
                continue;
            }

            let prediction = predict(&cfg, current_state, trigger);
            let nominal = prediction
                .predicted_state
                .clone()
                .or_else(|| prediction.possible_destinations.first().cloned());
            results.push(ShadowEvaluationResult {
                version: version.clone(),
                would_succeed: prediction.can_fire,
                predicted_state: if prediction.can_fire { nominal } else { None },
                is_guard_dependent: prediction.has_guard,
                duration: started.elapsed(),
                error: if prediction.can_fire {
                    None
                } else {
                    Some(prediction.reason)
                },
            });
        }

        let comparison = Self::summarize(current_state, current_version, trigger, results);
        debug!(
            trigger = trigger.name(),
            state = current_state.name(),
            consensus = ?comparison.consensus,
            divergent = comparison.has_divergent_behavior,
            "shadow evaluation finished"
        );
        comparison
    }

    /// Evaluate against versions registered for `entity_type`
    pub async fn evaluate_registered<S: State, T: Trigger>(
        &self,
        registry: &MachineRegistry,
        entity_type: &str,
        current_state: &S,
        trigger: &T,
        versions: &[Version],
        current_version: &Version,
    ) -> MachinaResult<ShadowComparison<S>> {
        let mut machines = Vec::with_capacity(versions.len());
        for version in versions {
            machines.push((version.clone(), registry.build::<S, T>(entity_type, version).await?));
        }
        let borrowed: Vec<(Version, &StateMachine<S, T>)> = machines
            .iter()
            .map(|(v, m)| (v.clone(), m))
            .collect();
        Ok(self.evaluate_across_versions(current_state, trigger, &borrowed, current_version))
    }

    fn summarize<S: State, T: Trigger>(
        current_state: &S,
        current_version: &Version,
        trigger: &T,
        results: Vec<ShadowEvaluationResult<S>>,
    ) -> ShadowComparison<S> {
        let successes: Vec<&ShadowEvaluationResult<S>> =
            results.iter().filter(|r| r.would_succeed).collect();
        let failures = results.len() - successes.len();

        let mut distinct: Vec<Option<&S>> = Vec::new();
        for success in &successes {
            let predicted = success.predicted_state.as_ref();
            if !distinct.contains(&predicted) {
                distinct.push(predicted);
            }
        }

        let consensus = if results.is_empty() {
            ConsensusType::NoResults
        } else if failures == results.len() {
            ConsensusType::AllFailure
        } else if failures > 0 {
            ConsensusType::Mixed
        } else if distinct.len() <= 1 {
            ConsensusType::AllSuccess
        } else {
            ConsensusType::SuccessWithDivergence
        };

        let has_divergent_behavior =
            (failures > 0 && !successes.is_empty()) || distinct.len() >= 2;

        let consensus_prediction = if consensus == ConsensusType::AllSuccess {
            distinct.first().copied().flatten().cloned()
        } else {
            None
        };

        ShadowComparison {
            current_state: current_state.clone(),
            current_version: current_version.clone(),
            trigger: trigger.name().to_string(),
            results,
            has_divergent_behavior,
            consensus,
            consensus_prediction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum S {
        Pending,
        Processing,
        Shipped,
        Cancelled,
        Express,
    }

    impl State for S {
        fn name(&self) -> &'static str {
            match self {
                Self::Pending => "Pending",
                Self::Processing => "Processing",
                Self::Shipped => "Shipped",
                Self::Cancelled => "Cancelled",
                Self::Express => "Express",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum T {
        Process,
        Ship,
        Cancel,
    }

    impl Trigger for T {
        fn name(&self) -> &'static str {
            match self {
                Self::Process => "Process",
                Self::Ship => "Ship",
                Self::Cancel => "Cancel",
            }
        }
    }

    fn v1() -> StateMachine<S, T> {
        let mut m = StateMachine::new(S::Pending);
        m.configure(S::Pending).permit(T::Process, S::Processing);
        m.configure(S::Processing).permit(T::Ship, S::Shipped);
        m
    }

    fn v2() -> StateMachine<S, T> {
        let mut m = v1();
        m.configure(S::Processing).permit(T::Cancel, S::Cancelled);
        m
    }

    #[test]
    fn test_mixed_consensus_when_only_new_version_accepts() {
        let evaluator = ShadowEvaluator::new();
        let m1 = v1();
        let m2 = v2();
        let comparison = evaluator.evaluate_across_versions(
            &S::Processing,
            &T::Cancel,
            &[(Version::new(1, 0, 0), &m1), (Version::new(1, 1, 0), &m2)],
            &Version::new(1, 0, 0),
        );

        assert_eq!(comparison.consensus, ConsensusType::Mixed);
        assert!(comparison.has_divergent_behavior);
        assert!(comparison.consensus_prediction.is_none());

        let r1 = &comparison.results[0];
        assert!(!r1.would_succeed);
        assert!(r1.error.as_deref().unwrap().contains("not permitted"));

        let r2 = &comparison.results[1];
        assert!(r2.would_succeed);
        assert_eq!(r2.predicted_state, Some(S::Cancelled));
    }

    #[test]
    fn test_all_success_with_consensus_prediction() {
        let evaluator = ShadowEvaluator::new();
        let m1 = v1();
        let m2 = v2();
        let comparison = evaluator.evaluate_across_versions(
            &S::Pending,
            &T::Process,
            &[(Version::new(1, 0, 0), &m1), (Version::new(1, 1, 0), &m2)],
            &Version::new(1, 0, 0),
        );

        assert_eq!(comparison.consensus, ConsensusType::AllSuccess);
        assert!(!comparison.has_divergent_behavior);
        assert_eq!(comparison.consensus_prediction, Some(S::Processing));
    }

    #[test]
    fn test_success_with_divergence() {
        let mut retargeted = v1();
        // A version that ships straight to Express
        retargeted.configure(S::Processing).permit(T::Process, S::Express);
        let mut m1 = v1();
        m1.configure(S::Processing).permit(T::Process, S::Shipped);

        let evaluator = ShadowEvaluator::new();
        let comparison = evaluator.evaluate_across_versions(
            &S::Processing,
            &T::Process,
            &[(Version::new(1, 0, 0), &m1), (Version::new(2, 0, 0), &retargeted)],
            &Version::new(1, 0, 0),
        );

        assert_eq!(comparison.consensus, ConsensusType::SuccessWithDivergence);
        assert!(comparison.has_divergent_behavior);
        assert!(comparison.consensus_prediction.is_none());
    }

    #[test]
    fn test_all_failure() {
        let evaluator = ShadowEvaluator::new();
        let m1 = v1();
        let m2 = v2();
        let comparison = evaluator.evaluate_across_versions(
            &S::Shipped,
            &T::Process,
            &[(Version::new(1, 0, 0), &m1), (Version::new(1, 1, 0), &m2)],
            &Version::new(1, 0, 0),
        );
        assert_eq!(comparison.consensus, ConsensusType::AllFailure);
        assert!(!comparison.has_divergent_behavior);
    }

    #[test]
    fn test_no_results() {
        let evaluator = ShadowEvaluator::new();
        let comparison = evaluator.evaluate_across_versions::<S, T>(
            &S::Pending,
            &T::Process,
            &[],
            &Version::new(1, 0, 0),
        );
        assert_eq!(comparison.consensus, ConsensusType::NoResults);
    }

    #[test]
    fn test_guard_dependent_prediction_flagged() {
        let mut guarded = v1();
        guarded
            .configure(S::Processing)
            .permit_if(T::Cancel, S::Cancelled, |_| false, "refundable only");

        let evaluator = ShadowEvaluator::new();
        let comparison = evaluator.evaluate_across_versions(
            &S::Processing,
            &T::Cancel,
            &[(Version::new(1, 2, 0), &guarded)],
            &Version::new(1, 0, 0),
        );

        let result = &comparison.results[0];
        assert!(result.would_succeed);
        assert!(result.is_guard_dependent);
        // Nominal prediction is the first possible destination
        assert_eq!(result.predicted_state, Some(S::Cancelled));
    }

    #[test]
    fn test_unknown_state_records_error() {
        let mut tiny = StateMachine::new(S::Pending);
        tiny.configure(S::Pending).permit(T::Process, S::Processing);

        let evaluator = ShadowEvaluator::new();
        let comparison = evaluator.evaluate_across_versions(
            &S::Express,
            &T::Process,
            &[(Version::new(0, 1, 0), &tiny)],
            &Version::new(0, 1, 0),
        );

        let result = &comparison.results[0];
        assert!(!result.would_succeed);
        assert!(result.error.is_some());
        assert_eq!(comparison.consensus, ConsensusType::AllFailure);
    }
}
