// Copyright 2025 Machina Contributors.

//! Structural diff between two machine configurations
//!
//! Transition changes are attributed to the state that registers the
//! transition. A change to a superstate's transition is reported on the
//! superstate only, never repeated for the substates that inherit it.

use indexmap::IndexSet;

use super::configuration::{Configuration, TransitionInfo};
use crate::machine::{State, Trigger};

/// A trigger added to or removed from a state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionChange<S, T> {
    /// State the change applies to
    pub state: S,
    /// Trigger that was added or removed
    pub trigger: T,
}

/// A `(state, trigger)` pair whose fixed destination changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifiedTransition<S, T> {
    /// State the transition leaves from
    pub state: S,
    /// Trigger of the transition
    pub trigger: T,
    /// Fixed destination in the old configuration
    pub old_destination: S,
    /// Fixed destination in the new configuration
    pub new_destination: S,
}

/// A `(state, trigger)` pair whose guard count changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardChange<S, T> {
    /// State the guarded transitions leave from
    pub state: S,
    /// Trigger of the guarded transitions
    pub trigger: T,
    /// Guarded-transition count in the old configuration
    pub old_guard_count: usize,
    /// Guarded-transition count in the new configuration
    pub new_guard_count: usize,
}

/// Result of diffing two configurations
#[derive(Debug, Clone)]
pub struct ConfigurationDiff<S, T> {
    /// States present only in the new configuration
    pub added_states: Vec<S>,
    /// States present only in the old configuration
    pub removed_states: Vec<S>,
    /// Triggers newly registered directly on common states
    pub added_transitions: Vec<TransitionChange<S, T>>,
    /// Triggers no longer registered directly on common states
    pub removed_transitions: Vec<TransitionChange<S, T>>,
    /// Common `(state, trigger)` pairs whose fixed destination changed
    pub modified_transitions: Vec<ModifiedTransition<S, T>>,
    /// Common `(state, trigger)` pairs whose guard count changed
    pub guard_changes: Vec<GuardChange<S, T>>,
    /// Whether the new configuration breaks callers of the old one
    pub has_breaking_changes: bool,
    /// Similarity score in `[0, 1]`; 1.0 means structurally identical
    pub similarity: f64,
}

impl<S, T> ConfigurationDiff<S, T> {
    /// Whether the two configurations are structurally identical
    pub fn is_identical(&self) -> bool {
        self.added_states.is_empty()
            && self.removed_states.is_empty()
            && self.added_transitions.is_empty()
            && self.removed_transitions.is_empty()
            && self.modified_transitions.is_empty()
            && self.guard_changes.is_empty()
    }
}

/// Diff two configurations, old (`a`) against new (`b`)
pub fn diff<S: State, T: Trigger>(
    a: &Configuration<S, T>,
    b: &Configuration<S, T>,
) -> ConfigurationDiff<S, T> {
    let added_states: Vec<S> = b
        .states
        .keys()
        .filter(|s| !a.contains_state(s))
        .cloned()
        .collect();
    let removed_states: Vec<S> = a
        .states
        .keys()
        .filter(|s| !b.contains_state(s))
        .cloned()
        .collect();

    let mut added_transitions = Vec::new();
    let mut removed_transitions = Vec::new();
    let mut modified_transitions = Vec::new();
    let mut guard_changes = Vec::new();

    // Compare only the triggers each state registers itself. Inherited
    // triggers belong to the ancestor that owns them and would otherwise be
    // reported once per descendant.
    for (state, old_cfg) in &a.states {
        let Some(new_cfg) = b.state_config(state) else {
            continue;
        };

        let old_own: IndexSet<T> = old_cfg.transitions.iter().map(|t| t.trigger.clone()).collect();
        let new_own: IndexSet<T> = new_cfg.transitions.iter().map(|t| t.trigger.clone()).collect();

        for trigger in &new_own {
            if !old_own.contains(trigger) {
                added_transitions.push(TransitionChange {
                    state: state.clone(),
                    trigger: trigger.clone(),
                });
            }
        }
        for trigger in &old_own {
            if !new_own.contains(trigger) {
                removed_transitions.push(TransitionChange {
                    state: state.clone(),
                    trigger: trigger.clone(),
                });
            }
        }

        for trigger in old_own.iter().filter(|t| new_own.contains(*t)) {
            let old = own_transitions(a, state, trigger);
            let new = own_transitions(b, state, trigger);

            let old_fixed = old.iter().find(|t| t.is_fixed()).and_then(|t| t.destination.clone());
            let new_fixed = new.iter().find(|t| t.is_fixed()).and_then(|t| t.destination.clone());
            if let (Some(old_dest), Some(new_dest)) = (old_fixed, new_fixed) {
                if old_dest != new_dest {
                    modified_transitions.push(ModifiedTransition {
                        state: state.clone(),
                        trigger: trigger.clone(),
                        old_destination: old_dest,
                        new_destination: new_dest,
                    });
                }
            }

            let old_guards = old.iter().filter(|t| t.has_guard).count();
            let new_guards = new.iter().filter(|t| t.has_guard).count();
            if old_guards != new_guards {
                guard_changes.push(GuardChange {
                    state: state.clone(),
                    trigger: trigger.clone(),
                    old_guard_count: old_guards,
                    new_guard_count: new_guards,
                });
            }
        }
    }

    // Every recorded modification is a destination change by construction
    let has_breaking_changes = !removed_states.is_empty()
        || !removed_transitions.is_empty()
        || !modified_transitions.is_empty();

    let change_count = added_states.len()
        + removed_states.len()
        + added_transitions.len()
        + removed_transitions.len()
        + modified_transitions.len();
    let denominator =
        a.state_count() + b.state_count() + a.transition_key_count() + b.transition_key_count();
    let similarity = if denominator == 0 {
        1.0
    } else {
        (1.0 - change_count as f64 / denominator as f64).clamp(0.0, 1.0)
    };

    ConfigurationDiff {
        added_states,
        removed_states,
        added_transitions,
        removed_transitions,
        modified_transitions,
        guard_changes,
        has_breaking_changes,
        similarity,
    }
}

/// Transitions registered directly on `state`, without walking the
/// superstate chain
fn own_transitions<'a, S: State, T: Trigger>(
    cfg: &'a Configuration<S, T>,
    state: &S,
    trigger: &T,
) -> &'a [TransitionInfo<S, T>] {
    cfg.transition_map
        .get(&(state.clone(), trigger.clone()))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}
