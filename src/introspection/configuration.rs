// Copyright 2025 Machina Contributors.

//! Immutable configuration topology extracted from a machine
//!
//! A [`Configuration`] is the full topology of one machine version: states,
//! hierarchy, permitted and ignored triggers, and transitions, plus a
//! derived `(source, trigger)` index for constant-time lookup. It is built
//! once from [`MachineInfo`] and never mutated.

use indexmap::{IndexMap, IndexSet};
use std::collections::HashMap;

use crate::machine::{MachineInfo, State, StateMachine, Trigger};

/// One transition in an extracted configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionInfo<S, T> {
    /// State the transition leaves from
    pub source: S,
    /// Trigger that activates it
    pub trigger: T,
    /// Definite destination; present only for fixed transitions
    pub destination: Option<S>,
    /// Every destination the transition may select
    pub possible_destinations: Vec<S>,
    /// Whether an opaque guard or selector controls it
    pub has_guard: bool,
    /// Guard description supplied at configuration time
    pub guard_description: Option<String>,
}

impl<S, T> TransitionInfo<S, T> {
    /// Whether this transition is fixed (unguarded, definite destination)
    pub fn is_fixed(&self) -> bool {
        !self.has_guard && self.destination.is_some()
    }
}

/// Per-state slice of a configuration
#[derive(Debug, Clone)]
pub struct StateConfig<S, T> {
    /// Parent state, if this is a substate
    pub superstate: Option<S>,
    /// Direct substates in registration order
    pub substates: Vec<S>,
    /// Effective trigger set: own transitions plus inherited ones
    pub permitted_triggers: IndexSet<T>,
    /// Triggers this state silently ignores
    pub ignored_triggers: IndexSet<T>,
    /// Transitions registered directly on this state
    pub transitions: Vec<TransitionInfo<S, T>>,
    /// Names of entry actions
    pub entry_actions: Vec<String>,
    /// Names of exit actions
    pub exit_actions: Vec<String>,
    /// Whether this is the configuration's initial state
    pub is_initial: bool,
}

/// Immutable topology of one machine version
#[derive(Debug, Clone)]
pub struct Configuration<S: State, T: Trigger> {
    /// Initial state of the machine
    pub initial_state: S,
    /// All states keyed in registration order
    pub states: IndexMap<S, StateConfig<S, T>>,
    /// Derived `(source, trigger)` index over own transitions
    pub transition_map: HashMap<(S, T), Vec<TransitionInfo<S, T>>>,
}

impl<S: State, T: Trigger> Configuration<S, T> {
    /// Whether `state` is part of this configuration
    pub fn contains_state(&self, state: &S) -> bool {
        self.states.contains_key(state)
    }

    /// The configuration of one state, if present
    pub fn state_config(&self, state: &S) -> Option<&StateConfig<S, T>> {
        self.states.get(state)
    }

    /// Look up a state by its stable name
    pub fn state_by_name(&self, name: &str) -> Option<S> {
        self.states.keys().find(|s| s.name() == name).cloned()
    }

    /// Number of states
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Number of `(source, trigger)` pairs in the transition map
    pub fn transition_key_count(&self) -> usize {
        self.transition_map.len()
    }

    /// Transitions applicable when `trigger` fires in `state`, walking the
    /// superstate chain until a level that handles the trigger is found
    pub fn transitions_for(&self, state: &S, trigger: &T) -> &[TransitionInfo<S, T>] {
        let mut cursor = Some(state.clone());
        let mut hops = 0usize;
        while let Some(s) = cursor {
            if hops > self.states.len() {
                break;
            }
            hops += 1;
            if let Some(found) = self.transition_map.get(&(s.clone(), trigger.clone())) {
                return found;
            }
            cursor = self.states.get(&s).and_then(|c| c.superstate.clone());
        }
        &[]
    }

    /// Whether `trigger` is ignored in `state` or one of its ancestors
    pub fn is_ignored(&self, state: &S, trigger: &T) -> bool {
        let mut cursor = Some(state.clone());
        let mut hops = 0usize;
        while let Some(s) = cursor {
            if hops > self.states.len() {
                break;
            }
            hops += 1;
            let Some(cfg) = self.states.get(&s) else { break };
            if cfg.ignored_triggers.contains(trigger) {
                return true;
            }
            cursor = cfg.superstate.clone();
        }
        false
    }
}

/// Extract the immutable configuration of a machine
///
/// Runs in one pass over the reflected info: O(states + transitions), with
/// one additional superstate-chain walk per state to compute the effective
/// permitted-trigger sets.
pub fn extract<S: State, T: Trigger>(machine: &StateMachine<S, T>) -> Configuration<S, T> {
    extract_from_info(&machine.info())
}

/// Extract a configuration from an already-captured [`MachineInfo`]
pub fn extract_from_info<S: State, T: Trigger>(info: &MachineInfo<S, T>) -> Configuration<S, T> {
    let mut states: IndexMap<S, StateConfig<S, T>> = IndexMap::new();
    let mut transition_map: HashMap<(S, T), Vec<TransitionInfo<S, T>>> = HashMap::new();

    for si in &info.states {
        let transitions: Vec<TransitionInfo<S, T>> = si
            .transitions
            .iter()
            .map(|t| TransitionInfo {
                source: si.state.clone(),
                trigger: t.trigger.clone(),
                destination: t.destination.clone(),
                possible_destinations: t.possible_destinations.clone(),
                has_guard: t.has_guard,
                guard_description: t.guard_description.clone(),
            })
            .collect();

        for t in &transitions {
            transition_map
                .entry((si.state.clone(), t.trigger.clone()))
                .or_default()
                .push(t.clone());
        }

        states.insert(
            si.state.clone(),
            StateConfig {
                superstate: si.superstate.clone(),
                substates: si.substates.clone(),
                permitted_triggers: transitions.iter().map(|t| t.trigger.clone()).collect(),
                ignored_triggers: si.ignored_triggers.iter().cloned().collect(),
                transitions,
                entry_actions: si.entry_actions.clone(),
                exit_actions: si.exit_actions.clone(),
                is_initial: si.state == info.initial_state,
            },
        );
    }

    // Fold inherited triggers into each state's effective permitted set
    let keys: Vec<S> = states.keys().cloned().collect();
    for state in keys {
        let mut inherited: Vec<T> = Vec::new();
        let mut cursor = states.get(&state).and_then(|c| c.superstate.clone());
        let mut hops = 0usize;
        while let Some(parent) = cursor {
            if hops > states.len() {
                break;
            }
            hops += 1;
            let Some(parent_cfg) = states.get(&parent) else {
                break;
            };
            inherited.extend(parent_cfg.transitions.iter().map(|t| t.trigger.clone()));
            cursor = parent_cfg.superstate.clone();
        }
        if let Some(cfg) = states.get_mut(&state) {
            for t in inherited {
                cfg.permitted_triggers.insert(t);
            }
        }
    }

    Configuration {
        initial_state: info.initial_state.clone(),
        states,
        transition_map,
    }
}
