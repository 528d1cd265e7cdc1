//! Reflective description of a configured machine
//!
//! [`MachineInfo`] is the narrow introspection contract: everything the
//! introspector needs to rebuild the transition graph is captured here as
//! the machine is configured, so no reflection over the live machine is
//! ever required.

use super::{State, StateMachine, Trigger, TransitionTarget};

/// Full reflective description of one machine configuration
#[derive(Debug, Clone)]
pub struct MachineInfo<S, T> {
    /// The state the machine starts in
    pub initial_state: S,
    /// The state the machine is currently in
    pub current_state: S,
    /// Per-state descriptions, in registration order
    pub states: Vec<StateInfo<S, T>>,
}

/// Description of one state in a machine configuration
#[derive(Debug, Clone)]
pub struct StateInfo<S, T> {
    /// The state itself
    pub state: S,
    /// Parent state, if this is a substate
    pub superstate: Option<S>,
    /// Direct substates, in registration order
    pub substates: Vec<S>,
    /// Triggers ignored in this state
    pub ignored_triggers: Vec<T>,
    /// Outgoing transitions registered on this state
    pub transitions: Vec<TransitionRecord<S, T>>,
    /// Names of entry actions
    pub entry_actions: Vec<String>,
    /// Names of exit actions
    pub exit_actions: Vec<String>,
}

/// One registered transition
///
/// A transition is *fixed* when it has no guard and a definite destination;
/// otherwise it is *dynamic* with one or more possible destinations.
#[derive(Debug, Clone)]
pub struct TransitionRecord<S, T> {
    /// Trigger that activates the transition
    pub trigger: T,
    /// Definite destination, present only for fixed transitions
    pub destination: Option<S>,
    /// All destinations the transition may select
    pub possible_destinations: Vec<S>,
    /// Whether an opaque guard or selector controls the transition
    pub has_guard: bool,
    /// Caller-supplied guard description, if any
    pub guard_description: Option<String>,
}

impl<S: Clone, T> TransitionRecord<S, T> {
    /// Whether this transition has exactly one unguarded destination
    pub fn is_fixed(&self) -> bool {
        !self.has_guard && self.destination.is_some()
    }
}

pub(super) fn build_info<S: State, T: Trigger>(machine: &StateMachine<S, T>) -> MachineInfo<S, T> {
    let states = machine
        .node_view()
        .map(
            |(state, superstate, substates, ignored, transitions, entry, exit)| StateInfo {
                state: state.clone(),
                superstate: superstate.cloned(),
                substates: substates.clone(),
                ignored_triggers: ignored.iter().cloned().collect(),
                transitions: transitions
                    .iter()
                    .map(|def| match &def.target {
                        TransitionTarget::Fixed(dest) => TransitionRecord {
                            trigger: def.trigger.clone(),
                            destination: Some(dest.clone()),
                            possible_destinations: vec![dest.clone()],
                            has_guard: false,
                            guard_description: None,
                        },
                        TransitionTarget::Guarded {
                            destination,
                            description,
                            ..
                        } => TransitionRecord {
                            trigger: def.trigger.clone(),
                            destination: None,
                            possible_destinations: vec![destination.clone()],
                            has_guard: true,
                            guard_description: description.clone(),
                        },
                        TransitionTarget::Dynamic {
                            possible,
                            description,
                            ..
                        } => TransitionRecord {
                            trigger: def.trigger.clone(),
                            destination: None,
                            possible_destinations: possible.clone(),
                            has_guard: true,
                            guard_description: description.clone(),
                        },
                    })
                    .collect(),
                entry_actions: entry.into_iter().map(str::to_string).collect(),
                exit_actions: exit.into_iter().map(str::to_string).collect(),
            },
        )
        .collect();

    MachineInfo {
        initial_state: machine.initial_state().clone(),
        current_state: machine.state().clone(),
        states,
    }
}
