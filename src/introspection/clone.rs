//! Rebuild a machine from its extracted configuration
//!
//! Guarded and dynamic transitions cannot be reproduced without the original
//! predicates, so they are omitted with a warning rather than failing the
//! clone. Entry/exit actions are likewise opaque and are not carried over.

use tracing::warn;

use super::configuration::{extract, Configuration};
use crate::errors::{MachinaError, MachinaResult};
use crate::machine::{State, StateMachine, Trigger};

/// A machine rebuilt from a configuration, plus what could not be carried
#[derive(Debug)]
pub struct ClonedMachine<S: State, T: Trigger> {
    /// The rebuilt machine
    pub machine: StateMachine<S, T>,
    /// One warning per omitted guarded/dynamic transition
    pub warnings: Vec<String>,
}

/// Clone a live machine's configuration into a fresh machine
///
/// The clone is anchored at `new_initial` when given, otherwise at the
/// source machine's initial state.
pub fn clone_machine<S: State, T: Trigger>(
    source: &StateMachine<S, T>,
    new_initial: Option<S>,
) -> MachinaResult<ClonedMachine<S, T>> {
    clone_from_configuration(&extract(source), new_initial)
}

/// Clone from an already-extracted configuration
pub fn clone_from_configuration<S: State, T: Trigger>(
    cfg: &Configuration<S, T>,
    new_initial: Option<S>,
) -> MachinaResult<ClonedMachine<S, T>> {
    let initial = new_initial.unwrap_or_else(|| cfg.initial_state.clone());
    if !cfg.contains_state(&initial) {
        return Err(MachinaError::UnknownState(initial.name().to_string()));
    }

    let mut machine = StateMachine::new(initial);
    let mut warnings = Vec::new();

    // First pass: states, hierarchy, ignored triggers
    for (state, state_cfg) in &cfg.states {
        let mut configurator = machine.configure(state.clone());
        if let Some(parent) = &state_cfg.superstate {
            configurator = configurator.substate_of(parent.clone());
        }
        for trigger in &state_cfg.ignored_triggers {
            configurator = configurator.ignore(trigger.clone());
        }
        let _ = configurator;
    }

    // Second pass: fixed transitions only
    for (state, state_cfg) in &cfg.states {
        for t in &state_cfg.transitions {
            if let (false, Some(dest)) = (t.has_guard, t.destination.clone()) {
                machine.configure(state.clone()).permit(t.trigger.clone(), dest);
            } else {
                let message = format!(
                    "guarded transition omitted from clone: {} -{}-> [{}]",
                    state.name(),
                    t.trigger.name(),
                    t.possible_destinations
                        .iter()
                        .map(|d| d.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                warn!(%message);
                warnings.push(message);
            }
        }
    }

    Ok(ClonedMachine { machine, warnings })
}

#[cfg(test)]
mod tests {
    use super::super::configuration::extract;
    use super::super::diff::diff;
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum S {
        A,
        B,
        C,
    }

    impl State for S {
        fn name(&self) -> &'static str {
            match self {
                Self::A => "A",
                Self::B => "B",
                Self::C => "C",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum T {
        Next,
        Skip,
        Noise,
    }

    impl Trigger for T {
        fn name(&self) -> &'static str {
            match self {
                Self::Next => "Next",
                Self::Skip => "Skip",
                Self::Noise => "Noise",
            }
        }
    }

    #[test]
    fn test_clone_preserves_fixed_topology() {
        let mut m = StateMachine::new(S::A);
        m.configure(S::A).permit(T::Next, S::B).ignore(T::Noise);
        m.configure(S::B).permit(T::Next, S::C);
        m.configure(S::C).substate_of(S::B);

        let cloned = clone_machine(&m, None).unwrap();
        assert!(cloned.warnings.is_empty());

        let d = diff(&extract(&m), &extract(&cloned.machine));
        assert!(d.is_identical());
        assert_eq!(d.similarity, 1.0);
    }

    #[test]
    fn test_clone_omits_guarded_transitions_with_warning() {
        let mut m = StateMachine::new(S::A);
        m.configure(S::A)
            .permit(T::Next, S::B)
            .permit_if(T::Skip, S::C, |_| true, "skip allowed");

        let cloned = clone_machine(&m, None).unwrap();
        assert_eq!(cloned.warnings.len(), 1);
        assert!(cloned.warnings[0].contains("Skip"));

        // The guarded transition is gone; the fixed one survives
        assert!(!cloned.machine.can_fire(&T::Skip));
        assert!(cloned.machine.can_fire(&T::Next));
    }

    #[test]
    fn test_clone_with_new_initial() {
        let mut m = StateMachine::new(S::A);
        m.configure(S::A).permit(T::Next, S::B);
        m.configure(S::B).permit(T::Next, S::C);

        let cloned = clone_machine(&m, Some(S::B)).unwrap();
        assert_eq!(cloned.machine.state(), &S::B);

        let mut machine = cloned.machine;
        let fired = machine.fire(T::Next).unwrap();
        assert_eq!(fired.destination, S::C);
    }

    #[test]
    fn test_clone_rejects_unknown_initial() {
        let mut m = StateMachine::new(S::A);
        m.configure(S::A).permit(T::Next, S::B);
        // C was never configured
        assert!(clone_machine(&m, Some(S::C)).is_err());
    }
}
