//! Side-effect-free prediction of a trigger's outcome
//!
//! Guards are never evaluated here; a guarded outcome is intentionally
//! indeterminate and reported through `possible_destinations`.

use super::configuration::Configuration;
use crate::machine::{State, Trigger};

/// Predicted outcome of firing one trigger from one state
#[derive(Debug, Clone)]
pub struct Prediction<S> {
    /// Whether the trigger would be accepted
    pub can_fire: bool,
    /// Whether the trigger is configured as ignored in that state
    pub is_ignored: bool,
    /// Whether the outcome depends on an opaque guard
    pub has_guard: bool,
    /// The definite next state, when one can be determined
    pub predicted_state: Option<S>,
    /// All destinations the trigger might select
    pub possible_destinations: Vec<S>,
    /// Human-readable explanation of the verdict
    pub reason: String,
}

impl<S> Prediction<S> {
    fn rejected(reason: String) -> Self {
        Self {
            can_fire: false,
            is_ignored: false,
            has_guard: false,
            predicted_state: None,
            possible_destinations: Vec::new(),
            reason,
        }
    }
}

/// Predict what firing `trigger` from `current` would do under `cfg`
///
/// Never panics: unknown states and unhandled triggers produce a rejection
/// with a named reason.
pub fn predict<S: State, T: Trigger>(
    cfg: &Configuration<S, T>,
    current: &S,
    trigger: &T,
) -> Prediction<S> {
    if !cfg.contains_state(current) {
        return Prediction::rejected(format!(
            "state {} is not part of this configuration",
            current.name()
        ));
    }

    if cfg.is_ignored(current, trigger) {
        return Prediction {
            can_fire: true,
            is_ignored: true,
            has_guard: false,
            predicted_state: Some(current.clone()),
            possible_destinations: vec![current.clone()],
            reason: format!("trigger {} is ignored; state is unchanged", trigger.name()),
        };
    }

    let permitted = cfg
        .state_config(current)
        .map(|c| c.permitted_triggers.contains(trigger))
        .unwrap_or(false);
    if !permitted {
        return Prediction::rejected(format!(
            "trigger {} is not permitted in state {}",
            trigger.name(),
            current.name()
        ));
    }

    let transitions = cfg.transitions_for(current, trigger);
    if transitions.is_empty() {
        return Prediction::rejected(format!(
            "no transition handles trigger {} from state {}",
            trigger.name(),
            current.name()
        ));
    }

    // A single unguarded transition is fully determined
    if transitions.len() == 1 && transitions[0].is_fixed() {
        if let Some(dest) = transitions[0].destination.clone() {
            return Prediction {
                can_fire: true,
                is_ignored: false,
                has_guard: false,
                predicted_state: Some(dest.clone()),
                possible_destinations: vec![dest],
                reason: format!("fixed transition on {}", trigger.name()),
            };
        }
    }

    // Otherwise gather every destination the trigger might pick
    let mut possible: Vec<S> = Vec::new();
    for t in transitions {
        for dest in &t.possible_destinations {
            if !possible.contains(dest) {
                possible.push(dest.clone());
            }
        }
    }
    let has_guard = transitions.iter().any(|t| t.has_guard);

    if possible.len() == 1 {
        let dest = possible[0].clone();
        return Prediction {
            can_fire: true,
            is_ignored: false,
            has_guard,
            predicted_state: Some(dest),
            possible_destinations: possible,
            reason: format!(
                "dynamic transition on {} with a single possible destination",
                trigger.name()
            ),
        };
    }

    Prediction {
        can_fire: true,
        is_ignored: false,
        has_guard,
        predicted_state: None,
        possible_destinations: possible,
        reason: format!(
            "dynamic transition on {}; destination depends on guards",
            trigger.name()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::super::configuration::extract;
    use super::*;
    use crate::machine::StateMachine;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Order {
        Pending,
        Processing,
        Shipped,
        Express,
        Cancelled,
    }

    impl State for Order {
        fn name(&self) -> &'static str {
            match self {
                Self::Pending => "Pending",
                Self::Processing => "Processing",
                Self::Shipped => "Shipped",
                Self::Express => "Express",
                Self::Cancelled => "Cancelled",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Act {
        Process,
        Ship,
        Cancel,
        Ping,
    }

    impl Trigger for Act {
        fn name(&self) -> &'static str {
            match self {
                Self::Process => "Process",
                Self::Ship => "Ship",
                Self::Cancel => "Cancel",
                Self::Ping => "Ping",
            }
        }
    }

    fn cfg() -> Configuration<Order, Act> {
        let mut m = StateMachine::new(Order::Pending);
        m.configure(Order::Pending)
            .permit(Act::Process, Order::Processing)
            .ignore(Act::Ping);
        m.configure(Order::Processing)
            .permit_if(Act::Ship, Order::Express, |_| false, "express lane")
            .permit_if(Act::Ship, Order::Shipped, |_| true, "standard lane")
            .permit_if(Act::Cancel, Order::Cancelled, |_| true, "cancellable");
        extract(&m)
    }

    #[test]
    fn test_predict_unknown_state() {
        let mut m = StateMachine::new(Order::Pending);
        m.configure(Order::Pending).permit(Act::Process, Order::Processing);
        let cfg = extract(&m);

        let p = predict(&cfg, &Order::Cancelled, &Act::Process);
        assert!(!p.can_fire);
        assert!(p.reason.contains("not part of this configuration"));
    }

    #[test]
    fn test_predict_ignored_trigger() {
        let p = predict(&cfg(), &Order::Pending, &Act::Ping);
        assert!(p.can_fire);
        assert!(p.is_ignored);
        assert_eq!(p.predicted_state, Some(Order::Pending));
    }

    #[test]
    fn test_predict_not_permitted() {
        let p = predict(&cfg(), &Order::Pending, &Act::Ship);
        assert!(!p.can_fire);
        assert!(p.reason.contains("not permitted"));
    }

    #[test]
    fn test_predict_fixed_transition() {
        let p = predict(&cfg(), &Order::Pending, &Act::Process);
        assert!(p.can_fire);
        assert!(!p.has_guard);
        assert_eq!(p.predicted_state, Some(Order::Processing));
    }

    #[test]
    fn test_predict_guarded_single_destination() {
        let p = predict(&cfg(), &Order::Processing, &Act::Cancel);
        assert!(p.can_fire);
        assert!(p.has_guard);
        // One possible destination, so the prediction is nominal
        assert_eq!(p.predicted_state, Some(Order::Cancelled));
    }

    #[test]
    fn test_predict_guarded_multiple_destinations_is_indeterminate() {
        let p = predict(&cfg(), &Order::Processing, &Act::Ship);
        assert!(p.can_fire);
        assert!(p.has_guard);
        assert_eq!(p.predicted_state, None);
        assert_eq!(
            p.possible_destinations,
            vec![Order::Express, Order::Shipped]
        );
    }

    #[test]
    fn test_predict_never_evaluates_guards() {
        // The express guard always returns false, yet it still contributes
        // a possible destination: prediction is structural only
        let p = predict(&cfg(), &Order::Processing, &Act::Ship);
        assert!(p.possible_destinations.contains(&Order::Express));
    }
}
