// Copyright 2025 Machina Contributors.

//! Finite state machine primitive with tracked configuration
//!
//! This module provides the FSM primitive the rest of the crate builds on:
//! a machine over closed state/trigger enumerations, configured through a
//! fluent per-state API (`configure`), fired synchronously, and fully
//! introspectable via [`MachineInfo`]. The machine tracks its own
//! configuration as it is built, so reflection is never needed to recover
//! the transition graph.
//!
//! States and triggers are finite enumerations supplied by the caller.
//! Guards are opaque predicates; a guard that panics is contained and
//! treated as "not passing".

mod info;

pub use info::{MachineInfo, StateInfo, TransitionRecord};

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::{MachinaError, MachinaResult};

/// Trait for types usable as machine states
pub trait State: Debug + Clone + PartialEq + Eq + Hash + Send + Sync + 'static {
    /// Stable name of this state, used for logging and persistence
    fn name(&self) -> &'static str;

    /// Optional stable ordinal for this state
    fn ordinal(&self) -> Option<u32> {
        None
    }

    /// Check if this is a terminal state
    fn is_terminal(&self) -> bool {
        false
    }
}

/// Trait for types usable as machine triggers
pub trait Trigger: Debug + Clone + PartialEq + Eq + Hash + Send + Sync + 'static {
    /// Stable name of this trigger, used for logging and persistence
    fn name(&self) -> &'static str;

    /// Optional stable ordinal for this trigger
    fn ordinal(&self) -> Option<u32> {
        None
    }
}

/// Opaque guard predicate over optional trigger arguments
pub type GuardFn = Arc<dyn Fn(Option<&Value>) -> bool + Send + Sync>;

/// Destination selector for dynamic transitions
pub type SelectorFn<S> = Arc<dyn Fn(Option<&Value>) -> S + Send + Sync>;

/// Entry/exit action over the transition context
pub type ActionFn<S, T> = Arc<dyn Fn(&TransitionContext<S, T>) + Send + Sync>;

/// Context passed to entry and exit actions
#[derive(Debug, Clone)]
pub struct TransitionContext<S, T> {
    /// State the machine is leaving
    pub source: S,
    /// State the machine is entering
    pub destination: S,
    /// Trigger that caused the transition
    pub trigger: T,
    /// Arguments supplied with the trigger, if any
    pub args: Option<Value>,
}

/// Result of a successful `fire`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTransition<S, T> {
    /// State before the trigger
    pub source: S,
    /// State after the trigger; equals `source` for ignored triggers
    pub destination: S,
    /// Trigger that was fired
    pub trigger: T,
    /// Whether the trigger was configured as ignored (no state change)
    pub ignored: bool,
}

#[derive(Clone)]
struct NamedAction<S, T> {
    name: String,
    action: ActionFn<S, T>,
}

#[derive(Clone)]
pub(crate) enum TransitionTarget<S> {
    Fixed(S),
    Guarded {
        destination: S,
        guard: GuardFn,
        description: Option<String>,
    },
    Dynamic {
        selector: SelectorFn<S>,
        possible: Vec<S>,
        description: Option<String>,
    },
}

#[derive(Clone)]
pub(crate) struct TransitionDef<S, T> {
    pub(crate) trigger: T,
    pub(crate) target: TransitionTarget<S>,
}

#[derive(Clone)]
struct StateNode<S: State, T: Trigger> {
    superstate: Option<S>,
    substates: Vec<S>,
    ignored: IndexSet<T>,
    transitions: Vec<TransitionDef<S, T>>,
    entry_actions: Vec<NamedAction<S, T>>,
    exit_actions: Vec<NamedAction<S, T>>,
}

impl<S: State, T: Trigger> StateNode<S, T> {
    fn new() -> Self {
        Self {
            superstate: None,
            substates: Vec::new(),
            ignored: IndexSet::new(),
            transitions: Vec::new(),
            entry_actions: Vec::new(),
            exit_actions: Vec::new(),
        }
    }
}

enum Resolution<S> {
    Ignored,
    To(S),
    None,
}

/// A configured finite state machine over closed state/trigger domains
#[derive(Clone)]
pub struct StateMachine<S: State, T: Trigger> {
    initial: S,
    current: S,
    nodes: IndexMap<S, StateNode<S, T>>,
    in_callback: bool,
    defects: Vec<String>,
}

impl<S: State, T: Trigger> StateMachine<S, T> {
    /// Create a machine anchored at `initial`
    pub fn new(initial: S) -> Self {
        let mut nodes = IndexMap::new();
        nodes.insert(initial.clone(), StateNode::new());
        Self {
            current: initial.clone(),
            initial,
            nodes,
            in_callback: false,
            defects: Vec::new(),
        }
    }

    /// Begin configuring a state, creating it if it is not yet known
    pub fn configure(&mut self, state: S) -> StateConfigurator<'_, S, T> {
        self.ensure_node(&state);
        StateConfigurator {
            machine: self,
            state,
        }
    }

    fn ensure_node(&mut self, state: &S) {
        if !self.nodes.contains_key(state) {
            self.nodes.insert(state.clone(), StateNode::new());
        }
    }

    /// The state the machine was created with
    pub fn initial_state(&self) -> &S {
        &self.initial
    }

    /// The current state
    pub fn state(&self) -> &S {
        &self.current
    }

    /// All configured states in registration order
    pub fn states(&self) -> impl Iterator<Item = &S> {
        self.nodes.keys()
    }

    /// Whether a fire is currently executing entry/exit actions
    pub fn is_in_callback(&self) -> bool {
        self.in_callback
    }

    /// Look up a configured state by its stable name
    pub fn state_by_name(&self, name: &str) -> Option<S> {
        self.nodes.keys().find(|s| s.name() == name).cloned()
    }

    /// Check whether the machine is in `state` or any of its substates
    pub fn in_state_or_substate(&self, state: &S) -> bool {
        self.ancestry(&self.current).contains(state)
    }

    /// Position the machine at `state` without firing a trigger
    ///
    /// No entry/exit actions run and no transition is recorded; callers use
    /// this for replay, cloning, and migration anchoring.
    pub fn anchor(&mut self, state: S) -> MachinaResult<()> {
        if !self.nodes.contains_key(&state) {
            return Err(MachinaError::UnknownState(state.name().to_string()));
        }
        self.current = state;
        Ok(())
    }

    fn ancestry(&self, state: &S) -> Vec<S> {
        let mut chain = Vec::new();
        let mut cursor = Some(state.clone());
        while let Some(s) = cursor {
            // A substate cycle would loop forever; the chain can never be
            // longer than the state count
            if chain.len() > self.nodes.len() {
                break;
            }
            cursor = self.nodes.get(&s).and_then(|n| n.superstate.clone());
            chain.push(s);
        }
        chain
    }

    fn eval_guard(&self, guard: &GuardFn, args: Option<&Value>) -> bool {
        match catch_unwind(AssertUnwindSafe(|| guard(args))) {
            Ok(passes) => passes,
            Err(_) => {
                warn!(state = self.current.name(), "guard panicked; treating as not passing");
                false
            }
        }
    }

    fn resolve(&self, trigger: &T, args: Option<&Value>) -> Resolution<S> {
        for state in self.ancestry(&self.current) {
            let Some(node) = self.nodes.get(&state) else {
                continue;
            };
            if node.ignored.contains(trigger) {
                return Resolution::Ignored;
            }
            for def in node.transitions.iter().filter(|d| &d.trigger == trigger) {
                match &def.target {
                    TransitionTarget::Fixed(dest) => return Resolution::To(dest.clone()),
                    TransitionTarget::Guarded {
                        destination, guard, ..
                    } => {
                        if self.eval_guard(guard, args) {
                            return Resolution::To(destination.clone());
                        }
                    }
                    TransitionTarget::Dynamic { selector, .. } => {
                        match catch_unwind(AssertUnwindSafe(|| selector(args))) {
                            Ok(dest) if self.nodes.contains_key(&dest) => {
                                return Resolution::To(dest)
                            }
                            Ok(dest) => {
                                warn!(
                                    destination = dest.name(),
                                    "dynamic selector returned an unconfigured state"
                                );
                            }
                            Err(_) => {
                                warn!(
                                    state = self.current.name(),
                                    trigger = trigger.name(),
                                    "dynamic selector panicked; treating as not firing"
                                );
                            }
                        }
                    }
                }
            }
            // Guards all declined at this level; superstate handlers still apply
        }
        Resolution::None
    }

    /// Whether firing `trigger` now would be accepted (guards are evaluated)
    pub fn can_fire(&self, trigger: &T) -> bool {
        self.can_fire_with(trigger, None)
    }

    /// `can_fire` with trigger arguments visible to guards and selectors
    pub fn can_fire_with(&self, trigger: &T, args: Option<&Value>) -> bool {
        !matches!(self.resolve(trigger, args), Resolution::None)
    }

    /// Triggers that would currently cause a transition, guards evaluated,
    /// ignored triggers excluded
    pub fn permitted_triggers(&self) -> Vec<T> {
        let mut seen = IndexSet::new();
        let mut masked: IndexSet<T> = IndexSet::new();
        for state in self.ancestry(&self.current) {
            let Some(node) = self.nodes.get(&state) else {
                continue;
            };
            // An ignore at an inner level masks outer handlers
            for trigger in &node.ignored {
                masked.insert(trigger.clone());
            }
            for def in &node.transitions {
                if seen.contains(&def.trigger) || masked.contains(&def.trigger) {
                    continue;
                }
                let firable = match &def.target {
                    TransitionTarget::Fixed(_) | TransitionTarget::Dynamic { .. } => true,
                    TransitionTarget::Guarded { guard, .. } => self.eval_guard(guard, None),
                };
                if firable {
                    seen.insert(def.trigger.clone());
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Fire a trigger with no arguments
    pub fn fire(&mut self, trigger: T) -> MachinaResult<FiredTransition<S, T>> {
        self.fire_with(trigger, None)
    }

    /// Fire a trigger carrying an argument payload
    pub fn fire_with(
        &mut self,
        trigger: T,
        args: Option<Value>,
    ) -> MachinaResult<FiredTransition<S, T>> {
        if self.in_callback {
            return Err(MachinaError::CallbackReentrancy {
                state: self.current.name().to_string(),
            });
        }

        let resolution = self.resolve(&trigger, args.as_ref());
        match resolution {
            Resolution::Ignored => Ok(FiredTransition {
                source: self.current.clone(),
                destination: self.current.clone(),
                trigger,
                ignored: true,
            }),
            Resolution::None => Err(MachinaError::InvalidTransition {
                state: self.current.name().to_string(),
                trigger: trigger.name().to_string(),
            }),
            Resolution::To(destination) => {
                let source = self.current.clone();
                let ctx = TransitionContext {
                    source: source.clone(),
                    destination: destination.clone(),
                    trigger: trigger.clone(),
                    args,
                };

                let lca = self.least_common_ancestor(&source, &destination);
                let exits = self.exit_path(&source, lca.as_ref());
                let entries = self.entry_path(&destination, lca.as_ref());

                self.in_callback = true;
                for state in &exits {
                    self.run_actions(state, &ctx, false);
                }
                self.current = destination.clone();
                for state in &entries {
                    self.run_actions(state, &ctx, true);
                }
                self.in_callback = false;

                debug!(
                    from = source.name(),
                    to = destination.name(),
                    trigger = ctx.trigger.name(),
                    "transition fired"
                );

                Ok(FiredTransition {
                    source,
                    destination,
                    trigger,
                    ignored: false,
                })
            }
        }
    }

    fn least_common_ancestor(&self, a: &S, b: &S) -> Option<S> {
        // A self-transition re-enters the state fully, so it has no shared
        // ancestor to stop at
        if a == b {
            return self.nodes.get(a).and_then(|n| n.superstate.clone());
        }
        let b_chain = self.ancestry(b);
        self.ancestry(a).into_iter().find(|s| b_chain.contains(s))
    }

    fn exit_path(&self, from: &S, stop: Option<&S>) -> Vec<S> {
        self.ancestry(from)
            .into_iter()
            .take_while(|s| Some(s) != stop)
            .collect()
    }

    fn entry_path(&self, to: &S, stop: Option<&S>) -> Vec<S> {
        let mut path: Vec<S> = self
            .ancestry(to)
            .into_iter()
            .take_while(|s| Some(s) != stop)
            .collect();
        path.reverse();
        path
    }

    fn run_actions(&self, state: &S, ctx: &TransitionContext<S, T>, entering: bool) {
        let Some(node) = self.nodes.get(state) else {
            return;
        };
        let actions = if entering {
            &node.entry_actions
        } else {
            &node.exit_actions
        };
        for named in actions {
            if catch_unwind(AssertUnwindSafe(|| (named.action)(ctx))).is_err() {
                warn!(
                    state = state.name(),
                    action = %named.name,
                    "entry/exit action panicked; transition continues"
                );
            }
        }
    }

    /// Validate structural invariants of the configuration
    ///
    /// Checks substate acyclicity, that no state both ignores and permits
    /// the same trigger, and surfaces any defects recorded while building.
    pub fn validate(&self) -> MachinaResult<()> {
        let mut problems = self.defects.clone();

        for (state, node) in &self.nodes {
            // Substate cycle: walking up must terminate before |states| hops
            let mut hops = 0usize;
            let mut cursor = node.superstate.clone();
            while let Some(s) = cursor {
                hops += 1;
                if &s == state || hops > self.nodes.len() {
                    problems.push(format!("substate cycle involving {}", state.name()));
                    break;
                }
                cursor = self.nodes.get(&s).and_then(|n| n.superstate.clone());
            }

            for trigger in &node.ignored {
                if node.transitions.iter().any(|d| &d.trigger == trigger) {
                    problems.push(format!(
                        "state {} both ignores and permits trigger {}",
                        state.name(),
                        trigger.name()
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MachinaError::InvalidOperation {
                reason: problems.join("; "),
            })
        }
    }

    /// Snapshot the configuration graph for introspection
    pub fn info(&self) -> MachineInfo<S, T> {
        info::build_info(self)
    }

    pub(crate) fn node_view(
        &self,
    ) -> impl Iterator<
        Item = (
            &S,
            Option<&S>,
            &Vec<S>,
            &IndexSet<T>,
            &Vec<TransitionDef<S, T>>,
            Vec<&str>,
            Vec<&str>,
        ),
    > {
        self.nodes.iter().map(|(state, node)| {
            (
                state,
                node.superstate.as_ref(),
                &node.substates,
                &node.ignored,
                &node.transitions,
                node.entry_actions.iter().map(|a| a.name.as_str()).collect(),
                node.exit_actions.iter().map(|a| a.name.as_str()).collect(),
            )
        })
    }
}

impl<S: State, T: Trigger> Debug for StateMachine<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("initial", &self.initial.name())
            .field("current", &self.current.name())
            .field("states", &self.nodes.keys().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// Fluent per-state configuration handle returned by [`StateMachine::configure`]
pub struct StateConfigurator<'a, S: State, T: Trigger> {
    machine: &'a mut StateMachine<S, T>,
    state: S,
}

impl<'a, S: State, T: Trigger> StateConfigurator<'a, S, T> {
    fn node(&mut self) -> &mut StateNode<S, T> {
        self.machine
            .nodes
            .get_mut(&self.state)
            .expect("configured state always has a node")
    }

    /// Permit `trigger`, transitioning to `destination` unconditionally
    pub fn permit(mut self, trigger: T, destination: S) -> Self {
        self.machine.ensure_node(&destination);
        self.node().transitions.push(TransitionDef {
            trigger,
            target: TransitionTarget::Fixed(destination),
        });
        self
    }

    /// Permit `trigger` to `destination` only when `guard` passes
    pub fn permit_if(
        mut self,
        trigger: T,
        destination: S,
        guard: impl Fn(Option<&Value>) -> bool + Send + Sync + 'static,
        description: impl Into<String>,
    ) -> Self {
        self.machine.ensure_node(&destination);
        self.node().transitions.push(TransitionDef {
            trigger,
            target: TransitionTarget::Guarded {
                destination,
                guard: Arc::new(guard),
                description: Some(description.into()),
            },
        });
        self
    }

    /// Permit `trigger` with a runtime-selected destination drawn from
    /// `possible` destinations
    pub fn permit_dynamic(
        mut self,
        trigger: T,
        selector: impl Fn(Option<&Value>) -> S + Send + Sync + 'static,
        possible: Vec<S>,
        description: impl Into<String>,
    ) -> Self {
        for dest in &possible {
            self.machine.ensure_node(dest);
        }
        self.node().transitions.push(TransitionDef {
            trigger,
            target: TransitionTarget::Dynamic {
                selector: Arc::new(selector),
                possible,
                description: Some(description.into()),
            },
        });
        self
    }

    /// Ignore `trigger` in this state: firing it is accepted and does nothing
    pub fn ignore(mut self, trigger: T) -> Self {
        let conflicts = self.node().transitions.iter().any(|d| d.trigger == trigger);
        if conflicts {
            let defect = format!(
                "state {} both ignores and permits trigger {}",
                self.state.name(),
                trigger.name()
            );
            self.machine.defects.push(defect);
            return self;
        }
        self.node().ignored.insert(trigger);
        self
    }

    /// Make this state a substate of `parent`
    pub fn substate_of(mut self, parent: S) -> Self {
        self.machine.ensure_node(&parent);
        let state = self.state.clone();
        self.node().superstate = Some(parent.clone());
        let parent_node = self
            .machine
            .nodes
            .get_mut(&parent)
            .expect("parent node just ensured");
        if !parent_node.substates.contains(&state) {
            parent_node.substates.push(state);
        }
        self
    }

    /// Run `action` whenever this state is entered
    pub fn on_entry(self, action: impl Fn(&TransitionContext<S, T>) + Send + Sync + 'static) -> Self {
        self.on_entry_named("on_entry", action)
    }

    /// Run a named `action` whenever this state is entered
    pub fn on_entry_named(
        mut self,
        name: impl Into<String>,
        action: impl Fn(&TransitionContext<S, T>) + Send + Sync + 'static,
    ) -> Self {
        self.node().entry_actions.push(NamedAction {
            name: name.into(),
            action: Arc::new(action),
        });
        self
    }

    /// Run `action` whenever this state is exited
    pub fn on_exit(self, action: impl Fn(&TransitionContext<S, T>) + Send + Sync + 'static) -> Self {
        self.on_exit_named("on_exit", action)
    }

    /// Run a named `action` whenever this state is exited
    pub fn on_exit_named(
        mut self,
        name: impl Into<String>,
        action: impl Fn(&TransitionContext<S, T>) + Send + Sync + 'static,
    ) -> Self {
        self.node().exit_actions.push(NamedAction {
            name: name.into(),
            action: Arc::new(action),
        });
        self
    }
}
