//! Graph building and validation.
//!
//! Graphs are assembled with a [`GraphBuilder`] and frozen into an immutable
//! [`Graph`] that a [`StateMachine`](crate::StateMachine) executes:
//!
//! ```
//! use rstm_core::{GraphBuilder, Plain, TransitionOptions};
//!
//! let mut builder = GraphBuilder::<()>::new();
//! let closed = builder.add_state("closed", Plain);
//! let opened = builder.add_state("opened", Plain);
//! let done = builder.add_final_state("done");
//!
//! builder.connect(closed, opened);
//! builder.connect(opened, closed);
//! builder.connect_any_with(done, TransitionOptions::new().named("shutdown"));
//! builder.set_initial(closed);
//!
//! let graph = builder.build();
//! assert!(graph.validate().is_ok());
//! ```

use crate::error::ConfigError;
use crate::state::{Plain, StateBehavior, StateId, StateKind, StateRef};
use crate::transition::{Sources, Transition, TransitionId, TransitionOptions};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a graph; embedded in every state and transition handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct GraphId(u64);

impl GraphId {
    pub(crate) fn next() -> Self {
        Self(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) struct StateNode<C> {
    pub(crate) name: String,
    pub(crate) kind: StateKind,
    pub(crate) behavior: Box<dyn StateBehavior<C>>,
}

/// Accumulates states and transitions.
pub struct GraphBuilder<C> {
    id: GraphId,
    states: Vec<StateNode<C>>,
    transitions: Vec<Transition<C>>,
    initial: Option<StateId>,
}

impl<C: 'static> GraphBuilder<C> {
    pub fn new() -> Self {
        Self {
            id: GraphId::next(),
            states: Vec::new(),
            transitions: Vec::new(),
            initial: None,
        }
    }

    /// Adds a state. An empty name becomes `S<n>`.
    pub fn add_state(
        &mut self,
        name: impl Into<String>,
        behavior: impl StateBehavior<C> + 'static,
    ) -> StateId {
        self.push_state(name.into(), StateKind::Normal, Box::new(behavior))
    }

    /// Adds a final state without behaviour.
    pub fn add_final_state(&mut self, name: impl Into<String>) -> StateId {
        self.push_state(name.into(), StateKind::Final, Box::new(Plain))
    }

    /// Adds a final state with behaviour; its hooks run like any other
    /// state's before the machine finishes.
    pub fn add_final_state_with(
        &mut self,
        name: impl Into<String>,
        behavior: impl StateBehavior<C> + 'static,
    ) -> StateId {
        self.push_state(name.into(), StateKind::Final, Box::new(behavior))
    }

    fn push_state(
        &mut self,
        name: String,
        kind: StateKind,
        behavior: Box<dyn StateBehavior<C>>,
    ) -> StateId {
        let index = self.states.len();
        let name = if name.is_empty() {
            format!("S{}", index + 1)
        } else {
            name
        };
        self.states.push(StateNode {
            name,
            kind,
            behavior,
        });
        StateId {
            graph: self.id,
            index,
        }
    }

    pub fn set_initial(&mut self, state: StateId) {
        self.initial = Some(state);
    }

    /// Connects `sources` to `target` with a manual, unnamed transition.
    pub fn connect(&mut self, sources: impl Into<Sources>, target: StateId) -> TransitionId {
        self.connect_with(sources, target, TransitionOptions::new())
    }

    pub fn connect_with(
        &mut self,
        sources: impl Into<Sources>,
        target: StateId,
        options: TransitionOptions<C>,
    ) -> TransitionId {
        self.push_transition(sources.into(), target, options)
    }

    /// Adds a global transition, valid from every non-final state.
    pub fn connect_any(&mut self, target: StateId) -> TransitionId {
        self.connect_any_with(target, TransitionOptions::new())
    }

    pub fn connect_any_with(
        &mut self,
        target: StateId,
        options: TransitionOptions<C>,
    ) -> TransitionId {
        self.push_transition(Sources::Any, target, options)
    }

    fn push_transition(
        &mut self,
        sources: Sources,
        target: StateId,
        options: TransitionOptions<C>,
    ) -> TransitionId {
        let index = self.transitions.len();
        let id = TransitionId {
            graph: self.id,
            index,
        };
        let (name, explicit_name) = match options.name {
            Some(name) if !name.is_empty() => (name, true),
            _ => (format!("T{}", index + 1), false),
        };
        self.transitions.push(Transition {
            id,
            sources,
            target,
            automatic: options.automatic,
            name,
            explicit_name,
            callback: options.callback,
        });
        id
    }

    /// Freezes the builder into an immutable graph.
    ///
    /// Structural problems are reported by [`Graph::validate`], which
    /// `StateMachine::start` runs.
    pub fn build(self) -> Graph<C> {
        let outgoing = (0..self.states.len())
            .map(|index| {
                let state = StateId {
                    graph: self.id,
                    index,
                };
                let is_final = self.states[index].kind == StateKind::Final;
                self.transitions
                    .iter()
                    .filter(|t| match &t.sources {
                        Sources::Any => !is_final,
                        Sources::States(states) => states.contains(&state),
                    })
                    .map(|t| t.id.index)
                    .collect()
            })
            .collect();

        Graph {
            id: self.id,
            states: self.states,
            transitions: self.transitions,
            initial: self.initial,
            outgoing,
        }
    }
}

impl<C: 'static> Default for GraphBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable graph of states and transitions.
pub struct Graph<C> {
    id: GraphId,
    states: Vec<StateNode<C>>,
    transitions: Vec<Transition<C>>,
    initial: Option<StateId>,
    /// Candidate transition indexes per state, in definition order.
    outgoing: Vec<Vec<usize>>,
}

impl<C> Graph<C> {
    /// Initial state chosen at build time.
    pub fn initial(&self) -> Option<StateId> {
        self.initial
    }

    pub fn contains_state(&self, state: StateId) -> bool {
        state.graph == self.id && state.index < self.states.len()
    }

    pub fn contains_transition(&self, transition: TransitionId) -> bool {
        transition.graph == self.id && transition.index < self.transitions.len()
    }

    pub fn state(&self, state: StateId) -> Option<StateRef<'_>> {
        if !self.contains_state(state) {
            return None;
        }
        let node = &self.states[state.index];
        Some(StateRef {
            id: state,
            name: &node.name,
            kind: node.kind,
        })
    }

    pub fn states(&self) -> impl Iterator<Item = StateRef<'_>> + '_ {
        self.states
            .iter()
            .enumerate()
            .map(move |(index, node)| StateRef {
                id: StateId {
                    graph: self.id,
                    index,
                },
                name: &node.name,
                kind: node.kind,
            })
    }

    pub fn final_states(&self) -> impl Iterator<Item = StateRef<'_>> + '_ {
        self.states().filter(|s| s.is_final())
    }

    pub fn is_final(&self, state: StateId) -> bool {
        self.contains_state(state) && self.states[state.index].kind == StateKind::Final
    }

    pub fn transition(&self, transition: TransitionId) -> Option<&Transition<C>> {
        if self.contains_transition(transition) {
            Some(&self.transitions[transition.index])
        } else {
            None
        }
    }

    /// All transitions in definition order.
    pub fn transitions(&self) -> impl Iterator<Item = &Transition<C>> + '_ {
        self.transitions.iter()
    }

    /// Candidate transitions from `state`: scoped transitions listing it as
    /// a source plus global transitions, in definition order. Final states
    /// have no global candidates.
    pub fn candidates(&self, state: StateId) -> impl Iterator<Item = &Transition<C>> + '_ {
        let indexes: &[usize] = if self.contains_state(state) {
            &self.outgoing[state.index]
        } else {
            &[]
        };
        indexes.iter().map(move |&i| &self.transitions[i])
    }

    pub fn is_candidate(&self, state: StateId, transition: TransitionId) -> bool {
        self.contains_state(state)
            && transition.graph == self.id
            && self.outgoing[state.index].contains(&transition.index)
    }

    /// Checks the graph against its build-time initial state.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_from(self.initial).map(|_| ())
    }

    /// Checks structure and the given initial state; returns the initial
    /// state on success.
    pub(crate) fn validate_from(&self, initial: Option<StateId>) -> Result<StateId, ConfigError> {
        for t in &self.transitions {
            if let Sources::States(sources) = &t.sources {
                if sources.is_empty() {
                    return Err(ConfigError::EmptySources {
                        transition: t.name.clone(),
                    });
                }
                if sources.iter().any(|s| !self.contains_state(*s)) {
                    return Err(ConfigError::ForeignState {
                        transition: t.name.clone(),
                    });
                }
            }
            if !self.contains_state(t.target) {
                return Err(ConfigError::ForeignState {
                    transition: t.name.clone(),
                });
            }
        }

        let initial = initial.ok_or(ConfigError::InitialStateNotSet)?;
        if !self.contains_state(initial) {
            return Err(ConfigError::ForeignInitialState);
        }

        if self.outgoing[initial.index].is_empty() {
            return Err(ConfigError::NoOutgoingTransitions {
                state: self.states[initial.index].name.clone(),
            });
        }

        Ok(initial)
    }

    pub(crate) fn behavior(&self, state: StateId) -> &dyn StateBehavior<C> {
        self.states[state.index].behavior.as_ref()
    }

    /// Name of a state known to belong to this graph.
    pub(crate) fn name_of(&self, state: StateId) -> &str {
        &self.states[state.index].name
    }

    pub(crate) fn state_ref(&self, state: StateId) -> StateRef<'_> {
        let node = &self.states[state.index];
        StateRef {
            id: state,
            name: &node.name,
            kind: node.kind,
        }
    }

    pub(crate) fn log_summary(&self) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        let mut lines = vec![format!(
            "graph: {} states, {} transitions",
            self.states.len(),
            self.transitions.len()
        )];
        for t in &self.transitions {
            let from = match &t.sources {
                Sources::Any => "*".to_string(),
                Sources::States(states) => states
                    .iter()
                    .filter(|s| self.contains_state(**s))
                    .map(|s| self.name_of(*s))
                    .collect::<Vec<_>>()
                    .join(", "),
            };
            let to = if self.contains_state(t.target) {
                self.name_of(t.target)
            } else {
                "?"
            };
            lines.push(format!("  {} -> {} : {}", from, to, t));
        }
        tracing::debug!("{}", lines.join("\n"));
    }
}
