//! Transitions between states.

use crate::graph::GraphId;
use crate::state::{HookResult, StateId};
use std::fmt;

/// Callback run while a transition is applied, after the source state has
/// been exited and before the target state is entered.
pub type Callback<C> = Box<dyn Fn(&mut C) -> HookResult + Send + Sync>;

/// Source side of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sources {
    /// Valid from every non-final state.
    Any,
    /// Valid from any of the listed states.
    States(Vec<StateId>),
}

impl Sources {
    pub fn contains(&self, state: StateId) -> bool {
        match self {
            Sources::Any => true,
            Sources::States(states) => states.contains(&state),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Sources::Any)
    }
}

impl From<StateId> for Sources {
    fn from(state: StateId) -> Self {
        Sources::States(vec![state])
    }
}

impl From<Vec<StateId>> for Sources {
    fn from(states: Vec<StateId>) -> Self {
        Sources::States(states)
    }
}

impl From<&[StateId]> for Sources {
    fn from(states: &[StateId]) -> Self {
        Sources::States(states.to_vec())
    }
}

impl<const N: usize> From<[StateId; N]> for Sources {
    fn from(states: [StateId; N]) -> Self {
        Sources::States(states.to_vec())
    }
}

/// Optional settings for a new transition.
pub struct TransitionOptions<C> {
    pub(crate) automatic: bool,
    pub(crate) name: Option<String>,
    pub(crate) callback: Option<Callback<C>>,
}

impl<C> TransitionOptions<C> {
    pub fn new() -> Self {
        Self {
            automatic: false,
            name: None,
            callback: None,
        }
    }

    /// Lets the machine apply the transition on its own.
    pub fn automatic(mut self) -> Self {
        self.automatic = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn callback<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut C) -> HookResult + Send + Sync + 'static,
    {
        self.callback = Some(Box::new(f));
        self
    }
}

impl<C> Default for TransitionOptions<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque handle to a transition in a specific graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransitionId {
    pub(crate) graph: GraphId,
    pub(crate) index: usize,
}

impl TransitionId {
    /// Position of the transition in its graph, in definition order.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// A transition owned by a graph.
pub struct Transition<C> {
    pub(crate) id: TransitionId,
    pub(crate) sources: Sources,
    pub(crate) target: StateId,
    pub(crate) automatic: bool,
    pub(crate) name: String,
    pub(crate) explicit_name: bool,
    pub(crate) callback: Option<Callback<C>>,
}

impl<C> Transition<C> {
    pub fn id(&self) -> TransitionId {
        self.id
    }

    pub fn sources(&self) -> &Sources {
        &self.sources
    }

    pub fn target(&self) -> StateId {
        self.target
    }

    pub fn is_automatic(&self) -> bool {
        self.automatic
    }

    pub fn is_global(&self) -> bool {
        self.sources.is_any()
    }

    /// Display name; `T<n>` when none was given.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_explicit_name(&self) -> bool {
        self.explicit_name
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Whether `state` is one of this transition's sources.
    ///
    /// Global transitions answer `true` for every state; the graph excludes
    /// final states when building candidate lists.
    pub fn can_transition_from(&self, state: StateId) -> bool {
        self.sources.contains(state)
    }

    pub(crate) fn run_callback(&self, ctx: &mut C) -> HookResult {
        match &self.callback {
            Some(callback) => callback(ctx),
            None => Ok(()),
        }
    }
}

impl<C> fmt::Debug for Transition<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("id", &self.id)
            .field("sources", &self.sources)
            .field("target", &self.target)
            .field("automatic", &self.automatic)
            .field("name", &self.name)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl<C> fmt::Display for Transition<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.automatic {
            write!(f, "{} [auto]", self.name)
        } else {
            write!(f, "{} [manual]", self.name)
        }
    }
}
