//! State behaviour and identity.
//!
//! A state is a node in a [`Graph`](crate::Graph). Its identity is a
//! [`StateId`] handed out by the [`GraphBuilder`](crate::GraphBuilder); its
//! behaviour is any [`StateBehavior`] implementation:
//!
//! ```
//! use rstm_core::{Entry, HookResult, StateBehavior};
//!
//! struct Counter;
//!
//! impl StateBehavior<u32> for Counter {
//!     fn on_entry(&self, visits: &mut u32) -> HookResult<Entry> {
//!         *visits += 1;
//!         Ok(Entry::Continue)
//!     }
//! }
//! ```

use crate::graph::GraphId;
use std::fmt;

/// Error returned by user hooks and transition callbacks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a user hook.
pub type HookResult<T = ()> = Result<T, HookError>;

/// Outcome of a successful `on_entry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Entry {
    /// Keep running; automatic transitions are resolved from this state.
    #[default]
    Continue,
    /// Finish the machine as if a final state had been entered.
    Finalize,
}

/// Behaviour attached to a state.
///
/// Every hook runs on the machine's worker thread and receives the machine
/// context. All hooks have no-op defaults.
pub trait StateBehavior<C>: Send + Sync {
    /// Whether the machine may enter this state right now.
    ///
    /// Evaluated on the destination state of each automatic transition
    /// candidate. Not evaluated for the initial state.
    fn is_applicable(&self, _ctx: &C) -> HookResult<bool> {
        Ok(true)
    }

    /// Called immediately before `on_entry` on every entry.
    ///
    /// Intended for resetting per-visit state; keep it short.
    fn prepare_entry(&self, _ctx: &mut C) -> HookResult {
        Ok(())
    }

    /// Called when the machine enters this state.
    ///
    /// The machine's current state already points at this state when the
    /// hook runs. Return [`Entry::Finalize`] to finish the machine.
    fn on_entry(&self, _ctx: &mut C) -> HookResult<Entry> {
        Ok(Entry::Continue)
    }

    /// Called before the machine leaves this state.
    ///
    /// A failure aborts the step; the machine stays in this state.
    fn on_exit(&self, _ctx: &mut C) -> HookResult {
        Ok(())
    }
}

/// A state with no behaviour.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plain;

impl<C> StateBehavior<C> for Plain {}

type ApplicableFn<C> = Box<dyn Fn(&C) -> HookResult<bool> + Send + Sync>;
type EntryFn<C> = Box<dyn Fn(&mut C) -> HookResult<Entry> + Send + Sync>;
type ContextFn<C> = Box<dyn Fn(&mut C) -> HookResult + Send + Sync>;

/// A state whose hooks are closures.
///
/// ```
/// use rstm_core::{Entry, FnState};
///
/// let state = FnState::<Vec<String>>::new()
///     .when(|log| Ok(log.len() < 3))
///     .entering(|log| {
///         log.push("entered".to_string());
///         Ok(Entry::Continue)
///     });
/// # let _ = state;
/// ```
pub struct FnState<C> {
    applicable: Option<ApplicableFn<C>>,
    prepare: Option<ContextFn<C>>,
    entry: Option<EntryFn<C>>,
    exit: Option<ContextFn<C>>,
}

impl<C> FnState<C> {
    pub fn new() -> Self {
        Self {
            applicable: None,
            prepare: None,
            entry: None,
            exit: None,
        }
    }

    /// Sets the applicability predicate.
    pub fn when<F>(mut self, f: F) -> Self
    where
        F: Fn(&C) -> HookResult<bool> + Send + Sync + 'static,
    {
        self.applicable = Some(Box::new(f));
        self
    }

    pub fn prepare<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut C) -> HookResult + Send + Sync + 'static,
    {
        self.prepare = Some(Box::new(f));
        self
    }

    /// Sets the `on_entry` hook.
    pub fn entering<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut C) -> HookResult<Entry> + Send + Sync + 'static,
    {
        self.entry = Some(Box::new(f));
        self
    }

    /// Sets the `on_exit` hook.
    pub fn exiting<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut C) -> HookResult + Send + Sync + 'static,
    {
        self.exit = Some(Box::new(f));
        self
    }
}

impl<C> Default for FnState<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> StateBehavior<C> for FnState<C> {
    fn is_applicable(&self, ctx: &C) -> HookResult<bool> {
        self.applicable.as_ref().map_or(Ok(true), |f| f(ctx))
    }

    fn prepare_entry(&self, ctx: &mut C) -> HookResult {
        self.prepare.as_ref().map_or(Ok(()), |f| f(ctx))
    }

    fn on_entry(&self, ctx: &mut C) -> HookResult<Entry> {
        self.entry.as_ref().map_or(Ok(Entry::Continue), |f| f(ctx))
    }

    fn on_exit(&self, ctx: &mut C) -> HookResult {
        self.exit.as_ref().map_or(Ok(()), |f| f(ctx))
    }
}

/// Kind of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Normal,
    /// Entering a final state finishes the machine.
    Final,
}

/// Opaque handle to a state in a specific graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId {
    pub(crate) graph: GraphId,
    pub(crate) index: usize,
}

impl StateId {
    /// Position of the state in its graph, in creation order.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Borrowed view of a state: identity, name and kind.
#[derive(Debug, Clone, Copy)]
pub struct StateRef<'g> {
    pub(crate) id: StateId,
    pub(crate) name: &'g str,
    pub(crate) kind: StateKind,
}

impl<'g> StateRef<'g> {
    pub fn id(&self) -> StateId {
        self.id
    }

    pub fn name(&self) -> &'g str {
        self.name
    }

    pub fn kind(&self) -> StateKind {
        self.kind
    }

    pub fn is_final(&self) -> bool {
        self.kind == StateKind::Final
    }
}

impl PartialEq for StateRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for StateRef<'_> {}

impl PartialEq<StateId> for StateRef<'_> {
    fn eq(&self, other: &StateId) -> bool {
        self.id == *other
    }
}

impl fmt::Display for StateRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
