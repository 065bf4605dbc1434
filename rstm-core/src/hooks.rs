//! Machine-level lifecycle hooks and error recovery.
//!
//! All hooks run on the worker thread, in step order. A slow hook stalls
//! the machine.

use crate::error::ErrorInfo;
use crate::graph::Graph;
use crate::machine::{Inner, Origin, Status};
use crate::state::{HookResult, StateId, StateRef};
use crate::transition::TransitionId;
use crate::TriggerError;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Observers and error handler for a machine.
///
/// ```
/// use rstm_core::{ErrorInfo, MachineHooks, Recovery, StateId, StateRef};
///
/// struct Retry;
///
/// impl MachineHooks<u32> for Retry {
///     fn on_state_changed(&mut self, from: StateRef<'_>, to: StateRef<'_>) {
///         println!("{} -> {}", from, to);
///     }
///
///     fn handle_error(
///         &mut self,
///         _error: &ErrorInfo,
///         recovery: &mut Recovery<'_, u32>,
///     ) -> Option<StateId> {
///         *recovery.context_mut() += 1;
///         recovery.resume();
///         Some(recovery.state().id())
///     }
/// }
/// ```
pub trait MachineHooks<C>: Send + 'static {
    /// Called on the worker before the initial state is entered.
    fn on_start(&mut self, _ctx: &mut C) {}

    /// Called after the target state's `on_entry` completed.
    fn on_state_changed(&mut self, _from: StateRef<'_>, _to: StateRef<'_>) {}

    /// Called after a state has been applied, including the initial state.
    fn on_state_applied(&mut self, _state: StateRef<'_>) {}

    /// Called once when the machine stops or finishes.
    fn on_exit(&mut self, _ctx: &mut C) {}

    /// Decides how to recover from a hook failure.
    ///
    /// The machine is halted while this runs. Call [`Recovery::resume`] to
    /// leave the halted state. A returned state is applied once the machine
    /// runs again. The default leaves the machine halted.
    ///
    /// The context lock is held for the whole call, so
    /// [`StateMachine::context`](crate::StateMachine::context) and
    /// [`StateMachine::with_context`](crate::StateMachine::with_context)
    /// block on other threads until it returns. Reach the context through
    /// [`Recovery::context`] and [`Recovery::context_mut`] instead.
    fn handle_error(
        &mut self,
        _error: &ErrorInfo,
        _recovery: &mut Recovery<'_, C>,
    ) -> Option<StateId> {
        None
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl<C> MachineHooks<C> for NoHooks {}

/// Access given to [`MachineHooks::handle_error`].
pub struct Recovery<'a, C> {
    pub(crate) ctx: &'a mut C,
    pub(crate) inner: &'a Inner<C>,
    pub(crate) state: StateId,
}

impl<'a, C: Send + 'static> Recovery<'a, C> {
    pub fn context(&self) -> &C {
        &*self.ctx
    }

    /// Mutable context, for repairing whatever made the hook fail.
    pub fn context_mut(&mut self) -> &mut C {
        &mut *self.ctx
    }

    /// The machine's current state.
    pub fn state(&self) -> StateRef<'a> {
        let inner = self.inner;
        inner.graph.state_ref(self.state)
    }

    pub fn graph(&self) -> &'a Graph<C> {
        let inner = self.inner;
        &inner.graph
    }

    pub fn status(&self) -> Status {
        self.inner.status()
    }

    /// Lets the machine run again once the handler returns.
    pub fn resume(&self) {
        self.inner.resume();
    }

    /// Requests a stop; the machine stops once the handler returns.
    pub fn stop(&self) {
        self.inner.request_stop();
    }

    /// Queues a trigger. Rejected unless [`resume`](Self::resume) was
    /// called first.
    pub fn trigger(&self, transition: TransitionId) -> Result<(), TriggerError> {
        self.inner.trigger(transition, Origin::Worker)
    }
}

/// Runs machine-level hooks on the worker thread.
///
/// Observer panics are logged and swallowed; state hook panics are turned
/// into hook errors by [`guarded`].
pub(crate) struct HookDispatcher<C> {
    hooks: Box<dyn MachineHooks<C>>,
}

impl<C: Send + 'static> HookDispatcher<C> {
    pub(crate) fn new(hooks: Box<dyn MachineHooks<C>>) -> Self {
        Self { hooks }
    }

    pub(crate) fn start(&mut self, ctx: &mut C) {
        let hooks = &mut self.hooks;
        observe("on_start", || hooks.on_start(ctx));
    }

    pub(crate) fn state_changed(&mut self, from: StateRef<'_>, to: StateRef<'_>) {
        let hooks = &mut self.hooks;
        observe("on_state_changed", || hooks.on_state_changed(from, to));
    }

    pub(crate) fn state_applied(&mut self, state: StateRef<'_>) {
        let hooks = &mut self.hooks;
        observe("on_state_applied", || hooks.on_state_applied(state));
    }

    pub(crate) fn exit(&mut self, ctx: &mut C) {
        let hooks = &mut self.hooks;
        observe("on_exit", || hooks.on_exit(ctx));
    }

    /// Runs the error handler. A panicking handler yields no redirect.
    pub(crate) fn handle_error(
        &mut self,
        error: &ErrorInfo,
        recovery: &mut Recovery<'_, C>,
    ) -> Option<StateId> {
        let hooks = &mut self.hooks;
        match panic::catch_unwind(AssertUnwindSafe(|| hooks.handle_error(error, recovery))) {
            Ok(redirect) => redirect,
            Err(payload) => {
                tracing::error!(
                    "handle_error panicked: {}; machine stays halted",
                    panic_message(payload.as_ref())
                );
                None
            }
        }
    }
}

fn observe(hook: &str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        tracing::warn!("{} panicked: {}", hook, panic_message(payload.as_ref()));
    }
}

/// Runs a state hook, converting a panic into a hook error.
pub(crate) fn guarded<T>(f: impl FnOnce() -> HookResult<T>) -> HookResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(format!("hook panicked: {}", panic_message(payload.as_ref())).into()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
