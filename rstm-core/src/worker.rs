//! The worker loop: the only place hooks run and transitions are applied.

use crate::error::{ErrorInfo, HookPhase};
use crate::hooks::{guarded, HookDispatcher, Recovery};
use crate::machine::{Inner, Status};
use crate::state::{Entry, HookError, HookResult, StateBehavior, StateId};
use crate::transition::TransitionId;
use std::sync::Arc;

/// Outcome of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Continue,
    Finalize,
    Halted,
}

enum Action {
    Stop,
    Redirect(StateId),
    Trigger(TransitionId, StateId),
    Resolve,
}

/// Step abandoned by the last failure.
#[derive(Debug, Clone, Copy)]
struct FailedStep {
    /// `None` for the initial entry.
    from: Option<StateId>,
    destination: StateId,
}

pub(crate) struct Worker<C> {
    inner: Arc<Inner<C>>,
    hooks: HookDispatcher<C>,
    failed: Option<FailedStep>,
}

impl<C: Send + 'static> Worker<C> {
    pub(crate) fn new(inner: Arc<Inner<C>>, hooks: HookDispatcher<C>) -> Self {
        Self {
            inner,
            hooks,
            failed: None,
        }
    }

    pub(crate) fn run(mut self, initial: StateId) {
        let inner = Arc::clone(&self.inner);
        {
            let mut ctx = inner.context.lock();
            self.hooks.start(&mut *ctx);
        }

        let status = match self.enter_initial(initial) {
            Progress::Finalize => Status::Finished,
            Progress::Halted => self.serve(),
            Progress::Continue => match self.resolve_automatic() {
                Progress::Finalize => Status::Finished,
                _ => self.serve(),
            },
        };

        self.finish(status);
    }

    fn enter_initial(&mut self, initial: StateId) -> Progress {
        let inner = Arc::clone(&self.inner);
        let graph = &inner.graph;

        let entered = {
            let mut ctx = inner.context.lock();
            enter(graph.behavior(initial), &mut *ctx)
        };

        match entered {
            Ok(entry) => {
                let state = graph.state_ref(initial);
                tracing::debug!("entered initial state '{}'", state);
                self.hooks.state_applied(state);
                finalize_if(state.is_final(), entry)
            }
            Err(e) => {
                self.fail(
                    ErrorInfo::new(e, initial, None, HookPhase::Entry),
                    FailedStep {
                        from: None,
                        destination: initial,
                    },
                );
                Progress::Halted
            }
        }
    }

    /// Serves requests until the machine stops or finishes.
    fn serve(&mut self) -> Status {
        loop {
            let progress = match self.next_action() {
                Action::Stop => return Status::Stopped,
                Action::Redirect(state) => self.redirect(state),
                Action::Trigger(transition, source) => match self.apply(transition, source) {
                    Progress::Continue => self.resolve_automatic(),
                    other => other,
                },
                Action::Resolve => self.resolve_automatic(),
            };

            if progress == Progress::Finalize {
                return Status::Finished;
            }
        }
    }

    /// Blocks until there is something to do.
    fn next_action(&self) -> Action {
        let inner = &self.inner;
        let mut shared = inner.shared.lock();
        loop {
            if shared.stop_requested {
                return Action::Stop;
            }

            if shared.status == Status::Running {
                if let Some(state) = shared.redirect.take() {
                    shared.idle = false;
                    return Action::Redirect(state);
                }

                if let Some(transition) = shared.queue.pop_front() {
                    shared.idle = false;
                    match shared.current {
                        Some(current) if inner.graph.is_candidate(current, transition) => {
                            return Action::Trigger(transition, current);
                        }
                        current => {
                            tracing::warn!(
                                "dropping stale trigger '{}' in state '{}'",
                                inner.graph.transition(transition).map_or("?", |t| t.name()),
                                current.map_or("?", |s| inner.graph.name_of(s))
                            );
                            continue;
                        }
                    }
                }

                if shared.resolve_pending {
                    shared.resolve_pending = false;
                    shared.idle = false;
                    return Action::Resolve;
                }
            }

            if !shared.idle {
                shared.idle = true;
                inner.changed.notify_all();
            }

            let poll = match shared.status {
                Status::Running => shared.poll_interval,
                _ => None,
            };
            match poll {
                Some(interval) => {
                    let timed_out = inner.work.wait_for(&mut shared, interval).timed_out();
                    let due = shared.status == Status::Running
                        && !shared.stop_requested
                        && shared.reserved.is_none();
                    if timed_out && due {
                        shared.idle = false;
                        return Action::Resolve;
                    }
                }
                None => inner.work.wait(&mut shared),
            }
        }
    }

    /// Applies a transition from `source`.
    fn apply(&mut self, id: TransitionId, source: StateId) -> Progress {
        let inner = Arc::clone(&self.inner);
        let graph = &inner.graph;
        let transition = match graph.transition(id) {
            Some(t) => t,
            None => return Progress::Continue,
        };
        let target = transition.target();
        let step = FailedStep {
            from: Some(source),
            destination: target,
        };

        tracing::debug!(
            "applying {}: '{}' -> '{}'",
            transition,
            graph.name_of(source),
            graph.name_of(target)
        );

        let mut ctx = inner.context.lock();

        if let Err(e) = guarded(|| graph.behavior(source).on_exit(&mut *ctx)) {
            drop(ctx);
            self.fail(ErrorInfo::new(e, source, Some(id), HookPhase::Exit), step);
            return Progress::Halted;
        }

        inner.set_current(target);

        if let Err(e) = guarded(|| transition.run_callback(&mut *ctx)) {
            drop(ctx);
            self.fail(
                ErrorInfo::new(e, target, Some(id), HookPhase::Callback),
                step,
            );
            return Progress::Halted;
        }

        let entered = enter(graph.behavior(target), &mut *ctx);
        drop(ctx);

        match entered {
            Ok(entry) => {
                let from = graph.state_ref(source);
                let to = graph.state_ref(target);
                self.hooks.state_changed(from, to);
                self.hooks.state_applied(to);
                finalize_if(to.is_final(), entry)
            }
            Err(e) => {
                self.fail(ErrorInfo::new(e, target, Some(id), HookPhase::Entry), step);
                Progress::Halted
            }
        }
    }

    /// Applies automatic transitions until none is applicable.
    fn resolve_automatic(&mut self) -> Progress {
        let inner = Arc::clone(&self.inner);
        loop {
            let current = {
                let shared = inner.shared.lock();
                if shared.stop_requested || shared.status != Status::Running {
                    return Progress::Continue;
                }
                match shared.current {
                    Some(current) => current,
                    None => return Progress::Continue,
                }
            };

            let chosen = match self.select_automatic(current) {
                Ok(Some(transition)) => transition,
                Ok(None) => return Progress::Continue,
                Err((e, transition)) => {
                    let destination = inner
                        .graph
                        .transition(transition)
                        .map_or(current, |t| t.target());
                    self.fail(
                        ErrorInfo::new(e, current, Some(transition), HookPhase::Applicability),
                        FailedStep {
                            from: Some(current),
                            destination,
                        },
                    );
                    return Progress::Halted;
                }
            };

            match self.apply(chosen, current) {
                Progress::Continue => continue,
                other => return other,
            }
        }
    }

    /// First automatic candidate, in definition order, whose target is
    /// applicable.
    fn select_automatic(
        &self,
        current: StateId,
    ) -> Result<Option<TransitionId>, (HookError, TransitionId)> {
        let graph = &self.inner.graph;
        let ctx = self.inner.context.lock();
        for t in graph.candidates(current).filter(|t| t.is_automatic()) {
            match guarded(|| graph.behavior(t.target()).is_applicable(&ctx)) {
                Ok(true) => return Ok(Some(t.id())),
                Ok(false) => {}
                Err(e) => return Err((e, t.id())),
            }
        }
        Ok(None)
    }

    /// Continues from a recovery redirect.
    ///
    /// Redirecting to the destination of the failed step re-enters it
    /// normally. Any other state is adopted without running its entry hooks.
    fn redirect(&mut self, state: StateId) -> Progress {
        let inner = Arc::clone(&self.inner);
        let graph = &inner.graph;
        let failed = self.failed.take();
        let previous = inner.shared.lock().current;

        let progress = match failed {
            Some(step) if step.destination == state => {
                tracing::info!("re-entering '{}' after recovery", graph.name_of(state));
                inner.set_current(state);
                let entered = {
                    let mut ctx = inner.context.lock();
                    enter(graph.behavior(state), &mut *ctx)
                };
                match entered {
                    Ok(entry) => {
                        let to = graph.state_ref(state);
                        if let Some(from) = step.from {
                            self.hooks.state_changed(graph.state_ref(from), to);
                        }
                        self.hooks.state_applied(to);
                        finalize_if(to.is_final(), entry)
                    }
                    Err(e) => {
                        self.fail(ErrorInfo::new(e, state, None, HookPhase::Entry), step);
                        Progress::Halted
                    }
                }
            }
            _ => {
                tracing::info!("continuing from '{}' after recovery", graph.name_of(state));
                let to = graph.state_ref(state);
                if previous != Some(state) {
                    inner.set_current(state);
                    if let Some(from) = previous {
                        self.hooks.state_changed(graph.state_ref(from), to);
                    }
                }
                self.hooks.state_applied(to);
                finalize_if(to.is_final(), Entry::Continue)
            }
        };

        match progress {
            Progress::Continue => self.resolve_automatic(),
            other => other,
        }
    }

    /// Halts the machine and hands the failure to the error handler.
    fn fail(&mut self, info: ErrorInfo, step: FailedStep) {
        let inner = Arc::clone(&self.inner);
        tracing::error!(
            "{} in state '{}'; machine halted",
            info,
            inner.graph.name_of(info.state)
        );

        {
            let mut shared = inner.shared.lock();
            shared.status = Status::Halted;
            shared.pending_error = Some(info.clone());
            shared.redirect = None;
            shared.resolve_pending = false;
        }
        inner.changed.notify_all();
        self.failed = Some(step);

        let redirect = {
            let mut ctx = inner.context.lock();
            let mut recovery = Recovery {
                ctx: &mut *ctx,
                inner: &*inner,
                state: info.state,
            };
            self.hooks.handle_error(&info, &mut recovery)
        };

        match redirect {
            Some(state) if inner.graph.contains_state(state) => {
                tracing::debug!("recovery redirect to '{}'", inner.graph.name_of(state));
                inner.shared.lock().redirect = Some(state);
                inner.work.notify_one();
            }
            Some(_) => {
                tracing::warn!("ignoring recovery redirect to a state from another graph");
            }
            None => {}
        }
    }

    /// Marks the machine terminated and runs the machine-level exit hook.
    fn finish(&mut self, status: Status) {
        let inner = Arc::clone(&self.inner);
        {
            let mut shared = inner.shared.lock();
            shared.status = status;
            if !shared.queue.is_empty() {
                tracing::debug!("discarding {} pending triggers", shared.queue.len());
                shared.queue.clear();
            }
            shared.redirect = None;
            shared.resolve_pending = false;
        }
        inner.changed.notify_all();

        {
            let mut ctx = inner.context.lock();
            self.hooks.exit(&mut *ctx);
        }

        let state = {
            let mut shared = inner.shared.lock();
            shared.terminated = true;
            shared.idle = true;
            shared.current
        };
        inner.changed.notify_all();

        tracing::info!(
            "machine {} in state '{}'",
            status,
            state.map_or("?", |s| inner.graph.name_of(s))
        );
    }
}

/// Runs `prepare_entry` then `on_entry`.
fn enter<C>(behavior: &dyn StateBehavior<C>, ctx: &mut C) -> HookResult<Entry> {
    guarded(|| behavior.prepare_entry(&mut *ctx))?;
    guarded(|| behavior.on_entry(&mut *ctx))
}

fn finalize_if(is_final: bool, entry: Entry) -> Progress {
    if is_final || entry == Entry::Finalize {
        Progress::Finalize
    } else {
        Progress::Continue
    }
}
