//! The machine runtime.
//!
//! A [`StateMachine`] owns a [`Graph`] and a context value. Once started, a
//! dedicated worker thread runs every hook and applies every transition;
//! other threads only enqueue requests and read snapshots.
//!
//! ```
//! use rstm_core::{GraphBuilder, Plain, StateMachine, Status};
//! use std::time::Duration;
//!
//! let mut builder = GraphBuilder::<u32>::new();
//! let closed = builder.add_state("closed", Plain);
//! let done = builder.add_final_state("done");
//! let finish = builder.connect(closed, done);
//! builder.set_initial(closed);
//!
//! let machine = StateMachine::new(builder.build(), 0);
//! machine.start().unwrap();
//! machine.trigger(finish).unwrap();
//! assert!(machine.join(Some(Duration::from_secs(5))).unwrap());
//! assert_eq!(machine.status(), Status::Finished);
//! ```

use crate::config::EngineConfig;
use crate::error::{ConfigError, ErrorInfo, MachineError, TriggerError};
use crate::graph::Graph;
use crate::hooks::{guarded, HookDispatcher, MachineHooks, NoHooks};
use crate::state::{StateId, StateRef};
use crate::transition::TransitionId;
use crate::worker::Worker;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Lifecycle status of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Built but not started.
    Created,
    Running,
    /// Suspended after a hook failure or an explicit halt.
    Halted,
    Stopped,
    /// A final state was reached.
    Finished,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Running => "running",
            Status::Halted => "halted",
            Status::Stopped => "stopped",
            Status::Finished => "finished",
        }
    }

    /// Whether the machine can no longer run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Stopped | Status::Finished)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable machine bookkeeping, guarded by a single mutex.
pub(crate) struct Shared {
    pub(crate) status: Status,
    pub(crate) initial: Option<StateId>,
    pub(crate) current: Option<StateId>,
    /// Accepted triggers waiting for the worker.
    pub(crate) queue: VecDeque<TransitionId>,
    pub(crate) capacity: usize,
    pub(crate) poll_interval: Option<Duration>,
    pub(crate) stop_requested: bool,
    /// Automatic resolution owed after an external halt was lifted.
    pub(crate) resolve_pending: bool,
    pub(crate) pending_error: Option<ErrorInfo>,
    pub(crate) redirect: Option<StateId>,
    /// Worker is parked waiting for work.
    pub(crate) idle: bool,
    /// Bumped on every change of `current`.
    pub(crate) state_seq: u64,
    pub(crate) started: bool,
    pub(crate) terminated: bool,
    /// Token of the live [`Reservation`], if any.
    pub(crate) reserved: Option<u64>,
    pub(crate) reservations: u64,
}

impl Shared {
    fn new(initial: Option<StateId>) -> Self {
        Self {
            status: Status::Created,
            initial,
            current: None,
            queue: VecDeque::new(),
            capacity: 0,
            poll_interval: None,
            stop_requested: false,
            resolve_pending: false,
            pending_error: None,
            redirect: None,
            idle: true,
            state_seq: 0,
            started: false,
            terminated: false,
            reserved: None,
            reservations: 0,
        }
    }

    /// Nothing left for the worker to do until someone asks.
    fn settled(&self) -> bool {
        if !self.started || self.terminated || self.status.is_terminal() {
            return true;
        }
        self.idle
            && !self.stop_requested
            && (self.status == Status::Halted
                || (self.queue.is_empty() && self.redirect.is_none() && !self.resolve_pending))
    }
}

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Any thread through the machine or a transition handle.
    Caller,
    /// The holder of the reservation with this token.
    Holder(u64),
    /// The worker itself, from inside `handle_error`.
    Worker,
}

/// State shared between the machine handle, transition handles and the
/// worker.
pub(crate) struct Inner<C> {
    pub(crate) graph: Graph<C>,
    pub(crate) context: Mutex<C>,
    pub(crate) shared: Mutex<Shared>,
    /// Wakes the worker.
    pub(crate) work: Condvar,
    /// Wakes waiters on state, status and idleness changes.
    pub(crate) changed: Condvar,
}

impl<C> Inner<C> {
    pub(crate) fn status(&self) -> Status {
        self.shared.lock().status
    }

    pub(crate) fn trigger(
        &self,
        transition: TransitionId,
        origin: Origin,
    ) -> Result<(), TriggerError> {
        let t = self
            .graph
            .transition(transition)
            .ok_or(TriggerError::UnknownTransition)?;

        let mut shared = self.shared.lock();
        if shared.stop_requested {
            return Err(TriggerError::NotRunning {
                status: Status::Stopped,
            });
        }
        let current = match (shared.status, shared.current) {
            (Status::Running, Some(current)) => current,
            (status, _) => return Err(TriggerError::NotRunning { status }),
        };

        if let Some(token) = shared.reserved {
            let allowed = match origin {
                Origin::Caller => false,
                Origin::Holder(holder) => holder == token,
                Origin::Worker => true,
            };
            if !allowed {
                return Err(TriggerError::Reserved);
            }
        }

        if !self.graph.is_candidate(current, transition) {
            return Err(TriggerError::InvalidTransition {
                state: self.graph.name_of(current).to_string(),
                transition: t.name().to_string(),
            });
        }

        if shared.capacity > 0 && shared.queue.len() >= shared.capacity {
            return Err(TriggerError::QueueFull {
                capacity: shared.capacity,
            });
        }

        shared.queue.push_back(transition);
        drop(shared);
        self.work.notify_one();
        Ok(())
    }

    /// Lifts a halt. Returns `false` if the machine was not halted.
    pub(crate) fn resume(&self) -> bool {
        let mut shared = self.shared.lock();
        if shared.status != Status::Halted || shared.stop_requested {
            return false;
        }
        shared.status = Status::Running;
        // After a failure the machine waits for a trigger or a redirect; an
        // external halt may have cut automatic resolution short.
        if shared.pending_error.take().is_none() {
            shared.resolve_pending = true;
        }
        drop(shared);

        tracing::info!("machine resumed");
        self.work.notify_one();
        self.changed.notify_all();
        true
    }

    /// Asks the worker to stop. Returns `false` if there was nothing to stop.
    pub(crate) fn request_stop(&self) -> bool {
        let mut shared = self.shared.lock();
        if !shared.started || shared.terminated || shared.stop_requested {
            return false;
        }
        shared.stop_requested = true;
        drop(shared);

        tracing::debug!("stop requested");
        self.work.notify_one();
        self.changed.notify_all();
        true
    }

    /// Moves the machine to `state`. Called by the worker only.
    pub(crate) fn set_current(&self, state: StateId) {
        let mut shared = self.shared.lock();
        shared.current = Some(state);
        shared.state_seq += 1;
        drop(shared);
        self.changed.notify_all();
    }

    /// Blocks until `done` holds or the timeout elapses. Returns whether
    /// `done` held.
    pub(crate) fn wait_until(
        &self,
        timeout: Option<Duration>,
        mut done: impl FnMut(&Shared) -> bool,
    ) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut shared = self.shared.lock();
        while !done(&*shared) {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut shared, deadline).timed_out() {
                        return done(&*shared);
                    }
                }
                None => self.changed.wait(&mut shared),
            }
        }
        true
    }
}

/// A state machine bound to a graph and a context value.
pub struct StateMachine<C> {
    inner: Arc<Inner<C>>,
    config: EngineConfig,
    hooks: Mutex<Option<Box<dyn MachineHooks<C>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Send + 'static> StateMachine<C> {
    /// Creates a machine. The initial state defaults to the graph's.
    pub fn new(graph: Graph<C>, context: C) -> Self {
        let initial = graph.initial();
        Self {
            inner: Arc::new(Inner {
                graph,
                context: Mutex::new(context),
                shared: Mutex::new(Shared::new(initial)),
                work: Condvar::new(),
                changed: Condvar::new(),
            }),
            config: EngineConfig::default(),
            hooks: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Installs machine-level hooks. Must be called before [`start`](Self::start).
    pub fn with_hooks(mut self, hooks: impl MachineHooks<C>) -> Self {
        *self.hooks.get_mut() = Some(Box::new(hooks));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn graph(&self) -> &Graph<C> {
        &self.inner.graph
    }

    /// Overrides the initial state. Only allowed before start.
    pub fn set_initial_state(&self, state: StateId) -> Result<(), MachineError> {
        if !self.inner.graph.contains_state(state) {
            return Err(ConfigError::ForeignInitialState.into());
        }
        let mut shared = self.inner.shared.lock();
        if shared.started {
            return Err(MachineError::AlreadyStarted);
        }
        shared.initial = Some(state);
        Ok(())
    }

    pub fn initial_state(&self) -> Option<StateRef<'_>> {
        let initial = self.inner.shared.lock().initial;
        initial.and_then(|s| self.inner.graph.state(s))
    }

    /// Validates the graph and launches the worker.
    ///
    /// Returns once the worker is running; the initial state is entered on
    /// the worker.
    pub fn start(&self) -> Result<(), MachineError> {
        let mut shared = self.inner.shared.lock();
        if shared.started {
            return Err(MachineError::AlreadyStarted);
        }

        let graph = &self.inner.graph;
        let initial = graph.validate_from(shared.initial)?;
        graph.log_summary();

        let hooks: Box<dyn MachineHooks<C>> = match self.hooks.lock().take() {
            Some(hooks) => hooks,
            None => Box::new(NoHooks),
        };

        shared.started = true;
        shared.status = Status::Running;
        shared.current = Some(initial);
        shared.state_seq += 1;
        shared.idle = false;
        shared.capacity = self.config.queue_capacity;
        shared.poll_interval = self.config.auto_poll_interval();

        let worker = Worker::new(Arc::clone(&self.inner), HookDispatcher::new(hooks));
        let spawned = thread::Builder::new()
            .name(self.config.worker_name.clone())
            .spawn(move || worker.run(initial));

        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                drop(shared);
                tracing::info!(
                    "machine started in state '{}' (worker: {})",
                    graph.name_of(initial),
                    self.config.worker_name
                );
                self.inner.changed.notify_all();
                Ok(())
            }
            Err(e) => {
                shared.started = false;
                shared.status = Status::Created;
                shared.current = None;
                shared.idle = true;
                tracing::error!("failed to spawn worker thread: {}", e);
                Err(MachineError::Spawn(e))
            }
        }
    }

    /// Requests a transition from the current state.
    ///
    /// The request is validated against the current state and queued; the
    /// worker applies it later. Rejections leave the machine untouched.
    pub fn trigger(&self, transition: TransitionId) -> Result<(), TriggerError> {
        self.inner.trigger(transition, Origin::Caller)
    }

    /// Returns a cloneable handle that triggers `transition` on this machine.
    pub fn handle(&self, transition: TransitionId) -> Result<TransitionHandle<C>, TriggerError> {
        if !self.inner.graph.contains_transition(transition) {
            return Err(TriggerError::UnknownTransition);
        }
        Ok(TransitionHandle {
            inner: Arc::clone(&self.inner),
            transition,
        })
    }

    /// Requests a cooperative stop. The step in flight completes first.
    pub fn stop(&self) -> Result<(), MachineError> {
        self.ensure_started()?;
        self.inner.request_stop();
        Ok(())
    }

    /// Suspends a running machine at the next step boundary.
    pub fn halt(&self) -> Result<(), MachineError> {
        let mut shared = self.inner.shared.lock();
        if !shared.started {
            return Err(MachineError::NotStarted);
        }
        if shared.status != Status::Running || shared.stop_requested {
            return Ok(());
        }
        shared.status = Status::Halted;
        drop(shared);

        tracing::info!("machine halted");
        self.inner.changed.notify_all();
        Ok(())
    }

    /// Lifts a halt. Does nothing if the machine is not halted.
    pub fn resume(&self) -> Result<(), MachineError> {
        self.ensure_started()?;
        self.inner.resume();
        Ok(())
    }

    /// Waits for the machine to stop or finish.
    ///
    /// Returns `Ok(false)` if the timeout elapsed first. `None` waits
    /// forever.
    pub fn join(&self, timeout: Option<Duration>) -> Result<bool, MachineError> {
        self.ensure_started()?;

        if self.on_worker_thread() {
            tracing::warn!("join called from the worker thread; not waiting");
            return Ok(self.inner.shared.lock().terminated);
        }

        let terminated = self.inner.wait_until(timeout, |s| s.terminated);
        if terminated {
            self.reap();
        }
        Ok(terminated)
    }

    fn reap(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }

    fn on_worker_thread(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map_or(false, |h| h.thread().id() == thread::current().id())
    }

    fn ensure_started(&self) -> Result<(), MachineError> {
        if self.inner.shared.lock().started {
            Ok(())
        } else {
            Err(MachineError::NotStarted)
        }
    }

    /// Current state; `None` before start.
    pub fn state(&self) -> Option<StateRef<'_>> {
        let current = self.inner.shared.lock().current;
        current.map(|s| self.inner.graph.state_ref(s))
    }

    pub fn is_in(&self, state: StateId) -> bool {
        self.inner.shared.lock().current == Some(state)
    }

    pub fn status(&self) -> Status {
        self.inner.status()
    }

    /// Started and not yet terminated.
    pub fn is_alive(&self) -> bool {
        let shared = self.inner.shared.lock();
        shared.started && !shared.terminated
    }

    pub fn is_halted(&self) -> bool {
        self.status() == Status::Halted
    }

    /// The failure that halted the machine, until it is resumed.
    pub fn pending_error(&self) -> Option<ErrorInfo> {
        self.inner.shared.lock().pending_error.clone()
    }

    /// Whether `transition` is a candidate from the current state and its
    /// target is applicable under the current context.
    pub fn can_transition(&self, transition: TransitionId) -> bool {
        let graph = &self.inner.graph;
        let current = match self.inner.shared.lock().current {
            Some(current) => current,
            None => return false,
        };
        if !graph.is_candidate(current, transition) {
            return false;
        }
        let target = match graph.transition(transition) {
            Some(t) => t.target(),
            None => return false,
        };

        let ctx = self.inner.context.lock();
        matches!(
            guarded(|| graph.behavior(target).is_applicable(&ctx)),
            Ok(true)
        )
    }

    /// Runs `f` with shared access to the context.
    ///
    /// Blocks while a step is in flight.
    pub fn with_context<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        let ctx = self.inner.context.lock();
        f(&ctx)
    }

    /// Snapshot of the context.
    pub fn context(&self) -> C
    where
        C: Clone,
    {
        self.inner.context.lock().clone()
    }

    /// Waits until the current state is one of `states`.
    ///
    /// Gives up early with `false` once the machine terminates elsewhere.
    pub fn wait_for(&self, states: &[StateId], timeout: Option<Duration>) -> bool {
        let reached = |s: &Shared| s.current.map_or(false, |c| states.contains(&c));
        self.inner
            .wait_until(timeout, |s| reached(s) || s.terminated);
        reached(&*self.inner.shared.lock())
    }

    /// Waits for the next state change.
    pub fn wait_next_state(&self, timeout: Option<Duration>) -> bool {
        let seq = self.inner.shared.lock().state_seq;
        self.inner
            .wait_until(timeout, |s| s.state_seq != seq || s.terminated);
        self.inner.shared.lock().state_seq != seq
    }

    /// Waits until the worker has drained accepted triggers and parked, the
    /// machine is halted, or it has terminated.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        self.inner.wait_until(timeout, Shared::settled)
    }

    /// Reserves the machine for the caller.
    ///
    /// Waits until the worker is idle and no other reservation is live. While
    /// the returned [`Reservation`] exists, triggers from anyone else are
    /// rejected with [`TriggerError::Reserved`] and idle polling is paused,
    /// so a sequence of [`Reservation::trigger`] calls runs without
    /// interference. Returns `Ok(None)` if the timeout elapsed first.
    ///
    /// ```
    /// use rstm_core::{GraphBuilder, Plain, StateMachine};
    /// use std::time::Duration;
    ///
    /// let mut builder = GraphBuilder::<()>::new();
    /// let a = builder.add_state("A", Plain);
    /// let b = builder.add_state("B", Plain);
    /// let c = builder.add_state("C", Plain);
    /// let ab = builder.connect(a, b);
    /// let bc = builder.connect(b, c);
    /// builder.set_initial(a);
    ///
    /// let machine = StateMachine::new(builder.build(), ());
    /// machine.start().unwrap();
    /// {
    ///     let reservation = machine.reserve(Some(Duration::from_secs(5))).unwrap().unwrap();
    ///     reservation.trigger(ab).unwrap();
    ///     reservation.trigger(bc).unwrap();
    ///     assert!(reservation.is_in(c));
    /// }
    /// machine.stop().unwrap();
    /// ```
    pub fn reserve(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<Reservation<'_, C>>, MachineError> {
        self.acquire(timeout, |_| true)
    }

    /// Waits until the machine rests in one of `states`, reserves it at that
    /// point and runs `f` with the reservation.
    ///
    /// Returns `Ok(None)` if the timeout elapsed or the machine terminated
    /// elsewhere.
    pub fn when<R>(
        &self,
        states: &[StateId],
        timeout: Option<Duration>,
        f: impl FnOnce(&Reservation<'_, C>) -> R,
    ) -> Result<Option<R>, MachineError> {
        let reached = |s: &Shared| s.current.map_or(false, |c| states.contains(&c));
        Ok(self.acquire(timeout, reached)?.map(|reservation| f(&reservation)))
    }

    fn acquire(
        &self,
        timeout: Option<Duration>,
        ready: impl Fn(&Shared) -> bool,
    ) -> Result<Option<Reservation<'_, C>>, MachineError> {
        self.ensure_started()?;
        if self.on_worker_thread() {
            return Err(MachineError::WorkerThread);
        }

        let inner: &Inner<C> = &self.inner;
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut shared = inner.shared.lock();
        loop {
            if shared.reserved.is_none() && shared.settled() {
                if ready(&*shared) {
                    shared.reservations += 1;
                    let token = shared.reservations;
                    shared.reserved = Some(token);
                    tracing::debug!("machine reserved (token {})", token);
                    return Ok(Some(Reservation { inner, token }));
                }
                if shared.terminated {
                    return Ok(None);
                }
            }

            match deadline {
                Some(deadline) => {
                    if inner.changed.wait_until(&mut shared, deadline).timed_out() {
                        return Ok(None);
                    }
                }
                None => inner.changed.wait(&mut shared),
            }
        }
    }
}

impl<C> fmt::Debug for StateMachine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("StateMachine")
            .field("status", &shared.status)
            .field(
                "state",
                &shared.current.map(|s| self.inner.graph.name_of(s)),
            )
            .field("pending", &shared.queue.len())
            .finish()
    }
}

impl<C> Drop for StateMachine<C> {
    fn drop(&mut self) {
        // The worker owns its own reference and exits on its own.
        self.inner.request_stop();
    }
}

/// Exclusive use of a machine, from [`StateMachine::reserve`] or
/// [`StateMachine::when`]. Released on drop.
///
/// Calling [`trigger`](Self::trigger) from a hook would wait on the worker
/// that runs it; reservations are for threads outside the machine.
pub struct Reservation<'m, C> {
    inner: &'m Inner<C>,
    token: u64,
}

impl<'m, C> Reservation<'m, C> {
    /// Requests a transition and waits until the worker has applied it,
    /// including any automatic transitions that follow.
    ///
    /// A hook failure during the step leaves the machine halted; check
    /// [`status`](Self::status) afterwards.
    pub fn trigger(&self, transition: TransitionId) -> Result<(), TriggerError> {
        self.inner.trigger(transition, Origin::Holder(self.token))?;
        self.inner.wait_until(None, Shared::settled);
        Ok(())
    }

    pub fn state(&self) -> Option<StateRef<'m>> {
        let inner = self.inner;
        let current = inner.shared.lock().current;
        current.map(|s| inner.graph.state_ref(s))
    }

    pub fn is_in(&self, state: StateId) -> bool {
        self.inner.shared.lock().current == Some(state)
    }

    pub fn status(&self) -> Status {
        self.inner.status()
    }

    /// Runs `f` with shared access to the context.
    pub fn with_context<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        let ctx = self.inner.context.lock();
        f(&ctx)
    }

    /// Lifts a halt left by a failed step.
    pub fn resume(&self) -> bool {
        self.inner.resume()
    }

    /// Requests a stop; takes effect once the worker is free.
    pub fn stop(&self) {
        self.inner.request_stop();
    }
}

impl<C> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        let mut shared = self.inner.shared.lock();
        if shared.reserved == Some(self.token) {
            shared.reserved = None;
        }
        drop(shared);
        tracing::debug!("machine released (token {})", self.token);
        self.inner.changed.notify_all();
    }
}

impl<C> fmt::Debug for Reservation<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("token", &self.token)
            .finish()
    }
}

/// Triggers one transition on one machine. Cheap to clone and send.
pub struct TransitionHandle<C> {
    inner: Arc<Inner<C>>,
    transition: TransitionId,
}

impl<C> TransitionHandle<C> {
    pub fn id(&self) -> TransitionId {
        self.transition
    }

    pub fn name(&self) -> &str {
        self.inner
            .graph
            .transition(self.transition)
            .map_or("", |t| t.name())
    }

    pub fn trigger(&self) -> Result<(), TriggerError> {
        self.inner.trigger(self.transition, Origin::Caller)
    }
}

impl<C> Clone for TransitionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            transition: self.transition,
        }
    }
}

impl<C> fmt::Debug for TransitionHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionHandle")
            .field("transition", &self.name())
            .finish()
    }
}
