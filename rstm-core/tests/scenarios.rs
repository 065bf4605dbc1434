//! End-to-end machine scenarios: triggers, automatic resolution, recovery
//! and shutdown, driven from test threads.

use parking_lot::Mutex;
use rstm_core::{
    EngineConfig, Entry, ErrorInfo, FnState, GraphBuilder, HookPhase, MachineError,
    MachineHooks, Plain, Recovery, StateId, StateMachine, StateRef, Status, TransitionId,
    TransitionOptions, TriggerError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar};
use std::thread;
use std::time::Duration;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

/// Records machine-level events as strings.
#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().push(event);
    }
}

impl<C: Send + 'static> MachineHooks<C> for Recorder {
    fn on_start(&mut self, _ctx: &mut C) {
        self.push("start".to_string());
    }

    fn on_state_changed(&mut self, from: StateRef<'_>, to: StateRef<'_>) {
        self.push(format!("changed {}->{}", from, to));
    }

    fn on_state_applied(&mut self, state: StateRef<'_>) {
        self.push(format!("applied {}", state));
    }

    fn on_exit(&mut self, _ctx: &mut C) {
        self.push("exit".to_string());
    }
}

/// Counts failures, optionally resumes and redirects.
struct Handler {
    calls: Arc<AtomicUsize>,
    resume: bool,
    redirect: Option<StateId>,
    redirect_to_failed: bool,
}

impl Handler {
    fn new(calls: &Arc<AtomicUsize>) -> Self {
        Self {
            calls: Arc::clone(calls),
            resume: true,
            redirect: None,
            redirect_to_failed: false,
        }
    }
}

impl<C: Send + 'static> MachineHooks<C> for Handler {
    fn handle_error(
        &mut self,
        _error: &ErrorInfo,
        recovery: &mut Recovery<'_, C>,
    ) -> Option<StateId> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.resume {
            recovery.resume();
        }
        if self.redirect_to_failed {
            return Some(recovery.state().id());
        }
        self.redirect
    }
}

fn log_entry(name: &'static str) -> FnState<Vec<String>> {
    FnState::new().entering(move |log: &mut Vec<String>| {
        log.push(format!("enter {}", name));
        Ok(Entry::Continue)
    })
}

#[test]
fn test_manual_then_automatic_to_final() {
    let mut builder = GraphBuilder::<Vec<String>>::new();
    let a = builder.add_state("A", log_entry("A"));
    let b = builder.add_state("B", log_entry("B"));
    let done = builder.add_final_state("F");
    let ab = builder.connect(a, b);
    builder.connect_with(b, done, TransitionOptions::new().automatic());
    builder.set_initial(a);

    let recorder = Recorder::default();
    let machine = StateMachine::new(builder.build(), Vec::new()).with_hooks(recorder.clone());
    machine.start().unwrap();
    machine.trigger(ab).unwrap();

    assert!(machine.join(TIMEOUT).unwrap());
    assert_eq!(machine.status(), Status::Finished);
    assert_eq!(machine.state().unwrap().name(), "F");
    assert_eq!(machine.context(), vec!["enter A", "enter B"]);
    assert_eq!(
        recorder.events(),
        vec![
            "start",
            "applied A",
            "changed A->B",
            "applied B",
            "changed B->F",
            "applied F",
            "exit",
        ]
    );
}

#[test]
fn test_automatic_fires_without_trigger() {
    let mut builder = GraphBuilder::<()>::new();
    let a = builder.add_state("A", Plain);
    let b = builder.add_state("B", Plain);
    let c = builder.add_state("C", Plain);
    builder.connect_with(a, b, TransitionOptions::new().automatic());
    builder.connect_with(b, c, TransitionOptions::new().automatic());
    builder.connect(c, a);
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), ());
    machine.start().unwrap();
    assert!(machine.wait_for(&[c], TIMEOUT));
    assert!(machine.wait_idle(TIMEOUT));
    assert!(machine.is_in(c));
    assert_eq!(machine.status(), Status::Running);

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_first_applicable_automatic_wins() {
    let mut builder = GraphBuilder::<u32>::new();
    let start = builder.add_state("start", Plain);
    let low = builder.add_state("low", FnState::new().when(|n: &u32| Ok(*n < 10)));
    let high = builder.add_state("high", FnState::new().when(|n: &u32| Ok(*n >= 10)));
    let any = builder.add_state("any", Plain);
    builder.connect_with(start, low, TransitionOptions::new().automatic());
    builder.connect_with(start, high, TransitionOptions::new().automatic());
    builder.connect_with(start, any, TransitionOptions::new().automatic());
    builder.connect_any(start);
    builder.set_initial(start);

    let machine = StateMachine::new(builder.build(), 42);
    machine.start().unwrap();
    assert!(machine.wait_for(&[high], TIMEOUT));
    assert!(machine.wait_idle(TIMEOUT));
    assert!(machine.is_in(high));

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_multi_source_reset() {
    let mut builder = GraphBuilder::<()>::new();
    let a = builder.add_state("A", Plain);
    let b = builder.add_state("B", Plain);
    let c = builder.add_state("C", Plain);
    let ab = builder.connect(a, b);
    let bc = builder.connect(b, c);
    let reset = builder.connect_with([a, b, c], a, TransitionOptions::new().named("reset"));
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), ());
    machine.start().unwrap();

    machine.trigger(ab).unwrap();
    assert!(machine.wait_for(&[b], TIMEOUT));
    machine.trigger(bc).unwrap();
    assert!(machine.wait_for(&[c], TIMEOUT));

    machine.trigger(reset).unwrap();
    assert!(machine.wait_for(&[a], TIMEOUT));
    machine.trigger(reset).unwrap();
    assert!(machine.wait_idle(TIMEOUT));
    assert!(machine.is_in(a));

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_global_transition() {
    let mut builder = GraphBuilder::<()>::new();
    let a = builder.add_state("A", Plain);
    let b = builder.add_state("B", Plain);
    let done = builder.add_final_state("done");
    let ab = builder.connect(a, b);
    let finish = builder.connect(b, done);
    let home = builder.connect_any_with(a, TransitionOptions::new().named("home"));
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), ());
    machine.start().unwrap();

    machine.trigger(ab).unwrap();
    assert!(machine.wait_for(&[b], TIMEOUT));
    machine.trigger(home).unwrap();
    assert!(machine.wait_for(&[a], TIMEOUT));

    machine.trigger(ab).unwrap();
    assert!(machine.wait_for(&[b], TIMEOUT));
    machine.trigger(finish).unwrap();
    assert!(machine.join(TIMEOUT).unwrap());

    assert!(matches!(
        machine.trigger(home),
        Err(TriggerError::NotRunning {
            status: Status::Finished
        })
    ));
    assert!(machine.is_in(done));
}

#[test]
fn test_entry_failure_halts_until_resumed() {
    let mut builder = GraphBuilder::<()>::new();
    let start = builder.add_state("start", Plain);
    let a = builder.add_state(
        "A",
        FnState::new().entering(|_: &mut ()| Err("sensor offline".into())),
    );
    let b = builder.add_state("B", Plain);
    let to_a = builder.connect(start, a);
    let ab = builder.connect(a, b);
    builder.set_initial(start);

    let machine = StateMachine::new(builder.build(), ());
    machine.start().unwrap();
    machine.trigger(to_a).unwrap();

    assert!(machine.wait_for(&[a], TIMEOUT));
    assert!(machine.wait_idle(TIMEOUT));
    assert_eq!(machine.status(), Status::Halted);
    assert!(machine.is_halted());

    let info = machine.pending_error().unwrap();
    assert_eq!(info.state, a);
    assert_eq!(info.transition, Some(to_a));
    assert_eq!(info.phase, HookPhase::Entry);
    assert_eq!(info.to_string(), "on_entry failed: sensor offline");

    assert!(matches!(
        machine.trigger(ab),
        Err(TriggerError::NotRunning {
            status: Status::Halted
        })
    ));

    machine.resume().unwrap();
    assert_eq!(machine.status(), Status::Running);
    assert!(machine.pending_error().is_none());
    assert!(machine.is_in(a));

    machine.trigger(ab).unwrap();
    assert!(machine.wait_for(&[b], TIMEOUT));

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_handle_error_called_once_and_resumes() {
    let mut builder = GraphBuilder::<()>::new();
    let a = builder.add_state(
        "A",
        FnState::new().entering(|_: &mut ()| Err("boom".into())),
    );
    let b = builder.add_state("B", Plain);
    let ab = builder.connect(a, b);
    builder.set_initial(a);

    let calls = Arc::new(AtomicUsize::new(0));
    let machine = StateMachine::new(builder.build(), ()).with_hooks(Handler::new(&calls));
    machine.start().unwrap();

    assert!(machine.wait_idle(TIMEOUT));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(machine.status(), Status::Running);
    assert!(machine.is_in(a));

    machine.trigger(ab).unwrap();
    assert!(machine.wait_for(&[b], TIMEOUT));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_exit_failure_keeps_source_state() {
    let mut builder = GraphBuilder::<()>::new();
    let a = builder.add_state(
        "A",
        FnState::new().exiting(|_: &mut ()| Err("door jammed".into())),
    );
    let b = builder.add_state("B", Plain);
    let ab = builder.connect(a, b);
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), ());
    machine.start().unwrap();
    machine.trigger(ab).unwrap();

    assert!(machine.wait_idle(TIMEOUT));
    assert!(machine.is_halted());
    assert!(machine.is_in(a));
    let info = machine.pending_error().unwrap();
    assert_eq!(info.phase, HookPhase::Exit);
    assert_eq!(info.state, a);

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
    assert_eq!(machine.status(), Status::Stopped);
}

#[test]
fn test_callback_failure_lands_in_target() {
    let mut builder = GraphBuilder::<Vec<String>>::new();
    let a = builder.add_state("A", Plain);
    let b = builder.add_state("B", log_entry("B"));
    let ab = builder.connect_with(
        a,
        b,
        TransitionOptions::new().callback(|_: &mut Vec<String>| Err("bad payload".into())),
    );
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), Vec::new());
    machine.start().unwrap();
    machine.trigger(ab).unwrap();

    assert!(machine.wait_idle(TIMEOUT));
    let info = machine.pending_error().unwrap();
    assert_eq!(info.phase, HookPhase::Callback);
    assert_eq!(info.state, b);
    assert!(machine.is_in(b));
    assert!(machine.context().is_empty());

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_redirect_skips_entry_and_resolves() {
    let mut builder = GraphBuilder::<Vec<String>>::new();
    let a = builder.add_state(
        "A",
        FnState::new().exiting(|_: &mut Vec<String>| Err("stuck".into())),
    );
    let b = builder.add_state("B", log_entry("B"));
    let safe = builder.add_state("safe", log_entry("safe"));
    let done = builder.add_final_state_with("done", log_entry("done"));
    let ab = builder.connect(a, b);
    builder.connect_with(safe, done, TransitionOptions::new().automatic());
    builder.set_initial(a);

    let calls = Arc::new(AtomicUsize::new(0));
    let mut handler = Handler::new(&calls);
    handler.redirect = Some(safe);

    let recorder = Recorder::default();
    let machine = StateMachine::new(builder.build(), Vec::new()).with_hooks(CombinedHooks {
        handler,
        recorder: recorder.clone(),
    });
    machine.start().unwrap();
    machine.trigger(ab).unwrap();

    assert!(machine.join(TIMEOUT).unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(machine.is_in(done));
    assert_eq!(machine.context(), vec!["enter done"]);
    assert!(recorder
        .events()
        .contains(&"changed A->safe".to_string()));
}

#[test]
fn test_redirect_to_failed_state_reenters() {
    let mut builder = GraphBuilder::<u32>::new();
    let a = builder.add_state("A", Plain);
    let b = builder.add_state(
        "B",
        FnState::new().entering(|attempts: &mut u32| {
            *attempts += 1;
            if *attempts == 1 {
                Err("not yet".into())
            } else {
                Ok(Entry::Continue)
            }
        }),
    );
    let ab = builder.connect(a, b);
    builder.connect(b, a);
    builder.set_initial(a);

    let calls = Arc::new(AtomicUsize::new(0));
    let mut handler = Handler::new(&calls);
    handler.redirect_to_failed = true;

    let recorder = Recorder::default();
    let machine = StateMachine::new(builder.build(), 0u32).with_hooks(CombinedHooks {
        handler,
        recorder: recorder.clone(),
    });
    machine.start().unwrap();
    machine.trigger(ab).unwrap();

    assert!(machine.wait_for(&[b], TIMEOUT));
    assert!(machine.wait_idle(TIMEOUT));
    assert_eq!(machine.status(), Status::Running);
    assert_eq!(machine.context(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(recorder.events().contains(&"changed A->B".to_string()));

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_unrecovered_halt_blocks_join() {
    let mut builder = GraphBuilder::<()>::new();
    let a = builder.add_state(
        "A",
        FnState::new().entering(|_: &mut ()| Err("broken".into())),
    );
    let b = builder.add_state("B", Plain);
    builder.connect(a, b);
    builder.set_initial(a);

    let calls = Arc::new(AtomicUsize::new(0));
    let mut handler = Handler::new(&calls);
    handler.resume = false;

    let machine = StateMachine::new(builder.build(), ()).with_hooks(handler);
    machine.start().unwrap();

    assert!(machine.wait_idle(TIMEOUT));
    assert!(machine.is_halted());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!machine.join(Some(Duration::from_millis(50))).unwrap());

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
    assert_eq!(machine.status(), Status::Stopped);
}

#[test]
fn test_panicking_hook_becomes_error() {
    let mut builder = GraphBuilder::<()>::new();
    let a = builder.add_state(
        "A",
        FnState::new().entering(|_: &mut ()| panic!("wire loose")),
    );
    let b = builder.add_state("B", Plain);
    builder.connect(a, b);
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), ());
    machine.start().unwrap();

    assert!(machine.wait_idle(TIMEOUT));
    let info = machine.pending_error().unwrap();
    assert_eq!(info.error.to_string(), "hook panicked: wire loose");
    assert!(machine.is_alive());

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_panicking_handler_stays_halted() {
    struct Panicky;

    impl MachineHooks<()> for Panicky {
        fn on_state_applied(&mut self, _state: StateRef<'_>) {
            panic!("observer bug");
        }

        fn handle_error(
            &mut self,
            _error: &ErrorInfo,
            _recovery: &mut Recovery<'_, ()>,
        ) -> Option<StateId> {
            panic!("handler bug");
        }
    }

    let mut builder = GraphBuilder::<()>::new();
    let a = builder.add_state("A", Plain);
    let b = builder.add_state(
        "B",
        FnState::new().entering(|_: &mut ()| Err("nope".into())),
    );
    let ab = builder.connect(a, b);
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), ()).with_hooks(Panicky);
    machine.start().unwrap();
    assert!(machine.wait_idle(TIMEOUT));
    assert_eq!(machine.status(), Status::Running);

    machine.trigger(ab).unwrap();
    assert!(machine.wait_for(&[b], TIMEOUT));
    assert!(machine.wait_idle(TIMEOUT));
    assert!(machine.is_halted());

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_halt_and_resume() {
    let mut builder = GraphBuilder::<()>::new();
    let a = builder.add_state("A", Plain);
    let b = builder.add_state("B", Plain);
    let ab = builder.connect(a, b);
    let ba = builder.connect(b, a);
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), ());
    machine.start().unwrap();
    assert!(machine.wait_idle(TIMEOUT));

    machine.halt().unwrap();
    assert!(machine.is_halted());
    assert!(machine.pending_error().is_none());
    assert!(matches!(
        machine.trigger(ab),
        Err(TriggerError::NotRunning {
            status: Status::Halted
        })
    ));

    machine.resume().unwrap();
    machine.trigger(ab).unwrap();
    assert!(machine.wait_for(&[b], TIMEOUT));
    machine.trigger(ba).unwrap();
    assert!(machine.wait_for(&[a], TIMEOUT));

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_stop_runs_exit_hook_once() {
    let mut builder = GraphBuilder::<()>::new();
    let a = builder.add_state("A", Plain);
    let b = builder.add_state("B", Plain);
    builder.connect(a, b);
    builder.set_initial(a);

    let recorder = Recorder::default();
    let machine = StateMachine::new(builder.build(), ()).with_hooks(recorder.clone());
    machine.start().unwrap();
    machine.stop().unwrap();
    machine.stop().unwrap();

    assert!(machine.join(TIMEOUT).unwrap());
    assert!(machine.join(TIMEOUT).unwrap());
    assert_eq!(machine.status(), Status::Stopped);
    let exits = recorder.events().iter().filter(|e| *e == "exit").count();
    assert_eq!(exits, 1);
}

#[test]
fn test_entry_finalize_finishes_machine() {
    let mut builder = GraphBuilder::<()>::new();
    let a = builder.add_state("A", Plain);
    let b = builder.add_state("B", FnState::new().entering(|_: &mut ()| Ok(Entry::Finalize)));
    let ab = builder.connect(a, b);
    builder.connect(b, a);
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), ());
    machine.start().unwrap();
    machine.trigger(ab).unwrap();

    assert!(machine.join(TIMEOUT).unwrap());
    assert_eq!(machine.status(), Status::Finished);
    assert!(machine.is_in(b));
}

#[test]
fn test_concurrent_triggers_are_serialized() {
    let mut builder = GraphBuilder::<u64>::new();
    let a = builder.add_state("A", Plain);
    let tick = builder.connect_with(
        a,
        a,
        TransitionOptions::new().named("tick").callback(|n: &mut u64| {
            *n += 1;
            Ok(())
        }),
    );
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), 0u64);
    machine.start().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let handle = machine.handle(tick).unwrap();
            thread::spawn(move || {
                for _ in 0..50 {
                    handle.trigger().unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert!(machine.wait_idle(TIMEOUT));
    assert_eq!(machine.context(), 200);

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_stale_trigger_is_dropped() {
    let mut builder = GraphBuilder::<()>::new();
    let a = builder.add_state("A", Plain);
    let b = builder.add_state("B", Plain);
    let c = builder.add_state("C", Plain);
    let go = builder.connect(a, b);
    let alt = builder.connect(a, c);
    builder.connect([b, c], a);
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), ());
    machine.start().unwrap();

    machine.trigger(go).unwrap();
    match machine.trigger(alt) {
        Ok(()) => {}
        Err(TriggerError::InvalidTransition { .. }) => {}
        Err(other) => panic!("unexpected rejection: {}", other),
    }

    assert!(machine.wait_idle(TIMEOUT));
    assert!(machine.is_in(b));

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

/// Blocks a hook until opened.
#[derive(Clone, Default)]
struct Gate(Arc<(std::sync::Mutex<bool>, Condvar)>);

impl Gate {
    fn wait(&self) {
        let (lock, cvar) = &*self.0;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
    }

    fn open(&self) {
        let (lock, cvar) = &*self.0;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }
}

#[test]
fn test_queue_capacity() {
    let gate = Gate::default();
    let blocked = gate.clone();

    let mut builder = GraphBuilder::<()>::new();
    let a = builder.add_state("A", Plain);
    let b = builder.add_state(
        "B",
        FnState::new().entering(move |_: &mut ()| {
            blocked.wait();
            Ok(Entry::Continue)
        }),
    );
    let ab = builder.connect(a, b);
    let back = builder.connect(b, a);
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), ())
        .with_config(EngineConfig::default().with_queue_capacity(1));
    machine.start().unwrap();
    machine.trigger(ab).unwrap();
    assert!(machine.wait_for(&[b], TIMEOUT));

    machine.trigger(back).unwrap();
    let err = machine.trigger(back).unwrap_err();
    assert!(matches!(err, TriggerError::QueueFull { capacity: 1 }));

    gate.open();
    assert!(machine.wait_for(&[a], TIMEOUT));
    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_poll_reevaluates_automatic() {
    let ready = Arc::new(AtomicBool::new(false));

    let mut builder = GraphBuilder::<Arc<AtomicBool>>::new();
    let waiting = builder.add_state("waiting", Plain);
    let go = builder.add_state(
        "go",
        FnState::new().when(|flag: &Arc<AtomicBool>| Ok(flag.load(Ordering::SeqCst))),
    );
    builder.connect_with(waiting, go, TransitionOptions::new().automatic());
    builder.connect(go, waiting);
    builder.set_initial(waiting);

    let machine = StateMachine::new(builder.build(), Arc::clone(&ready)).with_config(
        EngineConfig::default().with_auto_poll_interval(Duration::from_millis(10)),
    );
    machine.start().unwrap();
    assert!(!machine.wait_for(&[go], Some(Duration::from_millis(50))));

    ready.store(true, Ordering::SeqCst);
    assert!(machine.wait_for(&[go], TIMEOUT));

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_lifecycle_errors() {
    let mut builder = GraphBuilder::<()>::new();
    let a = builder.add_state("A", Plain);
    let b = builder.add_state("B", Plain);
    builder.connect(a, b);
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), ());
    assert!(matches!(machine.join(None), Err(MachineError::NotStarted)));
    machine.start().unwrap();
    assert!(matches!(machine.start(), Err(MachineError::AlreadyStarted)));
    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_applicability_failure_halts_in_source() {
    let broken = Arc::new(AtomicBool::new(true));
    let guard = Arc::clone(&broken);

    let mut builder = GraphBuilder::<()>::new();
    let a = builder.add_state("A", Plain);
    let b = builder.add_state(
        "B",
        FnState::new().when(move |_: &()| {
            if guard.swap(false, Ordering::SeqCst) {
                Err("guard broke".into())
            } else {
                Ok(true)
            }
        }),
    );
    let auto = builder.connect_with(a, b, TransitionOptions::new().automatic());
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), ());
    machine.start().unwrap();

    assert!(machine.wait_idle(TIMEOUT));
    assert!(machine.is_halted());
    assert!(machine.is_in(a));
    let info = machine.pending_error().unwrap();
    assert_eq!(info.phase, HookPhase::Applicability);
    assert_eq!(info.state, a);
    assert_eq!(info.transition, Some(auto));
    assert_eq!(info.to_string(), "is_applicable failed: guard broke");

    // Resuming after a failure waits for the next trigger; the automatic
    // transition is not retried.
    machine.resume().unwrap();
    assert!(machine.wait_idle(TIMEOUT));
    assert_eq!(machine.status(), Status::Running);
    assert!(machine.is_in(a));
    assert!(!broken.load(Ordering::SeqCst));

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_prepare_entry_runs_before_entry() {
    let mut builder = GraphBuilder::<Vec<String>>::new();
    let a = builder.add_state("A", Plain);
    let b = builder.add_state(
        "B",
        FnState::new()
            .prepare(|log: &mut Vec<String>| {
                log.push("prepare B".to_string());
                Ok(())
            })
            .entering(|log: &mut Vec<String>| {
                log.push("enter B".to_string());
                Ok(Entry::Continue)
            }),
    );
    let ab = builder.connect(a, b);
    let ba = builder.connect(b, a);
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), Vec::new());
    machine.start().unwrap();
    machine.trigger(ab).unwrap();
    assert!(machine.wait_for(&[b], TIMEOUT));
    assert!(machine.wait_idle(TIMEOUT));
    machine.trigger(ba).unwrap();
    assert!(machine.wait_for(&[a], TIMEOUT));
    machine.trigger(ab).unwrap();
    assert!(machine.wait_for(&[b], TIMEOUT));
    assert!(machine.wait_idle(TIMEOUT));

    assert_eq!(
        machine.context(),
        vec!["prepare B", "enter B", "prepare B", "enter B"]
    );

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_prepare_entry_failure_halts_in_target() {
    let mut builder = GraphBuilder::<Vec<String>>::new();
    let a = builder.add_state("A", Plain);
    let b = builder.add_state(
        "B",
        FnState::new()
            .prepare(|_: &mut Vec<String>| Err("reset failed".into()))
            .entering(|log: &mut Vec<String>| {
                log.push("enter B".to_string());
                Ok(Entry::Continue)
            }),
    );
    let ab = builder.connect(a, b);
    let ba = builder.connect(b, a);
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), Vec::new());
    machine.start().unwrap();
    machine.trigger(ab).unwrap();

    assert!(machine.wait_for(&[b], TIMEOUT));
    assert!(machine.wait_idle(TIMEOUT));
    assert!(machine.is_halted());
    let info = machine.pending_error().unwrap();
    assert_eq!(info.phase, HookPhase::Entry);
    assert_eq!(info.state, b);
    assert_eq!(info.transition, Some(ab));
    assert!(machine.context().is_empty());

    machine.resume().unwrap();
    assert!(machine.is_in(b));
    machine.trigger(ba).unwrap();
    assert!(machine.wait_for(&[a], TIMEOUT));

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_wait_next_state() {
    let gate = Gate::default();
    let blocked = gate.clone();

    let mut builder = GraphBuilder::<()>::new();
    let a = builder.add_state(
        "A",
        FnState::new().exiting(move |_: &mut ()| {
            blocked.wait();
            Ok(())
        }),
    );
    let b = builder.add_state("B", Plain);
    let ab = builder.connect(a, b);
    builder.connect(b, a);
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), ());
    machine.start().unwrap();
    assert!(machine.wait_idle(TIMEOUT));
    assert!(!machine.wait_next_state(Some(Duration::from_millis(20))));

    // The worker holds in A's exit hook until the gate opens.
    machine.trigger(ab).unwrap();
    let opener = gate.clone();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        opener.open();
    });
    assert!(machine.wait_next_state(TIMEOUT));
    assert!(machine.is_in(b));
    releaser.join().unwrap();

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

/// Copies the context seen by the error handler.
struct Snapshot {
    seen: Arc<Mutex<Option<Vec<String>>>>,
}

impl MachineHooks<Vec<String>> for Snapshot {
    fn handle_error(
        &mut self,
        _error: &ErrorInfo,
        recovery: &mut Recovery<'_, Vec<String>>,
    ) -> Option<StateId> {
        *self.seen.lock() = Some(recovery.context().clone());
        recovery.context_mut().push("handled".to_string());
        None
    }
}

#[test]
fn test_error_handler_reads_context_through_recovery() {
    let seen = Arc::new(Mutex::new(None));

    let mut builder = GraphBuilder::<Vec<String>>::new();
    let a = builder.add_state("A", Plain);
    let b = builder.add_state(
        "B",
        FnState::new().entering(|log: &mut Vec<String>| {
            log.push("half-entered B".to_string());
            Err("entry broke".into())
        }),
    );
    let ab = builder.connect(a, b);
    builder.set_initial(a);

    let machine = StateMachine::new(builder.build(), Vec::new()).with_hooks(Snapshot {
        seen: Arc::clone(&seen),
    });
    machine.start().unwrap();
    machine.trigger(ab).unwrap();

    assert!(machine.wait_idle(TIMEOUT));
    assert!(machine.is_halted());
    assert_eq!(
        seen.lock().clone(),
        Some(vec!["half-entered B".to_string()])
    );
    assert_eq!(machine.context(), vec!["half-entered B", "handled"]);

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

/// A -> B -> C (manual), C -> D (automatic), D -> A (manual).
struct Relay {
    machine: StateMachine<Vec<String>>,
    a: StateId,
    b: StateId,
    d: StateId,
    a_to_b: TransitionId,
    b_to_c: TransitionId,
    restart: TransitionId,
}

fn relay() -> Relay {
    let mut builder = GraphBuilder::<Vec<String>>::new();
    let a = builder.add_state("A", log_entry("A"));
    let b = builder.add_state("B", log_entry("B"));
    let c = builder.add_state("C", log_entry("C"));
    let d = builder.add_state("D", log_entry("D"));
    let a_to_b = builder.connect(a, b);
    let b_to_c = builder.connect(b, c);
    builder.connect_with(c, d, TransitionOptions::new().automatic());
    let restart = builder.connect(d, a);
    builder.set_initial(a);

    Relay {
        machine: StateMachine::new(builder.build(), Vec::new()),
        a,
        b,
        d,
        a_to_b,
        b_to_c,
        restart,
    }
}

#[test]
fn test_reservation_runs_sequence_without_interference() {
    let relay = relay();
    let machine = &relay.machine;
    machine.start().unwrap();

    {
        let reservation = machine.reserve(TIMEOUT).unwrap().unwrap();
        reservation.trigger(relay.a_to_b).unwrap();
        assert!(reservation.is_in(relay.b));

        // Everyone else is turned away while the reservation is live.
        assert!(matches!(
            machine.trigger(relay.b_to_c),
            Err(TriggerError::Reserved)
        ));
        let handle = machine.handle(relay.b_to_c).unwrap();
        let rejected = thread::spawn(move || handle.trigger()).join().unwrap();
        assert!(matches!(rejected, Err(TriggerError::Reserved)));
        assert!(machine.reserve(Some(Duration::from_millis(20))).unwrap().is_none());

        reservation.trigger(relay.b_to_c).unwrap();
        assert!(reservation.is_in(relay.d));
        assert_eq!(reservation.state().unwrap().name(), "D");
        assert_eq!(
            reservation.with_context(|log| log.clone()),
            vec!["enter A", "enter B", "enter C", "enter D"]
        );
    }

    machine.trigger(relay.restart).unwrap();
    assert!(machine.wait_for(&[relay.a], TIMEOUT));

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_when_reserves_on_arrival() {
    let relay = relay();
    let machine = &relay.machine;
    machine.start().unwrap();

    let seen = thread::scope(|scope| {
        let waiter = scope.spawn(|| {
            machine.when(&[relay.d], TIMEOUT, |reservation| {
                let name = reservation.state().unwrap().name().to_string();
                reservation.trigger(relay.restart).unwrap();
                name
            })
        });

        machine.trigger(relay.a_to_b).unwrap();
        assert!(machine.wait_for(&[relay.b], TIMEOUT));
        machine.trigger(relay.b_to_c).unwrap();

        waiter.join().unwrap()
    });

    assert_eq!(seen.unwrap().as_deref(), Some("D"));
    assert!(machine.wait_idle(TIMEOUT));
    assert!(machine.is_in(relay.a));

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

#[test]
fn test_when_gives_up() {
    let relay = relay();
    let machine = &relay.machine;
    machine.start().unwrap();

    let timed_out = machine
        .when(&[relay.d], Some(Duration::from_millis(30)), |_| ())
        .unwrap();
    assert!(timed_out.is_none());

    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
    assert!(machine.when(&[relay.d], None, |_| ()).unwrap().is_none());
}

#[test]
fn test_reservation_pauses_polling() {
    let ready = Arc::new(AtomicBool::new(false));

    let mut builder = GraphBuilder::<Arc<AtomicBool>>::new();
    let waiting = builder.add_state("waiting", Plain);
    let go = builder.add_state(
        "go",
        FnState::new().when(|flag: &Arc<AtomicBool>| Ok(flag.load(Ordering::SeqCst))),
    );
    builder.connect_with(waiting, go, TransitionOptions::new().automatic());
    builder.connect(go, waiting);
    builder.set_initial(waiting);

    let machine = StateMachine::new(builder.build(), Arc::clone(&ready)).with_config(
        EngineConfig::default().with_auto_poll_interval(Duration::from_millis(5)),
    );
    machine.start().unwrap();

    let reservation = machine.reserve(TIMEOUT).unwrap().unwrap();
    ready.store(true, Ordering::SeqCst);
    assert!(!machine.wait_for(&[go], Some(Duration::from_millis(50))));
    assert!(reservation.is_in(waiting));
    drop(reservation);

    assert!(machine.wait_for(&[go], TIMEOUT));
    machine.stop().unwrap();
    assert!(machine.join(TIMEOUT).unwrap());
}

/// Error handler plus event recorder.
struct CombinedHooks {
    handler: Handler,
    recorder: Recorder,
}

impl<C: Send + 'static> MachineHooks<C> for CombinedHooks {
    fn on_state_changed(&mut self, from: StateRef<'_>, to: StateRef<'_>) {
        MachineHooks::<C>::on_state_changed(&mut self.recorder, from, to);
    }

    fn handle_error(
        &mut self,
        error: &ErrorInfo,
        recovery: &mut Recovery<'_, C>,
    ) -> Option<StateId> {
        self.handler.handle_error(error, recovery)
    }
}
