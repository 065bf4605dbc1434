//! Built-in demo machines.

use crate::settings::Settings;
use clap::ValueEnum;
use colored::Colorize;
use rstm_core::{
    EngineConfig, Entry, ErrorInfo, FnState, Graph, GraphBuilder, MachineHooks, Plain, Recovery,
    StateId, StateMachine, StateRef, TransitionId, TransitionOptions,
};
use rstm_diagram::{html_page, state_diagram, GraphDescription};
use std::error::Error;
use std::time::Duration;

/// Available demos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DemoKind {
    /// A door driven open and closed by manual triggers
    Door,
    /// Automatic transitions branching on applicability
    Branching,
    /// A failing state recovered by the error handler
    Recovery,
}

/// Output format of `rstm diagram`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagramFormat {
    Mermaid,
    Html,
    Json,
}

impl DemoKind {
    pub fn title(&self) -> &'static str {
        match self {
            DemoKind::Door => "Door",
            DemoKind::Branching => "Branching",
            DemoKind::Recovery => "Recovery",
        }
    }

    pub fn run(self, settings: &Settings) -> Result<(), Box<dyn Error>> {
        println!("{} {}", "Running demo".green().bold(), self.title().cyan());
        match self {
            DemoKind::Door => run_door(settings),
            DemoKind::Branching => run_branching(settings),
            DemoKind::Recovery => run_recovery(settings),
        }
    }

    pub fn diagram(self, format: DiagramFormat) -> Result<String, Box<dyn Error>> {
        match self {
            DemoKind::Door => render(self.title(), &door().graph, format),
            DemoKind::Branching => render(self.title(), &branching(), format),
            DemoKind::Recovery => render(self.title(), &recovery().graph, format),
        }
    }
}

fn render<C>(
    title: &str,
    graph: &Graph<C>,
    format: DiagramFormat,
) -> Result<String, Box<dyn Error>> {
    let output = match format {
        DiagramFormat::Mermaid => format!("stateDiagram-v2\n{}", state_diagram(graph)),
        DiagramFormat::Html => html_page(title, &state_diagram(graph)),
        DiagramFormat::Json => GraphDescription::from_graph(graph).to_json()?,
    };
    Ok(output)
}

/// Prints state changes as they happen.
struct Printer;

impl<C: Send + 'static> MachineHooks<C> for Printer {
    fn on_state_changed(&mut self, from: StateRef<'_>, to: StateRef<'_>) {
        println!(
            "  {} {} {} {}",
            "state".dimmed(),
            from.name().yellow(),
            "->".dimmed(),
            to.name().yellow().bold()
        );
    }

    fn on_exit(&mut self, _ctx: &mut C) {
        println!("  {}", "machine exited".dimmed());
    }
}

fn machine<C: Send + 'static>(
    graph: Graph<C>,
    ctx: C,
    config: &EngineConfig,
    hooks: impl MachineHooks<C>,
) -> StateMachine<C> {
    StateMachine::new(graph, ctx)
        .with_config(config.clone())
        .with_hooks(hooks)
}

fn finish<C: Send + 'static>(
    machine: &StateMachine<C>,
    settings: &Settings,
) -> Result<(), Box<dyn Error>> {
    let timeout = settings.demo.join_timeout();
    if !machine.join(Some(timeout))? {
        machine.stop()?;
        machine.join(Some(timeout))?;
        return Err(format!("machine did not terminate within {:?}", timeout).into());
    }
    let state = machine.state().map_or("?", |s| s.name());
    println!(
        "{} {} in state {}",
        "Machine".green().bold(),
        machine.status(),
        state.cyan()
    );
    Ok(())
}

// ===== Door =====

/// Door actuator; counts completed movements.
#[derive(Debug, Default)]
struct Actuator {
    movements: u32,
}

impl Actuator {
    fn travel(&mut self, what: &str) {
        println!("  {} {}", "actuator".dimmed(), what);
        std::thread::sleep(Duration::from_millis(50));
        self.movements += 1;
    }
}

struct Door {
    graph: Graph<Actuator>,
    opened: StateId,
    closed: StateId,
    open: TransitionId,
    close: TransitionId,
}

fn door() -> Door {
    let mut builder = GraphBuilder::<Actuator>::new();
    let opening = builder.add_state(
        "Opening",
        FnState::new().entering(|actuator: &mut Actuator| {
            actuator.travel("extending");
            Ok(Entry::Continue)
        }),
    );
    let opened = builder.add_state("Opened", Plain);
    let closing = builder.add_state(
        "Closing",
        FnState::new().entering(|actuator: &mut Actuator| {
            actuator.travel("retracting");
            Ok(Entry::Continue)
        }),
    );
    let closed = builder.add_state("Closed", Plain);

    let all = [opening, opened, closing, closed];
    let open = builder.connect_with(all, opening, TransitionOptions::new().named("open"));
    let close = builder.connect_with(all, closing, TransitionOptions::new().named("close"));
    builder.connect_with(opening, opened, TransitionOptions::new().automatic());
    builder.connect_with(closing, closed, TransitionOptions::new().automatic());
    builder.set_initial(opened);

    Door {
        graph: builder.build(),
        opened,
        closed,
        open,
        close,
    }
}

fn run_door(settings: &Settings) -> Result<(), Box<dyn Error>> {
    let Door {
        graph,
        opened,
        closed,
        open,
        close,
    } = door();
    let timeout = Some(settings.demo.join_timeout());

    let door = machine(graph, Actuator::default(), &settings.engine, Printer);
    door.start()?;

    door.trigger(close)?;
    door.wait_idle(timeout);
    if !door.is_in(closed) {
        return Err("door did not close".into());
    }

    // Open from another thread through a transition handle.
    let handle = door.handle(open)?;
    std::thread::spawn(move || handle.trigger())
        .join()
        .map_err(|_| "trigger thread panicked")??;
    door.wait_idle(timeout);
    if !door.is_in(opened) {
        return Err("door did not open".into());
    }

    door.stop()?;
    finish(&door, settings)?;
    println!(
        "{} {}",
        "Actuator movements:".dimmed(),
        door.with_context(|actuator| actuator.movements)
    );
    Ok(())
}

// ===== Branching =====

/// Processing slot bookkeeping.
#[derive(Debug, Default, Clone)]
struct Work {
    processed: u32,
    waits: u32,
}

fn branching() -> Graph<Work> {
    let mut builder = GraphBuilder::<Work>::new();
    let staging = builder.add_state("", Plain);
    let processing = builder.add_state(
        "Processing",
        FnState::new()
            // The slot frees up after every third wait.
            .when(|work: &Work| Ok(work.waits > 0 && work.waits % 3 == 0))
            .entering(|work: &mut Work| {
                work.processed += 1;
                Ok(Entry::Continue)
            }),
    );
    let waiting = builder.add_state(
        "Waiting",
        FnState::new().entering(|work: &mut Work| {
            work.waits += 1;
            std::thread::sleep(Duration::from_millis(10));
            Ok(Entry::Continue)
        }),
    );
    let done = builder.add_final_state("Done");

    let auto = |name: &str| TransitionOptions::new().automatic().named(name);
    builder.connect_with(staging, processing, auto("process"));
    builder.connect_with(staging, waiting, auto("wait"));
    builder.connect_with(waiting, staging, auto("stage"));
    builder.connect_with(processing, done, auto("ready"));
    builder.set_initial(staging);
    builder.build()
}

fn run_branching(settings: &Settings) -> Result<(), Box<dyn Error>> {
    let machine = machine(branching(), Work::default(), &settings.engine, Printer);
    machine.start()?;
    finish(&machine, settings)?;

    let work = machine.context();
    println!(
        "{} processed={} waits={}",
        "Work:".dimmed(),
        work.processed,
        work.waits
    );
    Ok(())
}

// ===== Recovery =====

/// Context with a simulated fault.
#[derive(Debug)]
struct Plant {
    fault: bool,
}

struct RecoveryDemo {
    graph: Graph<Plant>,
    processing: StateId,
}

fn recovery() -> RecoveryDemo {
    let mut builder = GraphBuilder::<Plant>::new();
    let idle = builder.add_state("Idle", Plain);
    let processing = builder.add_state(
        "Processing",
        FnState::new().entering(|plant: &mut Plant| {
            if plant.fault {
                Err("fault!".into())
            } else {
                Ok(Entry::Continue)
            }
        }),
    );
    let done = builder.add_final_state("Done");
    let auto = |name: &str| TransitionOptions::new().automatic().named(name);
    builder.connect_with(idle, processing, auto("process"));
    builder.connect_with(processing, done, auto("finish"));
    builder.set_initial(idle);

    RecoveryDemo {
        graph: builder.build(),
        processing,
    }
}

/// Clears the fault and re-enters the failed state.
struct Repair {
    processing: StateId,
}

impl MachineHooks<Plant> for Repair {
    fn on_state_changed(&mut self, from: StateRef<'_>, to: StateRef<'_>) {
        MachineHooks::<Plant>::on_state_changed(&mut Printer, from, to);
    }

    fn handle_error(
        &mut self,
        error: &ErrorInfo,
        recovery: &mut Recovery<'_, Plant>,
    ) -> Option<StateId> {
        println!("  {} {}", "error".red().bold(), error);
        println!("  {} {}", "state".dimmed(), recovery.state());

        if error.state == self.processing {
            recovery.context_mut().fault = false;
        }

        println!("  {} {}", "halted:".dimmed(), recovery.status());
        recovery.resume();
        println!("  {} {}", "resumed:".dimmed(), recovery.status());

        Some(self.processing)
    }
}

fn run_recovery(settings: &Settings) -> Result<(), Box<dyn Error>> {
    let RecoveryDemo { graph, processing } = recovery();
    let hooks = Repair { processing };
    let machine = machine(graph, Plant { fault: true }, &settings.engine, hooks);
    machine.start()?;
    finish(&machine, settings)
}
