//! Mermaid state diagrams.
//!
//! See <https://mermaid.js.org/syntax/stateDiagram.html>.

use rstm_core::{Graph, Sources, StateId, StateRef, Transition};

/// Diagram key of a state: lowercase, spaces replaced with underscores.
pub fn state_key(name: &str) -> String {
    name.replace(' ', "_").to_lowercase()
}

/// Renders `graph` as the body of a Mermaid `stateDiagram-v2`.
///
/// State definitions come first, then one line per edge. The initial state
/// is entered from `[*]`, edges into final states end in `[*]`, and global
/// transitions are drawn from every non-final state.
pub fn state_diagram<C>(graph: &Graph<C>) -> String {
    let mut definitions = Definitions::default();
    let mut edges = Vec::new();

    if let Some(initial) = graph.initial().and_then(|s| graph.state(s)) {
        definitions.add(initial);
        edges.push(format!("[*] --> {}", state_key(initial.name())));
    }

    for transition in graph.transitions() {
        let target = match graph.state(transition.target()) {
            Some(target) => target,
            None => continue,
        };
        let to = if target.is_final() {
            "[*]".to_string()
        } else {
            definitions.add(target);
            state_key(target.name())
        };

        for source in sources(graph, transition) {
            let from = match graph.state(source) {
                Some(from) => from,
                None => continue,
            };
            definitions.add(from);

            let mut line = format!("{} --> {}", state_key(from.name()), to);
            if let Some(label) = label(transition) {
                line.push_str(" : ");
                line.push_str(&label);
            }
            edges.push(line);
        }
    }

    let mut lines = definitions.lines;
    lines.push(String::new());
    lines.extend(edges);
    lines.join("\n")
}

fn sources<C>(graph: &Graph<C>, transition: &Transition<C>) -> Vec<StateId> {
    match transition.sources() {
        Sources::Any => graph
            .states()
            .filter(|s| !s.is_final())
            .map(|s| s.id())
            .collect(),
        Sources::States(states) => states.clone(),
    }
}

/// Explicit name and an `[auto]` marker; generated names are left out.
fn label<C>(transition: &Transition<C>) -> Option<String> {
    match (transition.has_explicit_name(), transition.is_automatic()) {
        (true, true) => Some(format!("{} [auto]", transition.name())),
        (true, false) => Some(transition.name().to_string()),
        (false, true) => Some("[auto]".to_string()),
        (false, false) => None,
    }
}

#[derive(Default)]
struct Definitions {
    keys: Vec<String>,
    lines: Vec<String>,
}

impl Definitions {
    fn add(&mut self, state: StateRef<'_>) {
        let key = state_key(state.name());
        if !self.keys.contains(&key) {
            self.lines.push(format!("{}: {}", key, state.name()));
            self.keys.push(key);
        }
    }
}
