//! Serializable graph descriptions.
//!
//! The layout follows the JSON definition format:
//!
//! ```json
//! {
//!   "states": ["closed", "opened", "done"],
//!   "initial": "closed",
//!   "finals": ["done"],
//!   "transitions": [
//!     {"from": ["closed"], "to": "opened", "name": "open", "automatic": false},
//!     {"from": "*", "to": "done", "name": "T2", "automatic": true}
//!   ]
//! }
//! ```

use rstm_core::{Graph, Sources};
use serde::{Deserialize, Serialize};

/// Source side of a described transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceList {
    /// Global transition, serialized as `"*"`.
    Any(AnySource),
    States(Vec<String>),
}

/// Marker for the `"*"` source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnySource {
    #[serde(rename = "*")]
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionDescription {
    pub from: SourceList,
    pub to: String,
    pub name: String,
    #[serde(default)]
    pub automatic: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub callback: bool,
}

/// Names-only view of a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDescription {
    pub states: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finals: Vec<String>,
    pub transitions: Vec<TransitionDescription>,
}

impl GraphDescription {
    pub fn from_graph<C>(graph: &Graph<C>) -> Self {
        let name = |id| graph.state(id).map_or_else(String::new, |s| s.name().to_string());

        let transitions = graph
            .transitions()
            .map(|t| TransitionDescription {
                from: match t.sources() {
                    Sources::Any => SourceList::Any(AnySource::Any),
                    Sources::States(states) => {
                        SourceList::States(states.iter().map(|s| name(*s)).collect())
                    }
                },
                to: name(t.target()),
                name: t.name().to_string(),
                automatic: t.is_automatic(),
                callback: t.has_callback(),
            })
            .collect();

        Self {
            states: graph.states().map(|s| s.name().to_string()).collect(),
            initial: graph.initial().map(name),
            finals: graph.final_states().map(|s| s.name().to_string()).collect(),
            transitions,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
