//! # rstm-diagram
//!
//! Diagram rendering for rstm graphs.
//!
//! This crate provides:
//! - Mermaid `stateDiagram-v2` text for a frozen graph
//! - A standalone HTML page embedding a Mermaid diagram
//! - A serializable graph description in the JSON definition layout

pub mod describe;
pub mod html;
pub mod mermaid;

pub use describe::{AnySource, GraphDescription, SourceList, TransitionDescription};
pub use html::html_page;
pub use mermaid::{state_diagram, state_key};

/// Mermaid release loaded by generated HTML pages.
pub const MERMAID_VERSION: u32 = 10;
