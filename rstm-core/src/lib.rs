//! # rstm-core
//!
//! Execution engine for rstm.
//!
//! This crate provides:
//! - State behaviour and identity
//! - Transition tables with scoped and global transitions
//! - Graph building and structural validation
//! - A worker-driven machine with trigger/halt/resume/stop/join
//! - Reservations for running trigger sequences without interference
//! - Machine-level lifecycle hooks and error recovery

pub mod config;
pub mod error;
pub mod graph;
pub mod hooks;
pub mod machine;
pub mod state;
pub mod transition;
mod worker;

pub use config::EngineConfig;
pub use error::{ConfigError, ErrorInfo, HookPhase, MachineError, TriggerError};
pub use graph::{Graph, GraphBuilder};
pub use hooks::{MachineHooks, NoHooks, Recovery};
pub use machine::{Reservation, StateMachine, Status, TransitionHandle};
pub use state::{
    Entry, FnState, HookError, HookResult, Plain, StateBehavior, StateId, StateKind, StateRef,
};
pub use transition::{Sources, Transition, TransitionId, TransitionOptions};
