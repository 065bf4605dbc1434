//! Core error types.

use crate::machine::Status;
use crate::state::{HookError, StateId};
use crate::transition::TransitionId;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Structural problems found when a machine is started.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("initial state not set")]
    InitialStateNotSet,

    #[error("initial state does not belong to this graph")]
    ForeignInitialState,

    #[error("initial state '{state}' has no outgoing transitions")]
    NoOutgoingTransitions { state: String },

    #[error("transition '{transition}' references a state from another graph")]
    ForeignState { transition: String },

    #[error("transition '{transition}' has no source states")]
    EmptySources { transition: String },
}

/// Rejection of a trigger request. Reported to the caller only; the
/// machine is unaffected.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("machine is not running (status: {status})")]
    NotRunning { status: Status },

    #[error("invalid transition: cannot apply '{transition}' in state '{state}'")]
    InvalidTransition { state: String, transition: String },

    #[error("transition does not belong to this machine's graph")]
    UnknownTransition,

    #[error("trigger queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("machine is reserved by another caller")]
    Reserved,
}

/// Errors from machine lifecycle operations.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Rejected(#[from] TriggerError),

    #[error("machine already started")]
    AlreadyStarted,

    #[error("machine not started")]
    NotStarted,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("cannot wait for the machine from its own worker thread")]
    WorkerThread,
}

impl MachineError {
    /// Returns a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            MachineError::Config(_) => "CONFIGURATION",
            MachineError::Rejected(e) => e.error_code(),
            MachineError::AlreadyStarted => "ALREADY_STARTED",
            MachineError::NotStarted => "NOT_STARTED",
            MachineError::Spawn(_) => "SPAWN_FAILED",
            MachineError::WorkerThread => "WORKER_THREAD",
        }
    }
}

impl TriggerError {
    /// Returns a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            TriggerError::NotRunning { .. } => "NOT_RUNNING",
            TriggerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            TriggerError::UnknownTransition => "UNKNOWN_TRANSITION",
            TriggerError::QueueFull { .. } => "QUEUE_FULL",
            TriggerError::Reserved => "RESERVED",
        }
    }
}

/// Hook that was running when a step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    /// `is_applicable` of an automatic transition's target.
    Applicability,
    /// `on_exit` of the source state.
    Exit,
    /// The transition callback.
    Callback,
    /// `prepare_entry` or `on_entry` of the target state.
    Entry,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::Applicability => "is_applicable",
            HookPhase::Exit => "on_exit",
            HookPhase::Callback => "callback",
            HookPhase::Entry => "on_entry",
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hook failure and the machine position it happened at.
///
/// `state` is the machine's current state when the hook failed. For
/// `Exit` and `Applicability` failures that is the source state; for
/// `Callback` and `Entry` failures it is the target, which counts as
/// entered but not fully initialized.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    pub error: Arc<dyn std::error::Error + Send + Sync>,
    pub state: StateId,
    /// `None` for the initial entry and for redirect re-entries.
    pub transition: Option<TransitionId>,
    pub phase: HookPhase,
}

impl ErrorInfo {
    pub(crate) fn new(
        error: HookError,
        state: StateId,
        transition: Option<TransitionId>,
        phase: HookPhase,
    ) -> Self {
        Self {
            error: Arc::from(error),
            state,
            transition,
            phase,
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.phase, self.error)
    }
}
