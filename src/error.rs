//! Engine error types
//!
//! Configuration errors surface while the plan is built; runtime faults of
//! user code are [`Fault`](crate::assert::Fault) values instead.

use thiserror::Error;

use crate::models::HookKind;

/// Problems detected while resolving descriptors into a plan
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Fixture '{fixture}' declares more than one {kind} hook")]
    DuplicateHook { fixture: String, kind: HookKind },

    #[error("Run declares more than one {0} hook")]
    DuplicateRunHook(HookKind),

    #[error("Hook of kind {kind} is not valid at {scope} scope")]
    MisplacedHook { kind: HookKind, scope: &'static str },

    #[error("Fixture '{fixture}' derives from unknown fixture '{base}'")]
    UnknownBase { fixture: String, base: String },

    #[error("Fixture '{0}' is part of an inheritance cycle")]
    InheritanceCycle(String),

    #[error("Fixture id '{0}' is declared more than once")]
    DuplicateFixture(String),

    #[error("Case '{case}' is declared more than once in fixture '{fixture}'")]
    DuplicateCase { fixture: String, case: String },
}

/// Isolation boundary failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Failed to load boundary '{boundary}': {reason}")]
    Load { boundary: String, reason: String },

    #[error("Failed to unload boundary '{boundary}': {reason}")]
    Unload { boundary: String, reason: String },
}

/// Engine-level failures outside any single case
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("Deadlock guard tripped: {0}")]
    DeadlockGuard(String),

    #[error("Failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}
