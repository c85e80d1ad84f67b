//! Data models for the execution engine
//!
//! Descriptors consumed from discovery, argument values, and the outcome
//! records produced for the reporter.

mod descriptor;
mod outcome;
mod value;

pub use descriptor::{
    default_boundary, Apartment, CaseTemplate, CleanupTiming, DataRow, DataSource,
    ExpansionStrategy, FixtureDescriptor, HookDescriptor, HookKind, InheritanceMode,
    RunDescriptor, SourceKind,
};
pub use outcome::{
    CaseEvent, CaseResult, HookFailure, HookScope, Outcome, RunSummary, RunTotals,
};
pub use value::{format_args, ParamDecl, ParamType, TypeTag, Value};
