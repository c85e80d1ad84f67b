//! unitrun - execution core for a unit-test runner
//!
//! Takes fixture and case descriptors produced by a discovery step, resolves
//! them into an [`ExecutionPlan`](plan::ExecutionPlan) and runs it:
//!
//! - lifecycle hooks per run, fixture and case, with inheritance applied
//! - data-driven expansion of parameterized cases, including generic inference
//! - a bounded worker pool with disabled, case or fixture parallel scope
//! - per-phase timeouts with cooperative or forced cancellation
//! - retries, soft assertions and single-threaded apartments
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use unitrun::{Engine, EngineConfig, ScriptedHost, RunDescriptor};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let descriptor = RunDescriptor::load("plan.yaml")?;
//! let engine = Engine::new(EngineConfig::default(), Arc::new(ScriptedHost::new()));
//! let summary = engine.run_descriptor(&descriptor).await?;
//! println!("{}", summary);
//! # Ok(())
//! # }
//! ```

pub mod assert;
pub mod config;
pub mod error;
pub mod executor;
pub mod host;
pub mod models;
pub mod output;
pub mod plan;
pub mod report;
pub mod utils;

pub use assert::Fault;
pub use config::EngineConfig;
pub use error::{EngineError, HostError, PlanError};
pub use executor::{Engine, RunControl, TestContext};
pub use host::{InProcessHost, IsolationHost, ScriptedHost};
pub use models::{CaseResult, Outcome, RunDescriptor, RunSummary};
pub use plan::ExecutionPlan;
pub use report::Reporter;
