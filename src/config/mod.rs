//! Configuration module
//!
//! The engine reads every setting from one immutable [`EngineConfig`]
//! threaded through plan-build and execution.

mod env;
mod file;

pub use env::{print_env_help, EnvConfig};
pub use file::ConfigFile;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::executor::Phase;
use crate::models::{Apartment, CleanupTiming, ExpansionStrategy, Outcome};

/// Engine configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EngineConfig {
    pub parallel: ParallelConfig,

    pub timeouts: TimeoutConfig,

    pub retry: RetryConfig,

    /// Apartment used when neither fixture nor case declares one
    pub apartment: Apartment,

    /// Report inconclusive cases as failed
    pub map_inconclusive_to_failed: bool,

    /// A data source yielding no rows is inconclusive instead of failed
    pub empty_data_source_is_inconclusive: bool,

    /// Outcome of cases whose fixture init failed
    pub fixture_init_failure: InitFailurePolicy,

    /// Cleanup timing for fixtures that do not declare one
    pub cleanup_timing: CleanupTiming,

    /// Expansion strategy for sources that do not declare one
    pub data_expansion: ExpansionStrategy,

    /// Run-scoped properties copied into every context
    pub properties: BTreeMap<String, String>,
}

/// Parallel execution scope
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParallelScope {
    #[default]
    Disabled,
    Case,
    Fixture,
}

impl ParallelScope {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "disabled" | "none" | "off" => Some(ParallelScope::Disabled),
            "case" | "method" => Some(ParallelScope::Case),
            "fixture" | "class" => Some(ParallelScope::Fixture),
            _ => None,
        }
    }
}

/// Worker pool settings
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ParallelConfig {
    pub scope: ParallelScope,

    /// Worker count, 0 uses the available hardware concurrency
    pub workers: usize,

    /// Under fixture scope, run a fixture's cases concurrently too
    pub fixture_cases_concurrent: bool,
}

impl ParallelConfig {
    /// Effective number of workers
    pub fn worker_count(&self) -> usize {
        if self.scope == ParallelScope::Disabled {
            return 1;
        }
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.workers
        }
    }
}

/// Global per-phase deadlines in milliseconds
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TimeoutConfig {
    pub run_init_ms: Option<u64>,
    pub run_cleanup_ms: Option<u64>,
    pub fixture_init_ms: Option<u64>,
    pub fixture_cleanup_ms: Option<u64>,
    pub construct_ms: Option<u64>,
    pub case_init_ms: Option<u64>,
    pub body_ms: Option<u64>,
    pub case_cleanup_ms: Option<u64>,
    pub teardown_ms: Option<u64>,

    /// Signal cancellation at the deadline instead of abandoning the phase
    pub cooperative_cancellation: bool,

    /// Time a cancelled phase gets to unwind before it counts as timed out
    pub cancellation_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            run_init_ms: None,
            run_cleanup_ms: None,
            fixture_init_ms: None,
            fixture_cleanup_ms: None,
            construct_ms: None,
            case_init_ms: None,
            body_ms: None,
            case_cleanup_ms: None,
            teardown_ms: None,
            cooperative_cancellation: false,
            cancellation_grace_ms: 2000,
        }
    }
}

impl TimeoutConfig {
    /// Configured deadline for a phase kind
    pub fn for_phase(&self, phase: Phase) -> Option<u64> {
        match phase {
            Phase::RunInit => self.run_init_ms,
            Phase::RunCleanup => self.run_cleanup_ms,
            Phase::FixtureInit => self.fixture_init_ms,
            Phase::FixtureCleanup => self.fixture_cleanup_ms,
            Phase::Construct => self.construct_ms,
            Phase::CaseInit => self.case_init_ms,
            Phase::Body => self.body_ms,
            Phase::CaseCleanup => self.case_cleanup_ms,
            Phase::Teardown => self.teardown_ms,
        }
    }

    /// Explicit declaration beats configuration, which beats no deadline
    pub fn resolve(&self, phase: Phase, explicit_ms: Option<u64>) -> Option<Duration> {
        explicit_ms
            .or_else(|| self.for_phase(phase))
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.cancellation_grace_ms)
    }
}

/// Delay growth between retry attempts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Constant,
    Exponential,
}

/// Global retry settings
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RetryConfig {
    /// Additional attempts after a failed one
    pub max_retries: u32,
    pub delay_ms: u64,
    pub backoff: Backoff,
}

/// What cases report when their fixture failed to initialize
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InitFailurePolicy {
    #[default]
    Failed,
    Skipped,
    Inconclusive,
}

impl InitFailurePolicy {
    pub fn outcome(self) -> Outcome {
        match self {
            InitFailurePolicy::Failed => Outcome::Failed,
            InitFailurePolicy::Skipped => Outcome::Skipped,
            InitFailurePolicy::Inconclusive => Outcome::Inconclusive,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(mut self, scope: ParallelScope) -> Self {
        self.parallel.scope = scope;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.parallel.workers = workers;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retry.max_retries = retries;
        self
    }

    pub fn cooperative(mut self, cooperative: bool) -> Self {
        self.timeouts.cooperative_cancellation = cooperative;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Check values the engine cannot work with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeouts.cooperative_cancellation && self.timeouts.cancellation_grace_ms == 0 {
            anyhow::bail!("cancellation_grace_ms must be greater than 0 when cooperative cancellation is enabled");
        }
        if self.retry.max_retries > 100 {
            anyhow::bail!(
                "max_retries {} exceeds the supported ceiling of 100",
                self.retry.max_retries
            );
        }
        if self.parallel.workers > 1024 {
            anyhow::bail!("workers {} exceeds the supported ceiling of 1024", self.parallel.workers);
        }
        Ok(())
    }
}
