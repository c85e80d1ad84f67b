//! Execution plan
//!
//! The resolver and data expansion turn discovery descriptors into one
//! immutable [`ExecutionPlan`]: per-fixture hook chains with inheritance
//! applied, and concrete cases with their arguments and overrides resolved.

mod expansion;
pub mod generics;
mod resolver;

pub use resolver::PlanBuilder;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::executor::RetryOverride;
use crate::models::{Apartment, CleanupTiming, HookKind, Outcome, TypeTag, Value};

/// One hook in a resolved chain
#[derive(Clone, Debug, PartialEq)]
pub struct HookStep {
    pub kind: HookKind,
    pub target: String,
    /// Fixture that declared the hook, "run" for run-wide hooks
    pub owner: String,
    pub timeout_ms: Option<u64>,
    pub cooperative: Option<bool>,
    pub apartment: Apartment,
}

/// Whether a planned unit runs, and what it reports if it does not
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    Run,
    Skip(String),
    Fail(String),
    Inconclusive(String),
}

impl Disposition {
    /// Outcome and message for units that never run
    pub fn preset(&self) -> Option<(Outcome, &str)> {
        match self {
            Disposition::Run => None,
            Disposition::Skip(msg) => Some((Outcome::Skipped, msg)),
            Disposition::Fail(msg) => Some((Outcome::Failed, msg)),
            Disposition::Inconclusive(msg) => Some((Outcome::Inconclusive, msg)),
        }
    }

    pub fn runs(&self) -> bool {
        matches!(self, Disposition::Run)
    }
}

/// One call of the body with one row of arguments
#[derive(Clone, Debug)]
pub struct Invocation {
    pub args: Arc<Vec<Value>>,
    pub label: String,
    pub disposition: Disposition,
}

impl Invocation {
    pub fn new(args: Vec<Value>, label: impl Into<String>) -> Self {
        Self {
            args: Arc::new(args),
            label: label.into(),
            disposition: Disposition::Run,
        }
    }

    pub fn with_disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }
}

/// A concrete case
#[derive(Clone, Debug)]
pub struct PlannedCase {
    /// Position in the plan, used to order results
    pub index: usize,
    pub id: String,
    pub display_name: String,
    pub fixture_id: String,
    pub body: String,
    /// A folded case carries one invocation per row
    pub invocations: Vec<Invocation>,
    pub bindings: BTreeMap<String, TypeTag>,
    pub disposition: Disposition,
    pub timeout_ms: Option<u64>,
    pub cooperative: Option<bool>,
    pub retry: RetryOverride,
    pub apartment: Apartment,
}

impl PlannedCase {
    pub fn is_folded(&self) -> bool {
        self.invocations.len() > 1
    }
}

/// A fixture with its resolved hook chains
#[derive(Clone, Debug)]
pub struct PlannedFixture {
    pub id: String,
    pub display_name: String,
    pub boundary: String,
    /// Fixture init hooks, base first
    pub init_chain: Vec<HookStep>,
    /// Fixture cleanup hooks, derived first
    pub cleanup_chain: Vec<HookStep>,
    /// Per-case hooks by kind; init-like kinds base first, cleanup-like derived first
    pub case_hooks: BTreeMap<HookKindKey, Vec<HookStep>>,
    pub cleanup_timing: CleanupTiming,
    pub parallel: bool,
    pub apartment: Apartment,
    pub ignore: Option<String>,
    pub cases: Vec<PlannedCase>,
}

/// Ordered key for per-case hook kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookKindKey {
    Construct,
    CaseInit,
    CaseCleanup,
    Teardown,
}

impl HookKindKey {
    pub fn from_kind(kind: HookKind) -> Option<Self> {
        match kind {
            HookKind::Construct => Some(HookKindKey::Construct),
            HookKind::CaseInit => Some(HookKindKey::CaseInit),
            HookKind::CaseCleanup => Some(HookKindKey::CaseCleanup),
            HookKind::Teardown => Some(HookKindKey::Teardown),
            _ => None,
        }
    }
}

impl PlannedFixture {
    /// Resolved chain for a per-case hook kind
    pub fn case_hooks(&self, key: HookKindKey) -> &[HookStep] {
        self.case_hooks.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether any case of this fixture will run phases
    pub fn has_runnable_cases(&self) -> bool {
        self.ignore.is_none() && self.cases.iter().any(|c| c.disposition.runs())
    }

    pub fn needs_apartment(&self) -> bool {
        let single = |apartment: Apartment| apartment == Apartment::SingleThreaded;
        single(self.apartment)
            || self.cases.iter().any(|c| single(c.apartment))
            || self
                .init_chain
                .iter()
                .chain(&self.cleanup_chain)
                .chain(self.case_hooks.values().flatten())
                .any(|step| single(step.apartment))
    }
}

/// The whole-run schedule
#[derive(Clone, Debug, Default)]
pub struct ExecutionPlan {
    pub run_init: Option<HookStep>,
    pub run_cleanup: Option<HookStep>,
    pub fixtures: Vec<PlannedFixture>,
}

impl ExecutionPlan {
    pub fn case_count(&self) -> usize {
        self.fixtures.iter().map(|f| f.cases.len()).sum()
    }

    pub fn cases(&self) -> impl Iterator<Item = &PlannedCase> {
        self.fixtures.iter().flat_map(|f| f.cases.iter())
    }

    pub fn fixture(&self, id: &str) -> Option<&PlannedFixture> {
        self.fixtures.iter().find(|f| f.id == id)
    }

    pub fn case(&self, id: &str) -> Option<&PlannedCase> {
        self.cases().find(|c| c.id == id)
    }

    /// Fixtures split into those that may run in parallel and those that opted out
    pub fn partition(&self) -> (Vec<&PlannedFixture>, Vec<&PlannedFixture>) {
        self.fixtures.iter().partition(|f| f.parallel)
    }

    /// Distinct isolation boundaries in first-use order
    pub fn boundaries(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for fixture in &self.fixtures {
            if !seen.contains(&fixture.boundary.as_str()) {
                seen.push(&fixture.boundary);
            }
        }
        seen
    }
}
