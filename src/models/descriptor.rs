//! Discovery descriptors
//!
//! Language-neutral input handed to the engine by an external discovery
//! collaborator. Hooks and bodies are referenced by target name and are
//! invoked through an [`IsolationHost`](crate::host::IsolationHost).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::value::{ParamDecl, Value};
use crate::config::Backoff;

/// Lifecycle hook roles
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    RunInit,
    RunCleanup,
    FixtureInit,
    FixtureCleanup,
    Construct,
    CaseInit,
    CaseCleanup,
    Teardown,
}

impl HookKind {
    pub fn name(&self) -> &'static str {
        match self {
            HookKind::RunInit => "run init",
            HookKind::RunCleanup => "run cleanup",
            HookKind::FixtureInit => "fixture init",
            HookKind::FixtureCleanup => "fixture cleanup",
            HookKind::Construct => "construct",
            HookKind::CaseInit => "case init",
            HookKind::CaseCleanup => "case cleanup",
            HookKind::Teardown => "teardown",
        }
    }

    pub fn is_run_scoped(&self) -> bool {
        matches!(self, HookKind::RunInit | HookKind::RunCleanup)
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Whether a fixture-scoped hook also runs for derived fixtures
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InheritanceMode {
    /// Runs only for the declaring fixture
    #[default]
    None,
    /// Runs once for every concrete derived fixture
    BeforeEachDerived,
}

/// When a fixture's cleanup runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CleanupTiming {
    #[default]
    EndOfClass,
    EndOfRun,
}

/// Thread affinity requirement
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Apartment {
    #[default]
    Any,
    SingleThreaded,
}

/// Whether rows of one data source are reported as one case or many
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionStrategy {
    #[default]
    Unfold,
    Fold,
}

/// One hook declaration
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct HookDescriptor {
    pub kind: HookKind,
    /// Target name resolved by the isolation host
    pub target: String,
    #[serde(default)]
    pub inheritance: InheritanceMode,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub cooperative: Option<bool>,
    #[serde(default)]
    pub apartment: Option<Apartment>,
}

impl HookDescriptor {
    pub fn new(kind: HookKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            inheritance: InheritanceMode::None,
            timeout_ms: None,
            cooperative: None,
            apartment: None,
        }
    }

    pub fn inherited(mut self) -> Self {
        self.inheritance = InheritanceMode::BeforeEachDerived;
        self
    }

    pub fn with_timeout(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn cooperative(mut self, cooperative: bool) -> Self {
        self.cooperative = Some(cooperative);
        self
    }

    pub fn with_apartment(mut self, apartment: Apartment) -> Self {
        self.apartment = Some(apartment);
        self
    }
}

/// One concrete row of arguments
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct DataRow {
    pub values: Vec<Value>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub ignore: Option<String>,
}

impl DataRow {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            display_name: None,
            ignore: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn ignored(mut self, reason: impl Into<String>) -> Self {
        self.ignore = Some(reason.into());
        self
    }
}

/// Where rows come from
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Rows written inline in the descriptor
    Rows(Vec<DataRow>),
    /// Rows produced by a generator target on the isolation host
    Generator(String),
    /// Structured records matched to parameters by name
    Records(Vec<BTreeMap<String, Value>>),
}

/// A data source attached to a case template
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct DataSource {
    pub kind: SourceKind,
    /// Marks every row produced by this source as skipped
    #[serde(default)]
    pub ignore: Option<String>,
    #[serde(default)]
    pub strategy: Option<ExpansionStrategy>,
}

impl DataSource {
    pub fn rows(rows: Vec<DataRow>) -> Self {
        Self {
            kind: SourceKind::Rows(rows),
            ignore: None,
            strategy: None,
        }
    }

    pub fn generator(target: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::Generator(target.into()),
            ignore: None,
            strategy: None,
        }
    }

    pub fn records(records: Vec<BTreeMap<String, Value>>) -> Self {
        Self {
            kind: SourceKind::Records(records),
            ignore: None,
            strategy: None,
        }
    }

    pub fn ignored(mut self, reason: impl Into<String>) -> Self {
        self.ignore = Some(reason.into());
        self
    }

    pub fn with_strategy(mut self, strategy: ExpansionStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// A declared case, possibly parameterized
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct CaseTemplate {
    pub name: String,
    /// Body target resolved by the isolation host
    pub body: String,
    #[serde(default)]
    pub params: Vec<ParamDecl>,
    /// Generic slots the body declares
    #[serde(default)]
    pub type_params: Vec<String>,
    #[serde(default)]
    pub sources: Vec<DataSource>,
    #[serde(default)]
    pub ignore: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub cooperative: Option<bool>,
    /// Additional attempts after a failure
    #[serde(default)]
    pub retry: Option<u32>,
    /// Pause before a retry, overriding `retry.delay_ms`
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub retry_backoff: Option<Backoff>,
    #[serde(default)]
    pub apartment: Option<Apartment>,
    #[serde(default)]
    pub strategy: Option<ExpansionStrategy>,
}

impl CaseTemplate {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
            params: Vec::new(),
            type_params: Vec::new(),
            sources: Vec::new(),
            ignore: None,
            timeout_ms: None,
            cooperative: None,
            retry: None,
            retry_delay_ms: None,
            retry_backoff: None,
            apartment: None,
            strategy: None,
        }
    }

    pub fn param(mut self, param: ParamDecl) -> Self {
        self.params.push(param);
        self
    }

    pub fn type_param(mut self, name: impl Into<String>) -> Self {
        self.type_params.push(name.into());
        self
    }

    pub fn source(mut self, source: DataSource) -> Self {
        self.sources.push(source);
        self
    }

    pub fn ignored(mut self, reason: impl Into<String>) -> Self {
        self.ignore = Some(reason.into());
        self
    }

    pub fn with_timeout(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn cooperative(mut self, cooperative: bool) -> Self {
        self.cooperative = Some(cooperative);
        self
    }

    pub fn with_retry(mut self, retries: u32) -> Self {
        self.retry = Some(retries);
        self
    }

    pub fn with_retry_delay(mut self, ms: u64, backoff: Backoff) -> Self {
        self.retry_delay_ms = Some(ms);
        self.retry_backoff = Some(backoff);
        self
    }

    pub fn with_apartment(mut self, apartment: Apartment) -> Self {
        self.apartment = Some(apartment);
        self
    }

    pub fn with_strategy(mut self, strategy: ExpansionStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// One test class
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct FixtureDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Immediate base fixture id
    #[serde(default)]
    pub base: Option<String>,
    /// Isolation boundary the fixture's code lives in
    #[serde(default = "default_boundary")]
    pub boundary: String,
    #[serde(default)]
    pub hooks: Vec<HookDescriptor>,
    #[serde(default)]
    pub ignore: Option<String>,
    #[serde(default)]
    pub cleanup_timing: Option<CleanupTiming>,
    /// `Some(false)` opts the fixture out of parallel execution
    #[serde(default)]
    pub parallel: Option<bool>,
    #[serde(default)]
    pub apartment: Option<Apartment>,
    /// Abstract fixtures only contribute hooks to derived fixtures
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub cases: Vec<CaseTemplate>,
}

pub fn default_boundary() -> String {
    "default".to_string()
}

impl FixtureDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            base: None,
            boundary: default_boundary(),
            hooks: Vec::new(),
            ignore: None,
            cleanup_timing: None,
            parallel: None,
            apartment: None,
            is_abstract: false,
            cases: Vec::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn in_boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = boundary.into();
        self
    }

    pub fn hook(mut self, hook: HookDescriptor) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn case(mut self, case: CaseTemplate) -> Self {
        self.cases.push(case);
        self
    }

    pub fn ignored(mut self, reason: impl Into<String>) -> Self {
        self.ignore = Some(reason.into());
        self
    }

    pub fn with_cleanup_timing(mut self, timing: CleanupTiming) -> Self {
        self.cleanup_timing = Some(timing);
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = Some(parallel);
        self
    }

    pub fn with_apartment(mut self, apartment: Apartment) -> Self {
        self.apartment = Some(apartment);
        self
    }

    pub fn abstract_base(mut self) -> Self {
        self.is_abstract = true;
        self
    }
}

/// Everything discovery produced for one run
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct RunDescriptor {
    /// Run-wide init/cleanup hooks
    #[serde(default)]
    pub run_hooks: Vec<HookDescriptor>,
    #[serde(default)]
    pub fixtures: Vec<FixtureDescriptor>,
}

impl RunDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_hook(mut self, hook: HookDescriptor) -> Self {
        self.run_hooks.push(hook);
        self
    }

    pub fn fixture(mut self, fixture: FixtureDescriptor) -> Self {
        self.fixtures.push(fixture);
        self
    }

    /// Load a descriptor file (YAML or JSON by extension)
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;
        let is_yaml = path
            .extension()
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);

        if is_yaml {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML plan: {}", path.display()))
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON plan: {}", path.display()))
        }
    }
}
