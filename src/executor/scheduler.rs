//! Run scheduler
//!
//! Owns one run from start to finish: run-wide hooks, lazy fixture init,
//! case dispatch over a bounded worker pool, and cleanup once nothing that
//! depends on it is still in flight.
//!
//! Ordering:
//! - run init before any fixture init
//! - a fixture's init before any of its case bodies
//! - a fixture's cleanup after its last case finished
//! - run cleanup after every fixture cleanup

use futures::future::join_all;
use parking_lot::Mutex as SyncMutex;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::aggregator::Aggregator;
use super::apartment::{on_apartment_thread, ApartmentController, ApartmentThread};
use super::context::{ContextBuilder, TestContext};
use super::governor::{Governor, PhaseReport};
use super::lifecycle::{CaseRunner, PhaseEnv};
use crate::config::{EngineConfig, ParallelScope};
use crate::error::{EngineError, HostError, PlanError};
use crate::host::IsolationHost;
use crate::models::{
    default_boundary, Apartment, CaseResult, CleanupTiming, HookFailure, HookScope, Outcome,
    RunDescriptor, RunSummary,
};
use crate::plan::{ExecutionPlan, HookStep, PlanBuilder, PlannedCase, PlannedFixture};
use crate::report::{NullReporter, Reporter};
use crate::utils::timer::Stopwatch;

const RUN_OWNER: &str = "run";

/// External handle on a run: cancellation and the stop-accepting hook
#[derive(Clone, Debug)]
pub struct RunControl {
    token: CancellationToken,
    accepting: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Cancel the run. In-flight phases observe it, unstarted cases end Cancelled.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            info!("Run cancellation requested");
        }
        self.token.cancel();
    }

    /// Stop starting new cases; in-flight cases finish normally
    pub fn stop_accepting(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("Run stopped accepting new cases");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Test execution engine
pub struct Engine {
    config: Arc<EngineConfig>,
    host: Arc<dyn IsolationHost>,
    reporter: Arc<dyn Reporter>,
    control: RunControl,
}

impl Engine {
    pub fn new(config: EngineConfig, host: Arc<dyn IsolationHost>) -> Self {
        Self {
            config: Arc::new(config),
            host,
            reporter: Arc::new(NullReporter),
            control: RunControl::new(),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Handle for cancelling or stopping runs of this engine
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Resolve descriptors into a plan without running anything
    pub fn plan(&self, run: &RunDescriptor) -> Result<ExecutionPlan, PlanError> {
        PlanBuilder::new(&self.config, self.host.as_ref()).build(run)
    }

    pub async fn run_descriptor(&self, run: &RunDescriptor) -> Result<RunSummary, EngineError> {
        let plan = self.plan(run)?;
        Ok(self.run(plan).await)
    }

    /// Execute a plan to completion
    pub async fn run(&self, plan: ExecutionPlan) -> RunSummary {
        let state = Arc::new(RunState::new(plan, self));
        state.execute().await
    }

    /// Build a runtime and block on [`Engine::run`].
    ///
    /// Blocking on the run from a thread that already drives a runtime, or
    /// from an apartment pump, would wait on work scheduled onto the very
    /// thread doing the waiting. Both are refused.
    pub fn run_blocking(&self, plan: ExecutionPlan) -> Result<RunSummary, EngineError> {
        if on_apartment_thread() {
            return Err(EngineError::DeadlockGuard(
                "run_blocking called from an apartment thread".to_string(),
            ));
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(EngineError::DeadlockGuard(
                "run_blocking called from inside an async runtime, await Engine::run instead"
                    .to_string(),
            ));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.parallel.worker_count().max(1))
            .thread_name("unitrun-worker")
            .enable_all()
            .build()?;
        let summary = runtime.block_on(self.run(plan));
        // Abandoned phases must not hold the caller hostage.
        runtime.shutdown_background();
        Ok(summary)
    }
}

#[derive(Clone, Debug)]
enum InitResult {
    Ready,
    Failed {
        outcome: Outcome,
        message: String,
        /// False when the init was abandoned mid-flight
        safe_to_cleanup: bool,
    },
}

struct FixtureRuntime {
    init: OnceCell<InitResult>,
    cleaned: Mutex<bool>,
    remaining: AtomicUsize,
    token: CancellationToken,
    ctx: TestContext,
}

impl FixtureRuntime {
    fn new(fixture: &PlannedFixture, config: &EngineConfig, run_token: &CancellationToken) -> Self {
        let token = run_token.child_token();
        let ctx = ContextBuilder::new("", &fixture.id)
            .display_name(&fixture.display_name)
            .properties(config.properties.clone())
            .build(token.clone());
        Self {
            init: OnceCell::new(),
            cleaned: Mutex::new(false),
            remaining: AtomicUsize::new(fixture.cases.len()),
            token,
            ctx,
        }
    }
}

struct RunState {
    plan: ExecutionPlan,
    config: Arc<EngineConfig>,
    host: Arc<dyn IsolationHost>,
    governor: Governor,
    aggregator: Aggregator,
    apartments: ApartmentController,
    fixtures: Vec<FixtureRuntime>,
    control: RunControl,
    run_boundary: String,
    run_ctx: TestContext,
    run_init: OnceCell<InitResult>,
    loaded: SyncMutex<Vec<String>>,
}

impl RunState {
    fn new(plan: ExecutionPlan, engine: &Engine) -> Self {
        let config = engine.config.clone();
        let control = engine.control.clone();
        let fixtures = plan
            .fixtures
            .iter()
            .map(|fixture| FixtureRuntime::new(fixture, &config, control.token()))
            .collect();
        let run_ctx = ContextBuilder::new("", RUN_OWNER)
            .properties(config.properties.clone())
            .build(control.token().clone());

        Self {
            governor: Governor::new(engine.host.clone(), config.timeouts.grace()),
            aggregator: Aggregator::new(engine.reporter.clone(), config.map_inconclusive_to_failed),
            apartments: ApartmentController::new(),
            host: engine.host.clone(),
            run_boundary: default_boundary(),
            run_init: OnceCell::new(),
            loaded: SyncMutex::new(Vec::new()),
            plan,
            config,
            fixtures,
            control,
            run_ctx,
        }
    }

    async fn execute(self: Arc<Self>) -> RunSummary {
        let mut stopwatch = Stopwatch::new();
        info!(
            "Starting run: {} fixture(s), {} case(s), scope {:?}, {} worker(s)",
            self.plan.fixtures.len(),
            self.plan.case_count(),
            self.config.parallel.scope,
            self.config.parallel.worker_count()
        );

        if self.plan.run_init.is_some() {
            self.run_init.get_or_init(|| self.initialize_run()).await;
        }
        stopwatch.lap("run init");

        self.schedule().await;
        stopwatch.lap("cases");

        // End-of-run cleanups, derived fixtures' plan position first
        for index in (0..self.fixtures.len()).rev() {
            self.cleanup_fixture(index).await;
        }
        stopwatch.lap("fixture cleanup");

        self.cleanup_run().await;
        self.release();
        stopwatch.lap("run cleanup");

        debug!("Run timings: {}", stopwatch.format());
        let summary = self.aggregator.finish();
        info!(
            "Run finished in {}ms - Pass: {}/{} ({:.1}%)",
            summary.total_duration_ms,
            summary.passed,
            summary.total,
            summary.pass_rate()
        );
        summary
    }

    async fn schedule(self: &Arc<Self>) {
        let (parallel, serial): (Vec<usize>, Vec<usize>) =
            (0..self.plan.fixtures.len()).partition(|&index| self.plan.fixtures[index].parallel);

        match self.config.parallel.scope {
            ParallelScope::Disabled => {
                for index in 0..self.plan.fixtures.len() {
                    self.run_fixture(index, false).await;
                }
                return;
            }
            ParallelScope::Case => self.dispatch_cases(&parallel).await,
            ParallelScope::Fixture => self.dispatch_fixtures(&parallel).await,
        }

        if !serial.is_empty() {
            debug!("Running {} fixture(s) that opted out of parallel execution", serial.len());
        }
        for index in serial {
            self.run_fixture(index, false).await;
        }
    }

    /// Every case is its own work unit
    async fn dispatch_cases(self: &Arc<Self>, fixtures: &[usize]) {
        let semaphore = Arc::new(Semaphore::new(self.config.parallel.worker_count()));
        let mut handles = Vec::new();

        for &fixture in fixtures {
            for case in 0..self.plan.fixtures[fixture].cases.len() {
                let state = Arc::clone(self);
                let semaphore = semaphore.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    state.execute_case(fixture, case).await;
                }));
            }
        }

        join_workers(handles).await;
    }

    /// Each fixture holds one worker for its whole run
    async fn dispatch_fixtures(self: &Arc<Self>, fixtures: &[usize]) {
        let semaphore = Arc::new(Semaphore::new(self.config.parallel.worker_count()));
        let concurrent = self.config.parallel.fixture_cases_concurrent;
        let mut handles = Vec::new();

        for &fixture in fixtures {
            let state = Arc::clone(self);
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                state.run_fixture(fixture, concurrent).await;
            }));
        }

        join_workers(handles).await;
    }

    async fn run_fixture(&self, index: usize, concurrent: bool) {
        let count = self.plan.fixtures[index].cases.len();
        if concurrent {
            join_all((0..count).map(|case| self.execute_case(index, case))).await;
        } else {
            for case in 0..count {
                self.execute_case(index, case).await;
            }
        }
    }

    async fn execute_case(&self, fixture_index: usize, case_index: usize) {
        let fixture = &self.plan.fixtures[fixture_index];
        let case = &fixture.cases[case_index];

        let result = self.case_result(fixture_index, case).await;
        self.aggregator.case_finished(result);

        let runtime = &self.fixtures[fixture_index];
        let last = runtime.remaining.fetch_sub(1, Ordering::AcqRel) == 1;
        if last && fixture.cleanup_timing == CleanupTiming::EndOfClass {
            self.cleanup_fixture(fixture_index).await;
        }
    }

    async fn case_result(&self, fixture_index: usize, case: &PlannedCase) -> CaseResult {
        if let Some((outcome, message)) = case.disposition.preset() {
            return unstarted(case, outcome, message);
        }
        if self.control.is_cancelled() {
            return unstarted(case, Outcome::Cancelled, "Run was cancelled before the case started");
        }
        if !self.control.is_accepting() {
            return unstarted(
                case,
                Outcome::Skipped,
                "Case not started: run stopped accepting new cases",
            );
        }
        if let Some(InitResult::Failed { outcome, message, .. }) = self.run_init.get() {
            return unstarted(case, *outcome, message);
        }

        let runtime = &self.fixtures[fixture_index];
        let init = runtime
            .init
            .get_or_init(|| self.initialize_fixture(fixture_index))
            .await;
        if let InitResult::Failed { outcome, message, .. } = init {
            return unstarted(case, *outcome, message);
        }

        let runner = CaseRunner {
            env: self.fixture_env(fixture_index),
            fixture: &self.plan.fixtures[fixture_index],
        };
        runner.run_case(case, &runtime.token.child_token()).await
    }

    async fn initialize_run(&self) -> InitResult {
        let Some(step) = &self.plan.run_init else {
            return InitResult::Ready;
        };
        if let Err(err) = self.ensure_loaded(&self.run_boundary) {
            return self.load_failed(HookScope::Run, RUN_OWNER, err);
        }

        info!("Running run init");
        let env = self.run_env(step);
        match env
            .run_chain(slice::from_ref(step), RUN_OWNER, &self.run_ctx, self.control.token(), false)
            .await
        {
            None => InitResult::Ready,
            Some(report) => {
                self.record_hook_failure(HookScope::Run, RUN_OWNER, &report);
                self.init_failure("Run init", &report)
            }
        }
    }

    async fn initialize_fixture(&self, index: usize) -> InitResult {
        let fixture = &self.plan.fixtures[index];
        let runtime = &self.fixtures[index];
        if let Err(err) = self.ensure_loaded(&fixture.boundary) {
            return self.load_failed(HookScope::Fixture, &fixture.id, err);
        }

        info!("Initializing fixture {}", fixture.id);
        let env = self.fixture_env(index);
        let single_threaded = fixture.apartment == Apartment::SingleThreaded;
        match env
            .run_chain(&fixture.init_chain, &fixture.id, &runtime.ctx, &runtime.token, single_threaded)
            .await
        {
            None => InitResult::Ready,
            Some(report) => {
                self.record_hook_failure(HookScope::Fixture, &fixture.id, &report);
                self.init_failure(&format!("Fixture init of '{}'", fixture.id), &report)
            }
        }
    }

    /// What dependent cases report after a failed init
    fn init_failure(&self, what: &str, report: &PhaseReport) -> InitResult {
        let outcome = match report.outcome() {
            Outcome::Inconclusive => Outcome::Inconclusive,
            Outcome::Cancelled => Outcome::Cancelled,
            _ => self.config.fixture_init_failure.outcome(),
        };
        InitResult::Failed {
            outcome,
            message: format!("{what} failed: {}", report.message().unwrap_or_default()),
            safe_to_cleanup: !report.abandoned,
        }
    }

    fn load_failed(&self, scope: HookScope, owner: &str, err: HostError) -> InitResult {
        self.aggregator.hook_failed(HookFailure {
            scope,
            owner: owner.to_string(),
            hook: "boundary load".to_string(),
            outcome: Outcome::Failed,
            message: err.to_string(),
        });
        InitResult::Failed {
            outcome: self.config.fixture_init_failure.outcome(),
            message: err.to_string(),
            safe_to_cleanup: false,
        }
    }

    /// Runs at most once per fixture, and only if its init ran
    async fn cleanup_fixture(&self, index: usize) {
        let fixture = &self.plan.fixtures[index];
        let runtime = &self.fixtures[index];

        let mut cleaned = runtime.cleaned.lock().await;
        if *cleaned {
            return;
        }
        *cleaned = true;

        match runtime.init.get() {
            None => {}
            Some(InitResult::Failed {
                safe_to_cleanup: false,
                ..
            }) => {
                warn!(
                    "Skipping cleanup of fixture {}: its init did not finish",
                    fixture.id
                );
            }
            Some(_) => {
                debug!("Cleaning up fixture {}", fixture.id);
                let env = self.fixture_env(index);
                let single_threaded = fixture.apartment == Apartment::SingleThreaded;
                let failures = env
                    .run_all(
                        &fixture.cleanup_chain,
                        &fixture.id,
                        &runtime.ctx,
                        &runtime.token,
                        single_threaded,
                    )
                    .await;
                for report in failures {
                    self.record_hook_failure(HookScope::Fixture, &fixture.id, &report);
                }
            }
        }

        self.apartments.release(&fixture.id);
    }

    async fn cleanup_run(&self) {
        let Some(step) = &self.plan.run_cleanup else {
            return;
        };
        if let Some(InitResult::Failed {
            safe_to_cleanup: false,
            ..
        }) = self.run_init.get()
        {
            warn!("Skipping run cleanup: run init did not finish");
            return;
        }
        if let Err(err) = self.ensure_loaded(&self.run_boundary) {
            self.load_failed(HookScope::Run, RUN_OWNER, err);
            return;
        }

        info!("Running run cleanup");
        let env = self.run_env(step);
        let failures = env
            .run_all(slice::from_ref(step), RUN_OWNER, &self.run_ctx, self.control.token(), false)
            .await;
        for report in failures {
            self.record_hook_failure(HookScope::Run, RUN_OWNER, &report);
        }
    }

    /// Drop apartments and unload every boundary this run loaded
    fn release(&self) {
        self.apartments.release(RUN_OWNER);
        let loaded = std::mem::take(&mut *self.loaded.lock());
        for boundary in loaded.iter().rev() {
            match self.host.unload(boundary) {
                Ok(()) => debug!("Unloaded boundary {}", boundary),
                Err(err) => self.aggregator.hook_failed(HookFailure {
                    scope: HookScope::Run,
                    owner: RUN_OWNER.to_string(),
                    hook: "boundary unload".to_string(),
                    outcome: Outcome::Failed,
                    message: err.to_string(),
                }),
            }
        }
    }

    /// Load a boundary on first use
    fn ensure_loaded(&self, boundary: &str) -> Result<(), HostError> {
        let mut loaded = self.loaded.lock();
        if loaded.iter().any(|b| b == boundary) {
            return Ok(());
        }
        self.host.load(boundary)?;
        debug!("Loaded boundary {}", boundary);
        loaded.push(boundary.to_string());
        Ok(())
    }

    fn record_hook_failure(&self, scope: HookScope, owner: &str, report: &PhaseReport) {
        if !report.outcome().is_failure() {
            return;
        }
        self.aggregator.hook_failed(HookFailure {
            scope,
            owner: owner.to_string(),
            hook: report.phase.to_string(),
            outcome: report.outcome(),
            message: report.message().unwrap_or_default(),
        });
    }

    fn fixture_env(&self, index: usize) -> PhaseEnv<'_> {
        let fixture = &self.plan.fixtures[index];
        PhaseEnv {
            governor: &self.governor,
            config: &self.config,
            boundary: &fixture.boundary,
            apartment: fixture
                .needs_apartment()
                .then(|| self.apartment(&fixture.id))
                .flatten(),
        }
    }

    /// Run hooks stay off fixture apartments unless they ask for their own
    fn run_env(&self, step: &HookStep) -> PhaseEnv<'_> {
        PhaseEnv {
            governor: &self.governor,
            config: &self.config,
            boundary: &self.run_boundary,
            apartment: (step.apartment == Apartment::SingleThreaded)
                .then(|| self.apartment(RUN_OWNER))
                .flatten(),
        }
    }

    fn apartment(&self, owner: &str) -> Option<Arc<ApartmentThread>> {
        match self.apartments.get_or_spawn(owner) {
            Ok(thread) => Some(thread),
            Err(err) => {
                warn!("Failed to start apartment thread for {}: {}", owner, err);
                None
            }
        }
    }
}

fn unstarted(case: &PlannedCase, outcome: Outcome, message: &str) -> CaseResult {
    let mut result = CaseResult::new(&case.id, &case.fixture_id, outcome)
        .with_display_name(&case.display_name)
        .with_message(message);
    result.plan_index = case.index;
    result
}

async fn join_workers(handles: Vec<JoinHandle<()>>) {
    for result in join_all(handles).await {
        if let Err(err) = result {
            warn!("Worker task failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InitFailurePolicy;
    use crate::host::{InProcessHost, ScriptedHost};
    use crate::models::{
        CaseTemplate, DataRow, DataSource, FixtureDescriptor, HookDescriptor, HookKind, ParamDecl,
        ParamType, Value,
    };
    use crate::report::FailureLimit;
    use std::time::{Duration, Instant};

    fn hook(kind: HookKind, label: &str) -> HookDescriptor {
        HookDescriptor::new(kind, format!("record {label}"))
    }

    fn case(name: &str, script: &str) -> CaseTemplate {
        CaseTemplate::new(name, script)
    }

    async fn run(
        config: EngineConfig,
        descriptor: RunDescriptor,
    ) -> (RunSummary, Arc<ScriptedHost>) {
        let host = Arc::new(ScriptedHost::new());
        let engine = Engine::new(config, host.clone());
        let summary = engine.run_descriptor(&descriptor).await.unwrap();
        (summary, host)
    }

    #[tokio::test]
    async fn test_phase_ordering_in_event_log() {
        let descriptor = RunDescriptor::new()
            .run_hook(hook(HookKind::RunInit, "run init"))
            .run_hook(hook(HookKind::RunCleanup, "run cleanup"))
            .fixture(
                FixtureDescriptor::new("Calc")
                    .hook(hook(HookKind::FixtureInit, "fixture init"))
                    .hook(hook(HookKind::FixtureCleanup, "fixture cleanup"))
                    .hook(hook(HookKind::CaseInit, "case init"))
                    .hook(hook(HookKind::CaseCleanup, "case cleanup"))
                    .case(case("adds", "record body adds"))
                    .case(case("subtracts", "record body subtracts")),
            );

        let (summary, host) = run(EngineConfig::default(), descriptor).await;

        assert_eq!(summary.passed, 2);
        assert_eq!(
            host.journal(),
            vec![
                "run init",
                "fixture init",
                "case init",
                "body adds",
                "case cleanup",
                "case init",
                "body subtracts",
                "case cleanup",
                "fixture cleanup",
                "run cleanup",
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fixture_init_runs_once_under_case_scope() {
        let mut fixture = FixtureDescriptor::new("Shared")
            .hook(HookDescriptor::new(HookKind::FixtureInit, "record init; sleep 50"))
            .hook(hook(HookKind::FixtureCleanup, "cleanup"));
        for n in 0..8 {
            fixture = fixture.case(case(&format!("case{n}"), "sleep 10; record body"));
        }
        let config = EngineConfig::new()
            .with_scope(ParallelScope::Case)
            .with_workers(4);

        let (summary, host) = run(config, RunDescriptor::new().fixture(fixture)).await;

        assert_eq!(summary.passed, 8);
        let journal = host.journal();
        assert_eq!(journal.iter().filter(|e| *e == "init").count(), 1);
        assert_eq!(journal.iter().filter(|e| *e == "body").count(), 8);
        assert_eq!(journal.first().map(String::as_str), Some("init"));
        assert_eq!(journal.last().map(String::as_str), Some("cleanup"));
    }

    #[tokio::test]
    async fn test_fixture_init_failure_follows_policy_and_still_cleans_up() {
        let descriptor = RunDescriptor::new().fixture(
            FixtureDescriptor::new("Db")
                .hook(HookDescriptor::new(HookKind::FixtureInit, "fail db down"))
                .hook(hook(HookKind::FixtureCleanup, "cleanup"))
                .case(case("reads", "record body")),
        );

        let mut config = EngineConfig::default();
        config.fixture_init_failure = InitFailurePolicy::Skipped;
        let (summary, host) = run(config, descriptor.clone()).await;
        let result = summary.result("Db.reads").unwrap();
        assert_eq!(result.outcome, Outcome::Skipped);
        assert!(result.message.as_deref().unwrap().contains("db down"));
        assert_eq!(host.journal(), vec!["cleanup"]);
        assert_eq!(summary.hook_failures.len(), 1);
        assert_eq!(summary.hook_failures[0].scope, HookScope::Fixture);

        let (summary, _) = run(EngineConfig::default(), descriptor).await;
        assert_eq!(summary.result("Db.reads").unwrap().outcome, Outcome::Failed);
    }

    #[tokio::test]
    async fn test_inconclusive_fixture_init() {
        let descriptor = RunDescriptor::new().fixture(
            FixtureDescriptor::new("Gpu")
                .hook(HookDescriptor::new(HookKind::FixtureInit, "inconclusive no gpu"))
                .case(case("renders", "record body")),
        );
        let (summary, host) = run(EngineConfig::default(), descriptor).await;
        let result = summary.result("Gpu.renders").unwrap();
        assert_eq!(result.outcome, Outcome::Inconclusive);
        assert!(result.message.as_deref().unwrap().contains("no gpu"));
        assert!(host.journal().is_empty());
        assert!(summary.hook_failures.is_empty());
    }

    #[tokio::test]
    async fn test_run_init_failure_fails_every_case() {
        let descriptor = RunDescriptor::new()
            .run_hook(HookDescriptor::new(HookKind::RunInit, "fail no network"))
            .run_hook(hook(HookKind::RunCleanup, "run cleanup"))
            .fixture(FixtureDescriptor::new("A").case(case("one", "record body")))
            .fixture(FixtureDescriptor::new("B").case(case("two", "record body")));

        let (summary, host) = run(EngineConfig::default(), descriptor).await;
        assert_eq!(summary.failed, 2);
        assert!(summary.results.iter().all(|r| r
            .message
            .as_deref()
            .unwrap()
            .starts_with("Run init failed")));
        assert_eq!(host.journal(), vec!["run cleanup"]);
    }

    #[tokio::test]
    async fn test_end_of_run_cleanup_precedes_run_cleanup() {
        let descriptor = RunDescriptor::new()
            .run_hook(hook(HookKind::RunCleanup, "run cleanup"))
            .fixture(
                FixtureDescriptor::new("Late")
                    .with_cleanup_timing(CleanupTiming::EndOfRun)
                    .hook(hook(HookKind::FixtureCleanup, "late cleanup"))
                    .case(case("a", "record late body")),
            )
            .fixture(
                FixtureDescriptor::new("Early")
                    .hook(hook(HookKind::FixtureCleanup, "early cleanup"))
                    .case(case("b", "record early body")),
            );

        let (_, host) = run(EngineConfig::default(), descriptor).await;
        assert_eq!(
            host.journal(),
            vec![
                "late body",
                "early body",
                "early cleanup",
                "late cleanup",
                "run cleanup",
            ]
        );
    }

    #[tokio::test]
    async fn test_ignored_fixture_runs_no_hooks() {
        let descriptor = RunDescriptor::new().fixture(
            FixtureDescriptor::new("Off")
                .ignored("broken on CI")
                .hook(hook(HookKind::FixtureInit, "init"))
                .hook(hook(HookKind::FixtureCleanup, "cleanup"))
                .case(case("a", "record body")),
        );
        let (summary, host) = run(EngineConfig::default(), descriptor).await;
        assert_eq!(summary.skipped, 1);
        assert!(host.journal().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_threaded_fixture_stays_on_its_apartment() {
        let threads = Arc::new(SyncMutex::new(Vec::new()));
        let seen = threads.clone();
        let host = InProcessHost::new().hook("where", move |_, _| {
            seen.lock()
                .push(std::thread::current().name().map(str::to_string));
            Ok(())
        });

        let mut fixture = FixtureDescriptor::new("Ui")
            .with_apartment(Apartment::SingleThreaded)
            .hook(HookDescriptor::new(HookKind::FixtureInit, "where"))
            .hook(HookDescriptor::new(HookKind::CaseInit, "where"));
        for n in 0..3 {
            fixture = fixture.case(case(&format!("click{n}"), "where"));
        }
        let config = EngineConfig::new()
            .with_scope(ParallelScope::Case)
            .with_workers(3);
        let engine = Engine::new(config, Arc::new(host));

        let summary = engine
            .run_descriptor(&RunDescriptor::new().fixture(fixture))
            .await
            .unwrap();

        assert_eq!(summary.passed, 3);
        let threads = threads.lock();
        assert_eq!(threads.len(), 7);
        assert!(threads
            .iter()
            .all(|name| name.as_deref() == Some("unitrun-sta-Ui")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abandoned_apartment_phase_does_not_stall_later_cases() {
        let descriptor = RunDescriptor::new().fixture(
            FixtureDescriptor::new("Ui")
                .with_apartment(Apartment::SingleThreaded)
                .case(case("hangs", "sleep 4000").with_timeout(200))
                .case(case("next", "pass").with_timeout(1000))
                .case(case("last", "pass")),
        );

        let started = Instant::now();
        let (summary, _) = run(EngineConfig::default(), descriptor).await;

        assert!(started.elapsed() < Duration::from_millis(2500));
        assert_eq!(summary.result("Ui.hangs").unwrap().outcome, Outcome::TimedOut);
        for id in ["Ui.next", "Ui.last"] {
            let result = summary.result(id).unwrap();
            assert_eq!(result.outcome, Outcome::Passed, "{id}");
            assert!(result.duration_ms < 1000, "{id} took {}ms", result.duration_ms);
        }
    }

    #[tokio::test]
    async fn test_retry_does_not_rerun_fixture_hooks() {
        let descriptor = RunDescriptor::new().fixture(
            FixtureDescriptor::new("Flaky")
                .hook(hook(HookKind::FixtureInit, "init"))
                .hook(hook(HookKind::FixtureCleanup, "cleanup"))
                .case(case("settles", "record body; flaky 2").with_retry(3)),
        );

        let (summary, host) = run(EngineConfig::default(), descriptor).await;

        let result = summary.result("Flaky.settles").unwrap();
        assert_eq!(result.outcome, Outcome::Passed);
        assert_eq!(result.attempts, 3);
        assert_eq!(
            host.journal(),
            vec!["init", "body", "body", "body", "cleanup"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_reaches_running_and_unstarted_cases() {
        let descriptor = RunDescriptor::new().fixture(
            FixtureDescriptor::new("Slow")
                .hook(hook(HookKind::FixtureCleanup, "cleanup"))
                .case(case("waits", "wait-cancel 5000"))
                .case(case("never", "record never")),
        );
        let host = Arc::new(ScriptedHost::new());
        let engine = Engine::new(EngineConfig::default(), host.clone());
        let control = engine.control();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            control.cancel();
        });

        let started = Instant::now();
        let summary = engine.run_descriptor(&descriptor).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(summary.cancelled, 2);
        assert_eq!(host.journal(), vec!["cleanup"]);
    }

    #[tokio::test]
    async fn test_failure_limit_stops_accepting_new_cases() {
        let descriptor = RunDescriptor::new().fixture(
            FixtureDescriptor::new("F")
                .case(case("a", "fail first"))
                .case(case("b", "pass"))
                .case(case("c", "pass")),
        );
        let engine = Engine::new(EngineConfig::default(), Arc::new(ScriptedHost::new()));
        let limit = FailureLimit::new(1, engine.control());
        let engine = engine.with_reporter(Arc::new(limit));

        let summary = engine.run_descriptor(&descriptor).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 2);
        assert!(summary
            .result("F.c")
            .and_then(|r| r.message.as_deref())
            .unwrap()
            .contains("run stopped"));
    }

    #[tokio::test]
    async fn test_repeated_runs_yield_identical_totals() {
        let descriptor = RunDescriptor::new().fixture(
            FixtureDescriptor::new("F")
                .case(case("a", "pass"))
                .case(case("b", "fail nope"))
                .case(case("c", "inconclusive later"))
                .case(case("d", "pass").ignored("wip")),
        );
        let engine = Engine::new(
            EngineConfig::new().with_scope(ParallelScope::Case),
            Arc::new(ScriptedHost::new()),
        );
        let plan = engine.plan(&descriptor).unwrap();

        let first = engine.run(plan.clone()).await;
        let second = engine.run(plan).await;
        assert_eq!(first.totals(), second.totals());
        assert_eq!(first.totals().passed, 1);
        assert_eq!(first.totals().failed, 1);
        assert_eq!(first.totals().inconclusive, 1);
        assert_eq!(first.totals().skipped, 1);
    }

    #[tokio::test]
    async fn test_empty_source_policy() {
        let descriptor = RunDescriptor::new().fixture(
            FixtureDescriptor::new("Data").case(
                case("each", "pass")
                    .param(ParamDecl::new("n", ParamType::Int))
                    .source(DataSource::generator("empty")),
            ),
        );

        let mut config = EngineConfig::default();
        config.empty_data_source_is_inconclusive = true;
        let (summary, _) = run(config, descriptor.clone()).await;
        assert_eq!(summary.inconclusive, 1);

        let mut config = EngineConfig::default();
        config.empty_data_source_is_inconclusive = false;
        let (summary, _) = run(config, descriptor).await;
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_generic_inference_failures_are_failed_cases() {
        let generic = || {
            case("echo", "record body")
                .type_param("T")
                .param(ParamDecl::new("value", ParamType::Generic("T".into())))
        };
        let descriptor = RunDescriptor::new()
            .fixture(FixtureDescriptor::new("NoArgs").case(generic()))
            .fixture(
                FixtureDescriptor::new("Mixed").case(generic().source(DataSource::rows(vec![
                    DataRow::new(vec![Value::Int(1)]),
                    DataRow::new(vec![Value::Str("one".into())]),
                ]))),
            );

        let (summary, host) = run(EngineConfig::default(), descriptor).await;

        assert_eq!(summary.failed, 3);
        assert!(host.journal().is_empty());
        let message = |id: &str| summary.result(id).and_then(|r| r.message.clone()).unwrap();
        assert!(message("NoArgs.echo").contains("could not be inferred"));
        assert!(message("Mixed.echo#1").contains("conflicting types"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_body_timeout_returns_promptly() {
        let descriptor = RunDescriptor::new().fixture(
            FixtureDescriptor::new("Slow")
                .hook(hook(HookKind::CaseCleanup, "case cleanup"))
                .case(case("sleeps", "sleep 10000").with_timeout(1000)),
        );

        let started = Instant::now();
        let (summary, host) = run(EngineConfig::default(), descriptor).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        let result = summary.result("Slow.sleeps").unwrap();
        assert_eq!(result.outcome, Outcome::TimedOut);
        let message = result.message.as_deref().unwrap();
        assert!(message.contains("Slow.sleeps"));
        assert!(message.contains("1000ms"));
        assert_eq!(host.journal(), vec!["case cleanup"]);
    }

    #[tokio::test]
    async fn test_boundaries_load_once_and_unload_at_end() {
        let host = Arc::new(InProcessHost::new().hook("noop", |_, _| Ok(())));
        let descriptor = RunDescriptor::new()
            .fixture(
                FixtureDescriptor::new("A")
                    .in_boundary("shared")
                    .case(case("a", "noop")),
            )
            .fixture(
                FixtureDescriptor::new("B")
                    .in_boundary("shared")
                    .case(case("b", "noop")),
            )
            .fixture(FixtureDescriptor::new("C").in_boundary("other").case(case("c", "noop")));
        let engine = Engine::new(EngineConfig::default(), host.clone());

        let summary = engine.run_descriptor(&descriptor).await.unwrap();

        assert_eq!(summary.passed, 3);
        assert!(summary.hook_failures.is_empty());
        assert_eq!(host.load_count("shared"), 1);
        assert_eq!(host.load_count("other"), 1);
        assert!(!host.is_loaded("shared"));
        assert!(!host.is_loaded("other"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fixture_scope_runs_fixtures_concurrently() {
        let mut descriptor = RunDescriptor::new();
        for n in 0..3 {
            descriptor = descriptor.fixture(
                FixtureDescriptor::new(format!("F{n}")).case(case("waits", "sleep 300")),
            );
        }
        let config = EngineConfig::new()
            .with_scope(ParallelScope::Fixture)
            .with_workers(3);

        let started = Instant::now();
        let (summary, _) = run(config, descriptor).await;

        assert_eq!(summary.passed, 3);
        assert!(started.elapsed() < Duration::from_millis(850));
    }

    #[tokio::test]
    async fn test_run_blocking_refuses_inside_runtime() {
        let engine = Engine::new(EngineConfig::default(), Arc::new(ScriptedHost::new()));
        let result = engine.run_blocking(ExecutionPlan::default());
        assert!(matches!(result, Err(EngineError::DeadlockGuard(_))));
    }

    #[test]
    fn test_run_blocking_outside_runtime() {
        let engine = Engine::new(EngineConfig::default(), Arc::new(ScriptedHost::new()));
        let plan = engine
            .plan(&RunDescriptor::new().fixture(FixtureDescriptor::new("F").case(case("a", "pass"))))
            .unwrap();
        let summary = engine.run_blocking(plan).unwrap();
        assert_eq!(summary.passed, 1);
    }
}
