//! Lifecycle executor
//!
//! Drives one case through construct, case init, body, case cleanup and
//! teardown. Cleanup phases still run after an earlier failure; their own
//! failures are added to the verdict but never soften it.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::apartment::ApartmentThread;
use super::context::{ContextBuilder, TestContext};
use super::governor::{Governor, PhaseCall, PhaseReport};
use super::retry::RetryPolicy;
use super::state::{LifecycleState, Phase};
use crate::config::EngineConfig;
use crate::models::{Apartment, CaseResult, Outcome};
use crate::plan::{HookKindKey, HookStep, Invocation, PlannedCase, PlannedFixture};
use crate::utils::timer::Timer;

/// Where phases of one fixture run
pub(crate) struct PhaseEnv<'a> {
    pub governor: &'a Governor,
    pub config: &'a EngineConfig,
    pub boundary: &'a str,
    pub apartment: Option<Arc<ApartmentThread>>,
}

impl PhaseEnv<'_> {
    /// Build the governed call for a hook
    pub fn hook_call(
        &self,
        step: &HookStep,
        qualified_name: &str,
        single_threaded: bool,
    ) -> PhaseCall {
        let phase = Phase::from_hook(step.kind);
        let on_apartment = single_threaded || step.apartment == Apartment::SingleThreaded;
        PhaseCall::new(phase, qualified_name, self.boundary, &step.target)
            .with_timeout(self.config.timeouts.resolve(phase, step.timeout_ms))
            .cooperative(
                step.cooperative
                    .unwrap_or(self.config.timeouts.cooperative_cancellation),
            )
            .on_apartment(on_apartment.then(|| self.apartment.clone()).flatten())
    }

    /// Run hooks in order, stopping at the first one that does not complete
    pub async fn run_chain(
        &self,
        steps: &[HookStep],
        qualified_name: &str,
        ctx: &TestContext,
        owner: &CancellationToken,
        single_threaded: bool,
    ) -> Option<PhaseReport> {
        for step in steps {
            let call = self.hook_call(step, qualified_name, single_threaded);
            let report = self.governor.run(call, ctx, owner).await;
            if !report.is_completed() {
                return Some(report);
            }
        }
        None
    }

    /// Run every hook even after one fails; returns the failures
    pub async fn run_all(
        &self,
        steps: &[HookStep],
        qualified_name: &str,
        ctx: &TestContext,
        owner: &CancellationToken,
        single_threaded: bool,
    ) -> Vec<PhaseReport> {
        let mut failures = Vec::new();
        for step in steps {
            let call = self.hook_call(step, qualified_name, single_threaded);
            let report = self.governor.run(call, ctx, owner).await;
            if !report.is_completed() {
                failures.push(report);
            }
        }
        failures
    }
}

/// Accumulated outcome of a sequence of phases
#[derive(Clone, Debug)]
struct Verdict {
    outcome: Outcome,
    message: Option<String>,
    trace: Option<String>,
}

impl Default for Verdict {
    fn default() -> Self {
        Self {
            outcome: Outcome::Passed,
            message: None,
            trace: None,
        }
    }
}

impl Verdict {
    fn record(&mut self, outcome: Outcome, message: Option<String>, trace: Option<String>) {
        if outcome == Outcome::Passed {
            return;
        }
        if self.outcome == Outcome::Passed {
            self.outcome = outcome;
            self.message = message;
            self.trace = trace;
            return;
        }
        self.outcome = self.outcome.merge(outcome);
        if let Some(extra) = message {
            self.message = Some(match self.message.take() {
                Some(previous) => format!("{previous}\n{extra}"),
                None => extra,
            });
        }
    }

    fn absorb(&mut self, report: &PhaseReport) {
        let message = report.message().map(|msg| {
            if self.outcome == Outcome::Passed {
                msg
            } else {
                format!("{} also failed: {msg}", report.phase)
            }
        });
        self.record(report.outcome(), message, report.trace());
    }
}

struct SequenceReport {
    verdict: Verdict,
    output: String,
}

/// Runs the cases of one fixture
pub(crate) struct CaseRunner<'a> {
    pub env: PhaseEnv<'a>,
    pub fixture: &'a PlannedFixture,
}

impl CaseRunner<'_> {
    /// Run every attempt of `case` and produce its final result
    pub async fn run_case(&self, case: &PlannedCase, token: &CancellationToken) -> CaseResult {
        let timer = Timer::start(format!("Case '{}'", case.id));
        let policy = RetryPolicy::resolve(&self.env.config.retry, case.retry);

        let mut attempt = 1;
        let report = loop {
            debug!("Running {} (attempt {}/{})", case.id, attempt, policy.max_attempts());
            let report = self.run_attempt(case, attempt, token).await;

            if !policy.should_retry(attempt, report.verdict.outcome) || token.is_cancelled() {
                break report;
            }
            info!(
                "Case {} failed on attempt {}/{}, retrying",
                case.id,
                attempt,
                policy.max_attempts()
            );
            let delay = policy.delay_after(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        };

        let mut result = CaseResult::new(&case.id, &case.fixture_id, report.verdict.outcome)
            .with_display_name(&case.display_name)
            .with_trace(report.verdict.trace)
            .with_attempts(attempt)
            .with_duration(timer.stop().as_millis() as u64);
        result.message = report.verdict.message;
        result.output = report.output;
        result.plan_index = case.index;
        result
    }

    /// One attempt; a folded case runs every row in sequence
    async fn run_attempt(
        &self,
        case: &PlannedCase,
        attempt: u32,
        token: &CancellationToken,
    ) -> SequenceReport {
        let folded = case.is_folded();
        let mut verdict = Verdict::default();
        let mut output = String::new();

        for invocation in &case.invocations {
            let label = |msg: String| {
                if folded {
                    format!("{}: {msg}", invocation.label)
                } else {
                    msg
                }
            };

            if let Some((outcome, message)) = invocation.disposition.preset() {
                if outcome != Outcome::Skipped {
                    verdict.record(outcome, Some(label(message.to_string())), None);
                }
                continue;
            }

            let sequence = self.run_sequence(case, invocation, attempt, token).await;
            output.push_str(&sequence.output);
            verdict.record(
                sequence.verdict.outcome,
                sequence.verdict.message.map(label),
                sequence.verdict.trace,
            );
        }

        SequenceReport { verdict, output }
    }

    /// Construct through teardown for one row of arguments
    async fn run_sequence(
        &self,
        case: &PlannedCase,
        invocation: &Invocation,
        attempt: u32,
        token: &CancellationToken,
    ) -> SequenceReport {
        let ctx = ContextBuilder::new(&case.id, &case.fixture_id)
            .display_name(&invocation.label)
            .attempt(attempt)
            .bindings(case.bindings.clone())
            .properties(self.env.config.properties.clone())
            .build(token.clone());
        let single_threaded = case.apartment == Apartment::SingleThreaded;
        let mut verdict = Verdict::default();
        let mut state = LifecycleState::Construct;

        while !state.is_terminal() {
            state = match state {
                LifecycleState::Construct => {
                    match self
                        .chain(HookKindKey::Construct, case, &ctx, token, single_threaded)
                        .await
                    {
                        None => LifecycleState::CaseInit,
                        Some(report) => {
                            verdict.absorb(&report);
                            LifecycleState::Finished(verdict.outcome)
                        }
                    }
                }
                LifecycleState::CaseInit => {
                    match self
                        .chain(HookKindKey::CaseInit, case, &ctx, token, single_threaded)
                        .await
                    {
                        None => LifecycleState::Body,
                        Some(report) => {
                            verdict.absorb(&report);
                            LifecycleState::CaseCleanup
                        }
                    }
                }
                LifecycleState::Body => {
                    let call = PhaseCall::new(Phase::Body, &case.id, self.env.boundary, &case.body)
                        .with_args(invocation.args.clone())
                        .with_timeout(
                            self.env
                                .config
                                .timeouts
                                .resolve(Phase::Body, case.timeout_ms),
                        )
                        .cooperative(
                            case.cooperative
                                .unwrap_or(self.env.config.timeouts.cooperative_cancellation),
                        )
                        .on_apartment(single_threaded.then(|| self.env.apartment.clone()).flatten());
                    let report = self.env.governor.run(call, &ctx, token).await;
                    verdict.absorb(&report);
                    LifecycleState::CaseCleanup
                }
                LifecycleState::CaseCleanup => {
                    for report in self
                        .cleanup(HookKindKey::CaseCleanup, case, &ctx, token, single_threaded)
                        .await
                    {
                        verdict.absorb(&report);
                    }
                    LifecycleState::Teardown
                }
                LifecycleState::Teardown => {
                    for report in self
                        .cleanup(HookKindKey::Teardown, case, &ctx, token, single_threaded)
                        .await
                    {
                        verdict.absorb(&report);
                    }
                    ctx.take_instance();
                    LifecycleState::Finished(verdict.outcome)
                }
                _ => LifecycleState::Finished(verdict.outcome),
            };
        }

        let leftovers = ctx.drain_soft_failures();
        if !leftovers.is_empty() {
            let fault = crate::assert::aggregate(&leftovers);
            verdict.record(
                fault.outcome(),
                Some(fault.message().to_string()),
                fault.location().map(str::to_string),
            );
        }

        let output = ctx.output();
        ctx.abandon();
        SequenceReport { verdict, output }
    }

    async fn chain(
        &self,
        key: HookKindKey,
        case: &PlannedCase,
        ctx: &TestContext,
        token: &CancellationToken,
        single_threaded: bool,
    ) -> Option<PhaseReport> {
        self.env
            .run_chain(
                self.fixture.case_hooks(key),
                &case.id,
                ctx,
                token,
                single_threaded,
            )
            .await
    }

    async fn cleanup(
        &self,
        key: HookKindKey,
        case: &PlannedCase,
        ctx: &TestContext,
        token: &CancellationToken,
        single_threaded: bool,
    ) -> Vec<PhaseReport> {
        self.env
            .run_all(
                self.fixture.case_hooks(key),
                &case.id,
                ctx,
                token,
                single_threaded,
            )
            .await
    }
}
