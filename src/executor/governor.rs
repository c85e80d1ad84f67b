//! Timeout and cancellation governor
//!
//! Every phase runs under an optional deadline and a cancellation token that
//! is a child of its owner's token. At the deadline the governor either
//! signals cancellation and waits a grace period for the phase to unwind
//! (cooperative) or reports a timeout right away and abandons the phase
//! (forced).
//!
//! Phases with a deadline run on a detached thread so an abandoned phase
//! never holds up runtime shutdown. Phases without one run on the blocking
//! pool, and apartment-affine phases run on their apartment's pump.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::apartment::ApartmentThread;
use super::context::TestContext;
use super::state::Phase;
use crate::assert::Fault;
use crate::host::{HostCall, IsolationHost};
use crate::models::{Outcome, Value};
use crate::utils::timer::Timer;

/// Everything needed to run one phase
#[derive(Clone)]
pub struct PhaseCall {
    pub phase: Phase,
    /// Name used in diagnostics, e.g. `Calc.adds` or `Calc`
    pub qualified_name: String,
    pub boundary: String,
    pub target: String,
    pub args: Arc<Vec<Value>>,
    pub timeout: Option<Duration>,
    pub cooperative: bool,
    pub apartment: Option<Arc<ApartmentThread>>,
}

impl PhaseCall {
    pub fn new(
        phase: Phase,
        qualified_name: impl Into<String>,
        boundary: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            phase,
            qualified_name: qualified_name.into(),
            boundary: boundary.into(),
            target: target.into(),
            args: Arc::new(Vec::new()),
            timeout: None,
            cooperative: false,
            apartment: None,
        }
    }

    pub fn with_args(mut self, args: Arc<Vec<Value>>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cooperative(mut self, cooperative: bool) -> Self {
        self.cooperative = cooperative;
        self
    }

    pub fn on_apartment(mut self, apartment: Option<Arc<ApartmentThread>>) -> Self {
        self.apartment = apartment;
        self
    }
}

/// How a phase ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PhaseStatus {
    Completed,
    Faulted(Fault),
    Cancelled(String),
    TimedOut(String),
}

/// Result of one governed phase
#[derive(Clone, Debug)]
pub struct PhaseReport {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub duration: Duration,
    /// The phase was left running in the background
    pub abandoned: bool,
}

impl PhaseReport {
    pub fn outcome(&self) -> Outcome {
        match &self.status {
            PhaseStatus::Completed => Outcome::Passed,
            PhaseStatus::Faulted(fault) => fault.outcome(),
            PhaseStatus::Cancelled(_) => Outcome::Cancelled,
            PhaseStatus::TimedOut(_) => Outcome::TimedOut,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == PhaseStatus::Completed
    }

    pub fn message(&self) -> Option<String> {
        match &self.status {
            PhaseStatus::Completed => None,
            PhaseStatus::Faulted(fault) => Some(fault.message().to_string()),
            PhaseStatus::Cancelled(msg) | PhaseStatus::TimedOut(msg) => Some(msg.clone()),
        }
    }

    pub fn trace(&self) -> Option<String> {
        match &self.status {
            PhaseStatus::Faulted(fault) => fault.location().map(str::to_string),
            _ => None,
        }
    }
}

enum Wait {
    Finished(Result<(), Fault>),
    Lost,
    Elapsed,
    OwnerCancelled,
}

/// Wraps phases with deadlines and cancellation
pub struct Governor {
    host: Arc<dyn IsolationHost>,
    grace: Duration,
}

impl Governor {
    pub fn new(host: Arc<dyn IsolationHost>, grace: Duration) -> Self {
        Self { host, grace }
    }

    /// Run one phase. `owner` is the token of the unit that owns the phase.
    pub async fn run(
        &self,
        call: PhaseCall,
        ctx: &TestContext,
        owner: &CancellationToken,
    ) -> PhaseReport {
        let timer = Timer::start(format!("{} '{}'", call.phase, call.qualified_name));

        if owner.is_cancelled() && !call.phase.is_cleanup() {
            return PhaseReport {
                phase: call.phase,
                status: PhaseStatus::Cancelled(format!(
                    "{} '{}' was cancelled before it started",
                    call.phase, call.qualified_name
                )),
                duration: timer.elapsed(),
                abandoned: false,
            };
        }

        debug!(
            "{} '{}' starting (timeout: {:?}, cooperative: {})",
            call.phase, call.qualified_name, call.timeout, call.cooperative
        );

        // Cleanup is owed even when the owner was cancelled, so it gets its
        // own token and only its own deadline can stop it.
        let cleanup = call.phase.is_cleanup();
        let phase_token = if cleanup {
            CancellationToken::new()
        } else {
            owner.child_token()
        };
        let mut receiver = self.dispatch(&call, ctx.for_phase(phase_token.clone()));
        let owner_cancelled = async {
            if cleanup {
                std::future::pending::<()>().await
            } else {
                owner.cancelled().await
            }
        };

        let wait = match call.timeout {
            Some(limit) => tokio::select! {
                result = &mut receiver => received(result),
                _ = tokio::time::sleep(limit) => Wait::Elapsed,
                _ = owner_cancelled => Wait::OwnerCancelled,
            },
            None => tokio::select! {
                result = &mut receiver => received(result),
                _ = owner_cancelled => Wait::OwnerCancelled,
            },
        };

        let (status, abandoned) = match wait {
            Wait::Finished(Ok(())) => (PhaseStatus::Completed, false),
            Wait::Finished(Err(fault)) => (classify(fault), false),
            Wait::Lost => (
                PhaseStatus::Faulted(Fault::infrastructure(format!(
                    "{} '{}' stopped without reporting a result",
                    call.phase, call.qualified_name
                ))),
                false,
            ),
            Wait::Elapsed => {
                let limit_ms = call.timeout.map(|t| t.as_millis()).unwrap_or_default();
                let timeout_message = format!(
                    "{} '{}' exceeded its timeout of {}ms",
                    call.phase, call.qualified_name, limit_ms
                );
                phase_token.cancel();
                if call.cooperative {
                    self.await_unwind(&mut receiver, timeout_message).await
                } else {
                    warn!("{}; abandoning it", timeout_message);
                    (PhaseStatus::TimedOut(timeout_message), true)
                }
            }
            Wait::OwnerCancelled => {
                let message = format!(
                    "{} '{}' was cancelled by its owner",
                    call.phase, call.qualified_name
                );
                self.await_unwind(&mut receiver, message).await
            }
        };

        // The abandoned job still occupies the pump.
        if abandoned {
            if let Some(apartment) = &call.apartment {
                if let Err(err) = apartment.retire() {
                    warn!("Could not replace apartment {}: {}", apartment.name(), err);
                }
            }
        }

        let report = PhaseReport {
            phase: call.phase,
            status,
            duration: timer.stop(),
            abandoned,
        };
        if !report.is_completed() {
            debug!(
                "{} '{}' ended {:?}",
                call.phase, call.qualified_name, report.status
            );
        }
        report
    }

    /// After cancellation was signalled, give the phase the grace period
    async fn await_unwind(
        &self,
        receiver: &mut oneshot::Receiver<Result<(), Fault>>,
        fallback: String,
    ) -> (PhaseStatus, bool) {
        match tokio::time::timeout(self.grace, receiver).await {
            Ok(Ok(Err(fault))) => (PhaseStatus::Cancelled(fault.message().to_string()), false),
            Ok(Ok(Ok(()))) | Ok(Err(_)) => (PhaseStatus::Cancelled(fallback), false),
            Err(_) => {
                let message = format!(
                    "{fallback} and did not unwind within the {}ms grace period",
                    self.grace.as_millis()
                );
                warn!("{}; abandoning it", message);
                (PhaseStatus::TimedOut(message), true)
            }
        }
    }

    /// Start the phase on the thread it must run on
    fn dispatch(
        &self,
        call: &PhaseCall,
        phase_ctx: TestContext,
    ) -> oneshot::Receiver<Result<(), Fault>> {
        let host = self.host.clone();
        let boundary = call.boundary.clone();
        let target = call.target.clone();
        let args = call.args.clone();

        let job = move || {
            let call = HostCall {
                boundary: &boundary,
                target: &target,
                args: &args,
            };
            catch_unwind(AssertUnwindSafe(|| host.invoke(call, &phase_ctx)))
                .unwrap_or_else(|payload| Err(Fault::from_panic(payload)))
        };

        if let Some(apartment) = &call.apartment {
            return match apartment.submit(job) {
                Some(receiver) => receiver,
                None => failed_receiver(format!(
                    "apartment thread {} is no longer running",
                    apartment.name()
                )),
            };
        }

        let (tx, rx) = oneshot::channel();
        if call.timeout.is_some() {
            let spawned = thread::Builder::new()
                .name(format!("unitrun-phase-{}", call.phase.name().to_lowercase()))
                .spawn(move || {
                    let _ = tx.send(job());
                });
            if let Err(err) = spawned {
                return failed_receiver(format!("failed to start phase thread: {err}"));
            }
        } else {
            tokio::task::spawn_blocking(move || {
                let _ = tx.send(job());
            });
        }
        rx
    }
}

fn received(result: Result<Result<(), Fault>, oneshot::error::RecvError>) -> Wait {
    match result {
        Ok(outcome) => Wait::Finished(outcome),
        Err(_) => Wait::Lost,
    }
}

fn classify(fault: Fault) -> PhaseStatus {
    match fault {
        Fault::Cancelled(message) => PhaseStatus::Cancelled(message),
        other => PhaseStatus::Faulted(other),
    }
}

fn failed_receiver(message: String) -> oneshot::Receiver<Result<(), Fault>> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(Err(Fault::infrastructure(message)));
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::context::ContextBuilder;
    use crate::host::InProcessHost;
    use std::time::Instant;

    fn governor(host: InProcessHost) -> Governor {
        Governor::new(Arc::new(host), Duration::from_millis(500))
    }

    fn ctx() -> TestContext {
        ContextBuilder::new("Slow.case", "Slow").build(CancellationToken::new())
    }

    #[tokio::test]
    async fn test_completed_phase() {
        let host = InProcessHost::new().hook("ok", |_, _| Ok(()));
        let report = governor(host)
            .run(
                PhaseCall::new(Phase::Body, "Slow.case", "default", "ok"),
                &ctx(),
                &CancellationToken::new(),
            )
            .await;
        assert!(report.is_completed());
        assert_eq!(report.outcome(), Outcome::Passed);
    }

    #[tokio::test]
    async fn test_forced_timeout_returns_at_deadline() {
        let host = InProcessHost::new().hook("sleep", |_, _| {
            thread::sleep(Duration::from_millis(10_000));
            Ok(())
        });
        let call = PhaseCall::new(Phase::Body, "Slow.case", "default", "sleep")
            .with_timeout(Some(Duration::from_millis(1000)));

        let start = Instant::now();
        let report = governor(host)
            .run(call, &ctx(), &CancellationToken::new())
            .await;

        assert!(start.elapsed() < Duration::from_millis(5000));
        assert_eq!(report.outcome(), Outcome::TimedOut);
        assert!(report.abandoned);
        let message = report.message().unwrap();
        assert!(message.contains("Slow.case"));
        assert!(message.contains("1000ms"));
    }

    #[tokio::test]
    async fn test_cooperative_phase_reports_its_own_message() {
        let host = InProcessHost::new().hook("wait", |ctx, _| {
            while !ctx.is_cancellation_requested() {
                thread::sleep(Duration::from_millis(5));
            }
            Err(Fault::cancelled("stopped politely"))
        });
        let call = PhaseCall::new(Phase::Body, "Slow.case", "default", "wait")
            .with_timeout(Some(Duration::from_millis(50)))
            .cooperative(true);

        let report = governor(host)
            .run(call, &ctx(), &CancellationToken::new())
            .await;
        assert_eq!(report.status, PhaseStatus::Cancelled("stopped politely".into()));
        assert!(!report.abandoned);
    }

    #[tokio::test]
    async fn test_cooperative_phase_that_ignores_signal_times_out() {
        let host = InProcessHost::new().hook("stubborn", |_, _| {
            thread::sleep(Duration::from_millis(3000));
            Ok(())
        });
        let call = PhaseCall::new(Phase::Body, "Slow.case", "default", "stubborn")
            .with_timeout(Some(Duration::from_millis(50)))
            .cooperative(true);

        let report = governor(host)
            .run(call, &ctx(), &CancellationToken::new())
            .await;
        assert_eq!(report.outcome(), Outcome::TimedOut);
        assert!(report.message().unwrap().contains("grace period"));
    }

    #[tokio::test]
    async fn test_panics_become_failures() {
        let host = InProcessHost::new().hook("boom", |_, _| panic!("kaboom"));
        let report = governor(host)
            .run(
                PhaseCall::new(Phase::CaseInit, "Slow.case", "default", "boom"),
                &ctx(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(report.outcome(), Outcome::Failed);
        assert_eq!(report.message().as_deref(), Some("panicked: kaboom"));
    }

    #[tokio::test]
    async fn test_owner_cancelled_before_start() {
        let owner = CancellationToken::new();
        owner.cancel();
        let host = InProcessHost::new().hook("ok", |_, _| Ok(()));
        let gov = governor(host);

        let report = gov
            .run(
                PhaseCall::new(Phase::Body, "Slow.case", "default", "ok"),
                &ctx(),
                &owner,
            )
            .await;
        assert_eq!(report.outcome(), Outcome::Cancelled);

        // Cleanup phases still run for a cancelled owner and see a live token.
        let host = InProcessHost::new().hook("cleanup", |ctx, _| ctx.check_cancelled());
        let report = governor(host)
            .run(
                PhaseCall::new(Phase::CaseCleanup, "Slow.case", "default", "cleanup"),
                &ctx(),
                &owner,
            )
            .await;
        assert!(report.is_completed());
    }

    #[tokio::test]
    async fn test_apartment_dispatch() {
        let apartment = Arc::new(ApartmentThread::spawn("unitrun-sta-gov").unwrap());
        let expected = apartment.thread_id();
        let host = InProcessHost::new().hook("where", move |_, _| {
            crate::assert::equal(expected, thread::current().id())
        });
        let call = PhaseCall::new(Phase::Body, "Sta.case", "default", "where")
            .on_apartment(Some(apartment));

        let report = governor(host)
            .run(call, &ctx(), &CancellationToken::new())
            .await;
        assert!(report.is_completed());
    }
}
