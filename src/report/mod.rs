//! Reporter interface
//!
//! The engine streams one event per finished case, one per failed run or
//! fixture hook, and the run summary at the end. Serialization of reports
//! is left to the consumer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::executor::RunControl;
use crate::models::{CaseEvent, HookFailure, Outcome, RunSummary};

/// Receives results as the run progresses
pub trait Reporter: Send + Sync {
    fn case_finished(&self, event: &CaseEvent);

    fn hook_failed(&self, _failure: &HookFailure) {}

    fn run_finished(&self, _summary: &RunSummary) {}
}

/// Discards everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn case_finished(&self, _event: &CaseEvent) {}
}

/// Events carried by [`ChannelReporter`]
#[derive(Clone, Debug)]
pub enum ReportEvent {
    CaseFinished(CaseEvent),
    HookFailed(HookFailure),
    RunFinished(RunSummary),
}

/// Streams events over an unbounded channel
pub struct ChannelReporter {
    sender: mpsc::UnboundedSender<ReportEvent>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReportEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, event: ReportEvent) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.sender.send(event);
    }
}

impl Reporter for ChannelReporter {
    fn case_finished(&self, event: &CaseEvent) {
        self.send(ReportEvent::CaseFinished(event.clone()));
    }

    fn hook_failed(&self, failure: &HookFailure) {
        self.send(ReportEvent::HookFailed(failure.clone()));
    }

    fn run_finished(&self, summary: &RunSummary) {
        self.send(ReportEvent::RunFinished(summary.clone()));
    }
}

/// Logs one structured event per case
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn case_finished(&self, event: &CaseEvent) {
        match event.outcome {
            Outcome::Passed | Outcome::Skipped => info!(
                case_id = %event.case_id,
                outcome = %event.outcome,
                duration_ms = event.duration_ms,
                attempts = event.attempts,
                "{}", event
            ),
            _ => warn!(
                case_id = %event.case_id,
                outcome = %event.outcome,
                duration_ms = event.duration_ms,
                attempts = event.attempts,
                message = event.message.as_deref().unwrap_or_default(),
                "{}", event
            ),
        }
    }

    fn hook_failed(&self, failure: &HookFailure) {
        warn!(
            owner = %failure.owner,
            hook = %failure.hook,
            outcome = %failure.outcome,
            "{}", failure.message
        );
    }

    fn run_finished(&self, summary: &RunSummary) {
        let totals = summary.totals();
        info!(
            passed = totals.passed,
            failed = totals.failed,
            skipped = totals.skipped,
            inconclusive = totals.inconclusive,
            duration_ms = summary.total_duration_ms,
            "Run finished"
        );
    }
}

/// Stops the run from accepting new cases once enough cases failed
pub struct FailureLimit {
    limit: usize,
    failures: AtomicUsize,
    control: RunControl,
}

impl FailureLimit {
    pub fn new(limit: usize, control: RunControl) -> Self {
        Self {
            limit,
            failures: AtomicUsize::new(0),
            control,
        }
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl Reporter for FailureLimit {
    fn case_finished(&self, event: &CaseEvent) {
        if !event.outcome.is_failure() {
            return;
        }
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures == self.limit {
            warn!("{} case(s) failed, no further cases will start", failures);
            self.control.stop_accepting();
        }
    }
}

/// Forwards every event to several reporters
#[derive(Clone, Default)]
pub struct Fanout {
    reporters: Vec<Arc<dyn Reporter>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl Reporter for Fanout {
    fn case_finished(&self, event: &CaseEvent) {
        for reporter in &self.reporters {
            reporter.case_finished(event);
        }
    }

    fn hook_failed(&self, failure: &HookFailure) {
        for reporter in &self.reporters {
            reporter.hook_failed(failure);
        }
    }

    fn run_finished(&self, summary: &RunSummary) {
        for reporter in &self.reporters {
            reporter.run_finished(summary);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CaseResult;

    #[tokio::test]
    async fn test_fanout_reaches_every_reporter() {
        let (first, mut first_rx) = ChannelReporter::new();
        let (second, mut second_rx) = ChannelReporter::new();
        let fanout = Fanout::new()
            .with(Arc::new(first))
            .with(Arc::new(second))
            .with(Arc::new(TracingReporter));
        assert_eq!(fanout.len(), 3);

        fanout.case_finished(&CaseResult::new("F.a", "F", Outcome::Passed));

        for rx in [&mut first_rx, &mut second_rx] {
            match rx.recv().await {
                Some(ReportEvent::CaseFinished(event)) => assert_eq!(event.case_id, "F.a"),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_failure_limit_trips_once() {
        let control = RunControl::new();
        let limit = FailureLimit::new(2, control.clone());

        limit.case_finished(&CaseResult::new("F.a", "F", Outcome::Failed));
        limit.case_finished(&CaseResult::new("F.b", "F", Outcome::Passed));
        assert!(control.is_accepting());

        limit.case_finished(&CaseResult::new("F.c", "F", Outcome::TimedOut));
        assert!(!control.is_accepting());
        assert_eq!(limit.failures(), 2);
    }

    #[test]
    fn test_channel_reporter_keeps_event_order() {
        let (reporter, mut rx) = ChannelReporter::new();
        reporter.hook_failed(&HookFailure {
            scope: crate::models::HookScope::Run,
            owner: "run".into(),
            hook: "Run cleanup".into(),
            outcome: Outcome::Failed,
            message: "boom".into(),
        });
        reporter.run_finished(&RunSummary::new(chrono::Utc::now(), Vec::new(), Vec::new()));

        tokio_test::block_on(async {
            assert!(matches!(rx.recv().await, Some(ReportEvent::HookFailed(_))));
            match rx.recv().await {
                Some(ReportEvent::RunFinished(summary)) => assert_eq!(summary.total, 0),
                other => panic!("unexpected event {other:?}"),
            }
        });
    }

    #[test]
    fn test_channel_reporter_survives_dropped_receiver() {
        let (reporter, rx) = ChannelReporter::new();
        drop(rx);
        reporter.case_finished(&CaseResult::new("F.a", "F", Outcome::Failed));
    }
}
