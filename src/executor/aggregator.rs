//! Result aggregation

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

use crate::models::{CaseResult, HookFailure, Outcome, RunSummary};
use crate::report::Reporter;

/// Collects case results and hook failures, forwarding each to the reporter
pub struct Aggregator {
    started_at: DateTime<Utc>,
    results: Mutex<Vec<CaseResult>>,
    hook_failures: Mutex<Vec<HookFailure>>,
    reporter: Arc<dyn Reporter>,
    map_inconclusive_to_failed: bool,
}

impl Aggregator {
    pub fn new(reporter: Arc<dyn Reporter>, map_inconclusive_to_failed: bool) -> Self {
        Self {
            started_at: Utc::now(),
            results: Mutex::new(Vec::new()),
            hook_failures: Mutex::new(Vec::new()),
            reporter,
            map_inconclusive_to_failed,
        }
    }

    /// Record a final case result
    pub fn case_finished(&self, mut result: CaseResult) {
        if self.map_inconclusive_to_failed && result.outcome == Outcome::Inconclusive {
            result.outcome = Outcome::Failed;
        }
        self.reporter.case_finished(&result);
        self.results.lock().push(result);
    }

    pub fn hook_failed(&self, failure: HookFailure) {
        warn!(
            "{} hook of {} ended {}: {}",
            failure.hook, failure.owner, failure.outcome, failure.message
        );
        self.reporter.hook_failed(&failure);
        self.hook_failures.lock().push(failure);
    }

    /// Final summary, ordered by plan position
    pub fn finish(&self) -> RunSummary {
        let results = self.results.lock().clone();
        let hook_failures = self.hook_failures.lock().clone();
        let summary = RunSummary::new(self.started_at, results, hook_failures);
        self.reporter.run_finished(&summary);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HookScope;
    use crate::report::ChannelReporter;
    use crate::report::ReportEvent;

    #[tokio::test]
    async fn test_results_sorted_and_forwarded() {
        let (reporter, mut events) = ChannelReporter::new();
        let aggregator = Aggregator::new(Arc::new(reporter), false);

        let mut second = CaseResult::new("F.b", "F", Outcome::Failed);
        second.plan_index = 1;
        let mut first = CaseResult::new("F.a", "F", Outcome::Passed);
        first.plan_index = 0;
        aggregator.case_finished(second);
        aggregator.case_finished(first);

        let summary = aggregator.finish();
        let ids: Vec<&str> = summary.results.iter().map(|r| r.case_id.as_str()).collect();
        assert_eq!(ids, vec!["F.a", "F.b"]);

        assert!(matches!(events.recv().await, Some(ReportEvent::CaseFinished(r)) if r.case_id == "F.b"));
        assert!(matches!(events.recv().await, Some(ReportEvent::CaseFinished(_))));
        assert!(matches!(events.recv().await, Some(ReportEvent::RunFinished(_))));
    }

    #[test]
    fn test_inconclusive_mapping() {
        let (reporter, _events) = ChannelReporter::new();
        let aggregator = Aggregator::new(Arc::new(reporter), true);
        aggregator.case_finished(CaseResult::new("F.a", "F", Outcome::Inconclusive));
        aggregator.hook_failed(HookFailure {
            scope: HookScope::Fixture,
            owner: "F".into(),
            hook: "fixture cleanup".into(),
            outcome: Outcome::Failed,
            message: "disk full".into(),
        });

        let summary = aggregator.finish();
        assert_eq!(summary.totals().failed, 1);
        assert_eq!(summary.totals().inconclusive, 0);
        assert_eq!(summary.hook_failures.len(), 1);
    }
}
