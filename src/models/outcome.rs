//! Case outcomes and run summaries
//!
//! Defines the terminal statuses a case can reach and the records streamed
//! to the reporter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal status of a case
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
    Inconclusive,
    Cancelled,
    TimedOut,
}

impl Outcome {
    pub fn symbol(&self) -> &'static str {
        match self {
            Outcome::Passed => "✓",
            Outcome::Failed => "✗",
            Outcome::Skipped => "○",
            Outcome::Inconclusive => "?",
            Outcome::Cancelled => "⊘",
            Outcome::TimedOut => "⧖",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Passed)
    }

    /// Counted as a failure in run totals
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Outcome::Failed | Outcome::Cancelled | Outcome::TimedOut
        )
    }

    /// Rank used when several phases report; the higher rank wins
    pub fn severity(&self) -> u8 {
        match self {
            Outcome::Passed => 0,
            Outcome::Skipped => 1,
            Outcome::Inconclusive => 2,
            Outcome::Failed => 3,
            Outcome::Cancelled => 4,
            Outcome::TimedOut => 5,
        }
    }

    /// Combine two phase results without letting a milder one win
    pub fn merge(self, other: Outcome) -> Outcome {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => write!(f, "PASSED"),
            Outcome::Failed => write!(f, "FAILED"),
            Outcome::Skipped => write!(f, "SKIPPED"),
            Outcome::Inconclusive => write!(f, "INCONCLUSIVE"),
            Outcome::Cancelled => write!(f, "CANCELLED"),
            Outcome::TimedOut => write!(f, "TIMED OUT"),
        }
    }
}

/// Final record for one case, also the per-case reporter event
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub fixture_id: String,
    pub display_name: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub message: Option<String>,
    pub trace: Option<String>,
    pub attempts: u32,
    /// Output written by the final attempt
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    /// Position in the execution plan
    #[serde(skip)]
    pub plan_index: usize,
}

/// Event name used by reporters
pub type CaseEvent = CaseResult;

impl CaseResult {
    pub fn new(case_id: impl Into<String>, fixture_id: impl Into<String>, outcome: Outcome) -> Self {
        let case_id = case_id.into();
        Self {
            display_name: case_id.clone(),
            case_id,
            fixture_id: fixture_id.into(),
            outcome,
            duration_ms: 0,
            message: None,
            trace: None,
            attempts: 0,
            output: String::new(),
            plan_index: 0,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_trace(mut self, trace: Option<String>) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

impl fmt::Display for CaseResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}ms]",
            self.outcome.symbol(),
            self.display_name,
            self.duration_ms
        )?;
        if self.attempts > 1 {
            write!(f, " (attempts: {})", self.attempts)?;
        }
        if let Some(msg) = &self.message {
            write!(f, " - {msg}")?;
        }
        Ok(())
    }
}

/// Which hook scope a failure belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookScope {
    Run,
    Fixture,
}

/// A run- or fixture-level hook that did not complete cleanly
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HookFailure {
    pub scope: HookScope,
    /// Fixture id, or "run" for run-wide hooks
    pub owner: String,
    pub hook: String,
    pub outcome: Outcome,
    pub message: String,
}

/// Run totals handed to the reporter
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub inconclusive: usize,
}

/// Summary of a whole run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub inconclusive: usize,
    pub cancelled: usize,
    pub timed_out: usize,
    pub total_duration_ms: u64,
    pub results: Vec<CaseResult>,
    pub hook_failures: Vec<HookFailure>,
}

impl RunSummary {
    pub fn new(
        started_at: DateTime<Utc>,
        mut results: Vec<CaseResult>,
        hook_failures: Vec<HookFailure>,
    ) -> Self {
        results.sort_by_key(|r| r.plan_index);
        let count = |outcome: Outcome| results.iter().filter(|r| r.outcome == outcome).count();
        let completed_at = Utc::now();

        Self {
            started_at,
            completed_at,
            total: results.len(),
            passed: count(Outcome::Passed),
            failed: count(Outcome::Failed),
            skipped: count(Outcome::Skipped),
            inconclusive: count(Outcome::Inconclusive),
            cancelled: count(Outcome::Cancelled),
            timed_out: count(Outcome::TimedOut),
            total_duration_ms: (completed_at - started_at).num_milliseconds().max(0) as u64,
            results,
            hook_failures,
        }
    }

    /// The four headline totals; cancelled and timed-out cases count as failed
    pub fn totals(&self) -> RunTotals {
        RunTotals {
            passed: self.passed,
            failed: self.failed + self.cancelled + self.timed_out,
            skipped: self.skipped,
            inconclusive: self.inconclusive,
        }
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.passed as f64 / self.total as f64) * 100.0
        }
    }

    pub fn is_all_passed(&self) -> bool {
        self.totals().failed == 0 && self.hook_failures.is_empty()
    }

    pub fn result(&self, case_id: &str) -> Option<&CaseResult> {
        self.results.iter().find(|r| r.case_id == case_id)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Test run started {}", self.started_at.to_rfc3339())?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        for result in &self.results {
            writeln!(f, "  {result}")?;
        }
        for failure in &self.hook_failures {
            writeln!(
                f,
                "  ! {} {} ({}): {}",
                failure.owner, failure.hook, failure.outcome, failure.message
            )?;
        }
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        let totals = self.totals();
        writeln!(
            f,
            "Total: {} | Passed: {} | Failed: {} | Skipped: {} | Inconclusive: {}",
            self.total, totals.passed, totals.failed, totals.skipped, totals.inconclusive
        )?;
        writeln!(
            f,
            "Pass Rate: {:.1}% | Duration: {}ms",
            self.pass_rate(),
            self.total_duration_ms
        )
    }
}
