//! Soft-assertion scopes
//!
//! Inside a scope, soft checks are recorded and execution continues. Hard
//! checks return `Err` immediately so `?` aborts the scope. Leaving the scope
//! with recorded failures yields one aggregate failure.

use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;

use super::{caller_location, Fault};

/// One recorded soft failure
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoftFailure {
    pub message: String,
    pub location: Option<String>,
}

impl SoftFailure {
    fn render(&self) -> String {
        match &self.location {
            Some(location) => format!("{} (at {location})", self.message),
            None => self.message.clone(),
        }
    }
}

pub(crate) type SoftLedger = Arc<Mutex<Vec<SoftFailure>>>;

/// A delimited region collecting soft failures
pub struct SoftScope {
    ledger: SoftLedger,
    /// Ledger entries before this index belong to an enclosing scope
    start: usize,
}

impl SoftScope {
    /// A scope not attached to any execution context
    pub fn new() -> Self {
        Self::attached(Arc::new(Mutex::new(Vec::new())))
    }

    pub(crate) fn attached(ledger: SoftLedger) -> Self {
        let start = ledger.lock().len();
        Self { ledger, start }
    }

    /// Record a failed check; non-assertion faults are handed back
    pub fn check(&self, result: Result<(), Fault>) -> Result<(), Fault> {
        match result {
            Ok(()) => Ok(()),
            Err(Fault::Failure { message, location }) => {
                self.ledger.lock().push(SoftFailure { message, location });
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    #[track_caller]
    pub fn is_true(&self, condition: bool, message: impl AsRef<str>) {
        if !condition {
            self.record(format!("is_true failed. {}", message.as_ref()));
        }
    }

    #[track_caller]
    pub fn is_false(&self, condition: bool, message: impl AsRef<str>) {
        if condition {
            self.record(format!("is_false failed. {}", message.as_ref()));
        }
    }

    #[track_caller]
    pub fn equal<T: PartialEq + Debug>(&self, expected: T, actual: T) {
        if expected != actual {
            self.record(format!(
                "equal failed. Expected:<{expected:?}>. Actual:<{actual:?}>."
            ));
        }
    }

    /// Hard check: aborts the scope when `condition` is false
    #[track_caller]
    pub fn require(&self, condition: bool, message: impl AsRef<str>) -> Result<(), Fault> {
        super::is_true(condition, message)
    }

    /// Hard equality check
    #[track_caller]
    pub fn require_equal<T: PartialEq + Debug>(&self, expected: T, actual: T) -> Result<(), Fault> {
        super::equal(expected, actual)
    }

    pub fn pending(&self) -> usize {
        self.ledger.lock().len().saturating_sub(self.start)
    }

    #[track_caller]
    fn record(&self, message: String) {
        let location = caller_location();
        self.ledger.lock().push(SoftFailure {
            message,
            location: Some(location),
        });
    }

    fn take(&self) -> Vec<SoftFailure> {
        let mut ledger = self.ledger.lock();
        if ledger.len() <= self.start {
            return Vec::new();
        }
        ledger.split_off(self.start)
    }

    /// Close the scope normally
    pub fn finish(self) -> Result<(), Fault> {
        let failures = self.take();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(aggregate(&failures))
        }
    }

    /// Close the scope because a hard failure aborted it
    fn abort(self, hard: Fault) -> Fault {
        let pending = self.take();
        match hard {
            Fault::Failure { message, location } if !pending.is_empty() => Fault::Failure {
                message: format!(
                    "{message}\n{} soft assertion(s) failed before the abort:\n{}",
                    pending.len(),
                    render_list(&pending)
                ),
                location,
            },
            other => other,
        }
    }

    /// Run `body` inside this scope
    pub fn run<F>(self, body: F) -> Result<(), Fault>
    where
        F: FnOnce(&SoftScope) -> Result<(), Fault>,
    {
        match body(&self) {
            Ok(()) => self.finish(),
            Err(hard) => Err(self.abort(hard)),
        }
    }
}

impl Default for SoftScope {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the aggregate failure for a list of soft failures
pub(crate) fn aggregate(failures: &[SoftFailure]) -> Fault {
    Fault::Failure {
        message: format!(
            "{} assertion(s) failed within the scope:\n{}",
            failures.len(),
            render_list(failures)
        ),
        location: failures.first().and_then(|f| f.location.clone()),
    }
}

fn render_list(failures: &[SoftFailure]) -> String {
    failures
        .iter()
        .enumerate()
        .map(|(i, f)| format!("  {}) {}", i + 1, f.render()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run `body` in a detached soft-assertion scope
pub fn assert_all<F>(body: F) -> Result<(), Fault>
where
    F: FnOnce(&SoftScope) -> Result<(), Fault>,
{
    SoftScope::new().run(body)
}
