//! Faults and assertions
//!
//! Hooks and bodies return `Result<(), Fault>`. Assertion helpers record
//! their call site so failures point back at the line that raised them.

mod soft;

pub use soft::{assert_all, SoftFailure, SoftScope};
pub(crate) use soft::aggregate;

use std::any::Any;
use std::fmt::Debug;
use std::panic::Location;
use thiserror::Error;

use crate::models::Outcome;

/// A fault raised by a lifecycle phase
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Assertion failure or error raised by user code
    #[error("{message}")]
    Failure {
        message: String,
        location: Option<String>,
    },

    #[error("{0}")]
    Inconclusive(String),

    /// The phase observed its cancellation signal and unwound
    #[error("{0}")]
    Cancelled(String),

    /// Invocation-level problem unrelated to the code under test
    #[error("{0}")]
    Infrastructure(String),
}

impl Fault {
    /// Failure tagged with the caller's location
    #[track_caller]
    pub fn failure(message: impl Into<String>) -> Self {
        Fault::Failure {
            message: message.into(),
            location: Some(caller_location()),
        }
    }

    pub fn inconclusive(message: impl Into<String>) -> Self {
        Fault::Inconclusive(message.into())
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Fault::Cancelled(message.into())
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Fault::Infrastructure(message.into())
    }

    /// Convert a caught panic payload
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let reason = if let Some(msg) = payload.downcast_ref::<&str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "unknown panic".to_string()
        };
        Fault::Failure {
            message: format!("panicked: {reason}"),
            location: None,
        }
    }

    /// Outcome a case ends with when this fault terminates a phase
    pub fn outcome(&self) -> Outcome {
        match self {
            Fault::Failure { .. } | Fault::Infrastructure(_) => Outcome::Failed,
            Fault::Inconclusive(_) => Outcome::Inconclusive,
            Fault::Cancelled(_) => Outcome::Cancelled,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Fault::Failure { message, .. } => message,
            Fault::Inconclusive(msg) | Fault::Cancelled(msg) | Fault::Infrastructure(msg) => msg,
        }
    }

    pub fn location(&self) -> Option<&str> {
        match self {
            Fault::Failure { location, .. } => location.as_deref(),
            _ => None,
        }
    }
}

#[track_caller]
pub(crate) fn caller_location() -> String {
    let location = Location::caller();
    format!(
        "{}:{}:{}",
        location.file(),
        location.line(),
        location.column()
    )
}

#[track_caller]
pub fn is_true(condition: bool, message: impl AsRef<str>) -> Result<(), Fault> {
    if condition {
        Ok(())
    } else {
        Err(Fault::failure(format!("is_true failed. {}", message.as_ref())))
    }
}

#[track_caller]
pub fn is_false(condition: bool, message: impl AsRef<str>) -> Result<(), Fault> {
    if condition {
        Err(Fault::failure(format!("is_false failed. {}", message.as_ref())))
    } else {
        Ok(())
    }
}

#[track_caller]
pub fn equal<T: PartialEq + Debug>(expected: T, actual: T) -> Result<(), Fault> {
    if expected == actual {
        Ok(())
    } else {
        Err(Fault::failure(format!(
            "equal failed. Expected:<{expected:?}>. Actual:<{actual:?}>."
        )))
    }
}

#[track_caller]
pub fn not_equal<T: PartialEq + Debug>(unexpected: T, actual: T) -> Result<(), Fault> {
    if unexpected == actual {
        Err(Fault::failure(format!(
            "not_equal failed. Expected any value except:<{unexpected:?}>. Actual:<{actual:?}>."
        )))
    } else {
        Ok(())
    }
}

#[track_caller]
pub fn contains(haystack: &str, needle: &str) -> Result<(), Fault> {
    if haystack.contains(needle) {
        Ok(())
    } else {
        Err(Fault::failure(format!(
            "contains failed. String '{haystack}' does not contain '{needle}'."
        )))
    }
}

#[track_caller]
pub fn fail(message: impl Into<String>) -> Fault {
    Fault::failure(message)
}

pub fn inconclusive(message: impl Into<String>) -> Fault {
    Fault::inconclusive(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_reports_both_values() {
        let err = equal(1, 2).unwrap_err();
        assert_eq!(err.outcome(), Outcome::Failed);
        assert_eq!(err.message(), "equal failed. Expected:<1>. Actual:<2>.");
        assert!(err.location().unwrap().contains("assert/mod.rs"));
    }

    #[test]
    fn test_passing_assertions() {
        assert!(is_true(true, "x").is_ok());
        assert!(is_false(false, "x").is_ok());
        assert!(not_equal("a", "b").is_ok());
        assert!(contains("hello world", "world").is_ok());
    }

    #[test]
    fn test_fault_outcomes() {
        assert_eq!(inconclusive("later").outcome(), Outcome::Inconclusive);
        assert_eq!(Fault::cancelled("stop").outcome(), Outcome::Cancelled);
        assert_eq!(Fault::infrastructure("bad").outcome(), Outcome::Failed);
    }

    #[test]
    fn test_from_panic_payloads() {
        let fault = Fault::from_panic(Box::new("boom"));
        assert_eq!(fault.message(), "panicked: boom");

        let fault = Fault::from_panic(Box::new(String::from("owned")));
        assert_eq!(fault.message(), "panicked: owned");

        let fault = Fault::from_panic(Box::new(42_u8));
        assert_eq!(fault.message(), "panicked: unknown panic");
    }
}
