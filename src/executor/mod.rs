//! Test execution engine
//!
//! Schedules planned cases over a worker pool and drives each one through
//! its lifecycle under the timeout and cancellation governor.

mod aggregator;
mod apartment;
mod context;
mod governor;
mod lifecycle;
mod retry;
mod scheduler;
mod state;

pub use aggregator::Aggregator;
pub use apartment::{on_apartment_thread, ApartmentController, ApartmentThread};
pub use context::{
    ContextBuilder, TestContext, PROP_ATTEMPT, PROP_CASE_NAME, PROP_FIXTURE_NAME,
    PROP_FULLY_QUALIFIED_NAME,
};
pub use governor::{Governor, PhaseCall, PhaseReport, PhaseStatus};
pub use retry::{RetryOverride, RetryPolicy};
pub use scheduler::{Engine, RunControl};
pub use state::{LifecycleState, Phase};
