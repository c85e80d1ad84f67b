//! Lifecycle phases and states

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{HookKind, Outcome};

/// A unit of user code wrapped by the governor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    RunInit,
    RunCleanup,
    FixtureInit,
    FixtureCleanup,
    Construct,
    CaseInit,
    Body,
    CaseCleanup,
    Teardown,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::RunInit => "Run init",
            Phase::RunCleanup => "Run cleanup",
            Phase::FixtureInit => "Fixture init",
            Phase::FixtureCleanup => "Fixture cleanup",
            Phase::Construct => "Construct",
            Phase::CaseInit => "Case init",
            Phase::Body => "Body",
            Phase::CaseCleanup => "Case cleanup",
            Phase::Teardown => "Teardown",
        }
    }

    /// Cleanup phases still run after an earlier phase failed
    pub fn is_cleanup(&self) -> bool {
        matches!(
            self,
            Phase::RunCleanup | Phase::FixtureCleanup | Phase::CaseCleanup | Phase::Teardown
        )
    }

    pub fn from_hook(kind: HookKind) -> Self {
        match kind {
            HookKind::RunInit => Phase::RunInit,
            HookKind::RunCleanup => Phase::RunCleanup,
            HookKind::FixtureInit => Phase::FixtureInit,
            HookKind::FixtureCleanup => Phase::FixtureCleanup,
            HookKind::Construct => Phase::Construct,
            HookKind::CaseInit => Phase::CaseInit,
            HookKind::CaseCleanup => Phase::CaseCleanup,
            HookKind::Teardown => Phase::Teardown,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// States one case attempt moves through
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    RunInitPending,
    RunInitDone,
    FixtureInitPending,
    FixtureInitDone,
    Construct,
    CaseInit,
    Body,
    CaseCleanup,
    Teardown,
    FixtureCleanupPending,
    RunCleanupPending,
    Finished(Outcome),
}

impl LifecycleState {
    /// Phase executed while in this state, if any
    pub fn phase(&self) -> Option<Phase> {
        match self {
            LifecycleState::RunInitPending => Some(Phase::RunInit),
            LifecycleState::FixtureInitPending => Some(Phase::FixtureInit),
            LifecycleState::Construct => Some(Phase::Construct),
            LifecycleState::CaseInit => Some(Phase::CaseInit),
            LifecycleState::Body => Some(Phase::Body),
            LifecycleState::CaseCleanup => Some(Phase::CaseCleanup),
            LifecycleState::Teardown => Some(Phase::Teardown),
            LifecycleState::FixtureCleanupPending => Some(Phase::FixtureCleanup),
            LifecycleState::RunCleanupPending => Some(Phase::RunCleanup),
            LifecycleState::RunInitDone
            | LifecycleState::FixtureInitDone
            | LifecycleState::Finished(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Finished(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_phases() {
        assert!(Phase::CaseCleanup.is_cleanup());
        assert!(Phase::Teardown.is_cleanup());
        assert!(!Phase::Body.is_cleanup());
        assert!(!Phase::CaseInit.is_cleanup());
    }

    #[test]
    fn test_state_phases() {
        assert_eq!(LifecycleState::Body.phase(), Some(Phase::Body));
        assert_eq!(LifecycleState::RunInitDone.phase(), None);
        assert!(LifecycleState::Finished(Outcome::Passed).is_terminal());
    }

    #[test]
    fn test_phase_from_hook() {
        assert_eq!(Phase::from_hook(HookKind::CaseInit), Phase::CaseInit);
        assert_eq!(Phase::from_hook(HookKind::RunCleanup), Phase::RunCleanup);
    }
}
