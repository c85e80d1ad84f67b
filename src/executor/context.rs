//! Per-attempt execution context
//!
//! A fresh context is created for every case attempt. Clones share the same
//! state; each phase receives a clone carrying that phase's cancellation
//! token.

use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::assert::{Fault, SoftFailure, SoftScope};
use crate::models::TypeTag;

pub const PROP_FIXTURE_NAME: &str = "FixtureName";
pub const PROP_CASE_NAME: &str = "CaseName";
pub const PROP_FULLY_QUALIFIED_NAME: &str = "FullyQualifiedName";
pub const PROP_ATTEMPT: &str = "Attempt";

struct ContextState {
    case_id: String,
    fixture_id: String,
    display_name: String,
    attempt: u32,
    bindings: BTreeMap<String, TypeTag>,
    properties: RwLock<BTreeMap<String, String>>,
    instance: Mutex<Option<Box<dyn Any + Send>>>,
    output: Mutex<String>,
    soft: Arc<Mutex<Vec<SoftFailure>>>,
    abandoned: AtomicBool,
}

/// Mutable state visible to the hooks and body of one attempt
#[derive(Clone)]
pub struct TestContext {
    state: Arc<ContextState>,
    token: CancellationToken,
}

/// Builder for [`TestContext`]
pub struct ContextBuilder {
    case_id: String,
    fixture_id: String,
    display_name: Option<String>,
    attempt: u32,
    bindings: BTreeMap<String, TypeTag>,
    properties: BTreeMap<String, String>,
}

impl ContextBuilder {
    pub fn new(case_id: impl Into<String>, fixture_id: impl Into<String>) -> Self {
        Self {
            case_id: case_id.into(),
            fixture_id: fixture_id.into(),
            display_name: None,
            attempt: 1,
            bindings: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn bindings(mut self, bindings: BTreeMap<String, TypeTag>) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn build(self, token: CancellationToken) -> TestContext {
        let display_name = self.display_name.unwrap_or_else(|| self.case_id.clone());
        let mut properties = self.properties;
        properties.insert(PROP_FIXTURE_NAME.to_string(), self.fixture_id.clone());
        if !self.case_id.is_empty() {
            properties.insert(PROP_CASE_NAME.to_string(), display_name.clone());
            properties.insert(PROP_FULLY_QUALIFIED_NAME.to_string(), self.case_id.clone());
        }
        properties.insert(PROP_ATTEMPT.to_string(), self.attempt.to_string());

        TestContext {
            state: Arc::new(ContextState {
                case_id: self.case_id,
                fixture_id: self.fixture_id,
                display_name,
                attempt: self.attempt,
                bindings: self.bindings,
                properties: RwLock::new(properties),
                instance: Mutex::new(None),
                output: Mutex::new(String::new()),
                soft: Arc::new(Mutex::new(Vec::new())),
                abandoned: AtomicBool::new(false),
            }),
            token,
        }
    }
}

impl TestContext {
    /// Empty case id for run- and fixture-scoped contexts
    pub fn case_id(&self) -> &str {
        &self.state.case_id
    }

    pub fn fixture_id(&self) -> &str {
        &self.state.fixture_id
    }

    pub fn display_name(&self) -> &str {
        &self.state.display_name
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.state.attempt
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.state.properties.read().get(key).cloned()
    }

    pub fn properties(&self) -> BTreeMap<String, String> {
        self.state.properties.read().clone()
    }

    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        if self.is_abandoned() {
            return;
        }
        self.state
            .properties
            .write()
            .insert(key.into(), value.into());
    }

    /// Type inferred for a generic slot
    pub fn binding(&self, slot: &str) -> Option<&TypeTag> {
        self.state.bindings.get(slot)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(Cancelled)` once cancellation was requested, for use with `?`
    pub fn check_cancelled(&self) -> Result<(), Fault> {
        if self.is_cancellation_requested() {
            Err(Fault::cancelled(format!(
                "'{}' observed cancellation",
                self.qualified_name()
            )))
        } else {
            Ok(())
        }
    }

    /// Store the case instance created by the construct phase
    pub fn set_instance<T: Any + Send>(&self, instance: T) {
        if self.is_abandoned() {
            return;
        }
        *self.state.instance.lock() = Some(Box::new(instance));
    }

    /// Borrow the case instance mutably; `None` when absent or of another type
    pub fn with_instance<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.state.instance.lock();
        slot.as_mut()
            .and_then(|boxed| boxed.downcast_mut::<T>())
            .map(f)
    }

    pub fn has_instance(&self) -> bool {
        self.state.instance.lock().is_some()
    }

    pub fn take_instance(&self) -> Option<Box<dyn Any + Send>> {
        self.state.instance.lock().take()
    }

    /// Append a line to the captured output
    pub fn write_line(&self, line: impl AsRef<str>) {
        if self.is_abandoned() {
            return;
        }
        let mut output = self.state.output.lock();
        output.push_str(line.as_ref());
        output.push('\n');
    }

    pub fn output(&self) -> String {
        self.state.output.lock().clone()
    }

    /// Run `body` in a soft-assertion scope attached to this context
    pub fn assert_all<F>(&self, body: F) -> Result<(), Fault>
    where
        F: FnOnce(&SoftScope) -> Result<(), Fault>,
    {
        SoftScope::attached(self.state.soft.clone()).run(body)
    }

    fn qualified_name(&self) -> &str {
        if self.state.case_id.is_empty() {
            &self.state.fixture_id
        } else {
            &self.state.case_id
        }
    }

    /// Clone carrying a phase-specific cancellation token
    pub(crate) fn for_phase(&self, token: CancellationToken) -> TestContext {
        TestContext {
            state: self.state.clone(),
            token,
        }
    }

    /// Stop accepting writes from a phase that was abandoned
    pub(crate) fn abandon(&self) {
        self.state.abandoned.store(true, Ordering::SeqCst);
    }

    pub fn is_abandoned(&self) -> bool {
        self.state.abandoned.load(Ordering::SeqCst)
    }

    /// Soft failures left behind by a scope that never closed
    pub(crate) fn drain_soft_failures(&self) -> Vec<SoftFailure> {
        std::mem::take(&mut *self.state.soft.lock())
    }
}

impl std::fmt::Debug for TestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestContext")
            .field("case_id", &self.state.case_id)
            .field("fixture_id", &self.state.fixture_id)
            .field("attempt", &self.state.attempt)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TestContext {
        ContextBuilder::new("Calc.adds", "Calc")
            .attempt(2)
            .properties(BTreeMap::from([("Environment".to_string(), "ci".to_string())]))
            .build(CancellationToken::new())
    }

    #[test]
    fn test_properties_seeded() {
        let ctx = context();
        assert_eq!(ctx.property(PROP_FIXTURE_NAME).as_deref(), Some("Calc"));
        assert_eq!(ctx.property(PROP_ATTEMPT).as_deref(), Some("2"));
        assert_eq!(ctx.property("Environment").as_deref(), Some("ci"));
        assert_eq!(ctx.attempt(), 2);
    }

    #[test]
    fn test_instance_slot() {
        let ctx = context();
        ctx.set_instance(41_u32);
        assert_eq!(ctx.with_instance(|n: &mut u32| { *n += 1; *n }), Some(42));
        assert_eq!(ctx.with_instance(|s: &mut String| s.len()), None);
        assert!(ctx.take_instance().is_some());
        assert!(!ctx.has_instance());
    }

    #[test]
    fn test_abandoned_context_discards_writes() {
        let ctx = context();
        ctx.write_line("before");
        ctx.abandon();
        ctx.write_line("after");
        ctx.set_property("late", "value");
        assert_eq!(ctx.output(), "before\n");
        assert!(ctx.property("late").is_none());
    }

    #[test]
    fn test_phase_token_is_per_clone() {
        let ctx = context();
        let phase_token = CancellationToken::new();
        let phase_ctx = ctx.for_phase(phase_token.clone());
        phase_token.cancel();
        assert!(phase_ctx.is_cancellation_requested());
        assert!(!ctx.is_cancellation_requested());
        assert!(phase_ctx.check_cancelled().is_err());
    }

    #[test]
    fn test_attached_scope_uses_context_ledger() {
        let ctx = context();
        let result = ctx.assert_all(|scope| {
            scope.equal(1, 2);
            scope.is_true(false, "second");
            Ok(())
        });
        assert!(result.unwrap_err().message().starts_with("2 assertion(s) failed"));
        assert!(ctx.drain_soft_failures().is_empty());
    }
}
