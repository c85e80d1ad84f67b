//! Isolation host capability
//!
//! The engine never calls user code directly. Every hook, body and generator
//! is invoked by target name inside a boundary owned by an [`IsolationHost`].

mod script;

pub use script::ScriptedHost;

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::assert::Fault;
use crate::error::HostError;
use crate::executor::TestContext;
use crate::models::{DataRow, Value};

/// One invocation request
#[derive(Clone, Copy, Debug)]
pub struct HostCall<'a> {
    pub boundary: &'a str,
    pub target: &'a str,
    pub args: &'a [Value],
}

/// Runs named targets inside a possibly sandboxed boundary
pub trait IsolationHost: Send + Sync {
    /// Prepare a boundary before its first use
    fn load(&self, _boundary: &str) -> Result<(), HostError> {
        Ok(())
    }

    /// Release a boundary after its last use
    fn unload(&self, _boundary: &str) -> Result<(), HostError> {
        Ok(())
    }

    /// Invoke a hook or body
    fn invoke(&self, call: HostCall<'_>, ctx: &TestContext) -> Result<(), Fault>;

    /// Produce the rows of a generator data source
    fn generate_rows(&self, boundary: &str, target: &str) -> Result<Vec<DataRow>, Fault> {
        Err(Fault::infrastructure(format!(
            "Generator '{target}' is not available in boundary '{boundary}'"
        )))
    }
}

pub type TargetFn = Arc<dyn Fn(&TestContext, &[Value]) -> Result<(), Fault> + Send + Sync>;
pub type GeneratorFn = Arc<dyn Fn() -> Result<Vec<DataRow>, Fault> + Send + Sync>;

/// Host backed by closures registered in the current process
#[derive(Default)]
pub struct InProcessHost {
    targets: HashMap<String, TargetFn>,
    generators: HashMap<String, GeneratorFn>,
    loads: Mutex<BTreeMap<String, usize>>,
    loaded: Mutex<BTreeMap<String, bool>>,
}

impl InProcessHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook or body under `target`
    pub fn hook<F>(mut self, target: impl Into<String>, f: F) -> Self
    where
        F: Fn(&TestContext, &[Value]) -> Result<(), Fault> + Send + Sync + 'static,
    {
        self.targets.insert(target.into(), Arc::new(f));
        self
    }

    /// Register a row generator under `target`
    pub fn generator<F>(mut self, target: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Result<Vec<DataRow>, Fault> + Send + Sync + 'static,
    {
        self.generators.insert(target.into(), Arc::new(f));
        self
    }

    /// How many times `boundary` was loaded
    pub fn load_count(&self, boundary: &str) -> usize {
        self.loads.lock().get(boundary).copied().unwrap_or(0)
    }

    pub fn is_loaded(&self, boundary: &str) -> bool {
        self.loaded.lock().get(boundary).copied().unwrap_or(false)
    }
}

impl IsolationHost for InProcessHost {
    fn load(&self, boundary: &str) -> Result<(), HostError> {
        *self.loads.lock().entry(boundary.to_string()).or_default() += 1;
        self.loaded.lock().insert(boundary.to_string(), true);
        debug!("Loaded boundary {}", boundary);
        Ok(())
    }

    fn unload(&self, boundary: &str) -> Result<(), HostError> {
        match self.loaded.lock().get_mut(boundary) {
            Some(loaded) if *loaded => {
                *loaded = false;
                debug!("Unloaded boundary {}", boundary);
                Ok(())
            }
            _ => Err(HostError::Unload {
                boundary: boundary.to_string(),
                reason: "boundary is not loaded".to_string(),
            }),
        }
    }

    fn invoke(&self, call: HostCall<'_>, ctx: &TestContext) -> Result<(), Fault> {
        let target = self.targets.get(call.target).ok_or_else(|| {
            Fault::infrastructure(format!(
                "Target '{}' is not registered in boundary '{}'",
                call.target, call.boundary
            ))
        })?;
        target(ctx, call.args)
    }

    fn generate_rows(&self, boundary: &str, target: &str) -> Result<Vec<DataRow>, Fault> {
        let generator = self.generators.get(target).ok_or_else(|| {
            Fault::infrastructure(format!(
                "Generator '{target}' is not registered in boundary '{boundary}'"
            ))
        })?;
        generator()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ContextBuilder;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> TestContext {
        ContextBuilder::new("F.case", "F").build(CancellationToken::new())
    }

    #[test]
    fn test_invoke_registered_target() {
        let host = InProcessHost::new().hook("sum", |ctx, args| {
            let total: i64 = args.iter().filter_map(Value::as_int).sum();
            ctx.write_line(total.to_string());
            Ok(())
        });
        let ctx = ctx();
        let args = vec![Value::Int(2), Value::Int(3)];
        host.invoke(
            HostCall {
                boundary: "default",
                target: "sum",
                args: &args,
            },
            &ctx,
        )
        .unwrap();
        assert_eq!(ctx.output(), "5\n");
    }

    #[test]
    fn test_unknown_target_is_infrastructure_fault() {
        let host = InProcessHost::new();
        let err = host
            .invoke(
                HostCall {
                    boundary: "default",
                    target: "missing",
                    args: &[],
                },
                &ctx(),
            )
            .unwrap_err();
        assert!(matches!(err, Fault::Infrastructure(_)));
        assert!(err.message().contains("missing"));
    }

    #[test]
    fn test_load_and_unload_tracking() {
        let host = InProcessHost::new();
        host.load("arena").unwrap();
        assert!(host.is_loaded("arena"));
        assert_eq!(host.load_count("arena"), 1);
        host.unload("arena").unwrap();
        assert!(!host.is_loaded("arena"));
        assert!(host.unload("arena").is_err());
    }

    #[test]
    fn test_generator_rows() {
        let host = InProcessHost::new()
            .generator("pairs", || Ok(vec![DataRow::new(vec![Value::Int(1)])]));
        assert_eq!(host.generate_rows("default", "pairs").unwrap().len(), 1);
        assert!(host.generate_rows("default", "nope").is_err());
    }
}
