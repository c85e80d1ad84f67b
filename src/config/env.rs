//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;

use super::{EngineConfig, ParallelScope};

/// Environment variable prefix
const ENV_PREFIX: &str = "UNITRUN";

/// Overrides read from `UNITRUN_*` variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Config file from UNITRUN_CONFIG
    pub config_file: Option<String>,
    /// Worker count from UNITRUN_WORKERS
    pub workers: Option<usize>,
    /// Parallel scope from UNITRUN_SCOPE
    pub scope: Option<ParallelScope>,
    /// Retry count from UNITRUN_RETRIES
    pub retries: Option<u32>,
    /// Body timeout from UNITRUN_BODY_TIMEOUT_MS
    pub body_timeout_ms: Option<u64>,
    /// Cooperative cancellation from UNITRUN_COOPERATIVE
    pub cooperative: Option<bool>,
    /// Inconclusive mapping from UNITRUN_MAP_INCONCLUSIVE
    pub map_inconclusive: Option<bool>,
    /// Empty-source policy from UNITRUN_EMPTY_SOURCE_INCONCLUSIVE
    pub empty_source_inconclusive: Option<bool>,
    /// Log level from UNITRUN_LOG
    pub log_level: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            config_file: get_env("CONFIG"),
            workers: get_env_parse("WORKERS"),
            scope: get_env("SCOPE").and_then(|s| ParallelScope::from_str(&s)),
            retries: get_env_parse("RETRIES"),
            body_timeout_ms: get_env_parse("BODY_TIMEOUT_MS"),
            cooperative: get_env_bool("COOPERATIVE"),
            map_inconclusive: get_env_bool("MAP_INCONCLUSIVE"),
            empty_source_inconclusive: get_env_bool("EMPTY_SOURCE_INCONCLUSIVE"),
            log_level: get_env("LOG"),
        }
    }

    /// Check if any override is set
    pub fn has_any(&self) -> bool {
        self.config_file.is_some()
            || self.workers.is_some()
            || self.scope.is_some()
            || self.retries.is_some()
            || self.body_timeout_ms.is_some()
            || self.cooperative.is_some()
            || self.map_inconclusive.is_some()
            || self.empty_source_inconclusive.is_some()
            || self.log_level.is_some()
    }

    /// Apply overrides on top of a loaded configuration
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(workers) = self.workers {
            config.parallel.workers = workers;
        }
        if let Some(scope) = self.scope {
            config.parallel.scope = scope;
        }
        if let Some(retries) = self.retries {
            config.retry.max_retries = retries;
        }
        if let Some(ms) = self.body_timeout_ms {
            config.timeouts.body_ms = Some(ms);
        }
        if let Some(cooperative) = self.cooperative {
            config.timeouts.cooperative_cancellation = cooperative;
        }
        if let Some(map) = self.map_inconclusive {
            config.map_inconclusive_to_failed = map;
        }
        if let Some(empty) = self.empty_source_inconclusive {
            config.empty_data_source_is_inconclusive = empty;
        }
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Print all UNITRUN environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_CONFIG                     Path to configuration file");
    println!("  {ENV_PREFIX}_WORKERS                    Worker count (0 = hardware concurrency)");
    println!("  {ENV_PREFIX}_SCOPE                      Parallel scope (disabled, case, fixture)");
    println!("  {ENV_PREFIX}_RETRIES                    Retries after a failed attempt");
    println!("  {ENV_PREFIX}_BODY_TIMEOUT_MS            Default body timeout in milliseconds");
    println!("  {ENV_PREFIX}_COOPERATIVE                Cooperative cancellation (true/false)");
    println!("  {ENV_PREFIX}_MAP_INCONCLUSIVE           Report inconclusive as failed (true/false)");
    println!("  {ENV_PREFIX}_EMPTY_SOURCE_INCONCLUSIVE  Empty data source is inconclusive (true/false)");
    println!("  {ENV_PREFIX}_LOG                        Log level (trace, debug, info, warn, error)");
    println!();
    println!("Example:");
    println!("  export {ENV_PREFIX}_SCOPE=fixture");
    println!("  export {ENV_PREFIX}_WORKERS=4");
    println!("  unitrun run plan.yaml");
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sets variables for the duration of a test and restores them on drop
    struct EnvGuard {
        previous: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn set(vars: &[(&str, &str)]) -> Self {
            let previous = vars
                .iter()
                .map(|(name, value)| {
                    let key = format!("{ENV_PREFIX}_{name}");
                    let old = env::var(&key).ok();
                    env::set_var(&key, value);
                    (key, old)
                })
                .collect();
            Self { previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in &self.previous {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_env_config_default() {
        let config = EnvConfig::default();
        assert!(config.workers.is_none());
        assert!(!config.has_any());
    }

    #[test]
    fn test_env_overrides_applied() {
        let _guard = EnvGuard::set(&[
            ("WORKERS", "6"),
            ("SCOPE", "case"),
            ("RETRIES", "2"),
            ("BODY_TIMEOUT_MS", "750"),
            ("COOPERATIVE", "yes"),
            ("EMPTY_SOURCE_INCONCLUSIVE", "on"),
        ]);

        let env_config = EnvConfig::load();
        assert!(env_config.has_any());

        let mut config = EngineConfig::default();
        env_config.apply(&mut config);
        assert_eq!(config.parallel.workers, 6);
        assert_eq!(config.parallel.scope, ParallelScope::Case);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.timeouts.body_ms, Some(750));
        assert!(config.timeouts.cooperative_cancellation);
        assert!(config.empty_data_source_is_inconclusive);
        assert!(!config.map_inconclusive_to_failed);
    }
}
