//! Engine configuration files
//!
//! A file wraps an [`EngineConfig`] with a format version. YAML and JSON
//! are told apart by extension.

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{EngineConfig, ParallelScope};

/// Searched in order; the first existing path wins
const CONFIG_LOCATIONS: &[&str] = &[
    "./unitrun.yaml",
    "./unitrun.yml",
    "./unitrun.json",
    "./.unitrun/config.yaml",
    "~/.config/unitrun/config.yaml",
    "~/.unitrun.yaml",
];

const SUPPORTED_VERSIONS: &[&str] = &["1.0"];

/// On-disk configuration
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct ConfigFile {
    /// Format version, checked on load
    #[serde(default = "default_version")]
    pub version: String,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            engine: EngineConfig::default(),
        }
    }
}

impl ConfigFile {
    /// First existing file among the search locations
    pub fn find() -> Option<PathBuf> {
        CONFIG_LOCATIONS
            .iter()
            .map(|location| expand_path(location))
            .find(|path| path.exists())
    }

    /// Load the first file found, or defaults when there is none
    pub fn load_default() -> Result<Self> {
        if let Some(path) = Self::find() {
            debug!("Loading configuration from {}", path.display());
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Read, parse and validate one file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;

        let config: Self = match FileFormat::of(path) {
            FileFormat::Yaml => serde_yaml::from_str(&text).map_err(anyhow::Error::from),
            FileFormat::Json => serde_json::from_str(&text).map_err(anyhow::Error::from),
        }
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Write the file, creating missing parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = match FileFormat::of(path) {
            FileFormat::Yaml => serde_yaml::to_string(self).map_err(anyhow::Error::from),
            FileFormat::Json => serde_json::to_string_pretty(self).map_err(anyhow::Error::from),
        }
        .context("Cannot serialize configuration")?;

        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create {}", dir.display()))?;
        }
        std::fs::write(path, text).with_context(|| format!("Cannot write {}", path.display()))
    }

    /// Check the version, then the engine settings
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            anyhow::bail!("Unsupported config version: {}", self.version);
        }
        self.engine.validate()
    }

    /// Settings written by `unitrun config init`
    pub fn example() -> Self {
        let mut engine = EngineConfig::default()
            .with_scope(ParallelScope::Fixture)
            .with_workers(0)
            .with_retries(1)
            .with_property("Environment", "ci");
        engine.timeouts.fixture_init_ms = Some(60_000);
        engine.timeouts.body_ms = Some(30_000);
        engine.timeouts.cooperative_cancellation = true;
        engine.empty_data_source_is_inconclusive = true;

        Self {
            version: default_version(),
            engine,
        }
    }

    /// JSON schema of the configuration file
    pub fn schema() -> Result<String> {
        let schema = schemars::schema_for!(ConfigFile);
        serde_json::to_string_pretty(&schema).context("Failed to serialize schema")
    }
}

fn expand_path(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FileFormat {
    Yaml,
    Json,
}

impl FileFormat {
    /// Anything not named `.yaml`/`.yml` is read as JSON
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            _ => FileFormat::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_file_is_valid() {
        let defaults = ConfigFile::default();
        assert_eq!(defaults.version, "1.0");
        assert!(defaults.validate().is_ok());
    }

    #[test]
    fn test_config_file_save_load_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("unitrun.yaml");

        let config = ConfigFile::example();
        config.save(&path).unwrap();

        let loaded = ConfigFile::load(&path).unwrap();
        assert_eq!(loaded.engine.parallel.scope, ParallelScope::Fixture);
        assert_eq!(loaded.engine.timeouts.body_ms, Some(30_000));
        assert_eq!(
            loaded.engine.properties.get("Environment").map(String::as_str),
            Some("ci")
        );
    }

    #[test]
    fn test_config_file_save_load_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("unitrun.json");

        ConfigFile::example().save(&path).unwrap();
        let loaded = ConfigFile::load(&path).unwrap();
        assert_eq!(loaded.engine.retry.max_retries, 1);
    }

    #[test]
    fn test_validate_rejects_unknown_version() {
        let config = ConfigFile {
            version: "9.9".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_schema_mentions_sections() {
        let schema = ConfigFile::schema().unwrap();
        assert!(schema.contains("timeouts"));
        assert!(schema.contains("parallel"));
    }

    #[test]
    fn test_format_and_paths() {
        assert_eq!(FileFormat::of(Path::new("a/unitrun.yml")), FileFormat::Yaml);
        assert_eq!(FileFormat::of(Path::new("unitrun.conf")), FileFormat::Json);
        assert_eq!(expand_path("./unitrun.yaml"), PathBuf::from("./unitrun.yaml"));
    }
}
