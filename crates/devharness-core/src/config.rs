//! Harness configuration.
//!
//! A [`HarnessConfig`] can be built in code with the `with_*` methods or
//! loaded from a TOML document:
//!
//! ```toml
//! app_id = "exampleapp"
//! task_queues = ["mail", "reports"]
//! log_level = "warning"
//! startup_timeout_secs = 30
//!
//! [[components]]
//! name = "worker"
//! manifest = "worker/app.yaml"
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HarnessError, Result};
use crate::logging::{LogLevel, LogSink};
use crate::toolchain::Toolchain;

/// A named module started alongside the implicit one.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ComponentSpec {
    /// Module name; must be unique within a harness.
    pub name: String,
    /// Path to the module's manifest. Must exist when the harness starts.
    pub manifest: PathBuf,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>, manifest: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            manifest: manifest.into(),
        }
    }
}

/// Everything needed to start one harness.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Application id to pretend to be. Required when components are set.
    pub app_id: Option<String>,
    /// Task queues to declare in the queue manifest.
    pub task_queues: Vec<String>,
    /// Threshold for harness and mirrored child logging.
    pub log_level: LogLevel,
    /// Additional modules, in start order.
    pub components: Vec<ComponentSpec>,
    /// How long to wait for every component to announce its address.
    #[serde(rename = "startup_timeout_secs", with = "secs")]
    pub startup_timeout: Duration,
    /// Deadline for a single RPC round trip.
    #[serde(rename = "rpc_timeout_secs", with = "secs")]
    pub rpc_timeout: Duration,
    /// Wait this long for a running harness to close instead of failing fast.
    #[serde(rename = "admission_wait_secs", with = "opt_secs")]
    pub admission_wait: Option<Duration>,
    /// Explicit interpreter and server paths; skips discovery when set.
    #[serde(skip)]
    pub toolchain: Option<Toolchain>,
    /// Test-reporter sink. Defaults to `tracing`.
    #[serde(skip)]
    pub sink: Option<Arc<dyn LogSink>>,
}

impl fmt::Debug for HarnessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarnessConfig")
            .field("app_id", &self.app_id)
            .field("task_queues", &self.task_queues)
            .field("log_level", &self.log_level)
            .field("components", &self.components)
            .field("startup_timeout", &self.startup_timeout)
            .field("rpc_timeout", &self.rpc_timeout)
            .field("admission_wait", &self.admission_wait)
            .field("toolchain", &self.toolchain)
            .field("sink", &self.sink.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            task_queues: Vec::new(),
            log_level: LogLevel::default(),
            components: Vec::new(),
            startup_timeout: Self::DEFAULT_STARTUP_TIMEOUT,
            rpc_timeout: Self::DEFAULT_RPC_TIMEOUT,
            admission_wait: None,
            toolchain: None,
            sink: None,
        }
    }
}

impl HarnessConfig {
    /// App id used when none is configured.
    pub const DEFAULT_APP_ID: &str = "testapp";
    pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(15);
    pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| HarnessError::ConfigInvalid(e.to_string()))
    }

    /// Load a config file. Relative component manifests are resolved
    /// against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| HarnessError::workspace(path, e))?;
        let mut config = Self::from_toml_str(&contents)?;
        if let Some(dir) = path.parent() {
            for component in &mut config.components {
                if component.manifest.is_relative() {
                    component.manifest = dir.join(&component.manifest);
                }
            }
        }
        Ok(config)
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_task_queue(mut self, queue: impl Into<String>) -> Self {
        self.task_queues.push(queue.into());
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_component(mut self, name: impl Into<String>, manifest: impl Into<PathBuf>) -> Self {
        self.components.push(ComponentSpec::new(name, manifest));
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_admission_wait(mut self, wait: Duration) -> Self {
        self.admission_wait = Some(wait);
        self
    }

    pub fn with_toolchain(mut self, toolchain: Toolchain) -> Self {
        self.toolchain = Some(toolchain);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Effective application id.
    pub fn app_id(&self) -> &str {
        self.app_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(Self::DEFAULT_APP_ID)
    }

    /// Check invariants that must hold before anything is spawned.
    pub fn validate(&self) -> Result<()> {
        if !self.components.is_empty() && self.app_id.as_deref().is_none_or(str::is_empty) {
            return Err(HarnessError::ConfigInvalid(
                "an explicit app_id is required when components are configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for component in &self.components {
            if component.name.is_empty() {
                return Err(HarnessError::ConfigInvalid(
                    "component name must not be empty".to_string(),
                ));
            }
            if !seen.insert(component.name.as_str()) {
                return Err(HarnessError::ConfigInvalid(format!(
                    "duplicate component name {:?}",
                    component.name
                )));
            }
            if !component.manifest.exists() {
                return Err(HarnessError::ConfigInvalid(format!(
                    "manifest for component {:?} does not exist: {}",
                    component.name,
                    component.manifest.display()
                )));
            }
        }
        Ok(())
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = HarnessConfig::default();
        assert_eq!(cfg.app_id(), "testapp");
        assert!(cfg.task_queues.is_empty());
        assert_eq!(cfg.log_level, LogLevel::Error);
        assert_eq!(cfg.startup_timeout, Duration::from_secs(15));
        assert!(cfg.admission_wait.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn components_require_explicit_app_id() {
        let dir = tempfile::TempDir::new().unwrap();
        let manifest = dir.path().join("worker.yaml");
        std::fs::write(&manifest, "module: worker\n").unwrap();

        let cfg = HarnessConfig::new().with_component("worker", &manifest);
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, HarnessError::ConfigInvalid(_)), "got {err:?}");

        let cfg = cfg.with_app_id("exampleapp");
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_manifest_fails_fast() {
        let cfg = HarnessConfig::new()
            .with_app_id("exampleapp")
            .with_component("worker", "/definitely/not/here/app.yaml");
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("does not exist"), "got {err}");
    }

    #[test]
    fn duplicate_component_names_are_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let manifest = dir.path().join("a.yaml");
        std::fs::write(&manifest, "").unwrap();

        let cfg = HarnessConfig::new()
            .with_app_id("exampleapp")
            .with_component("worker", &manifest)
            .with_component("worker", &manifest);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"), "got {err}");
    }

    #[test]
    fn parses_toml() {
        let cfg = HarnessConfig::from_toml_str(
            r#"
            app_id = "exampleapp"
            task_queues = ["mail"]
            log_level = "child"
            startup_timeout_secs = 30
            admission_wait_secs = 5

            [[components]]
            name = "worker"
            manifest = "worker/app.yaml"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.app_id(), "exampleapp");
        assert_eq!(cfg.task_queues, vec!["mail"]);
        assert_eq!(cfg.log_level, LogLevel::Child);
        assert_eq!(cfg.startup_timeout, Duration::from_secs(30));
        assert_eq!(cfg.rpc_timeout, HarnessConfig::DEFAULT_RPC_TIMEOUT);
        assert_eq!(cfg.admission_wait, Some(Duration::from_secs(5)));
        assert_eq!(cfg.components[0].name, "worker");
    }

    #[test]
    fn load_resolves_manifests_relative_to_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("devharness.toml");
        std::fs::write(
            &path,
            "app_id = \"x\"\n[[components]]\nname = \"w\"\nmanifest = \"w.yaml\"\n",
        )
        .unwrap();
        let cfg = HarnessConfig::load(&path).unwrap();
        assert_eq!(cfg.components[0].manifest, dir.path().join("w.yaml"));
    }
}
