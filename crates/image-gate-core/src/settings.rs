use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::adapter::hadolint::HadolintAdapter;
use crate::adapter::trivy::TrivyAdapter;
use crate::adapter::{ScannerAdapter, DEFAULT_TIMEOUT};
use crate::error::ConfigError;
use crate::finding::Source;
use crate::policy::{file::load_policy, Policy};

/// Prefix for environment overrides, e.g. `IMAGE_GATE__TRIVY__TIMEOUT=90s`.
pub const ENV_PREFIX: &str = "IMAGE_GATE";
pub const DEFAULT_OUTPUT_DIR: &str = "gate-reports";

/// Runtime configuration: an optional config file layered under environment overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    /// Directory receiving raw tool output, rendered reports and the audit log.
    pub output_dir: PathBuf,
    pub policy: Option<PathBuf>,
    /// Defaults to `<output_dir>/audit.jsonl`.
    pub audit_log: Option<PathBuf>,
    pub cancel_on_failure: bool,
    /// Dockerfile linted when the artifact is an image reference.
    pub dockerfile: Option<PathBuf>,
    pub trivy: ToolSettings,
    pub hadolint: ToolSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    pub enabled: bool,
    /// Executable name or path; each adapter has its own default.
    pub program: Option<String>,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    pub extra_args: Vec<String>,
    /// Saved report to replay instead of invoking the tool.
    pub report: Option<PathBuf>,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            policy: None,
            audit_log: None,
            cancel_on_failure: true,
            dockerfile: None,
            trivy: ToolSettings::default(),
            hadolint: ToolSettings::default(),
        }
    }
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            program: None,
            timeout: DEFAULT_TIMEOUT,
            extra_args: Vec::new(),
            report: None,
        }
    }
}

impl ToolSettings {
    /// File name for the saved raw output; a replayed report keeps its own extension.
    pub fn raw_file_name(&self, tool: &str) -> String {
        let extension = self
            .report
            .as_deref()
            .and_then(Path::extension)
            .and_then(|ext| ext.to_str())
            .unwrap_or("json");
        format!("{tool}.{extension}")
    }
}

impl GateSettings {
    /// Load settings from `path` (TOML, YAML or JSON by extension) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_sources(path, None)
    }

    fn from_sources(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let environment = Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .source(env);
        let settings = builder
            .add_source(environment)
            .build()
            .with_context(|| match path {
                Some(path) => format!("failed to read settings from {}", path.display()),
                None => "failed to read settings from environment".to_string(),
            })?
            .try_deserialize()
            .context("invalid gate settings")?;
        Ok(settings)
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.output_dir.join("raw")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.audit_log
            .clone()
            .unwrap_or_else(|| self.output_dir.join("audit.jsonl"))
    }

    pub fn enabled_sources(&self) -> BTreeSet<Source> {
        let mut sources = BTreeSet::new();
        if self.trivy.enabled {
            sources.insert(Source::VulnerabilityScanner);
        }
        if self.hadolint.enabled {
            sources.insert(Source::LintChecker);
        }
        sources
    }

    /// The configured policy file, or the default policy requiring every enabled source.
    pub fn resolve_policy(&self) -> Result<Policy, ConfigError> {
        match &self.policy {
            Some(path) => load_policy(path),
            None => Ok(Policy {
                required_sources: self.enabled_sources(),
                ..Policy::default()
            }),
        }
    }

    /// Build the enabled adapters. Raw tool output lands under [`Self::raw_dir`].
    pub fn adapters(&self) -> Vec<Arc<dyn ScannerAdapter>> {
        let raw_dir = self.raw_dir();
        let mut adapters: Vec<Arc<dyn ScannerAdapter>> = Vec::new();

        if self.trivy.enabled {
            let tool = &self.trivy;
            let mut adapter = tool
                .program
                .as_deref()
                .map(TrivyAdapter::new)
                .unwrap_or_default()
                .with_timeout(tool.timeout)
                .with_extra_args(tool.extra_args.clone())
                .with_raw_output(raw_dir.join(tool.raw_file_name("trivy")));
            if let Some(report) = &tool.report {
                adapter = adapter.with_replay(report);
            }
            adapters.push(Arc::new(adapter));
        }

        if self.hadolint.enabled {
            let tool = &self.hadolint;
            let mut adapter = tool
                .program
                .as_deref()
                .map(HadolintAdapter::new)
                .unwrap_or_default()
                .with_timeout(tool.timeout)
                .with_extra_args(tool.extra_args.clone())
                .with_raw_output(raw_dir.join(tool.raw_file_name("hadolint")));
            if let Some(dockerfile) = &self.dockerfile {
                adapter = adapter.with_dockerfile(dockerfile);
            }
            if let Some(report) = &tool.report {
                adapter = adapter.with_replay(report);
            }
            adapters.push(Arc::new(adapter));
        }

        adapters
    }
}

/// Durations as humantime strings (`90s`, `5m`); bare integers are seconds.
mod duration_str {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration such as \"90s\" or a number of seconds")
        }

        fn visit_u64<E: de::Error>(self, secs: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(secs))
        }

        fn visit_i64<E: de::Error>(self, secs: i64) -> Result<Duration, E> {
            u64::try_from(secs)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must not be negative"))
        }

        fn visit_str<E: de::Error>(self, raw: &str) -> Result<Duration, E> {
            humantime::parse_duration(raw.trim()).map_err(E::custom)
        }
    }
}
