use std::{fmt, path::PathBuf, time::Duration};

use async_trait::async_trait;
use serde::de::{DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::partial::{deserialize_partial, CollectSeq};
use super::process::ToolInvocation;
use super::{finish_run, AdapterRun, ScannerAdapter, DEFAULT_TIMEOUT};
use crate::finding::{ArtifactRef, Finding, Severity, Source};

/// Vulnerability scanner adapter for `trivy` JSON reports.
#[derive(Debug, Clone)]
pub struct TrivyAdapter {
    program: String,
    extra_args: Vec<String>,
    timeout: Duration,
    replay: Option<PathBuf>,
    raw_output: Option<PathBuf>,
}

impl Default for TrivyAdapter {
    fn default() -> Self {
        Self::new("trivy")
    }
}

impl TrivyAdapter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            replay: None,
            raw_output: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Extra flags placed before the target, e.g. `--ignore-unfixed`.
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Parse a saved `trivy --format json` report instead of running trivy.
    pub fn with_replay(mut self, path: impl Into<PathBuf>) -> Self {
        self.replay = Some(path.into());
        self
    }

    pub fn with_raw_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.raw_output = Some(path.into());
        self
    }

    fn args_for(&self, artifact: &ArtifactRef) -> Vec<String> {
        let mode = if artifact.is_path() { "fs" } else { "image" };
        let mut args = vec![
            mode.to_string(),
            "--format".into(),
            "json".into(),
            "--quiet".into(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args.push(artifact.as_str().to_string());
        args
    }
}

#[async_trait]
impl ScannerAdapter for TrivyAdapter {
    fn name(&self) -> &str {
        "trivy"
    }

    fn source(&self) -> Source {
        Source::VulnerabilityScanner
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    #[instrument(name = "trivy_adapter", skip(self), fields(artifact = %artifact))]
    async fn run(&self, artifact: &ArtifactRef) -> AdapterRun {
        let raw = ToolInvocation {
            program: &self.program,
            args: self.args_for(artifact),
            // Trivy only exits non-zero on failure unless `--exit-code` is passed.
            accepted_status: &[0],
            replay: self.replay.as_deref(),
            raw_output: self.raw_output.as_deref(),
        }
        .report()
        .await;
        finish_run(&self.program, raw, parse_output)
    }
}

/// Parse a trivy JSON report, returning every finding decoded before any error.
pub fn parse_output(raw: &str) -> (Vec<Finding>, Option<serde_json::Error>) {
    let mut vulnerabilities = Vec::new();
    let result = deserialize_partial(raw, DocumentSeed(&mut vulnerabilities));
    let findings = vulnerabilities
        .into_iter()
        .map(TrivyVulnerability::into_finding)
        .collect();
    (findings, result.err())
}

#[derive(Debug, Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID")]
    vulnerability_id: String,
    #[serde(rename = "PkgName")]
    pkg_name: String,
    #[serde(rename = "InstalledVersion", default)]
    installed_version: String,
    #[serde(rename = "FixedVersion", default)]
    fixed_version: Option<String>,
    #[serde(rename = "Severity", default)]
    severity: Option<String>,
    #[serde(rename = "Title", default)]
    title: Option<String>,
    #[serde(rename = "Description", default)]
    description: Option<String>,
}

impl TrivyVulnerability {
    fn into_finding(self) -> Finding {
        let severity = self
            .severity
            .as_deref()
            .and_then(|raw| raw.parse::<Severity>().ok())
            .unwrap_or_else(|| {
                debug!(id = %self.vulnerability_id, raw = ?self.severity, "unrated vulnerability treated as LOW");
                Severity::Low
            });
        let subject = if self.installed_version.is_empty() {
            self.pkg_name.clone()
        } else {
            format!("{}@{}", self.pkg_name, self.installed_version)
        };
        let description = self
            .title
            .filter(|t| !t.trim().is_empty())
            .or_else(|| {
                self.description
                    .as_deref()
                    .and_then(|d| d.lines().next())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        let finding = Finding::new(
            self.vulnerability_id,
            Source::VulnerabilityScanner,
            severity,
            subject,
            description,
        );
        match self.fixed_version.filter(|v| !v.trim().is_empty()) {
            Some(fixed) => finding.with_remediation(format!("upgrade {} to {}", self.pkg_name, fixed)),
            None => finding,
        }
    }
}

/// Top-level document. Current trivy emits `{"Results": [...]}`; releases before
/// 0.20 emitted the results array directly.
struct DocumentSeed<'a>(&'a mut Vec<TrivyVulnerability>);

impl<'de> DeserializeSeed<'de> for DocumentSeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for DocumentSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a trivy report object or results array")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(key) = map.next_key::<String>()? {
            if key == "Results" {
                map.next_value_seed(ResultsSeed(&mut *self.0))?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, seq: A) -> Result<(), A::Error> {
        ResultsSeed(self.0).visit_seq(seq)
    }
}

struct ResultsSeed<'a>(&'a mut Vec<TrivyVulnerability>);

impl<'de> DeserializeSeed<'de> for ResultsSeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for ResultsSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of scan results or null")
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while seq.next_element_seed(ResultSeed(&mut *self.0))?.is_some() {}
        Ok(())
    }
}

struct ResultSeed<'a>(&'a mut Vec<TrivyVulnerability>);

impl<'de> DeserializeSeed<'de> for ResultSeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for ResultSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a scan result object")
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(key) = map.next_key::<String>()? {
            if key == "Vulnerabilities" {
                map.next_value_seed(CollectSeq::new(&mut *self.0))?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}
