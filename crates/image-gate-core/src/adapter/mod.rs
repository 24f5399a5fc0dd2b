use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::finding::{ArtifactRef, Finding, Source};

pub mod hadolint;
mod partial;
pub mod process;
pub mod trivy;

/// Default per-adapter time budget.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Broad category of an adapter failure, used by the gate to pick a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorKind {
    ToolNotFound,
    InvocationFailed,
    ParseError,
    Timeout,
}

/// Failures raised while invoking an external checker or reading its output.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterError {
    #[error("`{program}` was not found on PATH")]
    ToolNotFound { program: String },
    #[error("`{program}` failed (exit status {status:?}): {message}")]
    InvocationFailed {
        program: String,
        status: Option<i32>,
        message: String,
    },
    #[error("unparseable output from `{program}` after {parsed} finding(s): {message}")]
    ParseError {
        program: String,
        parsed: usize,
        message: String,
    },
    #[error("`{program}` did not finish within {}", format_timeout(.timeout))]
    Timeout {
        program: String,
        #[serde(with = "duration_secs")]
        timeout: Duration,
    },
}

impl AdapterError {
    pub fn kind(&self) -> AdapterErrorKind {
        match self {
            AdapterError::ToolNotFound { .. } => AdapterErrorKind::ToolNotFound,
            AdapterError::InvocationFailed { .. } => AdapterErrorKind::InvocationFailed,
            AdapterError::ParseError { .. } => AdapterErrorKind::ParseError,
            AdapterError::Timeout { .. } => AdapterErrorKind::Timeout,
        }
    }

    /// Errors meaning the gate itself could not do its job, as opposed to a broken tool run.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self.kind(),
            AdapterErrorKind::ToolNotFound | AdapterErrorKind::Timeout
        )
    }
}

/// Result of one adapter invocation.
///
/// `findings` may be non-empty even when `error` is set: a `ParseError` keeps
/// everything parsed before the unreadable part of the output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterRun {
    pub findings: Vec<Finding>,
    pub error: Option<AdapterError>,
}

impl AdapterRun {
    pub fn completed(findings: Vec<Finding>) -> Self {
        Self {
            findings,
            error: None,
        }
    }

    pub fn failed(error: AdapterError) -> Self {
        Self {
            findings: Vec::new(),
            error: Some(error),
        }
    }

    pub fn partial(findings: Vec<Finding>, error: AdapterError) -> Self {
        Self {
            findings,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Integration shim between one external checker and the gate.
///
/// Adding a checker means adding an implementation; the evaluator never changes.
#[async_trait]
pub trait ScannerAdapter: Send + Sync {
    /// Short stable name used for raw report files and report rows.
    fn name(&self) -> &str;

    fn source(&self) -> Source;

    /// Budget the gate grants this adapter before cancelling it.
    fn timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }

    /// Inspect the artifact and translate the tool's output into findings.
    async fn run(&self, artifact: &ArtifactRef) -> AdapterRun;
}

/// Turn a raw report into an `AdapterRun`, dropping findings that fail validation.
pub(crate) fn finish_run<F, E>(
    program: &str,
    raw: Result<String, AdapterError>,
    parse: F,
) -> AdapterRun
where
    F: FnOnce(&str) -> (Vec<Finding>, Option<E>),
    E: std::fmt::Display,
{
    let raw = match raw {
        Ok(raw) => raw,
        Err(err) => return AdapterRun::failed(err),
    };
    let (findings, err) = parse(&raw);
    let findings: Vec<_> = findings
        .into_iter()
        .filter(|finding| match finding.validate() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(program, error = %err, "dropping invalid finding");
                false
            }
        })
        .collect();
    match err {
        None => AdapterRun::completed(findings),
        Some(err) => {
            let error = AdapterError::ParseError {
                program: program.to_string(),
                parsed: findings.len(),
                message: err.to_string(),
            };
            AdapterRun::partial(findings, error)
        }
    }
}

fn format_timeout(timeout: &Duration) -> String {
    humantime::format_duration(*timeout).to_string()
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
