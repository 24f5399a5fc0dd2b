use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::finding::{ArtifactRef, Severity};
use crate::gate::GateState;
use crate::policy::Verdict;
use crate::report::{render_report, AdapterSummary, GateReport, OutputFormat};

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub recorded_at: DateTime<Utc>,
    pub artifact_ref: ArtifactRef,
    pub state: GateState,
    pub exit_code: i32,
    pub reason: String,
    pub threshold: Severity,
    pub adapters: Vec<AdapterSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
}

impl From<&GateReport> for AuditEntry {
    fn from(report: &GateReport) -> Self {
        Self {
            recorded_at: report.generated_at,
            artifact_ref: report.artifact_ref.clone(),
            state: report.state,
            exit_code: report.exit_code(),
            reason: report.reason.clone(),
            threshold: report.threshold,
            adapters: report.adapters.clone(),
            verdict: report.verdict.clone(),
        }
    }
}

/// Append-only JSON Lines record of every gate decision.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. Existing lines are never rewritten.
    pub async fn append(&self, report: &GateReport) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut line = serde_json::to_vec(&AuditEntry::from(report))?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        file.flush().await?;
        debug!(path = %self.path.display(), "audit entry appended");
        Ok(())
    }

    pub async fn entries(&self) -> Result<Vec<AuditEntry>> {
        let raw = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read audit log {}", self.path.display()))?;
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(index, line)| {
                serde_json::from_str::<AuditEntry>(line)
                    .with_context(|| format!("audit log line {} is not valid", index + 1))
            })
            .collect()
    }
}

/// Write `report.json`, `summary.txt` and `summary.md` into `dir`.
pub async fn write_report_files(report: &GateReport, dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    let mut written = Vec::with_capacity(3);
    for (name, format) in [
        ("report.json", OutputFormat::Json),
        ("summary.txt", OutputFormat::Human),
        ("summary.md", OutputFormat::Markdown),
    ] {
        let path = dir.join(name);
        let bytes = render_report(report, format)?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}
