use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Write},
    str::FromStr,
};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::{AdapterError, AdapterRun};
use crate::finding::{report_order, ArtifactRef, Finding, Severity, Source};
use crate::gate::GateState;
use crate::policy::Verdict;

/// Version of the JSON report layout. Bump on any breaking field change.
pub const REPORT_SCHEMA_VERSION: &str = "1";

/// Format styles supported by [`render_report`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
    Markdown,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "text" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            "markdown" | "md" => Ok(Self::Markdown),
            other => Err(format!(
                "unknown format `{other}` (expected human|json|markdown)"
            )),
        }
    }
}

/// What one adapter delivered. `run` is `None` when the adapter was cancelled.
#[derive(Debug, Clone)]
pub struct AdapterResult {
    pub name: String,
    pub source: Source,
    pub required: bool,
    pub run: Option<AdapterRun>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdapterStatus {
    Completed { findings: usize },
    Failed { error: AdapterError, partial_findings: usize },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterSummary {
    pub name: String,
    pub source: Source,
    pub required: bool,
    #[serde(flatten)]
    pub status: AdapterStatus,
}

/// One issue after merging identical `(id, subject)` reports from every adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedFinding {
    pub id: String,
    pub subject: String,
    pub severity: Severity,
    pub sources: Vec<Source>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregateReport {
    pub adapters: Vec<AdapterSummary>,
    pub findings: Vec<MergedFinding>,
    pub notes: Vec<String>,
}

/// Merge every adapter's findings, keeping provenance.
///
/// The result depends only on the set of inputs, never on completion order.
pub fn aggregate(results: &[AdapterResult]) -> AggregateReport {
    let mut groups: BTreeMap<(String, String), Vec<&Finding>> = BTreeMap::new();
    let mut adapters = Vec::with_capacity(results.len());
    let mut notes = Vec::new();

    for result in results {
        let status = match &result.run {
            None => {
                notes.push(format!("adapter `{}` was cancelled", result.name));
                AdapterStatus::Cancelled
            }
            Some(AdapterRun {
                findings,
                error: None,
            }) => AdapterStatus::Completed {
                findings: findings.len(),
            },
            Some(AdapterRun {
                findings,
                error: Some(error),
            }) => {
                if !result.required {
                    notes.push(format!(
                        "optional adapter `{}` skipped: {error}",
                        result.name
                    ));
                }
                AdapterStatus::Failed {
                    error: error.clone(),
                    partial_findings: findings.len(),
                }
            }
        };
        adapters.push(AdapterSummary {
            name: result.name.clone(),
            source: result.source,
            required: result.required,
            status,
        });

        // A failed optional adapter's source is skipped entirely.
        let counted = result
            .run
            .iter()
            .filter(|run| run.error.is_none() || result.required);
        for finding in counted.flat_map(|run| &run.findings) {
            groups
                .entry((finding.id.clone(), finding.subject.clone()))
                .or_default()
                .push(finding);
        }
    }

    let mut findings: Vec<_> = groups
        .into_iter()
        .map(|((id, subject), mut group)| {
            group.sort_by(|a, b| report_order(a, b));
            let primary = group[0];
            let sources: BTreeSet<Source> = group.iter().map(|f| f.source).collect();
            MergedFinding {
                id,
                subject,
                severity: primary.severity,
                sources: sources.into_iter().collect(),
                description: primary.description.clone(),
                remediation: group.iter().find_map(|f| f.remediation.clone()),
            }
        })
        .collect();
    findings.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.id.cmp(&b.id))
            .then_with(|| a.subject.cmp(&b.subject))
    });

    adapters.sort_by(|a, b| a.name.cmp(&b.name));
    notes.sort();

    AggregateReport {
        adapters,
        findings,
        notes,
    }
}

/// Full audit record of one gate invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub schema_version: String,
    pub tool_version: String,
    pub artifact_ref: ArtifactRef,
    pub generated_at: DateTime<Utc>,
    pub state: GateState,
    /// One-line explanation of `state`.
    pub reason: String,
    pub threshold: Severity,
    pub adapters: Vec<AdapterSummary>,
    pub findings: Vec<MergedFinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    pub notes: Vec<String>,
}

impl GateReport {
    pub fn exit_code(&self) -> i32 {
        self.state.exit_code()
    }

    fn status_of(&self, finding: &MergedFinding) -> FindingStatus {
        let Some(verdict) = &self.verdict else {
            return FindingStatus::Unevaluated;
        };
        let matches = |f: &Finding| f.id == finding.id && f.subject == finding.subject;
        if verdict.blocking_findings.iter().any(matches) {
            FindingStatus::Blocking
        } else if verdict.waived_findings.iter().any(matches) {
            FindingStatus::Waived
        } else {
            FindingStatus::BelowThreshold
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FindingStatus {
    Blocking,
    Waived,
    BelowThreshold,
    Unevaluated,
}

impl fmt::Display for FindingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FindingStatus::Blocking => "blocking",
            FindingStatus::Waived => "waived",
            FindingStatus::BelowThreshold => "ok",
            FindingStatus::Unevaluated => "-",
        })
    }
}

/// Produce report bytes from a `GateReport` using the desired format.
pub fn render_report(report: &GateReport, format: OutputFormat) -> anyhow::Result<Vec<u8>> {
    let text = match format {
        OutputFormat::Human => render_human(report)?,
        OutputFormat::Json => {
            let mut json = serde_json::to_string_pretty(report)?;
            json.push('\n');
            json
        }
        OutputFormat::Markdown => render_markdown(report)?,
    };
    Ok(text.into_bytes())
}

fn render_human(report: &GateReport) -> anyhow::Result<String> {
    let mut out = String::new();
    writeln!(
        out,
        "Gate {} (exit {}): {}",
        report.state.label(),
        report.exit_code(),
        report.reason
    )?;
    writeln!(out, "Artifact: {}", report.artifact_ref)?;
    writeln!(out, "Generated: {}", timestamp(&report.generated_at))?;
    writeln!(out, "Threshold: {}", report.threshold)?;
    writeln!(out)?;

    writeln!(out, "Adapters:")?;
    for adapter in &report.adapters {
        writeln!(
            out,
            "  - {name} [{source}, {req}] {status}",
            name = adapter.name,
            source = adapter.source,
            req = if adapter.required { "required" } else { "optional" },
            status = describe_status(&adapter.status),
        )?;
    }
    writeln!(out)?;

    if report.findings.is_empty() {
        writeln!(out, "No findings detected.")?;
    } else {
        let rows: Vec<[String; 5]> = report
            .findings
            .iter()
            .map(|finding| {
                [
                    finding.severity.to_string(),
                    finding.id.clone(),
                    finding.subject.clone(),
                    join_sources(&finding.sources),
                    report.status_of(finding).to_string(),
                ]
            })
            .collect();
        let header = ["SEVERITY", "ID", "SUBJECT", "SOURCES", "STATUS"].map(String::from);
        let mut widths = header.clone().map(|h| h.len());
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }
        writeln!(out, "Findings:")?;
        for row in std::iter::once(&header).chain(&rows) {
            let line = row
                .iter()
                .zip(widths)
                .map(|(cell, width)| format!("{cell:<width$}"))
                .collect::<Vec<_>>()
                .join("  ");
            writeln!(out, "  {}", line.trim_end())?;
        }
    }

    if let Some(verdict) = &report.verdict {
        if !verdict.blocking_findings.is_empty() {
            writeln!(out)?;
            writeln!(out, "Blocking:")?;
            for finding in &verdict.blocking_findings {
                write_detail(&mut out, finding)?;
            }
        }
        if !verdict.waived_findings.is_empty() {
            writeln!(out)?;
            writeln!(out, "Waived:")?;
            for finding in &verdict.waived_findings {
                write_detail(&mut out, finding)?;
            }
        }
    }

    if !report.notes.is_empty() {
        writeln!(out)?;
        writeln!(out, "Notes:")?;
        for note in &report.notes {
            writeln!(out, "  - {note}")?;
        }
    }
    Ok(out)
}

fn write_detail(out: &mut String, finding: &Finding) -> fmt::Result {
    writeln!(
        out,
        "  - {id} on {subject} ({severity}, {source}): {desc}",
        id = finding.id,
        subject = finding.subject,
        severity = finding.severity,
        source = finding.source,
        desc = single_line(&finding.description),
    )?;
    if let Some(fix) = &finding.remediation {
        writeln!(out, "    fix: {}", single_line(fix))?;
    }
    Ok(())
}

fn render_markdown(report: &GateReport) -> anyhow::Result<String> {
    let mut out = String::new();
    writeln!(out, "## Image gate: {}", report.state.label())?;
    writeln!(out)?;
    writeln!(out, "{}", escape_cell(&report.reason))?;
    writeln!(out)?;
    writeln!(
        out,
        "- **Artifact:** `{}`\n- **Threshold:** {}\n- **Exit code:** {}",
        report.artifact_ref,
        report.threshold,
        report.exit_code()
    )?;
    writeln!(out)?;

    writeln!(out, "| Adapter | Source | Required | Status |")?;
    writeln!(out, "|---|---|---|---|")?;
    for adapter in &report.adapters {
        writeln!(
            out,
            "| {} | {} | {} | {} |",
            adapter.name,
            adapter.source,
            if adapter.required { "yes" } else { "no" },
            escape_cell(&describe_status(&adapter.status))
        )?;
    }
    writeln!(out)?;

    if report.findings.is_empty() {
        writeln!(out, "No findings detected.")?;
    } else {
        writeln!(out, "| Severity | ID | Subject | Sources | Status | Description |")?;
        writeln!(out, "|---|---|---|---|---|---|")?;
        for finding in &report.findings {
            writeln!(
                out,
                "| {} | {} | `{}` | {} | {} | {} |",
                finding.severity,
                escape_cell(&finding.id),
                escape_cell(&finding.subject),
                join_sources(&finding.sources),
                report.status_of(finding),
                escape_cell(&finding.description)
            )?;
        }
    }

    if !report.notes.is_empty() {
        writeln!(out)?;
        for note in &report.notes {
            writeln!(out, "> {}", escape_cell(note))?;
        }
    }
    Ok(out)
}

fn describe_status(status: &AdapterStatus) -> String {
    match status {
        AdapterStatus::Completed { findings } => format!("completed, {findings} finding(s)"),
        AdapterStatus::Failed {
            error,
            partial_findings,
        } => format!("failed after {partial_findings} finding(s): {error}"),
        AdapterStatus::Cancelled => "cancelled".to_string(),
    }
}

fn join_sources(sources: &[Source]) -> String {
    sources
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn single_line(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\n' | '\r' => ' ',
            _ => c,
        })
        .collect()
}

fn escape_cell(input: &str) -> String {
    single_line(input).replace('|', "\\|")
}
