use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapter::AdapterError;
use crate::error::ConfigError;
use crate::finding::{report_order, ArtifactRef, Finding, FindingKey, Severity, Source};

pub mod file;

/// Identifier of the synthetic finding raised when a required adapter fails.
pub const ADAPTER_FAILURE_ID: &str = "ADAPTER_FAILURE";

/// Declarative rules deciding which findings block publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// Lowest severity that fails the gate.
    #[serde(alias = "fail_on", alias = "maxSeverity", default = "default_max_severity")]
    pub max_severity: Severity,
    #[serde(alias = "allowList", default)]
    pub allow_list: Vec<AllowEntry>,
    /// Sources whose adapters must run and succeed for a verdict to count.
    #[serde(alias = "requiredSources", default = "default_required_sources")]
    pub required_sources: BTreeSet<Source>,
}

fn default_max_severity() -> Severity {
    Severity::High
}

fn default_required_sources() -> BTreeSet<Source> {
    Source::ALL.into_iter().collect()
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_severity: default_max_severity(),
            allow_list: Vec::new(),
            required_sources: default_required_sources(),
        }
    }
}

/// A waived `(id, subject)` pair, optionally time-limited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllowEntry {
    pub id: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AllowEntry {
    /// Expired entries stop waiving at their expiry instant.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expiry.map_or(true, |expiry| expiry > now)
    }

    pub fn matches(&self, finding: &Finding) -> bool {
        self.id == finding.id && self.subject == finding.subject
    }
}

impl Policy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for (index, entry) in self.allow_list.iter().enumerate() {
            if entry.id.trim().is_empty() {
                return Err(ConfigError::BlankAllowEntry { index, field: "id" });
            }
            if entry.subject.trim().is_empty() {
                return Err(ConfigError::BlankAllowEntry {
                    index,
                    field: "subject",
                });
            }
            if !seen.insert((entry.id.as_str(), entry.subject.as_str())) {
                return Err(ConfigError::DuplicateAllowEntry {
                    id: entry.id.clone(),
                    subject: entry.subject.clone(),
                });
            }
        }
        Ok(())
    }

    /// The unexpired allow-list entry covering `finding`, if any.
    pub fn waiver_for(&self, finding: &Finding, now: DateTime<Utc>) -> Option<&AllowEntry> {
        if finding.id == ADAPTER_FAILURE_ID {
            return None;
        }
        self.allow_list
            .iter()
            .find(|entry| entry.matches(finding) && entry.is_active(now))
    }

    pub fn expired_entries(&self, now: DateTime<Utc>) -> impl Iterator<Item = &AllowEntry> {
        self.allow_list
            .iter()
            .filter(move |entry| !entry.is_active(now))
    }

    pub fn is_required(&self, source: Source) -> bool {
        self.required_sources.contains(&source)
    }
}

/// Outcome of evaluating one run's findings against a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    pub blocking_findings: Vec<Finding>,
    pub waived_findings: Vec<Finding>,
    pub timestamp: DateTime<Utc>,
    pub artifact_ref: ArtifactRef,
}

/// An adapter that did not deliver a trustworthy result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterFailure {
    pub adapter: String,
    pub source: Source,
    pub error: AdapterError,
}

impl AdapterFailure {
    fn as_finding(&self) -> Finding {
        Finding::new(
            ADAPTER_FAILURE_ID,
            self.source,
            Severity::Critical,
            self.adapter.clone(),
            format!("required adapter `{}` failed: {}", self.adapter, self.error),
        )
    }
}

/// Evaluate findings from adapters that all completed.
pub fn evaluate(
    artifact: &ArtifactRef,
    findings: &[Finding],
    policy: &Policy,
    now: DateTime<Utc>,
) -> Verdict {
    evaluate_with_failures(artifact, findings, &[], policy, now)
}

/// Evaluate findings, failing closed for every required source whose adapter failed.
///
/// Output depends only on the arguments: same findings (in any order), policy and
/// `now` always yield the same verdict.
pub fn evaluate_with_failures(
    artifact: &ArtifactRef,
    findings: &[Finding],
    failures: &[AdapterFailure],
    policy: &Policy,
    now: DateTime<Utc>,
) -> Verdict {
    let synthetic = failures
        .iter()
        .filter(|failure| policy.is_required(failure.source))
        .map(AdapterFailure::as_finding);
    let unique = dedupe(findings.iter().cloned().chain(synthetic));

    let mut blocking = Vec::new();
    let mut waived = Vec::new();
    for finding in unique {
        if let Some(entry) = policy.waiver_for(&finding, now) {
            debug!(id = %finding.id, subject = %finding.subject, reason = ?entry.reason, "finding waived");
            waived.push(finding);
        } else if finding.severity >= policy.max_severity {
            blocking.push(finding);
        }
    }
    blocking.sort_by(report_order);
    waived.sort_by(report_order);

    Verdict {
        passed: blocking.is_empty(),
        blocking_findings: blocking,
        waived_findings: waived,
        timestamp: now,
        artifact_ref: artifact.clone(),
    }
}

/// Collapse findings sharing `(id, source, subject)`, keeping the first in report order.
pub fn dedupe(findings: impl IntoIterator<Item = Finding>) -> Vec<Finding> {
    let mut unique: BTreeMap<FindingKey, Finding> = BTreeMap::new();
    for finding in findings {
        match unique.entry(finding.key()) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(finding);
            }
            std::collections::btree_map::Entry::Occupied(mut slot) => {
                if report_order(&finding, slot.get()).is_lt() {
                    slot.insert(finding);
                }
            }
        }
    }
    unique.into_values().collect()
}
