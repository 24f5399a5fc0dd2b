use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ConfigError;

/// Ordered severity scale shared by every adapter (`Low < Medium < High < Critical`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" | "MODERATE" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(format!(
                "unknown severity `{other}` (expected LOW|MEDIUM|HIGH|CRITICAL)"
            )),
        }
    }
}

impl TryFrom<String> for Severity {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Kind of checker that produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    VulnerabilityScanner,
    LintChecker,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::VulnerabilityScanner, Source::LintChecker];

    pub const fn as_str(self) -> &'static str {
        match self {
            Source::VulnerabilityScanner => "vulnerability-scanner",
            Source::LintChecker => "lint-checker",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized issue reported by one adapter. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Stable identifier such as a CVE number or lint rule code.
    pub id: String,
    pub source: Source,
    pub severity: Severity,
    /// Affected location: `package@version` or `file:line`.
    pub subject: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

/// Identity of a finding; re-emissions with the same key are the same finding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FindingKey {
    pub id: String,
    pub source: Source,
    pub subject: String,
}

impl Finding {
    pub fn new(
        id: impl Into<String>,
        source: Source,
        severity: Severity,
        subject: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            severity,
            subject: subject.into(),
            description: description.into(),
            remediation: None,
        }
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }

    pub fn key(&self) -> FindingKey {
        FindingKey {
            id: self.id.clone(),
            source: self.source,
            subject: self.subject.clone(),
        }
    }

    /// Reject findings an adapter should never emit.
    pub fn validate(&self) -> Result<(), FindingValidationError> {
        if self.id.trim().is_empty() {
            return Err(FindingValidationError::EmptyId {
                subject: self.subject.clone(),
            });
        }
        if self.subject.trim().is_empty() {
            return Err(FindingValidationError::EmptySubject {
                id: self.id.clone(),
            });
        }
        Ok(())
    }
}

/// Total order used for every finding list the gate emits:
/// severity descending, then id, subject and source ascending. The remaining
/// fields break ties, so only identical findings compare equal.
pub fn report_order(a: &Finding, b: &Finding) -> std::cmp::Ordering {
    b.severity
        .cmp(&a.severity)
        .then_with(|| a.id.cmp(&b.id))
        .then_with(|| a.subject.cmp(&b.subject))
        .then_with(|| a.source.cmp(&b.source))
        .then_with(|| a.description.cmp(&b.description))
        .then_with(|| a.remediation.cmp(&b.remediation))
}

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FindingValidationError {
    #[error("finding for subject `{subject}` has a blank id")]
    EmptyId { subject: String },
    #[error("finding `{id}` has a blank subject")]
    EmptySubject { id: String },
}

/// Reference to the artifact under inspection: an image name/tag/digest or a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::EmptyArtifact);
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidArtifact {
                artifact: trimmed.to_string(),
                reason: "must not contain whitespace".into(),
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the reference names an existing filesystem entry rather than an image.
    pub fn is_path(&self) -> bool {
        Path::new(&self.0).exists()
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn severity_parses_case_insensitively() {
        assert_eq!("critical".parse::<Severity>(), Ok(Severity::Critical));
        assert_eq!(" Moderate ".parse::<Severity>(), Ok(Severity::Medium));
        assert!("UNKNOWN".parse::<Severity>().is_err());
    }

    #[test]
    fn severity_round_trips_through_serde() {
        let value = serde_json::to_value(Severity::High).unwrap();
        assert_eq!(value, serde_json::json!("HIGH"));
        let parsed: Severity = serde_json::from_str("\"medium\"").unwrap();
        assert_eq!(parsed, Severity::Medium);
    }

    #[test]
    fn source_serializes_kebab_case() {
        let value = serde_json::to_value(Source::VulnerabilityScanner).unwrap();
        assert_eq!(value, serde_json::json!("vulnerability-scanner"));
    }

    #[test]
    fn validation_rejects_blank_subject() {
        let finding = Finding::new("DL3008", Source::LintChecker, Severity::Medium, " ", "pin");
        let err = finding.validate().expect_err("blank subject should be rejected");
        assert!(matches!(err, FindingValidationError::EmptySubject { id } if id == "DL3008"));
    }

    #[test]
    fn report_order_sorts_by_severity_then_id() {
        let mut findings = vec![
            Finding::new("CVE-B", Source::VulnerabilityScanner, Severity::High, "a@1", ""),
            Finding::new("CVE-C", Source::VulnerabilityScanner, Severity::Critical, "a@1", ""),
            Finding::new("CVE-A", Source::VulnerabilityScanner, Severity::High, "a@1", ""),
        ];
        findings.sort_by(report_order);
        let ids: Vec<_> = findings.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["CVE-C", "CVE-A", "CVE-B"]);
    }

    #[test]
    fn report_order_distinguishes_remediation() {
        let base = Finding::new("CVE-1", Source::VulnerabilityScanner, Severity::High, "openssl@3", "dh");
        let older = base.clone().with_remediation("upgrade openssl to 3.0.13");
        let newer = base.clone().with_remediation("upgrade openssl to 3.1.5");
        assert!(report_order(&older, &newer).is_lt());
        assert!(report_order(&base, &older).is_lt());
        assert!(report_order(&older, &older.clone()).is_eq());
    }

    #[test]
    fn artifact_ref_rejects_blank_input() {
        assert!(matches!(
            ArtifactRef::parse("   "),
            Err(ConfigError::EmptyArtifact)
        ));
        let artifact = ArtifactRef::parse(" app:1.0 ").unwrap();
        assert_eq!(artifact.as_str(), "app:1.0");
        assert!(!artifact.is_path());
    }
}
