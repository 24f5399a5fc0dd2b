use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::instrument;

use super::partial::{deserialize_partial, CollectSeq};
use super::process::ToolInvocation;
use super::{finish_run, AdapterRun, ScannerAdapter, DEFAULT_TIMEOUT};
use crate::finding::{ArtifactRef, Finding, Severity, Source};

const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// `<file>:<line> <code> <level>: <message>` as printed by `hadolint --format tty`.
static TTY_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<file>.+?):(?P<line>\d+) (?P<code>(?:DL|SC)\d+) (?P<level>error|warning|info|style): (?P<message>.*)$")
        .expect("tty line pattern is valid")
});

/// Dockerfile lint adapter for `hadolint`.
#[derive(Debug, Clone)]
pub struct HadolintAdapter {
    program: String,
    dockerfile: Option<PathBuf>,
    extra_args: Vec<String>,
    timeout: Duration,
    replay: Option<PathBuf>,
    raw_output: Option<PathBuf>,
}

impl Default for HadolintAdapter {
    fn default() -> Self {
        Self::new("hadolint")
    }
}

impl HadolintAdapter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            dockerfile: None,
            extra_args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            replay: None,
            raw_output: None,
        }
    }

    /// Dockerfile to lint. Without one, a path artifact is linted directly and an
    /// image artifact falls back to `./Dockerfile`.
    pub fn with_dockerfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.dockerfile = Some(path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_replay(mut self, path: impl Into<PathBuf>) -> Self {
        self.replay = Some(path.into());
        self
    }

    pub fn with_raw_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.raw_output = Some(path.into());
        self
    }

    fn target(&self, artifact: &ArtifactRef) -> PathBuf {
        if let Some(path) = &self.dockerfile {
            return path.clone();
        }
        if artifact.is_path() {
            return PathBuf::from(artifact.as_str());
        }
        PathBuf::from(DEFAULT_DOCKERFILE)
    }

    fn args_for(&self, target: &Path) -> Vec<String> {
        let mut args = vec!["--format".to_string(), "json".to_string()];
        args.extend(self.extra_args.iter().cloned());
        args.push(target.display().to_string());
        args
    }
}

#[async_trait]
impl ScannerAdapter for HadolintAdapter {
    fn name(&self) -> &str {
        "hadolint"
    }

    fn source(&self) -> Source {
        Source::LintChecker
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    #[instrument(name = "hadolint_adapter", skip(self), fields(artifact = %artifact))]
    async fn run(&self, artifact: &ArtifactRef) -> AdapterRun {
        let target = self.target(artifact);
        let raw = ToolInvocation {
            program: &self.program,
            args: self.args_for(&target),
            // Exit 1 means "violations found" and still carries a full report.
            accepted_status: &[0, 1],
            replay: self.replay.as_deref(),
            raw_output: self.raw_output.as_deref(),
        }
        .report()
        .await;
        if self.replay.is_some() {
            finish_run(&self.program, raw, parse_output)
        } else {
            finish_run(&self.program, raw, parse_json)
        }
    }
}

/// Parse a saved hadolint report in either `json` or `tty` format.
pub fn parse_output(raw: &str) -> (Vec<Finding>, Option<String>) {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        return parse_json(raw);
    }
    parse_tty(raw)
}

/// Parse `hadolint --format json` output, which must be a JSON array.
pub fn parse_json(raw: &str) -> (Vec<Finding>, Option<String>) {
    if !raw.trim_start().starts_with('[') {
        return (
            Vec::new(),
            Some("expected a JSON array of lint results".to_string()),
        );
    }
    let mut items = Vec::<HadolintItem>::new();
    let result = deserialize_partial(raw, CollectSeq::new(&mut items));
    let findings = items.into_iter().map(HadolintItem::into_finding).collect();
    (findings, result.err().map(|err| err.to_string()))
}

fn parse_tty(raw: &str) -> (Vec<Finding>, Option<String>) {
    let mut findings = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let Some(caps) = TTY_LINE.captures(line) else {
            return (
                findings,
                Some(format!("unrecognized output at line {}: {line}", idx + 1)),
            );
        };
        let item = HadolintItem {
            code: caps["code"].to_string(),
            file: caps["file"].to_string(),
            line: caps["line"].parse().unwrap_or(0),
            level: caps["level"].to_string(),
            message: caps["message"].to_string(),
        };
        findings.push(item.into_finding());
    }
    (findings, None)
}

#[derive(Debug, Deserialize)]
struct HadolintItem {
    code: String,
    file: String,
    line: u64,
    level: String,
    message: String,
}

impl HadolintItem {
    fn into_finding(self) -> Finding {
        let severity = match self.level.as_str() {
            "error" => Severity::High,
            "warning" => Severity::Medium,
            _ => Severity::Low,
        };
        let remediation = rule_reference(&self.code);
        let finding = Finding::new(
            self.code,
            Source::LintChecker,
            severity,
            format!("{}:{}", self.file, self.line),
            self.message,
        );
        match remediation {
            Some(link) => finding.with_remediation(link),
            None => finding,
        }
    }
}

fn rule_reference(code: &str) -> Option<String> {
    if code.starts_with("DL") {
        Some(format!("https://github.com/hadolint/hadolint/wiki/{code}"))
    } else if code.starts_with("SC") {
        Some(format!("https://www.shellcheck.net/wiki/{code}"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterError;

    const JSON_REPORT: &str = r#"[
  {"code":"DL3008","column":1,"file":"Dockerfile","level":"warning","line":7,"message":"Pin versions in apt get install."},
  {"code":"DL3002","column":1,"file":"Dockerfile","level":"error","line":12,"message":"Last USER should not be root"},
  {"code":"SC2086","column":1,"file":"Dockerfile","level":"info","line":9,"message":"Double quote to prevent globbing and word splitting."}
]"#;

    #[test]
    fn parses_json_levels_into_severities() {
        let (findings, err) = parse_output(JSON_REPORT);
        assert!(err.is_none());
        assert_eq!(findings.len(), 3);
        assert_eq!(findings[0].severity, Severity::Medium);
        assert_eq!(findings[0].subject, "Dockerfile:7");
        assert_eq!(findings[1].severity, Severity::High);
        assert_eq!(findings[2].severity, Severity::Low);
        assert_eq!(
            findings[2].remediation.as_deref(),
            Some("https://www.shellcheck.net/wiki/SC2086")
        );
    }

    #[test]
    fn parses_tty_format() {
        let raw = "Dockerfile:3 DL3007 warning: Using latest is prone to errors\n\
                   Dockerfile:10 DL3020 error: Use COPY instead of ADD for files and folders\n";
        let (findings, err) = parse_output(raw);
        assert!(err.is_none());
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[1].id, "DL3020");
        assert_eq!(findings[1].subject, "Dockerfile:10");
        assert_eq!(findings[1].severity, Severity::High);
    }

    #[test]
    fn empty_tty_output_means_clean() {
        let (findings, err) = parse_output("");
        assert!(findings.is_empty());
        assert!(err.is_none());
    }

    #[test]
    fn unrecognized_tty_line_keeps_earlier_findings() {
        let raw = "Dockerfile:3 DL3007 warning: Using latest\nhadolint: Dockerfile:5:1 unexpected 'R'\n";
        let (findings, err) = parse_output(raw);
        assert_eq!(findings.len(), 1);
        assert!(err.unwrap().contains("line 2"));
    }

    #[test]
    fn target_prefers_configured_dockerfile() {
        let image = ArtifactRef::parse("demo-api:1.0").unwrap();
        assert_eq!(
            HadolintAdapter::default().target(&image),
            PathBuf::from("Dockerfile")
        );
        let adapter = HadolintAdapter::default().with_dockerfile("build/Dockerfile.prod");
        let args = adapter.args_for(&adapter.target(&image));
        assert_eq!(args, vec!["--format", "json", "build/Dockerfile.prod"]);
    }

    #[tokio::test]
    async fn replayed_report_completes_without_error() {
        let temp = tempfile::tempdir().unwrap();
        let saved = temp.path().join("hadolint.json");
        std::fs::write(&saved, JSON_REPORT).unwrap();
        let adapter = HadolintAdapter::default().with_replay(&saved);
        let run = adapter
            .run(&ArtifactRef::parse("demo-api:1.0").unwrap())
            .await;
        assert!(run.is_success());
        assert_eq!(run.findings.len(), 3);
    }

    #[test]
    fn json_output_must_be_an_array() {
        let (findings, err) = parse_json("Dockerfile:3 DL3007 warning: Using latest\n");
        assert!(findings.is_empty());
        assert!(err.unwrap().contains("JSON array"));
        let (findings, err) = parse_json("[]");
        assert!(findings.is_empty());
        assert!(err.is_none());
    }

    #[cfg(unix)]
    fn fake_hadolint(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("hadolint");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_dockerfile_is_an_invocation_failure() {
        let temp = tempfile::tempdir().unwrap();
        let program = fake_hadolint(
            temp.path(),
            "echo 'hadolint: Dockerfile: openBinaryFile: does not exist (No such file or directory)' >&2\nexit 1",
        );
        let adapter = HadolintAdapter::new(program.to_str().unwrap());
        let run = adapter
            .run(&ArtifactRef::parse("demo-api:1.0").unwrap())
            .await;

        assert!(run.findings.is_empty());
        assert!(run.error.is_some());
        assert!(matches!(
            run.error,
            Some(AdapterError::InvocationFailed { status: Some(1), ref message, .. })
                if message.contains("does not exist")
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn live_tty_output_is_a_parse_error() {
        let temp = tempfile::tempdir().unwrap();
        let program = fake_hadolint(temp.path(), "echo 'Dockerfile:3 DL3007 warning: Using latest'");
        let run = HadolintAdapter::new(program.to_str().unwrap())
            .run(&ArtifactRef::parse("demo-api:1.0").unwrap())
            .await;
        assert!(matches!(run.error, Some(AdapterError::ParseError { parsed: 0, .. })));
    }

    #[tokio::test]
    async fn replayed_tty_report_is_accepted() {
        let temp = tempfile::tempdir().unwrap();
        let saved = temp.path().join("hadolint.txt");
        std::fs::write(&saved, "Dockerfile:3 DL3007 warning: Using latest\n").unwrap();
        let run = HadolintAdapter::default()
            .with_replay(&saved)
            .run(&ArtifactRef::parse("demo-api:1.0").unwrap())
            .await;
        assert!(run.is_success());
        assert_eq!(run.findings[0].id, "DL3007");
    }

    #[tokio::test]
    async fn missing_binary_is_tool_not_found() {
        let adapter = HadolintAdapter::new("image-gate-missing-hadolint");
        let run = adapter
            .run(&ArtifactRef::parse("demo-api:1.0").unwrap())
            .await;
        assert!(run.findings.is_empty());
        assert!(matches!(run.error, Some(AdapterError::ToolNotFound { .. })));
    }
}
