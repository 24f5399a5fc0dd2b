use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::adapter::{AdapterError, AdapterRun, ScannerAdapter};
use crate::error::{ConfigError, GateError};
use crate::finding::{ArtifactRef, Finding};
use crate::policy::{evaluate_with_failures, AdapterFailure, Policy};
use crate::report::{aggregate, AdapterResult, GateReport, REPORT_SCHEMA_VERSION};

/// Exit code for a passing artifact.
pub const EXIT_PASSED: u8 = 0;
/// Exit code for an artifact rejected by policy.
pub const EXIT_FAILED: u8 = 1;
/// Exit code when the gate itself could not reach a verdict.
pub const EXIT_ERRORED: u8 = 2;

/// Lifecycle of a gate run: `Pending → Running → {Passed, Failed, Errored}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateState {
    Pending,
    Running,
    Passed,
    Failed,
    Errored,
}

impl GateState {
    pub const fn label(self) -> &'static str {
        match self {
            GateState::Pending => "PENDING",
            GateState::Running => "RUNNING",
            GateState::Passed => "PASSED",
            GateState::Failed => "FAILED",
            GateState::Errored => "ERRORED",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, GateState::Passed | GateState::Failed | GateState::Errored)
    }

    /// Process exit code handed to CI. Non-terminal states count as infrastructure errors.
    pub const fn exit_code(self) -> i32 {
        match self {
            GateState::Passed => EXIT_PASSED as i32,
            GateState::Failed => EXIT_FAILED as i32,
            GateState::Pending | GateState::Running | GateState::Errored => EXIT_ERRORED as i32,
        }
    }
}

/// Runs every adapter against one artifact and turns the results into a report.
pub struct GateController {
    adapters: Vec<Arc<dyn ScannerAdapter>>,
    policy: Policy,
    cancel_on_failure: bool,
    state: GateState,
}

impl GateController {
    /// Validate the setup before anything runs: the policy must be well formed and
    /// every required source needs at least one adapter.
    pub fn new(adapters: Vec<Arc<dyn ScannerAdapter>>, policy: Policy) -> Result<Self, ConfigError> {
        policy.validate()?;
        if adapters.is_empty() {
            return Err(ConfigError::NoAdapters);
        }
        for source in &policy.required_sources {
            if !adapters.iter().any(|adapter| adapter.source() == *source) {
                return Err(ConfigError::MissingRequiredSource(*source));
            }
        }
        Ok(Self {
            adapters,
            policy,
            cancel_on_failure: true,
            state: GateState::Pending,
        })
    }

    /// When set (the default), a required adapter that cannot run cancels the others.
    pub fn with_cancel_on_failure(mut self, cancel: bool) -> Self {
        self.cancel_on_failure = cancel;
        self
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    fn transition(&mut self, next: GateState) {
        debug!(from = self.state.label(), to = next.label(), "gate state change");
        self.state = next;
    }

    /// Run the gate once. `now` is the instant used for waiver expiry and timestamps.
    #[instrument(name = "gate_run", skip(self, now), fields(artifact = %artifact))]
    pub async fn run(
        &mut self,
        artifact: &ArtifactRef,
        now: DateTime<Utc>,
    ) -> Result<GateReport, GateError> {
        if self.state != GateState::Pending {
            return Err(GateError::AlreadyStarted(self.state.label()));
        }
        self.transition(GateState::Running);
        let runs = self.dispatch(artifact).await;
        let report = self.conclude(artifact, runs, now);
        self.transition(report.state);
        info!(state = report.state.label(), reason = %report.reason, "gate finished");
        Ok(report)
    }

    /// Run all adapters concurrently. Slot `i` holds adapter `i`'s run, or `None`
    /// when it was cancelled.
    async fn dispatch(&self, artifact: &ArtifactRef) -> Vec<Option<AdapterRun>> {
        let mut tasks = JoinSet::new();
        for (index, adapter) in self.adapters.iter().enumerate() {
            let adapter = Arc::clone(adapter);
            let artifact = artifact.clone();
            tasks.spawn(async move {
                let budget = adapter.timeout();
                let run = match tokio::time::timeout(budget, adapter.run(&artifact)).await {
                    Ok(run) => run,
                    Err(_) => AdapterRun::failed(AdapterError::Timeout {
                        program: adapter.name().to_string(),
                        timeout: budget,
                    }),
                };
                (index, run)
            });
        }

        let mut runs: Vec<Option<AdapterRun>> = vec![None; self.adapters.len()];
        let mut aborted = false;
        while let Some(joined) = tasks.join_next().await {
            let (index, run) = match joined {
                Ok(done) => done,
                Err(err) if err.is_cancelled() => continue,
                Err(err) => {
                    error!(error = %err, "adapter task panicked");
                    continue;
                }
            };
            let adapter = &self.adapters[index];
            let required = self.policy.is_required(adapter.source());
            match &run.error {
                None => debug!(adapter = adapter.name(), findings = run.findings.len(), "adapter completed"),
                Some(err) if required => warn!(adapter = adapter.name(), error = %err, "required adapter failed"),
                Some(err) => warn!(adapter = adapter.name(), error = %err, "optional adapter failed; skipping its source"),
            }
            let fatal = required
                && run
                    .error
                    .as_ref()
                    .is_some_and(AdapterError::is_infrastructure);
            runs[index] = Some(run);
            if fatal && self.cancel_on_failure && !aborted {
                warn!(adapter = adapter.name(), "cancelling remaining adapters");
                tasks.abort_all();
                aborted = true;
            }
        }

        if !aborted {
            // Without an abort, an empty slot means the task panicked.
            for (slot, adapter) in runs.iter_mut().zip(&self.adapters) {
                if slot.is_none() {
                    *slot = Some(AdapterRun::failed(AdapterError::InvocationFailed {
                        program: adapter.name().to_string(),
                        status: None,
                        message: "adapter task panicked".into(),
                    }));
                }
            }
        }
        runs
    }

    fn conclude(
        &self,
        artifact: &ArtifactRef,
        runs: Vec<Option<AdapterRun>>,
        now: DateTime<Utc>,
    ) -> GateReport {
        let results: Vec<AdapterResult> = self
            .adapters
            .iter()
            .zip(runs)
            .map(|(adapter, run)| AdapterResult {
                name: adapter.name().to_string(),
                source: adapter.source(),
                required: self.policy.is_required(adapter.source()),
                run,
            })
            .collect();
        let summary = aggregate(&results);

        let mut infrastructure: Vec<(&str, &AdapterError)> = results
            .iter()
            .filter(|result| result.required)
            .filter_map(|result| {
                let err = result.run.as_ref()?.error.as_ref()?;
                err.is_infrastructure().then_some((result.name.as_str(), err))
            })
            .collect();
        infrastructure.sort_by(|a, b| a.0.cmp(b.0));

        let (state, reason, verdict) = if let Some((name, err)) = infrastructure.first() {
            (
                GateState::Errored,
                format!("required adapter `{name}` could not run: {err}"),
                None,
            )
        } else {
            let mut findings: Vec<Finding> = Vec::new();
            let mut failures = Vec::new();
            for result in &results {
                let Some(run) = &result.run else { continue };
                match &run.error {
                    None => findings.extend(run.findings.iter().cloned()),
                    Some(err) if result.required => {
                        findings.extend(run.findings.iter().cloned());
                        failures.push(AdapterFailure {
                            adapter: result.name.clone(),
                            source: result.source,
                            error: err.clone(),
                        });
                    }
                    Some(_) => {}
                }
            }
            let verdict = evaluate_with_failures(artifact, &findings, &failures, &self.policy, now);
            let threshold = self.policy.max_severity;
            let (state, reason) = if verdict.passed {
                (
                    GateState::Passed,
                    format!(
                        "no active finding at or above {threshold} ({} waived)",
                        verdict.waived_findings.len()
                    ),
                )
            } else {
                (
                    GateState::Failed,
                    format!(
                        "{} blocking finding(s) at or above {threshold}",
                        verdict.blocking_findings.len()
                    ),
                )
            };
            (state, reason, Some(verdict))
        };

        GateReport {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            artifact_ref: artifact.clone(),
            generated_at: now,
            state,
            reason,
            threshold: self.policy.max_severity,
            adapters: summary.adapters,
            findings: summary.findings,
            verdict,
            notes: summary.notes,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::finding::{Severity, Source};
    use crate::policy::{AllowEntry, ADAPTER_FAILURE_ID};
    use crate::report::AdapterStatus;

    struct FakeAdapter {
        name: &'static str,
        source: Source,
        delay: Duration,
        timeout: Duration,
        run: AdapterRun,
    }

    impl FakeAdapter {
        fn new(name: &'static str, source: Source, findings: Vec<Finding>) -> Self {
            Self {
                name,
                source,
                delay: Duration::ZERO,
                timeout: Duration::from_secs(30),
                run: AdapterRun::completed(findings),
            }
        }

        fn failing(name: &'static str, source: Source, run: AdapterRun) -> Self {
            Self {
                run,
                ..Self::new(name, source, Vec::new())
            }
        }

        fn delayed(mut self, delay: Duration, timeout: Duration) -> Self {
            self.delay = delay;
            self.timeout = timeout;
            self
        }

        fn shared(self) -> Arc<dyn ScannerAdapter> {
            Arc::new(self)
        }
    }

    #[async_trait]
    impl ScannerAdapter for FakeAdapter {
        fn name(&self) -> &str {
            self.name
        }

        fn source(&self) -> Source {
            self.source
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        async fn run(&self, _artifact: &ArtifactRef) -> AdapterRun {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.run.clone()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn artifact() -> ArtifactRef {
        ArtifactRef::parse("demo-api:1.0").unwrap()
    }

    fn cve(id: &str, severity: Severity) -> Finding {
        Finding::new(id, Source::VulnerabilityScanner, severity, "openssl@3.0.11", "openssl issue")
    }

    fn lint(id: &str) -> Finding {
        Finding::new(id, Source::LintChecker, Severity::Medium, "Dockerfile:7", "pin versions")
    }

    fn controller(adapters: Vec<Arc<dyn ScannerAdapter>>, policy: Policy) -> GateController {
        GateController::new(adapters, policy).expect("valid gate setup")
    }

    #[tokio::test]
    async fn clean_artifact_passes() {
        let mut gate = controller(
            vec![
                FakeAdapter::new("trivy", Source::VulnerabilityScanner, vec![cve("CVE-2", Severity::Low)]).shared(),
                FakeAdapter::new("hadolint", Source::LintChecker, vec![lint("DL3008")]).shared(),
            ],
            Policy::default(),
        );
        assert_eq!(gate.state(), GateState::Pending);
        let report = gate.run(&artifact(), now()).await.unwrap();
        assert_eq!(gate.state(), GateState::Passed);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.findings.len(), 2);
        assert!(report.verdict.unwrap().passed);
    }

    #[tokio::test]
    async fn critical_vulnerability_fails() {
        let mut gate = controller(
            vec![
                FakeAdapter::new(
                    "trivy",
                    Source::VulnerabilityScanner,
                    vec![cve("CVE-1", Severity::Critical), cve("CVE-2", Severity::Low)],
                )
                .shared(),
                FakeAdapter::new("hadolint", Source::LintChecker, Vec::new()).shared(),
            ],
            Policy::default(),
        );
        let report = gate.run(&artifact(), now()).await.unwrap();
        assert_eq!(report.state, GateState::Failed);
        assert_eq!(report.exit_code(), 1);
        let verdict = report.verdict.unwrap();
        let ids: Vec<_> = verdict.blocking_findings.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["CVE-1"]);
        assert!(report.reason.contains("1 blocking finding(s) at or above HIGH"));
    }

    #[tokio::test]
    async fn waived_critical_passes() {
        let policy = Policy {
            allow_list: vec![AllowEntry {
                id: "CVE-1".into(),
                subject: "openssl@3.0.11".into(),
                expiry: Some(now() + chrono::Duration::days(7)),
                reason: None,
            }],
            ..Policy::default()
        };
        let mut gate = controller(
            vec![
                FakeAdapter::new("trivy", Source::VulnerabilityScanner, vec![cve("CVE-1", Severity::Critical)]).shared(),
                FakeAdapter::new("hadolint", Source::LintChecker, Vec::new()).shared(),
            ],
            policy,
        );
        let report = gate.run(&artifact(), now()).await.unwrap();
        assert_eq!(report.state, GateState::Passed);
        assert_eq!(report.verdict.unwrap().waived_findings[0].id, "CVE-1");
    }

    #[tokio::test]
    async fn required_timeout_errors_and_cancels_others() {
        let mut gate = controller(
            vec![
                FakeAdapter::new("trivy", Source::VulnerabilityScanner, Vec::new())
                    .delayed(Duration::from_secs(30), Duration::from_millis(20))
                    .shared(),
                FakeAdapter::new("hadolint", Source::LintChecker, Vec::new())
                    .delayed(Duration::from_secs(30), Duration::from_secs(60))
                    .shared(),
            ],
            Policy::default(),
        );
        let report = tokio::time::timeout(Duration::from_secs(10), gate.run(&artifact(), now()))
            .await
            .expect("gate should not wait for cancelled adapters")
            .unwrap();
        assert_eq!(gate.state(), GateState::Errored);
        assert_eq!(report.exit_code(), 2);
        assert!(report.verdict.is_none());
        assert!(report.reason.contains("`trivy` could not run"));
        let hadolint = report.adapters.iter().find(|a| a.name == "hadolint").unwrap();
        assert_eq!(hadolint.status, AdapterStatus::Cancelled);
        let trivy = report.adapters.iter().find(|a| a.name == "trivy").unwrap();
        assert!(matches!(
            &trivy.status,
            AdapterStatus::Failed { error: AdapterError::Timeout { .. }, .. }
        ));
    }

    #[tokio::test]
    async fn without_cancellation_other_adapters_finish() {
        let mut gate = controller(
            vec![
                FakeAdapter::failing(
                    "trivy",
                    Source::VulnerabilityScanner,
                    AdapterRun::failed(AdapterError::ToolNotFound { program: "trivy".into() }),
                )
                .shared(),
                FakeAdapter::new("hadolint", Source::LintChecker, vec![lint("DL3008")])
                    .delayed(Duration::from_millis(50), Duration::from_secs(5))
                    .shared(),
            ],
            Policy::default(),
        )
        .with_cancel_on_failure(false);
        let report = gate.run(&artifact(), now()).await.unwrap();
        assert_eq!(report.state, GateState::Errored);
        let hadolint = report.adapters.iter().find(|a| a.name == "hadolint").unwrap();
        assert_eq!(hadolint.status, AdapterStatus::Completed { findings: 1 });
    }

    #[tokio::test]
    async fn required_parse_error_fails_closed_with_partial_findings() {
        let partial = AdapterRun::partial(
            vec![cve("CVE-5", Severity::Medium)],
            AdapterError::ParseError {
                program: "trivy".into(),
                parsed: 1,
                message: "EOF while parsing a string".into(),
            },
        );
        let mut gate = controller(
            vec![
                FakeAdapter::failing("trivy", Source::VulnerabilityScanner, partial).shared(),
                FakeAdapter::new("hadolint", Source::LintChecker, Vec::new()).shared(),
            ],
            Policy::default(),
        );
        let report = gate.run(&artifact(), now()).await.unwrap();
        assert_eq!(report.state, GateState::Failed);
        let verdict = report.verdict.unwrap();
        assert_eq!(verdict.blocking_findings[0].id, ADAPTER_FAILURE_ID);
        assert!(report.findings.iter().any(|f| f.id == "CVE-5"));
    }

    #[tokio::test]
    async fn optional_adapter_failure_degrades_gracefully() {
        let policy = Policy {
            required_sources: [Source::VulnerabilityScanner].into_iter().collect(),
            ..Policy::default()
        };
        let mut gate = controller(
            vec![
                FakeAdapter::new("trivy", Source::VulnerabilityScanner, Vec::new()).shared(),
                FakeAdapter::failing(
                    "hadolint",
                    Source::LintChecker,
                    AdapterRun::failed(AdapterError::Timeout {
                        program: "hadolint".into(),
                        timeout: Duration::from_secs(300),
                    }),
                )
                .shared(),
            ],
            policy,
        );
        let report = gate.run(&artifact(), now()).await.unwrap();
        assert_eq!(report.state, GateState::Passed);
        assert_eq!(report.notes.len(), 1);
        assert!(report.notes[0].contains("hadolint"));
    }

    #[tokio::test]
    async fn completion_order_does_not_change_report() {
        async fn run_with(trivy_delay: u64, lint_delay: u64) -> GateReport {
            let mut gate = controller(
                vec![
                    FakeAdapter::new("trivy", Source::VulnerabilityScanner, vec![cve("CVE-1", Severity::High)])
                        .delayed(Duration::from_millis(trivy_delay), Duration::from_secs(5))
                        .shared(),
                    FakeAdapter::new("hadolint", Source::LintChecker, vec![lint("DL3008"), lint("DL3002")])
                        .delayed(Duration::from_millis(lint_delay), Duration::from_secs(5))
                        .shared(),
                ],
                Policy::default(),
            );
            gate.run(&artifact(), now()).await.unwrap()
        }
        assert_eq!(run_with(1, 40).await, run_with(40, 1).await);
    }

    #[tokio::test]
    async fn gate_runs_only_once() {
        let mut gate = controller(
            vec![
                FakeAdapter::new("trivy", Source::VulnerabilityScanner, Vec::new()).shared(),
                FakeAdapter::new("hadolint", Source::LintChecker, Vec::new()).shared(),
            ],
            Policy::default(),
        );
        gate.run(&artifact(), now()).await.unwrap();
        let err = gate.run(&artifact(), now()).await.unwrap_err();
        assert_eq!(err, GateError::AlreadyStarted("PASSED"));
    }

    #[tokio::test]
    async fn independent_gates_do_not_interfere() {
        let mut gates: Vec<_> = (0..3)
            .map(|i| {
                let severity = if i == 1 { Severity::Critical } else { Severity::Low };
                controller(
                    vec![
                        FakeAdapter::new("trivy", Source::VulnerabilityScanner, vec![cve("CVE-1", severity)])
                            .delayed(Duration::from_millis(10), Duration::from_secs(5))
                            .shared(),
                        FakeAdapter::new("hadolint", Source::LintChecker, Vec::new()).shared(),
                    ],
                    Policy::default(),
                )
            })
            .collect();
        let artifact = artifact();
        let reports =
            futures::future::join_all(gates.iter_mut().map(|gate| gate.run(&artifact, now()))).await;
        let states: Vec<_> = reports.into_iter().map(|r| r.unwrap().state).collect();
        assert_eq!(states, vec![GateState::Passed, GateState::Failed, GateState::Passed]);
    }

    #[test]
    fn missing_required_source_is_a_config_error() {
        let result = GateController::new(
            vec![FakeAdapter::new("trivy", Source::VulnerabilityScanner, Vec::new()).shared()],
            Policy::default(),
        );
        assert!(matches!(
            result,
            Err(ConfigError::MissingRequiredSource(Source::LintChecker))
        ));
        assert!(matches!(
            GateController::new(Vec::new(), Policy::default()),
            Err(ConfigError::NoAdapters)
        ));
    }

    #[test]
    fn exit_codes_follow_ci_contract() {
        assert_eq!(GateState::Passed.exit_code(), 0);
        assert_eq!(GateState::Failed.exit_code(), 1);
        assert_eq!(GateState::Errored.exit_code(), 2);
        assert!(!GateState::Running.is_terminal());
    }
}
