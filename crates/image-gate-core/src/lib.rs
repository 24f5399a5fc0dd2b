pub mod adapter;
pub mod audit;
pub mod error;
pub mod finding;
pub mod gate;
pub mod policy;
pub mod report;
pub mod settings;

pub use adapter::{
    hadolint::HadolintAdapter, trivy::TrivyAdapter, AdapterError, AdapterErrorKind, AdapterRun,
    ScannerAdapter,
};
pub use audit::{write_report_files, AuditEntry, AuditLog};
pub use error::{ConfigError, GateError};
pub use finding::{ArtifactRef, Finding, FindingKey, FindingValidationError, Severity, Source};
pub use gate::{GateController, GateState, EXIT_ERRORED, EXIT_FAILED, EXIT_PASSED};
pub use policy::{
    evaluate, evaluate_with_failures, file::load_policy, AdapterFailure, AllowEntry, Policy,
    Verdict, ADAPTER_FAILURE_ID,
};
pub use report::{
    aggregate, render_report, AdapterResult, AdapterStatus, AdapterSummary, AggregateReport,
    GateReport, MergedFinding, OutputFormat,
};
pub use settings::{GateSettings, ToolSettings};
