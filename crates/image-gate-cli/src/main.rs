use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use image_gate_core::{
    load_policy, render_report, write_report_files, ArtifactRef, AuditLog, GateController,
    GateSettings, GateState, OutputFormat, EXIT_ERRORED, EXIT_FAILED, EXIT_PASSED,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "image-gate",
    author,
    version,
    about = "Policy-driven security gate for container images"
)]
struct Cli {
    /// Gate settings file (TOML, YAML or JSON)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Directory for raw tool output, reports and the audit log
    #[arg(long = "output-dir", value_name = "DIR", global = true)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan an artifact and decide whether it may be published
    Run(RunArgs),
    /// Validate a policy file and list its waivers
    CheckPolicy {
        /// Policy file (YAML or JSON)
        policy: PathBuf,
        /// Exit 1 when any waiver has expired
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Image reference (name:tag, name@digest) or filesystem path
    artifact: String,

    /// Dockerfile to lint
    #[arg(long, value_name = "FILE")]
    dockerfile: Option<PathBuf>,

    /// Policy file (YAML or JSON); defaults to failing on HIGH
    #[arg(long, value_name = "FILE")]
    policy: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = FormatArg::Human)]
    format: FormatArg,

    /// Per-adapter time budget, e.g. `90s` or `5m`
    #[arg(long, value_name = "DURATION")]
    timeout: Option<humantime::Duration>,

    /// Replay a saved `trivy --format json` report instead of running trivy
    #[arg(long, value_name = "FILE")]
    trivy_report: Option<PathBuf>,

    /// Replay a saved hadolint report (`json` or `tty` format) instead of running hadolint
    #[arg(long, value_name = "FILE")]
    hadolint_report: Option<PathBuf>,

    #[arg(long)]
    skip_trivy: bool,

    #[arg(long)]
    skip_hadolint: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    Human,
    Json,
    Markdown,
}

impl From<FormatArg> for OutputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Human => OutputFormat::Human,
            FormatArg::Json => OutputFormat::Json,
            FormatArg::Markdown => OutputFormat::Markdown,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let result = match &cli.command {
        Commands::Run(args) => run_gate(&cli, args).await,
        Commands::CheckPolicy { policy, strict } => check_policy(policy, *strict),
    };
    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::from(EXIT_ERRORED)
        }
    }
}

fn load_settings(cli: &Cli, args: &RunArgs) -> Result<GateSettings> {
    let mut settings = GateSettings::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.output_dir {
        settings.output_dir = dir.clone();
    }
    if let Some(policy) = &args.policy {
        settings.policy = Some(policy.clone());
    }
    if let Some(dockerfile) = &args.dockerfile {
        settings.dockerfile = Some(dockerfile.clone());
    }
    if let Some(timeout) = args.timeout.as_deref() {
        settings.trivy.timeout = *timeout;
        settings.hadolint.timeout = *timeout;
    }
    if let Some(report) = &args.trivy_report {
        settings.trivy.report = Some(report.clone());
    }
    if let Some(report) = &args.hadolint_report {
        settings.hadolint.report = Some(report.clone());
    }
    if args.skip_trivy {
        settings.trivy.enabled = false;
    }
    if args.skip_hadolint {
        settings.hadolint.enabled = false;
    }
    Ok(settings)
}

async fn run_gate(cli: &Cli, args: &RunArgs) -> Result<u8> {
    let settings = load_settings(cli, args)?;
    let artifact = ArtifactRef::parse(&args.artifact)?;
    let policy = settings.resolve_policy()?;
    let mut gate = GateController::new(settings.adapters(), policy)?
        .with_cancel_on_failure(settings.cancel_on_failure);

    info!(artifact = %artifact, output_dir = %settings.output_dir.display(), "starting gate");
    let report = gate.run(&artifact, Utc::now()).await?;

    let rendered = render_report(&report, args.format.into())?;
    {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&rendered)?;
        stdout.flush()?;
    }
    eprintln!(
        "{} {} ({})",
        status_label(report.state),
        artifact,
        settings.output_dir.display()
    );

    // The decision is already on stdout; an unrecorded decision still errors the run.
    write_report_files(&report, &settings.output_dir).await?;
    AuditLog::new(settings.audit_log_path())
        .append(&report)
        .await
        .context("failed to record gate decision")?;

    Ok(u8::try_from(report.exit_code()).unwrap_or(EXIT_ERRORED))
}

fn check_policy(path: &Path, strict: bool) -> Result<u8> {
    let policy = load_policy(path)?;
    let now = Utc::now();
    let required: Vec<_> = policy
        .required_sources
        .iter()
        .map(|source| source.as_str())
        .collect();
    println!("Policy {} is valid", path.display());
    println!("  fails on: {} and above", policy.max_severity);
    println!("  required sources: {}", required.join(", "));
    println!("  {} waiver(s)", policy.allow_list.len());

    let mut expired = 0;
    for entry in &policy.allow_list {
        let expiry = entry
            .expiry
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        let status = if entry.is_active(now) {
            "active".green()
        } else {
            expired += 1;
            "expired".yellow()
        };
        println!(
            "  - {id:<20} {subject:<32} expires {expiry} [{status}]{reason}",
            id = entry.id,
            subject = entry.subject,
            reason = entry
                .reason
                .as_deref()
                .map(|r| format!(" :: {r}"))
                .unwrap_or_default(),
        );
    }
    if expired > 0 {
        warn!(expired, "policy contains expired waivers");
        if strict {
            return Ok(EXIT_FAILED);
        }
    }
    Ok(EXIT_PASSED)
}

fn status_label(state: GateState) -> colored::ColoredString {
    match state {
        GateState::Passed => state.label().green().bold(),
        GateState::Failed => state.label().red().bold(),
        _ => state.label().yellow().bold(),
    }
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tokio=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
