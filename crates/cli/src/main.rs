use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use aemseed_core::{
    APP_NAME, ProgressSink, RunConfig, RunOptions, RunProgress, RunSummary, SeedServices,
    TokenSource, folder_counts, init_logging, new_run_id, preview_plan, run_seed, start_run_log,
    token_source_from_config,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Parser)]
#[command(name = "aemseed")]
#[command(about = "Generate synthetic images and seed them into an AEM DAM", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    events: bool,

    /// TOML settings layered under the environment.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Dotenv file to load instead of `./.env`.
    #[arg(long)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate assets and upload them.
    Run {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Print what a run would do without doing it.
    Plan {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Print the bearer token as a shell export line.
    Token,
}

#[derive(clap::Args, Default)]
struct Overrides {
    #[arg(long)]
    threads: Option<usize>,

    #[arg(long)]
    generations: Option<u64>,

    #[arg(long)]
    max_assets: Option<u64>,

    /// Replicate the customer folder structure in this file.
    #[arg(long)]
    structure: Option<PathBuf>,

    /// Synthesize only; skip the upload.
    #[arg(long)]
    no_upload: bool,

    /// Seed for names, tags and dates.
    #[arg(long)]
    seed: Option<u64>,
}

impl Overrides {
    fn apply(&self, config: &mut RunConfig) {
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(generations) = self.generations {
            config.generations = generations;
        }
        if let Some(max_assets) = self.max_assets {
            config.max_assets = Some(max_assets);
        }
        if let Some(file) = &self.structure {
            config.structure.enabled = true;
            config.structure.file = file.clone();
        }
        if self.no_upload {
            config.aem.enabled = false;
        }
    }
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

struct NdjsonProgressSink {
    run_id: String,
}

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, p: RunProgress) {
        let line = serde_json::json!({
            "type": "task.progress",
            "runId": self.run_id,
            "done": p.done,
            "total": p.total,
            "succeeded": p.succeeded,
            "failed": p.failed,
        });
        println!("{line}");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    load_dotenv(cli.env_file.as_ref())?;

    let mut config = RunConfig::load(cli.config.as_deref()).map_err(map_core_err)?;
    match &cli.cmd {
        Command::Run { overrides } | Command::Plan { overrides } => overrides.apply(&mut config),
        Command::Token => {}
    }
    config.validate().map_err(map_core_err)?;

    let _log_guard = match &config.logging.file {
        Some(path) => Some(
            start_run_log(path, &config.logging.level)
                .map_err(|e| CliError::new("log.open_failed", format!("{}: {e}", path.display())))?,
        ),
        None => {
            init_logging(&config.logging.level);
            None
        }
    };

    match cli.cmd {
        Command::Run { overrides } => {
            seed_run(&config, overrides.seed, cli.json, cli.events).await
        }
        Command::Plan { overrides } => plan_show(&config, overrides.seed, cli.json),
        Command::Token => token_check(&config, cli.json),
    }
}

fn load_dotenv(path: Option<&PathBuf>) -> Result<(), CliError> {
    match path {
        Some(path) => {
            dotenvy::from_path(path).map_err(|e| {
                CliError::new("config.read_failed", format!("{}: {e}", path.display()))
            })?;
        }
        None => {
            // A missing `.env` is normal.
            let _ = dotenvy::dotenv();
        }
    }
    Ok(())
}

async fn seed_run(
    config: &RunConfig,
    rng_seed: Option<u64>,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let services = SeedServices::from_config(config).map_err(map_core_err)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(event = "run.interrupt", "run.interrupt");
                cancel.cancel();
            }
        });
    }

    let run_id = new_run_id();
    if events {
        println!(
            "{}",
            serde_json::json!({
                "type": "run.state",
                "runId": run_id,
                "app": APP_NAME,
                "state": "running",
            })
        );
    }

    let progress: Option<Arc<dyn ProgressSink>> = if events {
        Some(Arc::new(NdjsonProgressSink {
            run_id: run_id.clone(),
        }))
    } else {
        None
    };
    let summary = run_seed(
        config,
        services,
        RunOptions {
            run_id: Some(run_id.clone()),
            cancel: Some(cancel),
            progress,
            plan_date: None,
            rng_seed,
        },
    )
    .await
    .map_err(map_core_err)?;

    let passed = summary.is_success(config.failure_tolerance);
    let state = if passed { "succeeded" } else { "failed" };
    if events {
        println!(
            "{}",
            serde_json::json!({
                "type": "run.state",
                "runId": run_id,
                "state": state,
                "summary": summary,
            })
        );
    } else if json {
        println!(
            "{}",
            serde_json::to_string(&summary)
                .map_err(|e| CliError::new("output.encode_failed", e.to_string()))?
        );
    } else {
        print_summary(&summary);
    }

    if passed {
        return Ok(());
    }
    let details = serde_json::json!({
        "runId": summary.run_id,
        "failed": summary.failed(),
        "interrupted": summary.interrupted,
        "notAttempted": summary.not_attempted,
        "tolerance": config.failure_tolerance,
    });
    Err(match summary.abort_reason {
        Some(reason) => CliError::new("run.aborted", reason).with_details(details),
        None => CliError::retryable(
            "run.failed",
            format!(
                "{} of {} uploads failed (tolerance {})",
                summary.failed(),
                summary.planned,
                config.failure_tolerance
            ),
        )
        .with_details(details),
    })
}

fn print_summary(summary: &RunSummary) {
    println!("runId={}", summary.run_id);
    println!(
        "planned={} succeeded={} retriedThenSucceeded={} failedPermanent={} failedRetriesExhausted={} interrupted={} notAttempted={} elapsedMs={}",
        summary.planned,
        summary.succeeded,
        summary.retried_then_succeeded,
        summary.failed_permanent,
        summary.failed_retries_exhausted,
        summary.interrupted,
        summary.not_attempted,
        summary.elapsed_ms,
    );
    for (folder, counts) in &summary.per_folder {
        println!(
            "folder={folder} planned={} succeeded={} failed={}",
            counts.planned, counts.succeeded, counts.failed
        );
    }
    for failure in &summary.failures {
        println!(
            "failed {}/{} status={:?} attempts={} error={}",
            failure.destination_folder,
            failure.file_name,
            failure.status,
            failure.attempts,
            failure.error.as_deref().unwrap_or("-"),
        );
    }
    if let Some(reason) = &summary.abort_reason {
        println!("aborted: {reason}");
    }
}

fn plan_show(config: &RunConfig, rng_seed: Option<u64>, json: bool) -> Result<(), CliError> {
    let tasks = preview_plan(config, None, rng_seed).map_err(map_core_err)?;
    let counts = folder_counts(&tasks);

    if json {
        println!(
            "{}",
            serde_json::json!({
                "total": tasks.len(),
                "folders": counts,
                "tasks": tasks,
            })
        );
    } else {
        println!("total={}", tasks.len());
        for (folder, count) in &counts {
            println!("folder={folder} assets={count}");
        }
    }
    Ok(())
}

fn token_check(config: &RunConfig, json: bool) -> Result<(), CliError> {
    let source = token_source_from_config(config);
    let (token, obtained_at) = source.current_token().map_err(map_core_err)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "token": token,
                "obtainedAt": obtained_at.to_rfc3339(),
            })
        );
    } else {
        println!("export AEM_TOKEN='{token}'");
    }
    Ok(())
}

fn map_core_err(e: aemseed_core::Error) -> CliError {
    match e {
        aemseed_core::Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        aemseed_core::Error::InvalidFolderSpec { message } => {
            CliError::new("structure.invalid", message)
        }
        aemseed_core::Error::Credential { message } => {
            CliError::new("credential.unavailable", message)
        }
        aemseed_core::Error::Http(e) => CliError::retryable("aem.unavailable", e.to_string()),
        aemseed_core::Error::Synthesis { message } => CliError::new("synthesis.failed", message),
        other => CliError::new("unknown", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_parse() {
        let cli = Cli::try_parse_from([
            "aemseed",
            "--json",
            "run",
            "--threads",
            "8",
            "--generations",
            "50",
            "--structure",
            "data/acme.csv",
        ])
        .unwrap();
        assert!(cli.json);
        let Command::Run { overrides } = cli.cmd else {
            panic!("expected run");
        };

        let mut config = RunConfig::default();
        overrides.apply(&mut config);
        assert_eq!(config.threads, 8);
        assert_eq!(config.generations, 50);
        assert!(config.structure.enabled);
        assert_eq!(config.structure.file, PathBuf::from("data/acme.csv"));
    }

    #[test]
    fn no_upload_disables_aem() {
        let mut config = RunConfig::default();
        config.aem.enabled = true;
        Overrides {
            no_upload: true,
            ..Default::default()
        }
        .apply(&mut config);
        assert!(!config.aem.enabled);
    }

    #[test]
    fn core_errors_map_to_stable_codes() {
        let err = map_core_err(aemseed_core::Error::Credential {
            message: "expired".to_string(),
        });
        assert_eq!(err.code, "credential.unavailable");
        assert!(!err.retryable);
    }
}
