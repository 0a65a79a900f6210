use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{AemHttpApi, AemHttpApiConfig, AssetApi};
use crate::config::RunConfig;
use crate::credential::{CredentialProvider, FileTokenSource, StaticTokenSource, TokenSource};
use crate::ledger::{RunLedger, RunSummary};
use crate::plan::{AssetShape, FolderSpec, PlanOptions, UploadTask, build_plan};
use crate::pool::{PoolContext, run_pool};
use crate::progress::ProgressSink;
use crate::structure::load_structure_file;
use crate::synth::{AssetSynthesizer, ImageSynthesizer};
use crate::upload::UploadClient;
use crate::{Error, Result};

/// The collaborators a run talks to. `api` and `token_source` are only used
/// when AEM upload is enabled.
pub struct SeedServices {
    pub api: Option<Arc<dyn AssetApi>>,
    pub token_source: Option<Arc<dyn TokenSource>>,
    pub synthesizer: Arc<dyn AssetSynthesizer>,
}

impl SeedServices {
    /// HTTP client, token source and image synthesizer built from `config`.
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let synthesizer: Arc<dyn AssetSynthesizer> = Arc::new(ImageSynthesizer::new(
            Some(config.paths.input_dir.as_path()),
            config.paths.output_dir.clone(),
        )?);

        if !config.aem.enabled {
            return Ok(Self {
                api: None,
                token_source: None,
                synthesizer,
            });
        }

        let api: Arc<dyn AssetApi> = Arc::new(AemHttpApi::new(AemHttpApiConfig {
            host: config.aem.host.clone(),
            request_timeout: Duration::from_secs(config.aem.request_timeout_secs),
        })?);
        let token_source = token_source_from_config(config);

        Ok(Self {
            api: Some(api),
            token_source: Some(token_source),
            synthesizer,
        })
    }
}

/// `AEM_TOKEN` when set, otherwise the token file.
pub fn token_source_from_config(config: &RunConfig) -> Arc<dyn TokenSource> {
    match &config.aem.token {
        Some(token) if !token.is_empty() => Arc::new(StaticTokenSource::new(token.clone())),
        _ => Arc::new(FileTokenSource::new(config.aem.token_file.clone())),
    }
}

#[derive(Default)]
pub struct RunOptions {
    /// Generated when absent.
    pub run_id: Option<String>,
    pub cancel: Option<CancellationToken>,
    pub progress: Option<Arc<dyn ProgressSink>>,
    /// Overrides today's date for the date partition and capture dates.
    pub plan_date: Option<NaiveDate>,
    /// Makes names, tags and dates reproducible.
    pub rng_seed: Option<u64>,
}

/// Folder specs for this run: the structure file when replication is
/// enabled, otherwise one folder at the destination root.
pub fn load_folder_specs(config: &RunConfig) -> Result<Vec<FolderSpec>> {
    if config.structure.enabled {
        return load_structure_file(&config.structure.file);
    }
    let count = i64::try_from(config.generations)
        .map_err(|_| Error::invalid_config("NUM_GENERATIONS is too large"))?;
    Ok(vec![FolderSpec::new(config.aem.destination.clone(), count)?])
}

pub fn build_run_plan(
    config: &RunConfig,
    plan_date: NaiveDate,
    rng: &mut impl Rng,
) -> Result<Vec<UploadTask>> {
    let specs = load_folder_specs(config)?;
    let options = PlanOptions {
        root: config.aem.destination.clone(),
        plan_date,
        date_partition: config.aem.put_into_date_folder,
        shape: AssetShape {
            width: config.image.width,
            height: config.image.height,
        },
        max_tasks: config.max_assets,
    };
    build_plan(&specs, &options, rng)
}

/// The plan a run with these options would execute, without running it.
pub fn preview_plan(
    config: &RunConfig,
    plan_date: Option<NaiveDate>,
    rng_seed: Option<u64>,
) -> Result<Vec<UploadTask>> {
    let plan_date = plan_date.unwrap_or_else(|| Local::now().date_naive());
    build_run_plan(config, plan_date, &mut plan_rng(rng_seed))
}

fn plan_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    }
}

pub fn new_run_id() -> String {
    format!("run_{}", uuid::Uuid::new_v4().simple())
}

/// Plans and executes one run, returning its summary.
///
/// Errors are reserved for setup problems (bad structure file, unusable
/// credentials). Task failures and aborts are reported in the summary.
pub async fn run_seed(
    config: &RunConfig,
    services: SeedServices,
    options: RunOptions,
) -> Result<RunSummary> {
    let started = Instant::now();
    let plan_date = options.plan_date.unwrap_or_else(|| Local::now().date_naive());
    let tasks = build_run_plan(config, plan_date, &mut plan_rng(options.rng_seed))?;

    // An empty plan never touches AEM, so it needs no credential.
    let client = if config.aem.enabled && !tasks.is_empty() {
        let api = services
            .api
            .ok_or_else(|| Error::invalid_config("AEM upload enabled without an API client"))?;
        let source = services
            .token_source
            .ok_or_else(|| Error::invalid_config("AEM upload enabled without a token source"))?;
        let credentials = Arc::new(CredentialProvider::new(source)?);
        Some(Arc::new(UploadClient::new(api, credentials, config.retry)))
    } else {
        None
    };

    let run_id = options.run_id.unwrap_or_else(new_run_id);
    let ledger = Arc::new(RunLedger::new(run_id.clone(), tasks.len() as u64));
    info!(
        event = "run.start",
        run_id = %run_id,
        planned = tasks.len(),
        threads = config.threads,
        aem_enabled = config.aem.enabled,
        structure = config.structure.enabled,
        plan_date = %plan_date,
        "run.start"
    );

    let outer = options.cancel.unwrap_or_default();
    let cancel = outer.child_token();
    let abort_reason = run_pool(
        tasks,
        config.threads,
        PoolContext {
            client,
            synthesizer: services.synthesizer,
            ledger: ledger.clone(),
            progress: options.progress,
            cancel,
        },
    )
    .await;
    let abort_reason = abort_reason.or_else(|| outer.is_cancelled().then(|| "cancelled".to_string()));

    let summary = ledger.finalize(started.elapsed(), abort_reason);
    info!(
        event = "run.finish",
        run_id = %summary.run_id,
        planned = summary.planned,
        succeeded = summary.succeeded,
        failed = summary.failed(),
        interrupted = summary.interrupted,
        not_attempted = summary.not_attempted,
        aborted = summary.aborted,
        elapsed_ms = summary.elapsed_ms,
        "run.finish"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_mode_plans_generations_under_destination() {
        let mut config = RunConfig::default();
        config.generations = 4;
        config.aem.put_into_date_folder = true;
        let date = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();

        let tasks = build_run_plan(&config, date, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(tasks.len(), 4);
        assert!(tasks.iter().all(|t| t.destination_folder == "/content/dam/images/2026/03"));
    }

    #[test]
    fn structure_mode_reads_the_file_and_honors_max_assets() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("structure.csv");
        std::fs::write(&file, "folder;asset_count\n/content/dam/images/a;3\n/content/dam/b;2\n").unwrap();

        let mut config = RunConfig::default();
        config.structure.enabled = true;
        config.structure.file = file;
        config.max_assets = Some(4);
        let date = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();

        let tasks = build_run_plan(&config, date, &mut StdRng::seed_from_u64(1)).unwrap();
        let folders: Vec<_> = tasks.iter().map(|t| t.destination_folder.as_str()).collect();
        assert_eq!(
            folders,
            vec![
                "/content/dam/images/a",
                "/content/dam/images/a",
                "/content/dam/images/a",
                "/content/dam/b",
            ]
        );
    }

    #[tokio::test]
    async fn empty_plan_needs_no_credential() {
        let mut config = RunConfig::default();
        config.generations = 0;
        config.aem.enabled = true;
        config.aem.token = None;
        config.aem.token_file = "/nonexistent/token.json".into();
        config.paths.output_dir = None;

        let services = SeedServices::from_config(&config).unwrap();
        let summary = run_seed(&config, services, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.planned, 0);
        assert_eq!(summary.total_attempts, 0);
        assert!(summary.is_success(0));
    }

    #[test]
    fn missing_structure_file_is_an_error() {
        let mut config = RunConfig::default();
        config.structure.enabled = true;
        config.structure.file = "/nonexistent/structure.csv".into();
        let date = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        assert!(build_run_plan(&config, date, &mut StdRng::seed_from_u64(1)).is_err());
    }
}
