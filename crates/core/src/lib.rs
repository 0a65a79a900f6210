mod api;
mod config;
mod credential;
mod error;
mod folders;
mod ledger;
mod plan;
mod pool;
mod progress;
mod retry;
mod run_log;
mod seed;
mod structure;
mod synth;
mod upload;

pub const APP_NAME: &str = "aemseed";

pub use api::{
    AemHttpApi, AemHttpApiConfig, ApiError, ApiErrorKind, ApiFuture, AssetApi, CompleteUpload,
    UploadSession, classify_status, plan_parts,
};
pub use config::{
    AemConfig, DAM_ROOT, ImageConfig, LoggingConfig, PathsConfig, RunConfig, StructureConfig,
};
pub use credential::{
    Credential, CredentialProvider, FileTokenSource, StaticTokenSource, TokenSource,
};
pub use error::{Error, Result};
pub use folders::{FolderRegistry, folder_chain};
pub use ledger::{FolderSummary, RunLedger, RunSummary, UploadOutcome, UploadStatus};
pub use plan::{
    AssetMetadata, AssetShape, DateRoot, FolderSpec, PlanOptions, UploadTask, build_plan,
    folder_counts, normalize_file_stem, resolve_destination,
};
pub use pool::{PoolContext, run_pool};
pub use progress::{ProgressSink, RunProgress};
pub use retry::RetryPolicy;
pub use run_log::{RunLogGuard, init_logging, level_directive, start_run_log};
pub use seed::{
    RunOptions, SeedServices, build_run_plan, load_folder_specs, new_run_id, preview_plan,
    run_seed, token_source_from_config,
};
pub use structure::{load_structure_file, parse_structure};
pub use synth::{AssetSynthesizer, ImageSynthesizer};
pub use upload::{JPEG_MIME_TYPE, Step, StepFailure, TaskState, UploadClient};
