use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ApiErrorKind, AssetApi, CompleteUpload, plan_parts};
use crate::credential::{Credential, CredentialProvider};
use crate::folders::{FolderRegistry, folder_chain};
use crate::plan::UploadTask;
use crate::retry::RetryPolicy;
use crate::Error;

pub const JPEG_MIME_TYPE: &str = "image/jpeg";

/// Where a task failed. The protocol steps run in declaration order after
/// the payload has been synthesized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Synthesize,
    EnsureFolder,
    Initiate,
    Transfer,
    Complete,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Synthesize => "synthesize",
            Step::EnsureFolder => "ensure_folder",
            Step::Initiate => "initiate",
            Step::Transfer => "transfer",
            Step::Complete => "complete",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: Step,
    pub error: ApiError,
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

/// Per-task retry state machine.
///
/// `Attempting` runs one full pass over the protocol steps. Credential
/// refreshes happen inside a step and never move the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Attempting {
        attempt: u32,
    },
    BackoffWait {
        attempt: u32,
        delay: Duration,
        failure: StepFailure,
    },
    Succeeded {
        attempts: u32,
    },
    FailedPermanent {
        attempts: u32,
        failure: StepFailure,
    },
    FailedRetriesExhausted {
        attempts: u32,
        failure: StepFailure,
    },
    /// Stopped by cancellation between steps or during backoff.
    Interrupted {
        attempts: u32,
        reason: String,
    },
    /// The credential provider failed; the whole run must stop.
    Aborted {
        attempts: u32,
        message: String,
    },
}

#[derive(Debug)]
enum AttemptError {
    Api(StepFailure),
    Cancelled(Step),
    Credential(String),
}

impl AttemptError {
    fn api(step: Step, error: ApiError) -> Self {
        Self::Api(StepFailure { step, error })
    }

    fn credential(e: Error) -> Self {
        match e {
            Error::Credential { message } => Self::Credential(message),
            other => Self::Credential(other.to_string()),
        }
    }
}

/// Runs the folder / initiate / transfer / complete protocol for one task
/// with bounded retries. Shared by every worker.
pub struct UploadClient {
    api: Arc<dyn AssetApi>,
    credentials: Arc<CredentialProvider>,
    folders: FolderRegistry,
    policy: RetryPolicy,
}

impl UploadClient {
    pub fn new(
        api: Arc<dyn AssetApi>,
        credentials: Arc<CredentialProvider>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            api,
            credentials,
            folders: FolderRegistry::new(),
            policy,
        }
    }

    /// Drives `task` to a terminal state. `task.attempt_count` tracks the
    /// attempt in progress.
    ///
    /// Cancellation is honoured between steps and during backoff. Once bytes
    /// have started moving the attempt runs through `complete`, so the server
    /// is never left with a transferred but unfinished binary by our choice.
    /// That holds for a run abort too: transfer and complete keep using the
    /// token the transfer started with if the provider has since failed.
    pub async fn upload(
        &self,
        task: &mut UploadTask,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> TaskState {
        let mut state = TaskState::Pending;
        loop {
            state = match state {
                TaskState::Pending => TaskState::Attempting { attempt: 1 },
                TaskState::Attempting { attempt } => {
                    task.attempt_count = attempt;
                    self.run_attempt(task, payload, attempt, cancel).await
                }
                TaskState::BackoffWait {
                    attempt,
                    delay,
                    failure,
                } => {
                    warn!(
                        event = "task.retry",
                        file = %task.file_name,
                        folder = %task.destination_folder,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "task.retry"
                    );
                    if cancel.is_cancelled() {
                        TaskState::Interrupted {
                            attempts: attempt,
                            reason: format!("cancelled during backoff after {failure}"),
                        }
                    } else {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => TaskState::Interrupted {
                                attempts: attempt,
                                reason: format!("cancelled during backoff after {failure}"),
                            },
                            _ = tokio::time::sleep(delay) => TaskState::Attempting { attempt: attempt + 1 },
                        }
                    }
                }
                terminal => return terminal,
            };
        }
    }

    async fn run_attempt(
        &self,
        task: &UploadTask,
        payload: &[u8],
        attempt: u32,
        cancel: &CancellationToken,
    ) -> TaskState {
        debug!(
            event = "task.attempt",
            file = %task.file_name,
            folder = %task.destination_folder,
            attempt,
            "task.attempt"
        );
        match self.attempt_once(task, payload, cancel).await {
            Ok(()) => TaskState::Succeeded { attempts: attempt },
            Err(AttemptError::Cancelled(step)) => TaskState::Interrupted {
                attempts: attempt,
                reason: format!("cancelled before {step}"),
            },
            Err(AttemptError::Credential(message)) => TaskState::Aborted {
                attempts: attempt,
                message,
            },
            Err(AttemptError::Api(failure)) => {
                if failure.error.kind == ApiErrorKind::Permanent {
                    TaskState::FailedPermanent {
                        attempts: attempt,
                        failure,
                    }
                } else if attempt >= self.policy.max_attempts {
                    TaskState::FailedRetriesExhausted {
                        attempts: attempt,
                        failure,
                    }
                } else {
                    let delay = self.policy.jittered_delay(attempt, &mut rand::rng());
                    TaskState::BackoffWait {
                        attempt,
                        delay,
                        failure,
                    }
                }
            }
        }
    }

    async fn attempt_once(
        &self,
        task: &UploadTask,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), AttemptError> {
        let api = self.api.as_ref();

        for folder in folder_chain(&task.destination_folder) {
            if cancel.is_cancelled() {
                return Err(AttemptError::Cancelled(Step::EnsureFolder));
            }
            let cell = self.folders.cell(&folder);
            let folder = folder.as_str();
            cell.get_or_try_init(|| async {
                self.with_auth(Step::EnsureFolder, None, |token| async move {
                    api.ensure_folder(&token, folder).await
                })
                .await?;
                info!(event = "folder.ready", folder, "folder.ready");
                Ok::<(), AttemptError>(())
            })
            .await?;
        }

        if cancel.is_cancelled() {
            return Err(AttemptError::Cancelled(Step::Initiate));
        }
        let folder = task.destination_folder.as_str();
        let file_name = task.file_name.as_str();
        let size = payload.len() as u64;
        let (session, mut pinned) = self
            .with_auth(Step::Initiate, None, |token| async move {
                api.initiate_upload(&token, folder, file_name, size).await
            })
            .await?;

        if cancel.is_cancelled() {
            return Err(AttemptError::Cancelled(Step::Transfer));
        }
        let parts = plan_parts(
            size,
            session.upload_uris.len(),
            session.min_part_size,
            session.max_part_size,
        )
        .map_err(|e| AttemptError::api(Step::Transfer, e))?;
        for (uri, range) in session.upload_uris.iter().zip(parts) {
            let slice = &payload[range.start as usize..range.end as usize];
            let uri = uri.as_str();
            let ((), used) = self
                .with_auth(Step::Transfer, Some(&pinned), |token| async move {
                    api.upload_part(&token, uri, slice.to_vec()).await
                })
                .await?;
            pinned = used;
        }

        let description = format!("Uploaded on {}", task.metadata.captured_on.format("%Y-%m-%d"));
        let tags = task.metadata.tags.join(",");
        let session = &session;
        let title = task.metadata.title.as_str();
        let description = description.as_str();
        let tags = tags.as_str();
        self.with_auth(Step::Complete, Some(&pinned), |token| async move {
            api.complete_upload(
                &token,
                CompleteUpload {
                    session,
                    file_name,
                    mime_type: JPEG_MIME_TYPE,
                    title,
                    description: description.to_string(),
                    tags: tags.to_string(),
                },
            )
            .await
        })
        .await
        .map(|_| ())
    }

    /// Calls one step, refreshing the credential on 401/403 up to
    /// `auth_retry_limit` times. A rejection past that limit is handed back as
    /// transient so it counts against the task budget.
    ///
    /// With `pinned` set, a failed provider falls back to that credential
    /// instead of failing the step. Returns the credential the call succeeded
    /// with.
    async fn with_auth<T, F, Fut>(
        &self,
        step: Step,
        pinned: Option<&Credential>,
        mut call: F,
    ) -> Result<(T, Credential), AttemptError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut credential = match (self.credentials.get().await, pinned) {
            (Ok(credential), _) => credential,
            (Err(e), Some(pinned)) => {
                debug!(
                    event = "task.pinned_credential",
                    step = step.as_str(),
                    epoch = pinned.epoch,
                    error = %e,
                    "task.pinned_credential"
                );
                pinned.clone()
            }
            (Err(e), None) => return Err(AttemptError::credential(e)),
        };
        let mut auth_retries = 0;

        loop {
            match call(credential.token.clone()).await {
                Ok(value) => return Ok((value, credential)),
                Err(error) if error.kind == ApiErrorKind::Unauthorized => {
                    if auth_retries >= self.policy.auth_retry_limit {
                        return Err(AttemptError::api(
                            step,
                            ApiError {
                                kind: ApiErrorKind::Transient,
                                ..error
                            },
                        ));
                    }
                    auth_retries += 1;
                    warn!(
                        event = "task.auth_retry",
                        step = step.as_str(),
                        epoch = credential.epoch,
                        error = %error,
                        "task.auth_retry"
                    );
                    credential = self
                        .credentials
                        .invalidate_and_refresh(credential.epoch)
                        .await
                        .map_err(AttemptError::credential)?;
                }
                Err(error) => return Err(AttemptError::api(step, error)),
            }
        }
    }
}
