use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::ApiError;
use crate::ledger::{RunLedger, UploadOutcome, UploadStatus};
use crate::plan::UploadTask;
use crate::progress::{ProgressSink, RunProgress};
use crate::synth::AssetSynthesizer;
use crate::upload::{Step, StepFailure, TaskState, UploadClient};

/// Shared state for one pool run.
pub struct PoolContext {
    /// `None` runs synthesis only.
    pub client: Option<Arc<UploadClient>>,
    pub synthesizer: Arc<dyn AssetSynthesizer>,
    pub ledger: Arc<RunLedger>,
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub cancel: CancellationToken,
}

struct Shared {
    ctx: PoolContext,
    queue: Mutex<VecDeque<UploadTask>>,
    abort_reason: OnceLock<String>,
    total: u64,
    done: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    fn record(&self, outcome: UploadOutcome) {
        match outcome.status {
            UploadStatus::Success => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            UploadStatus::NotAttempted => {}
            _ => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        self.ctx.ledger.append(outcome);

        if let Some(progress) = &self.ctx.progress {
            progress.on_progress(RunProgress {
                done,
                total: self.total,
                succeeded: self.succeeded.load(Ordering::Relaxed),
                failed: self.failed.load(Ordering::Relaxed),
            });
        }
    }

    fn abort(&self, reason: String) {
        if self.abort_reason.set(reason.clone()).is_ok() {
            error!(event = "run.abort", reason = %reason, "run.abort");
        }
        self.ctx.cancel.cancel();
    }
}

/// A popped task owned by a worker. Dropped before an outcome was recorded
/// (the worker panicked or returned early), it records the task as
/// interrupted.
struct Claimed<'a> {
    shared: &'a Shared,
    task: UploadTask,
    recorded: bool,
}

impl Drop for Claimed<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.shared.record(UploadOutcome::new(
                &self.task,
                UploadStatus::Interrupted,
                Some("worker stopped unexpectedly".to_string()),
                Duration::ZERO,
            ));
        }
    }
}

/// Drains `tasks` with `workers` concurrent workers.
///
/// Every task ends with exactly one ledger outcome. Returns the abort reason
/// when a fatal error stopped the run.
pub async fn run_pool(tasks: Vec<UploadTask>, workers: usize, ctx: PoolContext) -> Option<String> {
    let total = tasks.len() as u64;
    let workers = workers.max(1).min(tasks.len().max(1));

    let shared = Arc::new(Shared {
        ctx,
        queue: Mutex::new(tasks.into()),
        abort_reason: OnceLock::new(),
        total,
        done: AtomicU64::new(0),
        succeeded: AtomicU64::new(0),
        failed: AtomicU64::new(0),
    });

    let mut set = JoinSet::new();
    for worker_id in 0..workers {
        let shared = shared.clone();
        set.spawn(async move { worker(worker_id, shared).await });
    }
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            error!(event = "worker.crashed", error = %e, "worker.crashed");
        }
    }

    let leftover: Vec<UploadTask> = shared.queue.lock().await.drain(..).collect();
    if !leftover.is_empty() {
        debug!(
            event = "run.not_attempted",
            count = leftover.len(),
            "run.not_attempted"
        );
    }
    for task in &leftover {
        shared.record(UploadOutcome::not_attempted(task));
    }

    shared.abort_reason.get().cloned()
}

async fn worker(worker_id: usize, shared: Arc<Shared>) {
    loop {
        if shared.ctx.cancel.is_cancelled() {
            break;
        }
        let Some(task) = shared.queue.lock().await.pop_front() else {
            break;
        };
        let mut claimed = Claimed {
            shared: &shared,
            task,
            recorded: false,
        };

        let started = Instant::now();
        let state = process_task(&shared, &mut claimed.task).await;
        let elapsed = started.elapsed();

        if let TaskState::Aborted { message, .. } = &state {
            shared.abort(format!("credential failure: {message}"));
        }

        let Some(outcome) = UploadOutcome::from_state(&claimed.task, &state, elapsed) else {
            warn!(event = "task.non_terminal", seq = claimed.task.seq, "task.non_terminal");
            continue;
        };
        claimed.recorded = true;
        drop(claimed);
        info!(
            event = "task.finish",
            worker_id,
            seq = outcome.seq,
            file = %outcome.file_name,
            folder = %outcome.destination_folder,
            status = ?outcome.status,
            attempts = outcome.attempts,
            duration_ms = outcome.duration_ms,
            "task.finish"
        );
        shared.record(outcome);
    }
}

async fn process_task(shared: &Shared, task: &mut UploadTask) -> TaskState {
    let synthesizer = shared.ctx.synthesizer.clone();
    let input = task.clone();
    let payload = match tokio::task::spawn_blocking(move || synthesizer.synthesize(&input)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => return synthesis_failed(task, e.to_string()),
        Err(e) => return synthesis_failed(task, format!("synthesis task failed: {e}")),
    };

    match &shared.ctx.client {
        Some(client) => client.upload(task, &payload, &shared.ctx.cancel).await,
        None => {
            task.attempt_count = 1;
            TaskState::Succeeded { attempts: 1 }
        }
    }
}

fn synthesis_failed(task: &mut UploadTask, message: String) -> TaskState {
    task.attempt_count = 1;
    TaskState::FailedPermanent {
        attempts: 1,
        failure: StepFailure {
            step: Step::Synthesize,
            error: ApiError::permanent(message),
        },
    }
}
