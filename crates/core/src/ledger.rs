use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::plan::UploadTask;
use crate::upload::TaskState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Success,
    FailedPermanent,
    FailedRetriesExhausted,
    /// Started but stopped by cancellation or a run abort.
    Interrupted,
    /// Still queued when the run stopped.
    NotAttempted,
}

impl UploadStatus {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            UploadStatus::FailedPermanent | UploadStatus::FailedRetriesExhausted
        )
    }
}

/// Final record for one task. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub seq: u64,
    pub destination_folder: String,
    pub file_name: String,
    pub status: UploadStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl UploadOutcome {
    pub fn new(task: &UploadTask, status: UploadStatus, error: Option<String>, duration: Duration) -> Self {
        Self {
            seq: task.seq,
            destination_folder: task.destination_folder.clone(),
            file_name: task.file_name.clone(),
            status,
            attempts: task.attempt_count,
            error,
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Maps a terminal upload state to its outcome. Returns `None` for a
    /// state that is still in progress.
    pub fn from_state(task: &UploadTask, state: &TaskState, duration: Duration) -> Option<Self> {
        let (status, attempts, error) = match state {
            TaskState::Succeeded { attempts } => (UploadStatus::Success, *attempts, None),
            TaskState::FailedPermanent { attempts, failure } => {
                (UploadStatus::FailedPermanent, *attempts, Some(failure.to_string()))
            }
            TaskState::FailedRetriesExhausted { attempts, failure } => (
                UploadStatus::FailedRetriesExhausted,
                *attempts,
                Some(failure.to_string()),
            ),
            TaskState::Interrupted { attempts, reason } => {
                (UploadStatus::Interrupted, *attempts, Some(reason.clone()))
            }
            TaskState::Aborted { attempts, message } => (
                UploadStatus::Interrupted,
                *attempts,
                Some(format!("credential failure: {message}")),
            ),
            TaskState::Pending | TaskState::Attempting { .. } | TaskState::BackoffWait { .. } => {
                return None;
            }
        };
        let mut outcome = Self::new(task, status, error, duration);
        outcome.attempts = attempts;
        Some(outcome)
    }

    pub fn not_attempted(task: &UploadTask) -> Self {
        Self::new(task, UploadStatus::NotAttempted, None, Duration::ZERO)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSummary {
    pub planned: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub planned: u64,
    /// Tasks that made at least one attempt.
    pub attempted: u64,
    pub succeeded: u64,
    pub retried_then_succeeded: u64,
    pub failed_permanent: u64,
    pub failed_retries_exhausted: u64,
    pub interrupted: u64,
    pub not_attempted: u64,
    pub total_attempts: u64,
    pub elapsed_ms: u64,
    pub per_folder: BTreeMap<String, FolderSummary>,
    pub failures: Vec<UploadOutcome>,
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

impl RunSummary {
    pub fn failed(&self) -> u64 {
        self.failed_permanent + self.failed_retries_exhausted
    }

    /// A run passes when it was not aborted and no more than `tolerance`
    /// tasks failed.
    pub fn is_success(&self, tolerance: u64) -> bool {
        !self.aborted && self.interrupted == 0 && self.failed() <= tolerance
    }
}

/// Append-only record of task outcomes, shared by all workers.
#[derive(Debug)]
pub struct RunLedger {
    run_id: String,
    planned: u64,
    outcomes: Mutex<Vec<UploadOutcome>>,
}

impl RunLedger {
    pub fn new(run_id: impl Into<String>, planned: u64) -> Self {
        Self {
            run_id: run_id.into(),
            planned,
            outcomes: Mutex::new(Vec::with_capacity(planned as usize)),
        }
    }

    pub fn append(&self, outcome: UploadOutcome) {
        self.outcomes
            .lock()
            .expect("run ledger mutex poisoned")
            .push(outcome);
    }

    /// Snapshot of the outcomes in seq order.
    pub fn outcomes(&self) -> Vec<UploadOutcome> {
        let mut outcomes = self
            .outcomes
            .lock()
            .expect("run ledger mutex poisoned")
            .clone();
        outcomes.sort_by_key(|o| o.seq);
        outcomes
    }

    pub fn finalize(&self, elapsed: Duration, abort_reason: Option<String>) -> RunSummary {
        let outcomes = self.outcomes();

        let mut summary = RunSummary {
            run_id: self.run_id.clone(),
            planned: self.planned,
            attempted: 0,
            succeeded: 0,
            retried_then_succeeded: 0,
            failed_permanent: 0,
            failed_retries_exhausted: 0,
            interrupted: 0,
            not_attempted: 0,
            total_attempts: 0,
            elapsed_ms: elapsed.as_millis() as u64,
            per_folder: BTreeMap::new(),
            failures: Vec::new(),
            aborted: abort_reason.is_some(),
            abort_reason,
        };

        for outcome in outcomes {
            if outcome.attempts > 0 {
                summary.attempted += 1;
            }
            summary.total_attempts += u64::from(outcome.attempts);

            let folder = summary
                .per_folder
                .entry(outcome.destination_folder.clone())
                .or_default();
            folder.planned += 1;

            match outcome.status {
                UploadStatus::Success => {
                    summary.succeeded += 1;
                    folder.succeeded += 1;
                    if outcome.attempts > 1 {
                        summary.retried_then_succeeded += 1;
                    }
                }
                UploadStatus::FailedPermanent => summary.failed_permanent += 1,
                UploadStatus::FailedRetriesExhausted => summary.failed_retries_exhausted += 1,
                UploadStatus::Interrupted => summary.interrupted += 1,
                UploadStatus::NotAttempted => summary.not_attempted += 1,
            }
            if outcome.status.is_failure() {
                folder.failed += 1;
            }
            if outcome.status != UploadStatus::Success
                && outcome.status != UploadStatus::NotAttempted
            {
                summary.failures.push(outcome);
            }
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::plan::{AssetMetadata, AssetShape};

    fn task(seq: u64, folder: &str, attempts: u32) -> UploadTask {
        UploadTask {
            seq,
            destination_folder: folder.to_string(),
            file_name: format!("asset_{seq:06}.jpg"),
            shape: AssetShape {
                width: 8,
                height: 8,
            },
            metadata: AssetMetadata {
                title: "Quiet Harbor".to_string(),
                captured_on: NaiveDate::from_ymd_opt(2020, 1, 2).unwrap(),
                tags: vec!["findme".to_string()],
            },
            attempt_count: attempts,
        }
    }

    #[test]
    fn finalize_counts_every_status() {
        let ledger = RunLedger::new("run_test", 5);
        ledger.append(UploadOutcome::new(&task(3, "/content/dam/b", 2), UploadStatus::Success, None, Duration::from_millis(5)));
        ledger.append(UploadOutcome::new(&task(1, "/content/dam/a", 1), UploadStatus::Success, None, Duration::ZERO));
        ledger.append(UploadOutcome::new(
            &task(2, "/content/dam/a", 1),
            UploadStatus::FailedPermanent,
            Some("initiate: http 400: bad".to_string()),
            Duration::ZERO,
        ));
        ledger.append(UploadOutcome::new(
            &task(4, "/content/dam/b", 3),
            UploadStatus::FailedRetriesExhausted,
            Some("transfer: http 503: busy".to_string()),
            Duration::ZERO,
        ));
        ledger.append(UploadOutcome::not_attempted(&task(5, "/content/dam/b", 0)));

        let summary = ledger.finalize(Duration::from_millis(1500), None);
        assert_eq!(summary.planned, 5);
        assert_eq!(summary.attempted, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.retried_then_succeeded, 1);
        assert_eq!(summary.failed_permanent, 1);
        assert_eq!(summary.failed_retries_exhausted, 1);
        assert_eq!(summary.not_attempted, 1);
        assert_eq!(summary.total_attempts, 7);
        assert_eq!(summary.elapsed_ms, 1500);
        assert_eq!(summary.failures.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![2, 4]);

        let b = &summary.per_folder["/content/dam/b"];
        assert_eq!((b.planned, b.succeeded, b.failed), (3, 1, 1));

        assert!(!summary.is_success(1));
        assert!(summary.is_success(2));
    }

    #[test]
    fn aborted_run_never_succeeds() {
        let ledger = RunLedger::new("run_test", 0);
        let summary = ledger.finalize(Duration::ZERO, Some("credential failure".to_string()));
        assert!(summary.aborted);
        assert!(!summary.is_success(100));

        let clean = RunLedger::new("run_test", 0).finalize(Duration::ZERO, None);
        assert!(clean.is_success(0));
    }

    #[test]
    fn in_progress_states_have_no_outcome() {
        let t = task(1, "/content/dam/a", 1);
        assert!(UploadOutcome::from_state(&t, &TaskState::Attempting { attempt: 1 }, Duration::ZERO).is_none());

        let outcome = UploadOutcome::from_state(
            &t,
            &TaskState::Aborted {
                attempts: 1,
                message: "login rejected".to_string(),
            },
            Duration::ZERO,
        )
        .unwrap();
        assert_eq!(outcome.status, UploadStatus::Interrupted);
        assert!(outcome.error.unwrap().contains("login rejected"));
    }

    #[test]
    fn summary_serializes_statuses_in_snake_case() {
        let ledger = RunLedger::new("run_test", 1);
        ledger.append(UploadOutcome::new(
            &task(1, "/content/dam/a", 3),
            UploadStatus::FailedRetriesExhausted,
            Some("boom".to_string()),
            Duration::ZERO,
        ));
        let json = serde_json::to_value(ledger.finalize(Duration::ZERO, None)).unwrap();
        assert_eq!(json["failures"][0]["status"], "failed_retries_exhausted");
        assert!(json.get("abort_reason").is_none());
    }
}
