use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub done: u64,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: RunProgress);
}
