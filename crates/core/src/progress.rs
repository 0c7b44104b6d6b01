use serde::{Deserialize, Serialize};

use crate::accounting::TaskOutcome;

/// One completion in a run. `index` counts completions, not submissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub index: u32,
    pub total: u32,
    pub display_name: String,
    pub outcome: TaskOutcome,
    pub added_bytes: u64,
    pub total_bytes: u64,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: TaskProgress);
}
