use std::sync::Arc;
use std::time::Duration;

use crate::schedule::StageSnapshot;

/// Scheduler state after one control tick.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// 1-based tick counter.
    pub tick: u64,
    pub elapsed: Duration,
    /// Workers the scheduler currently counts as live; retired workers still draining are
    /// not included.
    pub live_vus: u64,
    pub sleeping_vus: u64,
    pub target_vus: u64,
    /// `None` for constant VU runs.
    pub stage: Option<StageSnapshot>,
    pub iterations_total: u64,
}

pub type ProgressFn = Arc<dyn Fn(ProgressUpdate) + Send + Sync + 'static>;
