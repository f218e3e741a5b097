//! Per-stage completion tracking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::node::Stage;

/// Outcome of waiting on a stage barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageWait {
    /// Every node of the requested stage finished.
    StageFinished,
    /// The whole run finished first.
    RunFinished,
    /// Neither happened within the bounded wait.
    TimedOut,
}

struct StageState {
    remaining: AtomicI64,
    done: CancellationToken,
}

/// Counts down executable nodes per stage and signals each stage's
/// completion exactly once. A stage with zero nodes starts already done.
pub(crate) struct StageKeeper {
    all_done: CancellationToken,
    stages: HashMap<Stage, StageState>,
    timeout: Duration,
}

impl StageKeeper {
    pub fn new(counts: &HashMap<Stage, usize>, timeout: Duration) -> Self {
        let mut stages = HashMap::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            let count = counts.get(&stage).copied().unwrap_or(0);
            let done = CancellationToken::new();
            if count == 0 {
                done.cancel();
            }
            stages.insert(
                stage,
                StageState {
                    remaining: AtomicI64::new(count as i64),
                    done,
                },
            );
        }
        StageKeeper {
            all_done: CancellationToken::new(),
            stages,
            timeout,
        }
    }

    pub fn record_finish(&self, stage: Stage) {
        if let Some(state) = self.stages.get(&stage) {
            if state.remaining.fetch_sub(1, Ordering::AcqRel) <= 1 {
                state.done.cancel();
            }
        }
    }

    /// Block until the stage completes, the whole run completes, or the
    /// bounded wait elapses, whichever happens first.
    pub async fn wait_for(&self, stage: Stage) -> StageWait {
        let Some(state) = self.stages.get(&stage) else {
            return tokio::select! {
                _ = self.all_done.cancelled() => StageWait::RunFinished,
                _ = tokio::time::sleep(self.timeout) => StageWait::TimedOut,
            };
        };
        tokio::select! {
            biased;
            _ = state.done.cancelled() => StageWait::StageFinished,
            _ = self.all_done.cancelled() => StageWait::RunFinished,
            _ = tokio::time::sleep(self.timeout) => StageWait::TimedOut,
        }
    }

    pub fn set_all_done(&self) {
        self.all_done.cancel();
    }

    pub fn all_done_token(&self) -> CancellationToken {
        self.all_done.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(Stage, usize)]) -> HashMap<Stage, usize> {
        pairs.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_empty_stage_is_already_done() {
        let keeper = StageKeeper::new(&counts(&[(Stage::Sync, 1)]), Duration::from_secs(1));
        assert_eq!(keeper.wait_for(Stage::Async).await, StageWait::StageFinished);
    }

    #[tokio::test]
    async fn test_stage_signals_on_last_finish() {
        let keeper = StageKeeper::new(&counts(&[(Stage::Sync, 2)]), Duration::from_secs(1));
        keeper.record_finish(Stage::Sync);
        keeper.record_finish(Stage::Sync);
        assert_eq!(keeper.wait_for(Stage::Sync).await, StageWait::StageFinished);
    }

    #[tokio::test]
    async fn test_run_finish_beats_pending_stage() {
        let keeper = StageKeeper::new(&counts(&[(Stage::Sync, 2)]), Duration::from_secs(5));
        keeper.record_finish(Stage::Sync);
        keeper.set_all_done();
        assert_eq!(keeper.wait_for(Stage::Sync).await, StageWait::RunFinished);
    }

    #[tokio::test]
    async fn test_bounded_wait_times_out() {
        let keeper = StageKeeper::new(&counts(&[(Stage::Sync, 1)]), Duration::from_millis(20));
        assert_eq!(keeper.wait_for(Stage::Sync).await, StageWait::TimedOut);
    }
}
