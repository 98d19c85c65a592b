//! Periodic renewal driver.
//!
//! Wakes on a fixed interval and runs one cycle per pipeline. A cycle
//! that is still running when the next tick arrives is skipped for that
//! pipeline rather than stacked. Pipelines run sequentially by default;
//! concurrent mode runs them all at once for installations with many
//! independent domain sets.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::errors::Classify;
use crate::pipeline::Pipeline;

/// Floor for the check interval. Checking more often than hourly only
/// hammers the local store; renewal windows are measured in days.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Grace period before the first check so the consumer can finish
/// starting up alongside us.
const INITIAL_DELAY: Duration = Duration::from_secs(10);

pub struct RenewalScheduler {
    pipelines: Vec<Arc<Mutex<Pipeline>>>,
    check_interval: Duration,
    concurrent: bool,
}

impl RenewalScheduler {
    pub fn new(pipelines: Vec<Pipeline>, check_interval: Duration, concurrent: bool) -> Self {
        let clamped = check_interval.max(MIN_CHECK_INTERVAL);
        if clamped != check_interval {
            warn!(
                requested_secs = check_interval.as_secs(),
                clamped_secs = clamped.as_secs(),
                "check interval below minimum, clamping"
            );
        }
        Self {
            pipelines: pipelines
                .into_iter()
                .map(|p| Arc::new(Mutex::new(p)))
                .collect(),
            check_interval: clamped,
            concurrent,
        }
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run forever. Callers race this against a shutdown signal.
    pub async fn run(&self) {
        info!(
            pipelines = self.pipelines.len(),
            interval_secs = self.check_interval.as_secs(),
            concurrent = self.concurrent,
            "renewal scheduler started"
        );

        tokio::time::sleep(INITIAL_DELAY).await;
        self.check_all().await;

        let mut ticker = tokio::time::interval(self.check_interval);
        // The first tick fires immediately and we just checked.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.check_all().await;
        }
    }

    /// One renewal pass over every pipeline.
    pub async fn check_all(&self) {
        if self.concurrent {
            let mut tasks = tokio::task::JoinSet::new();
            for pipeline in &self.pipelines {
                let pipeline = pipeline.clone();
                tasks.spawn(async move { run_one(&pipeline).await });
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "renewal task panicked");
                }
            }
        } else {
            for pipeline in &self.pipelines {
                run_one(pipeline).await;
            }
        }
    }
}

async fn run_one(pipeline: &Arc<Mutex<Pipeline>>) {
    // A cycle from the previous tick may still be waiting on DNS or the
    // CA. Skip instead of queueing behind it.
    let Ok(mut guard) = pipeline.try_lock() else {
        warn!("previous renewal cycle still in flight, skipping this tick");
        return;
    };

    let primary = guard.primary().to_string();
    match guard.run_cycle(false).await {
        Ok(state) => {
            info!(primary = %primary, state = %state, "renewal check complete");
        }
        Err(e) => {
            error!(
                primary = %primary,
                error = %e,
                class = ?e.class(),
                "renewal check failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_clamped_to_minimum() {
        let scheduler = RenewalScheduler::new(Vec::new(), Duration::from_secs(60), false);
        assert_eq!(scheduler.check_interval(), MIN_CHECK_INTERVAL);

        let daily = Duration::from_secs(24 * 60 * 60);
        let scheduler = RenewalScheduler::new(Vec::new(), daily, false);
        assert_eq!(scheduler.check_interval(), daily);
    }

    #[tokio::test]
    async fn test_check_all_with_no_pipelines_is_a_noop() {
        let scheduler = RenewalScheduler::new(Vec::new(), MIN_CHECK_INTERVAL, true);
        scheduler.check_all().await;
    }
}
