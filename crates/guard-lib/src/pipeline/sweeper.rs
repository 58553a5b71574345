//! Periodic ban expiry

use super::Pipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Runs the tracker's expiry sweep on its own interval
pub struct ExpirySweeper {
    pipeline: Arc<Pipeline>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(pipeline: Arc<Pipeline>, interval: Duration) -> Self {
        Self { pipeline, interval }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "Starting ban expiry sweeper");

        let mut ticker = interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let lifted = self.pipeline.sweep_expired();
                    if !lifted.is_empty() {
                        debug!(count = lifted.len(), "Expired bans lifted");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down ban expiry sweeper");
                    break;
                }
            }
        }
    }
}
