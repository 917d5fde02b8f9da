//! Scheduler: a single logical ticker that dispatches due operations.
//!
//! Every tick scans for pending operations whose `scheduled_at` has
//! passed and claims each with a compare-and-set transition into
//! `running`. The claim is what makes multiple orchestrator replicas
//! safe; the scheduler itself is not otherwise distributed. Claimed
//! operations run on their own tasks so a long migration never blocks
//! the ticker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::executor::Executor;
use crate::operation::OperationStatus;
use crate::store::OperationStore;

pub struct Scheduler {
    store: Arc<dyn OperationStore>,
    executor: Executor,
    interval: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn OperationStore>, executor: Executor, interval: Duration) -> Self {
        Self {
            store,
            executor,
            interval,
        }
    }

    /// Run the ticker until the process exits.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Scheduler running every {:?}", self.interval);
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.tick().await {
                    error!("Scheduler tick failed: {}", e);
                }
            }
        })
    }

    /// One scan-and-dispatch pass. Public for tests.
    pub async fn tick(&self) -> crate::error::Result<usize> {
        let now = Utc::now();
        let due = self.store.due(now).await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!("{} operations due", due.len());

        let mut dispatched = 0;
        for id in due {
            // Compare-and-set: a replica that loses the claim skips the
            // operation without side effects.
            match self
                .store
                .transition_to_running(id, &[OperationStatus::Pending], now)
                .await?
            {
                Some(claimed) => {
                    dispatched += 1;
                    info!("Dispatching operation {}", id);
                    let executor = self.executor.clone();
                    tokio::spawn(async move {
                        if let Err(e) = executor.run_claimed(claimed).await {
                            error!("Operation {} failed to persist its outcome: {}", id, e);
                        }
                    });
                }
                None => debug!("Operation {} already claimed", id),
            }
        }
        Ok(dispatched)
    }
}
