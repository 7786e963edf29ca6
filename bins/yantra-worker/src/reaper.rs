// Periodic reaper loop; the sweep itself lives in yantra_common::reaper
use crate::config::WorkerConfig;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use yantra_common::leases::LeaseRegistry;
use yantra_common::queue::JobQueue;
use yantra_common::reaper::{sweep, ReaperPolicy};
use yantra_common::staging::StagingArea;
use yantra_common::store::StateStore;

pub struct Reaper {
    pub store: Arc<dyn StateStore>,
    pub queue: Arc<dyn JobQueue>,
    pub leases: Arc<dyn LeaseRegistry>,
    pub staging: StagingArea,
    pub policy: ReaperPolicy,
    pub interval: Duration,
}

impl Reaper {
    pub fn from_config(
        config: &WorkerConfig,
        store: Arc<dyn StateStore>,
        queue: Arc<dyn JobQueue>,
        leases: Arc<dyn LeaseRegistry>,
    ) -> Self {
        Self {
            store,
            queue,
            leases,
            staging: StagingArea::new(&config.staging_root),
            policy: ReaperPolicy {
                build_timeout_secs: config.build_timeout_secs,
                grace_secs: config.reaper_grace_secs,
                build_log_limit: config.build_log_limit_bytes,
            },
            interval: Duration::from_secs(config.reaper_interval_secs.max(1)),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Reaper started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = sweep(
                self.store.as_ref(),
                self.queue.as_ref(),
                self.leases.as_ref(),
                &self.staging,
                &self.policy,
                Utc::now(),
            )
            .await
            {
                error!(error = %e, "Reaper sweep failed");
            }
        }
        info!("Reaper stopped");
    }
}
