/// Background sweep of expired waits
///
/// A single tokio-cron-scheduler job periodically asks the flow service to resume
/// or fail waiting contexts whose deadline has passed. Delay nodes rely on it: a
/// delay only records a deadline and never holds a worker for its duration.

use crate::runtime::service::FlowService;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

pub struct SweepScheduler {
    scheduler: Arc<RwLock<JobScheduler>>,
    service: Arc<FlowService>,
    schedule: String,
    job_uuid: Mutex<Option<Uuid>>,
}

impl SweepScheduler {
    pub async fn new(service: Arc<FlowService>, schedule: impl Into<String>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            service,
            schedule: schedule.into(),
            job_uuid: Mutex::new(None),
        })
    }

    /// Register the sweep job and start ticking
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting expired-wait sweep ({})", self.schedule);

        let service = Arc::clone(&self.service);
        // One sweep at a time; a tick that finds the previous one still running is skipped
        let in_flight = Arc::new(Mutex::new(()));
        let job = Job::new_async(self.schedule.as_str(), move |_uuid, _l| {
            let service = Arc::clone(&service);
            let in_flight = Arc::clone(&in_flight);

            Box::pin(async move {
                let Ok(_guard) = in_flight.try_lock() else {
                    tracing::debug!("⏭️ Previous sweep still running, skipping tick");
                    return;
                };
                match service.sweep_expired_waits().await {
                    Ok(0) => {}
                    Ok(count) => tracing::info!("✅ Sweep handled {} expired waits", count),
                    Err(e) => tracing::error!("❌ Expired-wait sweep failed: {}", e),
                }
            })
        })?;

        let scheduler = self.scheduler.read().await;
        let uuid = scheduler.add(job).await?;
        *self.job_uuid.lock().await = Some(uuid);
        scheduler.start().await?;

        tracing::info!("✅ Sweep scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping sweep scheduler");
        if let Some(uuid) = self.job_uuid.lock().await.take() {
            let scheduler = self.scheduler.read().await;
            if let Err(e) = scheduler.remove(&uuid).await {
                tracing::warn!("⚠️ Failed to remove sweep job {}: {}", uuid, e);
            }
        }
        let mut scheduler = self.scheduler.write().await;
        scheduler.shutdown().await?;
        Ok(())
    }
}
