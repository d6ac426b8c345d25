use std::sync::Arc;

use anyhow::Context;
use comscan_core::{IngestError, ResourceSet};
use comscan_storage::RecordStore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::orchestrator::JobHandle;

/// Queues a full refresh (every kind) for each stored company.
pub async fn enqueue_refresh(store: &dyn RecordStore, jobs: &JobHandle) -> Result<usize, IngestError> {
    let companies = store.list_companies().await?;
    let mut queued = 0usize;
    for company in companies {
        jobs.enqueue(company, ResourceSet::all())
            .map_err(|err| IngestError::StorageFailure(err.to_string()))?;
        queued += 1;
    }
    Ok(queued)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    store: Arc<dyn RecordStore>,
    jobs: JobHandle,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.refresh_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let store = store.clone();
        let jobs = jobs.clone();
        Box::pin(async move {
            match enqueue_refresh(store.as_ref(), &jobs).await {
                Ok(queued) => info!(queued, "scheduled refresh enqueued"),
                Err(err) => error!(error = %err, "scheduled refresh failed"),
            }
        })
    })
    .with_context(|| format!("creating refresh job for cron {cron}"))?;
    sched.add(job).await.context("adding refresh job")?;
    Ok(Some(sched))
}
