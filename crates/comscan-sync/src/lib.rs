//! Ingestion orchestration: per-kind fetchers, the job queue with retries,
//! periodic refresh and runtime configuration.

use std::sync::Arc;

use anyhow::Context;
use comscan_source::{CredentialRotator, HttpFetcher, SessionPool, VoyagerSessions};

pub mod config;
pub mod fetchers;
pub mod orchestrator;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use config::SyncConfig;
pub use fetchers::{ingest_kind, EnrichmentThrottle, Fetched, KindOutcome};
pub use orchestrator::{
    job_channel, AttemptReport, IngestJob, JobHandle, JobReceiver, JobRecord, JobState, JobTracker, Orchestrator,
    QueueClosed, RetryPolicy, DEFAULT_JOB_RETENTION,
};
pub use scheduler::{enqueue_refresh, maybe_build_scheduler};

pub const CRATE_NAME: &str = "comscan-sync";

/// Builds the shared HTTP transport and a credential-rotating session pool.
pub fn session_pool(config: &SyncConfig) -> anyhow::Result<Arc<SessionPool>> {
    let http = HttpFetcher::new(config.http_client())?;
    let rotator = CredentialRotator::new(config.credential_pool()?).context("SOURCE_CREDENTIALS")?;
    let factory = VoyagerSessions::new(Arc::new(http), config.voyager());
    Ok(Arc::new(SessionPool::new(Arc::new(factory), Arc::new(rotator))))
}
