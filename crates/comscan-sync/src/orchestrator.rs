//! Ingestion jobs: queue, worker pool, retry state machine and status tracking.
//!
//! A job moves `Queued -> Running -> Completed`, or through `FailedRetrying`
//! back to `Running` until its attempts are used up (`FailedTerminal`).
//! Retries are parked on a detached timer so workers stay free.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use comscan_core::{CompanyProfile, IngestError, ResourceKind, ResourceSet};
use comscan_source::SessionPool;
use comscan_storage::RecordStore;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::fetchers::{ingest_kind, EnrichmentThrottle, KindOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    FailedRetrying,
    FailedTerminal,
}

impl JobState {
    pub fn is_settled(&self) -> bool {
        matches!(self, JobState::Completed | JobState::FailedTerminal)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub company_id: i64,
    pub requested: ResourceSet,
    /// Kinds the next attempt will run.
    pub pending: ResourceSet,
    pub state: JobState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestJob {
    pub id: Uuid,
    pub company: CompanyProfile,
    pub kinds: ResourceSet,
    pub attempt: u32,
}

impl IngestJob {
    pub fn new(company: CompanyProfile, kinds: ResourceSet) -> Self {
        Self {
            id: Uuid::new_v4(),
            company,
            kinds,
            attempt: 1,
        }
    }
}

/// Settled records older than this are dropped from the board.
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(60 * 60);

/// In-process job status board. Clones share state. Settled records are
/// pruned once they are older than the retention window.
#[derive(Debug, Clone)]
pub struct JobTracker {
    jobs: Arc<Mutex<HashMap<Uuid, JobRecord>>>,
    changes: Arc<watch::Sender<u64>>,
    retention: chrono::Duration,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_JOB_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            changes: Arc::new(changes),
            retention: chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(365)),
        }
    }

    fn prune_settled(&self, jobs: &mut HashMap<Uuid, JobRecord>) {
        let cutoff = Utc::now() - self.retention;
        let before = jobs.len();
        jobs.retain(|_, record| !(record.state.is_settled() && record.updated_at <= cutoff));
        let pruned = before - jobs.len();
        if pruned > 0 {
            debug!(pruned, "dropped settled job records");
        }
    }

    fn register(&self, job: &IngestJob) -> JobRecord {
        let record = JobRecord {
            id: job.id,
            company_id: job.company.internal_id,
            requested: job.kinds.clone(),
            pending: job.kinds.clone(),
            state: JobState::Queued,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        };
        {
            let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            self.prune_settled(&mut jobs);
            jobs.insert(job.id, record.clone());
        }
        self.changes.send_modify(|n| *n += 1);
        record
    }

    fn update(&self, id: Uuid, apply: impl FnOnce(&mut JobRecord)) {
        if let Some(record) = self.jobs.lock().unwrap_or_else(PoisonError::into_inner).get_mut(&id) {
            apply(record);
            record.updated_at = Utc::now();
        }
        self.changes.send_modify(|n| *n += 1);
    }

    pub fn get(&self, id: Uuid) -> Option<JobRecord> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).get(&id).cloned()
    }

    pub fn snapshot(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.updated_at, r.id));
        records
    }

    /// Resolves once the job reaches `Completed` or `FailedTerminal`; `None`
    /// for unknown ids.
    pub async fn wait_until_settled(&self, id: Uuid) -> Option<JobRecord> {
        let mut changes = self.changes.subscribe();
        loop {
            match self.get(id) {
                None => return None,
                Some(record) if record.state.is_settled() => return Some(record),
                Some(_) => {}
            }
            if changes.changed().await.is_err() {
                return self.get(id);
            }
        }
    }
}

#[derive(Debug, Error)]
#[error("job queue is closed")]
pub struct QueueClosed;

/// Producer side of the job queue.
#[derive(Debug, Clone)]
pub struct JobHandle {
    tx: mpsc::UnboundedSender<IngestJob>,
    tracker: JobTracker,
}

/// Consumer side, shared by the worker pool.
#[derive(Debug, Clone)]
pub struct JobReceiver(Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<IngestJob>>>);

pub fn job_channel(tracker: JobTracker) -> (JobHandle, JobReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        JobHandle { tx, tracker },
        JobReceiver(Arc::new(tokio::sync::Mutex::new(rx))),
    )
}

impl JobHandle {
    pub fn enqueue(&self, company: CompanyProfile, kinds: ResourceSet) -> Result<Uuid, QueueClosed> {
        let job = IngestJob::new(company, kinds);
        let id = job.id;
        self.tracker.register(&job);
        debug!(job_id = %id, company_id = job.company.internal_id, kinds = %job.kinds, "job queued");
        self.tx.send(job).map_err(|_| QueueClosed)?;
        Ok(id)
    }

    fn requeue(&self, job: IngestJob) -> Result<(), QueueClosed> {
        self.tx.send(job).map_err(|_| QueueClosed)
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }
}

/// Result of one attempt across the requested kinds.
#[derive(Debug, Default)]
pub struct AttemptReport {
    pub session_error: Option<IngestError>,
    pub outcomes: Vec<(ResourceKind, Result<KindOutcome, IngestError>)>,
}

impl AttemptReport {
    /// Kinds the next attempt should re-run. A session failure means nothing
    /// ran, so every requested kind is retried.
    pub fn retry_kinds(&self, requested: &ResourceSet) -> ResourceSet {
        if self.session_error.is_some() {
            return requested.clone();
        }
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, Err(err) if err.is_retryable()))
            .map(|(kind, _)| *kind)
            .collect()
    }

    /// Most recent hard failure, else the most recent skipped partial
    /// failure, else the session error.
    pub fn last_error(&self) -> Option<String> {
        let failed = self
            .outcomes
            .iter()
            .rev()
            .find_map(|(kind, outcome)| outcome.as_ref().err().map(|err| format!("{kind}: {err}")));
        let degraded = || {
            self.outcomes.iter().rev().find_map(|(kind, outcome)| match outcome {
                Ok(KindOutcome {
                    degraded: Some(err), ..
                }) => Some(format!("{kind} (partial): {err}")),
                _ => None,
            })
        };
        failed
            .or_else(degraded)
            .or_else(|| self.session_error.as_ref().map(ToString::to_string))
    }
}

pub struct Orchestrator {
    sessions: Arc<SessionPool>,
    store: Arc<dyn RecordStore>,
    throttle: EnrichmentThrottle,
    retry: RetryPolicy,
    tracker: JobTracker,
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<SessionPool>,
        store: Arc<dyn RecordStore>,
        throttle: EnrichmentThrottle,
        tracker: JobTracker,
    ) -> Self {
        Self {
            sessions,
            store,
            throttle,
            retry: RetryPolicy::default(),
            tracker,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Runs each requested kind in order. A failing kind is logged and does
    /// not stop the others.
    pub async fn run_attempt(&self, job: &IngestJob) -> AttemptReport {
        let source = match self.sessions.next_session() {
            Ok(source) => source,
            Err(err) => {
                warn!(error = %err, "could not open source session");
                return AttemptReport {
                    session_error: Some(err.into()),
                    outcomes: Vec::new(),
                };
            }
        };

        let mut report = AttemptReport::default();
        for kind in job.kinds.iter() {
            let outcome = ingest_kind(source.as_ref(), self.store.as_ref(), &job.company, kind, &self.throttle).await;
            match &outcome {
                Ok(KindOutcome { upserted, degraded }) => info!(
                    %kind,
                    inserted = upserted.inserted,
                    updated = upserted.updated,
                    partial = degraded.is_some(),
                    "kind ingested"
                ),
                Err(err) => warn!(%kind, error = %err, retryable = err.is_retryable(), "kind failed"),
            }
            report.outcomes.push((kind, outcome));
        }
        report
    }

    /// Runs one attempt and records the transition. Returns the follow-up job
    /// when another attempt is due.
    pub async fn process(&self, job: IngestJob) -> Option<IngestJob> {
        let span = info_span!(
            "ingest_job",
            job_id = %job.id,
            company_id = job.company.internal_id,
            attempt = job.attempt
        );
        async move {
            self.tracker.update(job.id, |r| {
                r.state = JobState::Running;
                r.attempts = job.attempt;
            });

            let report = self.run_attempt(&job).await;
            let retry_kinds = report.retry_kinds(&job.kinds);
            let last_error = report.last_error();

            if retry_kinds.is_empty() {
                info!("job completed");
                self.tracker.update(job.id, |r| {
                    r.state = JobState::Completed;
                    r.pending = ResourceSet::empty();
                    r.last_error = last_error;
                });
                return None;
            }

            if job.attempt >= self.retry.max_attempts {
                error!(failed = %retry_kinds, "job failed permanently");
                self.tracker.update(job.id, |r| {
                    r.state = JobState::FailedTerminal;
                    r.pending = retry_kinds;
                    r.last_error = last_error;
                });
                return None;
            }

            warn!(
                failed = %retry_kinds,
                delay_secs = self.retry.delay.as_secs(),
                "job attempt failed, scheduling retry"
            );
            self.tracker.update(job.id, |r| {
                r.state = JobState::FailedRetrying;
                r.pending = retry_kinds.clone();
                r.last_error = last_error;
            });
            Some(IngestJob {
                kinds: retry_kinds,
                attempt: job.attempt + 1,
                ..job
            })
        }
        .instrument(span)
        .await
    }

    /// Runs a job to a settled state on the current task, sleeping between
    /// attempts.
    pub async fn run_inline(&self, company: CompanyProfile, kinds: ResourceSet) -> JobRecord {
        let mut job = IngestJob::new(company, kinds);
        let id = job.id;
        let registered = self.tracker.register(&job);
        while let Some(next) = self.process(job).await {
            tokio::time::sleep(self.retry.delay).await;
            job = next;
        }
        self.tracker.get(id).unwrap_or(registered)
    }

    fn schedule_retry(&self, job: IngestJob, handle: JobHandle) {
        let delay = self.retry.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let id = job.id;
            if handle.requeue(job).is_err() {
                warn!(job_id = %id, "job queue closed, dropping retry");
            }
        });
    }

    /// Starts `count` workers draining `receiver`. Each job is received by
    /// exactly one worker.
    pub fn spawn_workers(self: &Arc<Self>, count: usize, receiver: JobReceiver, handle: JobHandle) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| {
                let orchestrator = Arc::clone(self);
                let receiver = receiver.clone();
                let handle = handle.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.0.lock().await.recv().await;
                        let Some(job) = next else { break };
                        if let Some(retry) = orchestrator.process(job).await {
                            orchestrator.schedule_retry(retry, handle.clone());
                        }
                    }
                    debug!(worker, "job queue closed, worker exiting");
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use comscan_source::{Credential, CredentialRotator};
    use comscan_storage::{MemoryStore, RecordBatch, UpsertOutcome};

    use crate::testing::{acme, ScriptedSessions, ScriptedSource};

    async fn store_with_acme() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert(RecordBatch::Companies(vec![acme()]))
            .await
            .expect("seed company");
        store
    }

    fn sessions(source: &ScriptedSource, refuse: bool) -> Arc<SessionPool> {
        let rotator = CredentialRotator::new(vec![Credential::new("c1", "a"), Credential::new("c2", "b")])
            .expect("pool");
        Arc::new(SessionPool::new(
            Arc::new(ScriptedSessions {
                source: source.clone(),
                refuse,
            }),
            Arc::new(rotator),
        ))
    }

    fn orchestrator(source: &ScriptedSource, store: Arc<MemoryStore>, refuse: bool) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            sessions(source, refuse),
            store,
            EnrichmentThrottle::none(),
            JobTracker::new(),
        ))
    }

    fn start(orchestrator: &Arc<Orchestrator>, workers: usize) -> JobHandle {
        let (handle, receiver) = job_channel(orchestrator.tracker().clone());
        orchestrator.spawn_workers(workers, receiver, handle.clone());
        handle
    }

    fn kinds(list: &[ResourceKind]) -> ResourceSet {
        list.iter().copied().collect()
    }

    #[tokio::test]
    async fn enqueued_job_is_tracked_as_queued() {
        let (handle, _receiver) = job_channel(JobTracker::new());
        let id = handle.enqueue(acme(), kinds(&[ResourceKind::Jobs])).expect("enqueue");

        let record = handle.tracker().get(id).expect("record");
        assert_eq!(record.state, JobState::Queued);
        assert_eq!(record.requested, kinds(&[ResourceKind::Jobs]));
        assert_eq!(record.attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn three_failed_attempts_end_terminal() {
        let source = ScriptedSource::from_fixtures().failing_jobs(usize::MAX);
        let orchestrator = orchestrator(&source, store_with_acme().await, false);
        let handle = start(&orchestrator, 2);

        let id = handle.enqueue(acme(), kinds(&[ResourceKind::Jobs])).expect("enqueue");
        let record = handle.tracker().wait_until_settled(id).await.expect("settled");

        assert_eq!(record.state, JobState::FailedTerminal);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.pending, kinds(&[ResourceKind::Jobs]));
        assert!(record.last_error.is_some());

        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        assert_eq!(source.calls("jobs"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_third_attempt_completes() {
        let source = ScriptedSource::from_fixtures().failing_jobs(2);
        let store = store_with_acme().await;
        let orchestrator = orchestrator(&source, store.clone(), false);
        let handle = start(&orchestrator, 1);

        let id = handle.enqueue(acme(), kinds(&[ResourceKind::Jobs])).expect("enqueue");
        let record = handle.tracker().wait_until_settled(id).await.expect("settled");

        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.attempts, 3);

        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        assert_eq!(source.calls("jobs"), 3);
        assert_eq!(store.snapshot().await.jobs.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rerun_only_failed_kinds() {
        let source = ScriptedSource::from_fixtures().failing_jobs(1);
        let orchestrator = orchestrator(&source, store_with_acme().await, false);
        let handle = start(&orchestrator, 1);

        let id = handle
            .enqueue(acme(), kinds(&[ResourceKind::Jobs, ResourceKind::Posts]))
            .expect("enqueue");
        let record = handle.tracker().wait_until_settled(id).await.expect("settled");

        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.attempts, 2);
        assert_eq!(source.calls("jobs"), 2);
        assert_eq!(source.calls("posts"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_session_open_is_retried() {
        let source = ScriptedSource::from_fixtures();
        let orchestrator = orchestrator(&source, store_with_acme().await, true);
        let handle = start(&orchestrator, 1);

        let id = handle.enqueue(acme(), kinds(&[ResourceKind::Posts])).expect("enqueue");
        let record = handle.tracker().wait_until_settled(id).await.expect("settled");

        assert_eq!(record.state, JobState::FailedTerminal);
        assert_eq!(record.attempts, 3);
        assert_eq!(source.calls("posts"), 0);
    }

    #[tokio::test]
    async fn storage_failures_are_not_retried() {
        let source = ScriptedSource::from_fixtures();
        // No company row, so every child batch is rejected.
        let orchestrator = orchestrator(&source, Arc::new(MemoryStore::new()), false);

        let record = orchestrator.run_inline(acme(), kinds(&[ResourceKind::Posts])).await;

        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.attempts, 1);
        assert!(record.last_error.expect("error").contains("storage"));
    }

    #[tokio::test(start_paused = true)]
    async fn inline_run_waits_between_attempts() {
        let source = ScriptedSource::from_fixtures().failing_jobs(2);
        let orchestrator = orchestrator(&source, store_with_acme().await, false);

        let started = tokio::time::Instant::now();
        let record = orchestrator.run_inline(acme(), kinds(&[ResourceKind::Jobs])).await;

        assert_eq!(record.state, JobState::Completed);
        assert!(started.elapsed() >= Duration::from_secs(10 * 60));
    }

    #[tokio::test]
    async fn event_window_failure_still_persists_other_windows() {
        let source = ScriptedSource::from_fixtures().failing_window(comscan_source::EventWindow::Past);
        let store = store_with_acme().await;
        let orchestrator = orchestrator(&source, store.clone(), false);

        let record = orchestrator.run_inline(acme(), kinds(&[ResourceKind::Events])).await;

        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.attempts, 1);
        assert!(record.last_error.expect("partial failure").starts_with("events (partial)"));
        let tables = store.snapshot().await;
        assert_eq!(tables.events.len(), 2);
        assert!(tables.events.contains_key("9001"));
    }

    #[tokio::test]
    async fn employees_are_linked_to_the_company() {
        let source = ScriptedSource::from_fixtures();
        let store = store_with_acme().await;
        let orchestrator = orchestrator(&source, store.clone(), false);

        orchestrator.run_inline(acme(), kinds(&[ResourceKind::Employees])).await;
        orchestrator.run_inline(acme(), kinds(&[ResourceKind::Employees])).await;

        let tables = store.snapshot().await;
        assert_eq!(tables.employees.len(), 1);
        assert_eq!(tables.employment.len(), 1);
        assert!(tables.employment.contains(&(1441, "jane-doe".to_string())));
    }

    #[test]
    fn report_retries_only_retryable_failures() {
        let report = AttemptReport {
            session_error: None,
            outcomes: vec![
                (ResourceKind::Jobs, Err(IngestError::UpstreamUnavailable("503".into()))),
                (ResourceKind::Posts, Err(IngestError::StorageFailure("fk".into()))),
                (
                    ResourceKind::Events,
                    Ok(KindOutcome {
                        upserted: UpsertOutcome::default(),
                        degraded: Some(IngestError::UpstreamUnavailable("today".into())),
                    }),
                ),
            ],
        };
        let requested = ResourceSet::all();
        assert_eq!(report.retry_kinds(&requested), kinds(&[ResourceKind::Jobs]));
        assert!(report.last_error().expect("error").starts_with("posts"));
    }

    #[test]
    fn partial_outcome_is_reported_when_nothing_failed_outright() {
        let report = AttemptReport {
            session_error: None,
            outcomes: vec![
                (
                    ResourceKind::Employees,
                    Ok(KindOutcome {
                        upserted: UpsertOutcome::default(),
                        degraded: Some(IngestError::UpstreamUnavailable("429".into())),
                    }),
                ),
            ],
        };
        assert!(report.retry_kinds(&ResourceSet::all()).is_empty());
        assert_eq!(
            report.last_error().as_deref(),
            Some("employees (partial): upstream unavailable: 429")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn employee_enrichment_outage_retries_until_terminal() {
        let source = ScriptedSource::from_fixtures().failing_part(comscan_source::EmployeePart::Profile);
        let store = store_with_acme().await;
        let orchestrator = orchestrator(&source, store.clone(), false);

        let record = orchestrator.run_inline(acme(), kinds(&[ResourceKind::Employees])).await;

        assert_eq!(record.state, JobState::FailedTerminal);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.pending, kinds(&[ResourceKind::Employees]));
        assert!(record.last_error.expect("error").starts_with("employees: upstream unavailable"));
        assert_eq!(source.profile_calls("jane-doe"), 3);
        assert!(store.snapshot().await.employees.is_empty());
    }

    #[test]
    fn settled_records_past_retention_are_pruned() {
        let tracker = JobTracker::with_retention(Duration::ZERO);
        let done = IngestJob::new(acme(), kinds(&[ResourceKind::Jobs]));
        let running = IngestJob::new(acme(), kinds(&[ResourceKind::Posts]));
        tracker.register(&done);
        tracker.register(&running);
        tracker.update(done.id, |r| r.state = JobState::Completed);
        tracker.update(running.id, |r| r.state = JobState::Running);

        let next = IngestJob::new(acme(), kinds(&[ResourceKind::Events]));
        tracker.register(&next);

        assert!(tracker.get(done.id).is_none());
        assert_eq!(tracker.get(running.id).expect("running").state, JobState::Running);
        assert!(tracker.get(next.id).is_some());
        assert_eq!(tracker.snapshot().len(), 2);
    }

    #[test]
    fn settled_records_within_retention_are_kept() {
        let tracker = JobTracker::new();
        let done = IngestJob::new(acme(), kinds(&[ResourceKind::Jobs]));
        tracker.register(&done);
        tracker.update(done.id, |r| r.state = JobState::FailedTerminal);

        tracker.register(&IngestJob::new(acme(), kinds(&[ResourceKind::Posts])));

        assert_eq!(tracker.get(done.id).expect("kept").state, JobState::FailedTerminal);
    }
}
