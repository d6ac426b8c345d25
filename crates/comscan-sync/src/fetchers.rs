//! Per-kind fetch + normalize. Each fetcher returns the records for one
//! company; empty remote results are an empty Vec. Events and employees
//! tolerate isolated failures and report the last one they skipped.

use std::collections::HashSet;
use std::time::Duration;

use comscan_core::{
    CompanyEvent, CompanyPost, CompanyProfile, EmployeeProfile, IngestError, JobPosting, ResourceKind,
};
use comscan_source::normalize::{self, EmployeeParts};
use comscan_source::{CompanySource, EmployeePart, EventWindow, JobSearch, PeopleSearch, SimpleTokenBucket};
use comscan_storage::{RecordBatch, RecordStore, UpsertOutcome};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

pub const JOB_LISTING_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Pacing for per-person enrichment calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrichmentThrottle {
    /// Wait before the first enrichment call of a company.
    pub pause: Duration,
    /// Persons enriched at once.
    pub concurrency: usize,
    /// Minimum gap between any two enrichment calls.
    pub min_spacing: Duration,
}

impl Default for EnrichmentThrottle {
    fn default() -> Self {
        Self {
            pause: Duration::from_secs(30),
            concurrency: 2,
            min_spacing: Duration::from_millis(1500),
        }
    }
}

impl EnrichmentThrottle {
    pub fn none() -> Self {
        Self {
            pause: Duration::ZERO,
            concurrency: 1,
            min_spacing: Duration::ZERO,
        }
    }
}

/// Records for one kind plus the last isolated failure skipped on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<R> {
    pub records: Vec<R>,
    pub skipped: Option<IngestError>,
}

impl<R> Fetched<R> {
    fn complete(records: Vec<R>) -> Self {
        Self { records, skipped: None }
    }
}

/// What one kind persisted, and whether part of it was skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct KindOutcome {
    pub upserted: UpsertOutcome,
    pub degraded: Option<IngestError>,
}

fn universal_name(company: &CompanyProfile) -> Result<&str, IngestError> {
    company.universal_name.as_deref().ok_or_else(|| {
        IngestError::MalformedPayload(format!("company {} has no universal name", company.internal_id))
    })
}

pub async fn fetch_jobs(source: &dyn CompanySource, company: &CompanyProfile) -> Result<Vec<JobPosting>, IngestError> {
    let search = JobSearch {
        keywords: company.display_name.clone().unwrap_or_default(),
        company_id: company.internal_id,
        listed_within: JOB_LISTING_WINDOW,
    };
    let raw = source.search_jobs(&search).await?;
    let total = raw.len();
    let jobs: Vec<JobPosting> = raw
        .iter()
        .filter(|item| normalize::job_company_id(item) == Some(company.internal_id))
        .filter_map(|item| normalize::job_posting(item, company.internal_id))
        .collect();
    debug!(total, kept = jobs.len(), "filtered job listings by company");
    Ok(jobs)
}

pub async fn fetch_posts(source: &dyn CompanySource, company: &CompanyProfile) -> Result<Vec<CompanyPost>, IngestError> {
    let raw = source.company_updates(universal_name(company)?).await?;
    Ok(raw
        .iter()
        .filter(|item| normalize::has_post_content(item))
        .filter_map(|item| normalize::company_post(item, company.internal_id))
        .collect())
}

/// Queries every listing window separately; a failing window is logged and
/// skipped. Only when all windows fail is the last error returned.
pub async fn fetch_events(
    source: &dyn CompanySource,
    company: &CompanyProfile,
) -> Result<Fetched<CompanyEvent>, IngestError> {
    let universal_name = universal_name(company)?;
    let mut events = Vec::new();
    let mut last_error = None;
    let mut failed_windows = 0usize;

    for window in EventWindow::ALL {
        match source.company_events(universal_name, window).await {
            Ok(raw) => events.extend(
                raw.iter()
                    .filter_map(|item| normalize::company_event(item, window, company.internal_id)),
            ),
            Err(err) => {
                warn!(%window, error = %err, "event window fetch failed");
                failed_windows += 1;
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(err) if failed_windows == EventWindow::ALL.len() => Err(err.into()),
        skipped => Ok(Fetched {
            records: events,
            skipped: skipped.map(IngestError::from),
        }),
    }
}

async fn optional_part(
    source: &dyn CompanySource,
    bucket: &SimpleTokenBucket,
    public_id: &str,
    part: EmployeePart,
) -> Option<serde_json::Value> {
    bucket.take().await;
    match source.employee_part(public_id, part).await {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(public_id, part = part.as_str(), error = %err, "employee enrichment call failed");
            None
        }
    }
}

async fn enrich_employee(
    source: &dyn CompanySource,
    bucket: &SimpleTokenBucket,
    public_id: String,
) -> Result<EmployeeProfile, IngestError> {
    bucket.take().await;
    let profile = source
        .employee_part(&public_id, EmployeePart::Profile)
        .await
        .inspect_err(|err| warn!(%public_id, error = %err, "profile lookup failed, skipping employee"))?;
    let parts = EmployeeParts {
        profile,
        contact: optional_part(source, bucket, &public_id, EmployeePart::ContactInfo).await,
        network: optional_part(source, bucket, &public_id, EmployeePart::NetworkInfo).await,
        skills: optional_part(source, bucket, &public_id, EmployeePart::Skills).await,
    };
    Ok(normalize::employee_profile(&public_id, &parts))
}

pub async fn fetch_employees(
    source: &dyn CompanySource,
    company: &CompanyProfile,
    throttle: &EnrichmentThrottle,
) -> Result<Fetched<EmployeeProfile>, IngestError> {
    let hits = source
        .search_people(&PeopleSearch {
            keywords: company.display_name.clone().unwrap_or_default(),
            company_id: company.internal_id,
        })
        .await?;

    let mut seen = HashSet::new();
    let ids: Vec<String> = hits
        .iter()
        .filter_map(normalize::employee_public_id)
        .filter(|id| seen.insert(id.clone()))
        .collect();
    if ids.is_empty() {
        return Ok(Fetched::complete(Vec::new()));
    }

    info!(candidates = ids.len(), pause_secs = throttle.pause.as_secs(), "enriching employees");
    if !throttle.pause.is_zero() {
        tokio::time::sleep(throttle.pause).await;
    }

    let bucket = SimpleTokenBucket::new(1, throttle.min_spacing);
    let enriched: Vec<Result<EmployeeProfile, IngestError>> = stream::iter(ids)
        .map(|id| enrich_employee(source, &bucket, id))
        .buffer_unordered(throttle.concurrency.max(1))
        .collect()
        .await;

    let attempted = enriched.len();
    let mut records = Vec::with_capacity(attempted);
    let mut failed = 0usize;
    let mut skipped = None;
    for result in enriched {
        match result {
            Ok(employee) => records.push(employee),
            Err(err) => {
                failed += 1;
                skipped = Some(err);
            }
        }
    }

    match skipped {
        Some(err) if failed == attempted => Err(err),
        skipped => {
            if failed > 0 {
                warn!(failed, attempted, "some employees could not be enriched");
            }
            Ok(Fetched { records, skipped })
        }
    }
}

/// Fetches one kind for `company` and upserts it as a single batch.
pub async fn ingest_kind(
    source: &dyn CompanySource,
    store: &dyn RecordStore,
    company: &CompanyProfile,
    kind: ResourceKind,
    throttle: &EnrichmentThrottle,
) -> Result<KindOutcome, IngestError> {
    let (batch, degraded) = match kind {
        ResourceKind::Jobs => (RecordBatch::Jobs(fetch_jobs(source, company).await?), None),
        ResourceKind::Posts => (RecordBatch::Posts(fetch_posts(source, company).await?), None),
        ResourceKind::Events => {
            let fetched = fetch_events(source, company).await?;
            (RecordBatch::Events(fetched.records), fetched.skipped)
        }
        ResourceKind::Employees => {
            let fetched = fetch_employees(source, company, throttle).await?;
            let batch = RecordBatch::Employees {
                company_id: company.internal_id,
                records: fetched.records,
            };
            (batch, fetched.skipped)
        }
    };
    let upserted = store.upsert(batch).await?;
    Ok(KindOutcome { upserted, degraded })
}
