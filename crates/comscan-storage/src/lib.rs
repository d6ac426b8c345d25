//! Keyed upsert engine for comscan records, with in-memory and Postgres backends.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use comscan_core::{
    CompanyEvent, CompanyPost, CompanyProfile, EmployeeProfile, EntityKind, IngestError, JobPosting,
    Record,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

mod postgres;

pub use postgres::PgStore;

pub const CRATE_NAME: &str = "comscan-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("company {company_id} is not stored; refusing {kind} batch")]
    MissingCompany { company_id: i64, kind: EntityKind },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<StorageError> for IngestError {
    fn from(err: StorageError) -> Self {
        IngestError::StorageFailure(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertOutcome {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

/// One entity kind's worth of records, applied atomically.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBatch {
    Companies(Vec<CompanyProfile>),
    Jobs(Vec<JobPosting>),
    Posts(Vec<CompanyPost>),
    Events(Vec<CompanyEvent>),
    /// Employees are linked to `company_id` through the association table.
    Employees {
        company_id: i64,
        records: Vec<EmployeeProfile>,
    },
}

impl RecordBatch {
    pub fn kind(&self) -> EntityKind {
        match self {
            RecordBatch::Companies(_) => EntityKind::Company,
            RecordBatch::Jobs(_) => EntityKind::Job,
            RecordBatch::Posts(_) => EntityKind::Post,
            RecordBatch::Events(_) => EntityKind::Event,
            RecordBatch::Employees { .. } => EntityKind::Employee,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RecordBatch::Companies(r) => r.len(),
            RecordBatch::Jobs(r) => r.len(),
            RecordBatch::Posts(r) => r.len(),
            RecordBatch::Events(r) => r.len(),
            RecordBatch::Employees { records, .. } => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Key the batch, last occurrence of a duplicated key wins.
pub fn partition_by_key<R: Record>(records: Vec<R>) -> BTreeMap<R::Key, R> {
    let mut pending = BTreeMap::new();
    for record in records {
        pending.insert(record.key(), record);
    }
    pending
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert-or-replace every record in the batch as one transaction.
    async fn upsert(&self, batch: RecordBatch) -> Result<UpsertOutcome, StorageError>;

    async fn company(&self, internal_id: i64) -> Result<Option<CompanyProfile>, StorageError>;

    async fn list_companies(&self) -> Result<Vec<CompanyProfile>, StorageError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTables {
    pub companies: BTreeMap<i64, CompanyProfile>,
    pub jobs: BTreeMap<i64, JobPosting>,
    pub posts: BTreeMap<String, CompanyPost>,
    pub events: BTreeMap<String, CompanyEvent>,
    pub employees: BTreeMap<String, EmployeeProfile>,
    pub employment: BTreeSet<(i64, String)>,
}

/// Process-local store. The table mutex is the batch commit boundary.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> MemoryTables {
        self.tables.lock().await.clone()
    }
}

fn ensure_owners<'a, R: Record>(
    companies: &BTreeMap<i64, CompanyProfile>,
    records: impl IntoIterator<Item = &'a R>,
) -> Result<(), StorageError> {
    for record in records {
        if let Some(company_id) = record.company_id() {
            if !companies.contains_key(&company_id) {
                return Err(StorageError::MissingCompany {
                    company_id,
                    kind: R::KIND,
                });
            }
        }
    }
    Ok(())
}

fn merge_into<R: Record>(table: &mut BTreeMap<R::Key, R>, records: Vec<R>) -> UpsertOutcome {
    let mut pending = partition_by_key(records);
    let existing = pending
        .keys()
        .filter(|key| table.contains_key(*key))
        .cloned()
        .collect::<Vec<_>>();

    let mut outcome = UpsertOutcome::default();
    for key in existing {
        if let Some(record) = pending.remove(&key) {
            table.insert(key, record);
            outcome.updated += 1;
        }
    }
    for (key, record) in pending {
        table.insert(key, record);
        outcome.inserted += 1;
    }
    outcome
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert(&self, batch: RecordBatch) -> Result<UpsertOutcome, StorageError> {
        let kind = batch.kind();
        let mut tables = self.tables.lock().await;
        let outcome = match batch {
            RecordBatch::Companies(records) => merge_into(&mut tables.companies, records),
            RecordBatch::Jobs(records) => {
                ensure_owners(&tables.companies, &records)?;
                merge_into(&mut tables.jobs, records)
            }
            RecordBatch::Posts(records) => {
                ensure_owners(&tables.companies, &records)?;
                merge_into(&mut tables.posts, records)
            }
            RecordBatch::Events(records) => {
                ensure_owners(&tables.companies, &records)?;
                merge_into(&mut tables.events, records)
            }
            RecordBatch::Employees {
                company_id,
                records,
            } => {
                if !tables.companies.contains_key(&company_id) {
                    return Err(StorageError::MissingCompany {
                        company_id,
                        kind: EntityKind::Employee,
                    });
                }
                let keys = records.iter().map(Record::key).collect::<Vec<_>>();
                let outcome = merge_into(&mut tables.employees, records);
                for key in keys {
                    tables.employment.insert((company_id, key));
                }
                outcome
            }
        };
        debug!(%kind, inserted = outcome.inserted, updated = outcome.updated, "memory upsert committed");
        Ok(outcome)
    }

    async fn company(&self, internal_id: i64) -> Result<Option<CompanyProfile>, StorageError> {
        Ok(self.tables.lock().await.companies.get(&internal_id).cloned())
    }

    async fn list_companies(&self) -> Result<Vec<CompanyProfile>, StorageError> {
        Ok(self.tables.lock().await.companies.values().cloned().collect())
    }
}
