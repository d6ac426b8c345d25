//! Postgres backend. Each batch runs in one transaction guarded by a per-kind
//! advisory lock, so concurrent batches of the same kind never interleave their
//! insert/update decisions.

use std::collections::HashSet;

use async_trait::async_trait;
use comscan_core::{
    CompanyEvent, CompanyPost, CompanyProfile, EmployeeProfile, EntityKind, JobPosting, Record,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info_span, Instrument};

use crate::{partition_by_key, RecordBatch, RecordStore, StorageError, UpsertOutcome};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn advisory_lock_key(kind: EntityKind) -> i64 {
    let offset = match kind {
        EntityKind::Company => 1,
        EntityKind::Job => 2,
        EntityKind::Post => 3,
        EntityKind::Event => 4,
        EntityKind::Employee => 5,
    };
    0x636f_6d73_0000 + offset
}

async fn ensure_company(conn: &mut PgConnection, company_id: i64, kind: EntityKind) -> Result<(), StorageError> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM companies WHERE internal_id = $1)")
            .bind(company_id)
            .fetch_one(&mut *conn)
            .await?;
    if exists {
        Ok(())
    } else {
        Err(StorageError::MissingCompany { company_id, kind })
    }
}

async fn ensure_owners<R: Record>(conn: &mut PgConnection, records: &[R]) -> Result<(), StorageError> {
    let owners = records
        .iter()
        .filter_map(Record::company_id)
        .collect::<HashSet<_>>();
    for company_id in owners {
        ensure_company(conn, company_id, R::KIND).await?;
    }
    Ok(())
}

async fn existing_i64_keys(
    conn: &mut PgConnection,
    sql: &str,
    keys: Vec<i64>,
) -> Result<HashSet<i64>, StorageError> {
    let rows: Vec<i64> = sqlx::query_scalar(sql).bind(keys).fetch_all(&mut *conn).await?;
    Ok(rows.into_iter().collect())
}

async fn existing_text_keys(
    conn: &mut PgConnection,
    sql: &str,
    keys: Vec<String>,
) -> Result<HashSet<String>, StorageError> {
    let rows: Vec<String> = sqlx::query_scalar(sql).bind(keys).fetch_all(&mut *conn).await?;
    Ok(rows.into_iter().collect())
}

async fn upsert_companies(
    conn: &mut PgConnection,
    records: Vec<CompanyProfile>,
) -> Result<UpsertOutcome, StorageError> {
    let pending = partition_by_key(records);
    let existing = existing_i64_keys(
        conn,
        "SELECT internal_id FROM companies WHERE internal_id = ANY($1) FOR UPDATE",
        pending.keys().copied().collect(),
    )
    .await?;

    let mut outcome = UpsertOutcome::default();
    for (key, c) in pending {
        let sql = if existing.contains(&key) {
            outcome.updated += 1;
            r#"
            UPDATE companies
               SET display_name = $2, universal_name = $3, link = $4, website = $5,
                   address = $6, employee_count = $7, specialities = $8,
                   followers_count = $9, tagline = $10, description = $11,
                   founded_year = $12, industry = $13, updated_at = NOW()
             WHERE internal_id = $1
            "#
        } else {
            outcome.inserted += 1;
            r#"
            INSERT INTO companies (
                internal_id, display_name, universal_name, link, website, address,
                employee_count, specialities, followers_count, tagline, description,
                founded_year, industry
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#
        };
        sqlx::query(sql)
            .bind(c.internal_id)
            .bind(&c.display_name)
            .bind(&c.universal_name)
            .bind(&c.link)
            .bind(&c.website)
            .bind(&c.address)
            .bind(c.employee_count)
            .bind(&c.specialities)
            .bind(c.followers_count)
            .bind(&c.tagline)
            .bind(&c.description)
            .bind(c.founded_year)
            .bind(&c.industry)
            .execute(&mut *conn)
            .await?;
    }
    Ok(outcome)
}

async fn upsert_jobs(conn: &mut PgConnection, records: Vec<JobPosting>) -> Result<UpsertOutcome, StorageError> {
    ensure_owners(conn, &records).await?;
    let pending = partition_by_key(records);
    let existing = existing_i64_keys(
        conn,
        "SELECT job_id FROM job_postings WHERE job_id = ANY($1) FOR UPDATE",
        pending.keys().copied().collect(),
    )
    .await?;

    let mut outcome = UpsertOutcome::default();
    for (key, job) in pending {
        let sql = if existing.contains(&key) {
            outcome.updated += 1;
            r#"
            UPDATE job_postings
               SET state = $2, title = $3, location = $4, listed_at = $5,
                   expire_at = $6, company_id = $7
             WHERE job_id = $1
            "#
        } else {
            outcome.inserted += 1;
            r#"
            INSERT INTO job_postings (job_id, state, title, location, listed_at, expire_at, company_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#
        };
        sqlx::query(sql)
            .bind(job.job_id)
            .bind(&job.state)
            .bind(&job.title)
            .bind(&job.location)
            .bind(job.listed_at)
            .bind(job.expire_at)
            .bind(job.company_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(outcome)
}

async fn upsert_posts(conn: &mut PgConnection, records: Vec<CompanyPost>) -> Result<UpsertOutcome, StorageError> {
    ensure_owners(conn, &records).await?;
    let pending = partition_by_key(records);
    let existing = existing_text_keys(
        conn,
        "SELECT link FROM company_posts WHERE link = ANY($1) FOR UPDATE",
        pending.keys().cloned().collect(),
    )
    .await?;

    let mut outcome = UpsertOutcome::default();
    for (key, post) in pending {
        let sql = if existing.contains(&key) {
            outcome.updated += 1;
            "UPDATE company_posts SET content = $2, commentary = $3, company_id = $4 WHERE link = $1"
        } else {
            outcome.inserted += 1;
            "INSERT INTO company_posts (link, content, commentary, company_id) VALUES ($1, $2, $3, $4)"
        };
        sqlx::query(sql)
            .bind(&post.link)
            .bind(&post.content)
            .bind(&post.commentary)
            .bind(post.company_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(outcome)
}

async fn upsert_events(conn: &mut PgConnection, records: Vec<CompanyEvent>) -> Result<UpsertOutcome, StorageError> {
    ensure_owners(conn, &records).await?;
    let pending = partition_by_key(records);
    let existing = existing_text_keys(
        conn,
        "SELECT event_id FROM company_events WHERE event_id = ANY($1) FOR UPDATE",
        pending.keys().cloned().collect(),
    )
    .await?;

    let mut outcome = UpsertOutcome::default();
    for (key, event) in pending {
        let sql = if existing.contains(&key) {
            outcome.updated += 1;
            r#"
            UPDATE company_events
               SET state = $2, name = $3, description = $4, display_time = $5,
                   attendee_count = $6, company_id = $7
             WHERE event_id = $1
            "#
        } else {
            outcome.inserted += 1;
            r#"
            INSERT INTO company_events (event_id, state, name, description, display_time, attendee_count, company_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#
        };
        sqlx::query(sql)
            .bind(&event.event_id)
            .bind(&event.state)
            .bind(&event.name)
            .bind(&event.description)
            .bind(event.display_time)
            .bind(event.attendee_count)
            .bind(event.company_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(outcome)
}

async fn upsert_employees(
    conn: &mut PgConnection,
    company_id: i64,
    records: Vec<EmployeeProfile>,
) -> Result<UpsertOutcome, StorageError> {
    ensure_company(conn, company_id, EntityKind::Employee).await?;
    let pending = partition_by_key(records);
    let keys = pending.keys().cloned().collect::<Vec<_>>();
    let existing = existing_text_keys(
        conn,
        "SELECT public_id FROM employees WHERE public_id = ANY($1) FOR UPDATE",
        keys.clone(),
    )
    .await?;

    let mut outcome = UpsertOutcome::default();
    for (key, e) in pending {
        let sql = if existing.contains(&key) {
            outcome.updated += 1;
            r#"
            UPDATE employees
               SET first_name = $2, last_name = $3, headline = $4, summary = $5,
                   industry_name = $6, location_name = $7, student = $8,
                   geo_country_name = $9, geo_location_name = $10, experience = $11,
                   education = $12, languages = $13, publications = $14,
                   certifications = $15, volunteer = $16, honors = $17, skills = $18,
                   email_address = $19, websites = $20, twitter = $21, birthdate = $22,
                   phone_numbers = $23, followable = $24, followers_count = $25,
                   connections_count = $26
             WHERE public_id = $1
            "#
        } else {
            outcome.inserted += 1;
            r#"
            INSERT INTO employees (
                public_id, first_name, last_name, headline, summary, industry_name,
                location_name, student, geo_country_name, geo_location_name, experience,
                education, languages, publications, certifications, volunteer, honors,
                skills, email_address, websites, twitter, birthdate, phone_numbers,
                followable, followers_count, connections_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26)
            "#
        };
        sqlx::query(sql)
            .bind(&e.public_id)
            .bind(&e.first_name)
            .bind(&e.last_name)
            .bind(&e.headline)
            .bind(&e.summary)
            .bind(&e.industry_name)
            .bind(&e.location_name)
            .bind(e.student)
            .bind(&e.geo_country_name)
            .bind(&e.geo_location_name)
            .bind(Json(&e.experience))
            .bind(Json(&e.education))
            .bind(Json(&e.languages))
            .bind(Json(&e.publications))
            .bind(Json(&e.certifications))
            .bind(Json(&e.volunteer))
            .bind(Json(&e.honors))
            .bind(&e.skills)
            .bind(&e.email_address)
            .bind(Json(&e.websites))
            .bind(Json(&e.twitter))
            .bind(&e.birthdate)
            .bind(Json(&e.phone_numbers))
            .bind(e.followable)
            .bind(e.followers_count)
            .bind(e.connections_count)
            .execute(&mut *conn)
            .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO employment_records (company_id, employee_id)
        SELECT $1, unnest($2::text[])
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(company_id)
    .bind(keys)
    .execute(&mut *conn)
    .await?;

    Ok(outcome)
}

fn company_from_row(row: &PgRow) -> Result<CompanyProfile, StorageError> {
    Ok(CompanyProfile {
        internal_id: row.try_get("internal_id")?,
        display_name: row.try_get("display_name")?,
        universal_name: row.try_get("universal_name")?,
        link: row.try_get("link")?,
        website: row.try_get("website")?,
        address: row.try_get::<Option<JsonValue>, _>("address")?,
        employee_count: row.try_get("employee_count")?,
        specialities: row.try_get("specialities")?,
        followers_count: row.try_get("followers_count")?,
        tagline: row.try_get("tagline")?,
        description: row.try_get("description")?,
        founded_year: row.try_get("founded_year")?,
        industry: row.try_get("industry")?,
    })
}

const COMPANY_COLUMNS: &str = r#"
    internal_id, display_name, universal_name, link, website, address, employee_count,
    specialities, followers_count, tagline, description, founded_year, industry
"#;

#[async_trait]
impl RecordStore for PgStore {
    async fn upsert(&self, batch: RecordBatch) -> Result<UpsertOutcome, StorageError> {
        let kind = batch.kind();
        let size = batch.len();
        let span = info_span!("pg_upsert", %kind, size);

        async move {
            let mut tx = self.pool.begin().await?;
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(advisory_lock_key(kind))
                .execute(&mut *tx)
                .await?;

            let outcome = match batch {
                RecordBatch::Companies(records) => upsert_companies(&mut tx, records).await?,
                RecordBatch::Jobs(records) => upsert_jobs(&mut tx, records).await?,
                RecordBatch::Posts(records) => upsert_posts(&mut tx, records).await?,
                RecordBatch::Events(records) => upsert_events(&mut tx, records).await?,
                RecordBatch::Employees {
                    company_id,
                    records,
                } => upsert_employees(&mut tx, company_id, records).await?,
            };

            tx.commit().await?;
            debug!(inserted = outcome.inserted, updated = outcome.updated, "batch committed");
            Ok::<_, StorageError>(outcome)
        }
        .instrument(span)
        .await
    }

    async fn company(&self, internal_id: i64) -> Result<Option<CompanyProfile>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {COMPANY_COLUMNS} FROM companies WHERE internal_id = $1"
        ))
        .bind(internal_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(company_from_row).transpose()
    }

    async fn list_companies(&self) -> Result<Vec<CompanyProfile>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {COMPANY_COLUMNS} FROM companies ORDER BY internal_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(company_from_row).collect()
    }
}
