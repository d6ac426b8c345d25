//! Core entity records, resource kinds and the ingestion error taxonomy for comscan.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "comscan-core";

/// Persisted entity kinds, one table each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Company,
    Job,
    Post,
    Event,
    Employee,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Company => "company",
            EntityKind::Job => "job",
            EntityKind::Post => "post",
            EntityKind::Event => "event",
            EntityKind::Employee => "employee",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Child resources an ingestion job can request. Declaration order is run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Jobs,
    Posts,
    Events,
    Employees,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Jobs,
        ResourceKind::Posts,
        ResourceKind::Events,
        ResourceKind::Employees,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Jobs => "jobs",
            ResourceKind::Posts => "posts",
            ResourceKind::Events => "events",
            ResourceKind::Employees => "employees",
        }
    }

    pub fn entity_kind(&self) -> EntityKind {
        match self {
            ResourceKind::Jobs => EntityKind::Job,
            ResourceKind::Posts => EntityKind::Post,
            ResourceKind::Events => EntityKind::Event,
            ResourceKind::Employees => EntityKind::Employee,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered set of requested resource kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSet(BTreeSet<ResourceKind>);

impl ResourceSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        ResourceKind::ALL.into_iter().collect()
    }

    pub fn from_flags(jobs: bool, posts: bool, employees: bool, events: bool) -> Self {
        let mut set = Self::empty();
        for (flag, kind) in [
            (jobs, ResourceKind::Jobs),
            (posts, ResourceKind::Posts),
            (events, ResourceKind::Events),
            (employees, ResourceKind::Employees),
        ] {
            if flag {
                set.insert(kind);
            }
        }
        set
    }

    pub fn insert(&mut self, kind: ResourceKind) -> bool {
        self.0.insert(kind)
    }

    pub fn contains(&self, kind: ResourceKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<ResourceKind> for ResourceSet {
    fn from_iter<I: IntoIterator<Item = ResourceKind>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ResourceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.iter().map(|k| k.as_str()).collect::<Vec<_>>();
        write!(f, "[{}]", names.join(","))
    }
}

/// A flat record with a stable primary key.
pub trait Record: Clone + Send + Sync + 'static {
    type Key: Ord + Clone + fmt::Debug + Send + Sync;
    const KIND: EntityKind;

    fn key(&self) -> Self::Key;

    /// Owning company for child records.
    fn company_id(&self) -> Option<i64> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompanyProfile {
    pub internal_id: i64,
    pub display_name: Option<String>,
    pub universal_name: Option<String>,
    pub link: Option<String>,
    pub website: Option<String>,
    pub address: Option<JsonValue>,
    pub employee_count: Option<i64>,
    pub specialities: Vec<String>,
    pub followers_count: Option<i64>,
    pub tagline: Option<String>,
    pub description: Option<String>,
    pub founded_year: Option<i32>,
    pub industry: Vec<String>,
}

impl Record for CompanyProfile {
    type Key = i64;
    const KIND: EntityKind = EntityKind::Company;

    fn key(&self) -> i64 {
        self.internal_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub job_id: i64,
    pub state: Option<String>,
    pub title: Option<String>,
    pub location: Option<String>,
    pub listed_at: Option<DateTime<Utc>>,
    pub expire_at: Option<DateTime<Utc>>,
    pub company_id: i64,
}

impl Record for JobPosting {
    type Key = i64;
    const KIND: EntityKind = EntityKind::Job;

    fn key(&self) -> i64 {
        self.job_id
    }

    fn company_id(&self) -> Option<i64> {
        Some(self.company_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyPost {
    pub link: String,
    pub content: JsonValue,
    pub commentary: Option<JsonValue>,
    pub company_id: i64,
}

impl Record for CompanyPost {
    type Key = String;
    const KIND: EntityKind = EntityKind::Post;

    fn key(&self) -> String {
        self.link.clone()
    }

    fn company_id(&self) -> Option<i64> {
        Some(self.company_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyEvent {
    pub event_id: String,
    pub state: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub display_time: Option<DateTime<Utc>>,
    pub attendee_count: Option<i64>,
    pub company_id: i64,
}

impl Record for CompanyEvent {
    type Key = String;
    const KIND: EntityKind = EntityKind::Event;

    fn key(&self) -> String {
        self.event_id.clone()
    }

    fn company_id(&self) -> Option<i64> {
        Some(self.company_id)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EmployeeProfile {
    pub public_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub headline: Option<String>,
    pub summary: Option<String>,
    pub industry_name: Option<String>,
    pub location_name: Option<String>,
    pub student: Option<bool>,
    pub geo_country_name: Option<String>,
    pub geo_location_name: Option<String>,
    pub experience: Vec<JsonValue>,
    pub education: Vec<JsonValue>,
    pub languages: Vec<JsonValue>,
    pub publications: Vec<JsonValue>,
    pub certifications: Vec<JsonValue>,
    pub volunteer: Vec<JsonValue>,
    pub honors: Vec<JsonValue>,
    pub skills: Vec<String>,
    pub email_address: Option<String>,
    pub websites: Vec<JsonValue>,
    pub twitter: Vec<JsonValue>,
    pub birthdate: Option<JsonValue>,
    pub phone_numbers: Vec<JsonValue>,
    pub followable: Option<bool>,
    pub followers_count: Option<i64>,
    pub connections_count: Option<i64>,
}

impl Record for EmployeeProfile {
    type Key = String;
    const KIND: EntityKind = EntityKind::Employee;

    fn key(&self) -> String {
        self.public_id.clone()
    }
}

/// Failure taxonomy shared by resolution, fetching, storage and jobs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("invalid company identifier: {0}")]
    InvalidIdentifier(String),
    #[error("unknown company: {0}")]
    UnknownCompany(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("storage failure: {0}")]
    StorageFailure(String),
    #[error("malformed upstream payload: {0}")]
    MalformedPayload(String),
}

impl IngestError {
    /// Whether an ingestion job should schedule another attempt for this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::UpstreamUnavailable(_))
    }

    /// Whether the failure is the caller's fault rather than infrastructure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            IngestError::InvalidIdentifier(_) | IngestError::UnknownCompany(_)
        )
    }
}
