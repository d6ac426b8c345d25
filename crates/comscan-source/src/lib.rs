//! Outbound fetch capability: the `CompanySource` contract, its HTTP-backed
//! implementation, session auth + credential rotation, payload normalization
//! and company identity resolution.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use comscan_core::IngestError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub mod auth;
pub mod http;
pub mod identity;
pub mod normalize;
pub mod voyager;

pub use auth::{AuthHeaderProvider, Credential, CredentialError, CredentialRotator, SessionCookieAuth};
pub use http::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, SimpleTokenBucket};
pub use identity::{company_slug_from_link, resolve_company, universal_name_for, IdentityResolver};
pub use normalize::EmployeeParts;
pub use voyager::{VoyagerClient, VoyagerConfig, VoyagerSessions};

pub const CRATE_NAME: &str = "comscan-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("session unavailable: {0}")]
    Session(String),
}

impl From<SourceError> for IngestError {
    fn from(err: SourceError) -> Self {
        IngestError::UpstreamUnavailable(err.to_string())
    }
}

/// Listing windows the events endpoint partitions a company's events into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventWindow {
    Upcoming,
    Today,
    Past,
}

impl EventWindow {
    pub const ALL: [EventWindow; 3] = [EventWindow::Upcoming, EventWindow::Today, EventWindow::Past];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventWindow::Upcoming => "UPCOMING",
            EventWindow::Today => "TODAY",
            EventWindow::Past => "PAST",
        }
    }
}

impl fmt::Display for EventWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four per-person enrichment lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmployeePart {
    Profile,
    ContactInfo,
    NetworkInfo,
    Skills,
}

impl EmployeePart {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmployeePart::Profile => "profile",
            EmployeePart::ContactInfo => "contact_info",
            EmployeePart::NetworkInfo => "network_info",
            EmployeePart::Skills => "skills",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSearch {
    pub keywords: String,
    pub company_id: i64,
    pub listed_within: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeopleSearch {
    pub keywords: String,
    pub company_id: i64,
}

/// Raw access to the remote site. Every method returns undecoded payload
/// objects; an empty Vec means the site legitimately had nothing.
#[async_trait]
pub trait CompanySource: Send + Sync {
    async fn company_by_universal_name(&self, universal_name: &str) -> Result<Vec<JsonValue>, SourceError>;

    async fn search_jobs(&self, search: &JobSearch) -> Result<Vec<JsonValue>, SourceError>;

    async fn company_updates(&self, universal_name: &str) -> Result<Vec<JsonValue>, SourceError>;

    async fn company_events(
        &self,
        universal_name: &str,
        window: EventWindow,
    ) -> Result<Vec<JsonValue>, SourceError>;

    async fn search_people(&self, search: &PeopleSearch) -> Result<Vec<JsonValue>, SourceError>;

    async fn employee_part(&self, public_id: &str, part: EmployeePart) -> Result<JsonValue, SourceError>;
}

/// Opens a `CompanySource` bound to one credential.
pub trait SessionFactory: Send + Sync {
    fn open(&self, credential: &Credential) -> Result<Arc<dyn CompanySource>, SourceError>;
}

/// Hands out sessions round-robin across the credential pool.
#[derive(Clone)]
pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    rotator: Arc<CredentialRotator>,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, rotator: Arc<CredentialRotator>) -> Self {
        Self { factory, rotator }
    }

    pub fn rotator(&self) -> &Arc<CredentialRotator> {
        &self.rotator
    }

    pub fn next_session(&self) -> Result<Arc<dyn CompanySource>, SourceError> {
        let credential = self.rotator.next();
        debug!(login = %credential.login(), "opening source session");
        self.factory.open(&credential)
    }
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("credentials", &self.rotator.len())
            .finish()
    }
}
