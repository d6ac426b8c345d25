//! `CompanySource` backed by the site's JSON API.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::auth::{AuthHeaderProvider, Credential, SessionCookieAuth};
use crate::http::HttpFetcher;
use crate::normalize::is_job_posting;
use crate::{CompanySource, EmployeePart, EventWindow, JobSearch, PeopleSearch, SessionFactory, SourceError};

pub const DEFAULT_BASE_URL: &str = "https://www.linkedin.com/voyager/api";

const COMPANY_DECORATION: &str = "com.linkedin.voyager.dash.deco.organization.MemberCompany-65";
const JOB_HIT_DECORATION: &str = "com.linkedin.voyager.deco.jserp.WebJobSearchHitWithSalary-25";
const EVENT_DECORATION: &str = "com.linkedin.voyager.dash.deco.events.WebListedOrganizationEvent-6";

#[derive(Debug, Clone)]
pub struct VoyagerConfig {
    pub base_url: String,
    pub page_size: usize,
    pub max_results: usize,
}

impl Default for VoyagerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            page_size: 49,
            max_results: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VoyagerClient {
    http: Arc<HttpFetcher>,
    auth: Arc<dyn AuthHeaderProvider>,
    config: VoyagerConfig,
}

/// One page of a paginated listing: the items to keep and the raw page length
/// used to detect the last page.
struct Page {
    items: Vec<JsonValue>,
    raw_len: usize,
}

fn elements(body: &JsonValue) -> Vec<JsonValue> {
    body.get("elements")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default()
}

fn job_page(body: JsonValue) -> Page {
    let raw_len = body.get("elements").and_then(JsonValue::as_array).map_or(0, Vec::len);
    let items = body
        .get("included")
        .and_then(JsonValue::as_array)
        .map(|included| included.iter().filter(|v| is_job_posting(v)).cloned().collect())
        .unwrap_or_default();
    Page { items, raw_len }
}

fn element_page(body: JsonValue) -> Page {
    let items = elements(&body);
    Page {
        raw_len: items.len(),
        items,
    }
}

/// Blended search nests hits one level down inside each cluster.
fn people_page(body: JsonValue) -> Page {
    let clusters = elements(&body);
    let items: Vec<JsonValue> = clusters.iter().flat_map(elements).collect();
    Page {
        raw_len: items.len(),
        items,
    }
}

impl VoyagerClient {
    pub fn new(http: Arc<HttpFetcher>, auth: Arc<dyn AuthHeaderProvider>, config: VoyagerConfig) -> Self {
        Self { http, auth, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get(&self, endpoint: &str, path: &str, query: &[(&str, String)]) -> Result<JsonValue, SourceError> {
        let headers = self.auth.headers()?;
        Ok(self.http.get_json(endpoint, &self.url(path), query, headers).await?)
    }

    async fn paged(
        &self,
        endpoint: &str,
        path: &str,
        query: Vec<(&str, String)>,
        extract: fn(JsonValue) -> Page,
    ) -> Result<Vec<JsonValue>, SourceError> {
        let count = self.config.page_size.max(1);
        let mut collected = Vec::new();
        let mut start = 0usize;
        loop {
            let mut page_query = query.clone();
            page_query.push(("count", count.to_string()));
            page_query.push(("start", start.to_string()));

            let page = extract(self.get(endpoint, path, &page_query).await?);
            collected.extend(page.items);
            start += count;
            if page.raw_len < count || collected.len() >= self.config.max_results {
                break;
            }
        }
        collected.truncate(self.config.max_results);
        debug!(endpoint, results = collected.len(), "paged listing complete");
        Ok(collected)
    }
}

#[async_trait]
impl CompanySource for VoyagerClient {
    async fn company_by_universal_name(&self, universal_name: &str) -> Result<Vec<JsonValue>, SourceError> {
        let body = self
            .get(
                "company",
                "/voyagerOrganizationDashCompanies",
                &[
                    ("decorationId", COMPANY_DECORATION.to_string()),
                    ("q", "universalName".to_string()),
                    ("universalName", universal_name.to_string()),
                ],
            )
            .await?;
        Ok(elements(&body))
    }

    async fn search_jobs(&self, search: &JobSearch) -> Result<Vec<JsonValue>, SourceError> {
        let filters = format!(
            "List(f_C->{},f_TPR->r{},resultType->JOBS)",
            search.company_id,
            search.listed_within.as_secs()
        );
        let query = vec![
            ("decorationId", JOB_HIT_DECORATION.to_string()),
            ("q", "jserpFilters".to_string()),
            ("keywords", search.keywords.clone()),
            ("filters", filters),
            ("queryContext", "List(primaryHitType->JOBS,spellCorrectionEnabled->true)".to_string()),
            ("origin", "JOB_SEARCH_PAGE_QUERY_EXPANSION".to_string()),
        ];
        self.paged("jobs", "/search/hits", query, job_page).await
    }

    async fn company_updates(&self, universal_name: &str) -> Result<Vec<JsonValue>, SourceError> {
        let query = vec![
            ("companyUniversalName", universal_name.to_string()),
            ("q", "companyFeedByUniversalName".to_string()),
            ("moduleKey", "member-share".to_string()),
        ];
        self.paged("updates", "/feed/updates", query, element_page).await
    }

    async fn company_events(
        &self,
        universal_name: &str,
        window: EventWindow,
    ) -> Result<Vec<JsonValue>, SourceError> {
        let body = self
            .get(
                "events",
                "/voyagerOrganizationOrganizationEvents",
                &[
                    ("decorationId", EVENT_DECORATION.to_string()),
                    ("organizationIdOrUniversalName", universal_name.to_string()),
                    ("q", "timeFrame".to_string()),
                    ("timeFrame", window.as_str().to_string()),
                    ("start", "0".to_string()),
                    ("count", "100".to_string()),
                ],
            )
            .await?;
        Ok(elements(&body))
    }

    async fn search_people(&self, search: &PeopleSearch) -> Result<Vec<JsonValue>, SourceError> {
        let query = vec![
            ("filters", format!("List(currentCompany->{},resultType->PEOPLE)", search.company_id)),
            ("keywords", search.keywords.clone()),
            ("origin", "FACETED_SEARCH".to_string()),
            ("q", "all".to_string()),
            ("queryContext", "List(spellCorrectionEnabled->true)".to_string()),
        ];
        self.paged("people", "/search/blended", query, people_page).await
    }

    async fn employee_part(&self, public_id: &str, part: EmployeePart) -> Result<JsonValue, SourceError> {
        let (suffix, query): (&str, Vec<(&str, String)>) = match part {
            EmployeePart::Profile => ("profileView", Vec::new()),
            EmployeePart::ContactInfo => ("profileContactInfo", Vec::new()),
            EmployeePart::NetworkInfo => ("networkinfo", Vec::new()),
            EmployeePart::Skills => ("skills", vec![("count", "100".to_string()), ("start", "0".to_string())]),
        };
        let path = format!("/identity/profiles/{public_id}/{suffix}");
        self.get(part.as_str(), &path, &query).await
    }
}

/// Opens a `VoyagerClient` per credential over one shared transport.
#[derive(Debug, Clone)]
pub struct VoyagerSessions {
    http: Arc<HttpFetcher>,
    config: VoyagerConfig,
}

impl VoyagerSessions {
    pub fn new(http: Arc<HttpFetcher>, config: VoyagerConfig) -> Self {
        Self { http, config }
    }
}

impl SessionFactory for VoyagerSessions {
    fn open(&self, credential: &Credential) -> Result<Arc<dyn CompanySource>, SourceError> {
        let auth = SessionCookieAuth::from_credential(credential);
        // Fail at session open rather than on the first request.
        auth.headers()?;
        Ok(Arc::new(VoyagerClient::new(self.http.clone(), Arc::new(auth), self.config.clone())))
    }
}
