//! Turns a caller-supplied company name or profile link into a fetched
//! `CompanyProfile`.

use std::sync::Arc;

use comscan_core::{CompanyProfile, IngestError};
use tracing::{debug, instrument};

use crate::normalize;
use crate::{CompanySource, SessionPool};

const COMPANY_SEGMENT: &str = "/company/";

/// Extracts the universal name from links like
/// `https://www.linkedin.com/company/acme/about/?trk=x`.
pub fn company_slug_from_link(link: &str) -> Result<String, IngestError> {
    let invalid = || IngestError::InvalidIdentifier(format!("no /company/<name> segment in `{link}`"));

    let (_, rest) = link.split_once(COMPANY_SEGMENT).ok_or_else(invalid)?;
    let rest = rest.split(['?', '#']).next().unwrap_or_default();
    let slug = rest.split('/').next().unwrap_or_default().trim();
    if slug.is_empty() {
        return Err(invalid());
    }
    Ok(slug.to_string())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Picks the universal name to look up. A non-blank name wins over a link.
pub fn universal_name_for(name: Option<&str>, link: Option<&str>) -> Result<String, IngestError> {
    if let Some(name) = non_blank(name) {
        return Ok(name.to_string());
    }
    match non_blank(link) {
        Some(link) => company_slug_from_link(link),
        None => Err(IngestError::InvalidIdentifier(
            "either company_name or company_link is required".to_string(),
        )),
    }
}

/// Resolves against one session. The first matching element is the company.
#[instrument(skip(source))]
pub async fn resolve_company(
    source: &dyn CompanySource,
    name: Option<&str>,
    link: Option<&str>,
) -> Result<CompanyProfile, IngestError> {
    let universal_name = universal_name_for(name, link)?;
    let elements = source.company_by_universal_name(&universal_name).await?;
    let Some(first) = elements.first() else {
        return Err(IngestError::UnknownCompany(universal_name));
    };
    let company = normalize::company_profile(first)?;
    debug!(internal_id = company.internal_id, %universal_name, "resolved company");
    Ok(company)
}

/// Resolution bound to the shared session pool; each call rotates to the
/// next credential.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    sessions: Arc<SessionPool>,
}

impl IdentityResolver {
    pub fn new(sessions: Arc<SessionPool>) -> Self {
        Self { sessions }
    }

    pub async fn resolve(&self, name: Option<&str>, link: Option<&str>) -> Result<CompanyProfile, IngestError> {
        universal_name_for(name, link)?;
        let source = self.sessions.next_session()?;
        resolve_company(source.as_ref(), name, link).await
    }
}
