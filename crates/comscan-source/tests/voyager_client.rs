use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use comscan_source::{
    Credential, EmployeePart, EventWindow, HttpClientConfig, HttpFetcher, JobSearch, PeopleSearch, SessionFactory,
    VoyagerConfig, VoyagerSessions,
};
use serde_json::{json, Value as JsonValue};

type Seen = Arc<Mutex<Vec<HashMap<String, String>>>>;

fn fixture(name: &str) -> JsonValue {
    let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/voyager")
        .join(name);
    serde_json::from_str(&std::fs::read_to_string(path).expect("fixture")).expect("fixture json")
}

fn require_session(headers: &HeaderMap) -> Result<(), StatusCode> {
    let has_csrf = headers
        .get("csrf-token")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("ajax:"));
    let has_cookie = headers
        .get("cookie")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("li_at=session-cookie"));
    if has_csrf && has_cookie {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn companies(
    State(seen): State<Seen>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<JsonValue>, StatusCode> {
    require_session(&headers)?;
    seen.lock().expect("lock").push(q.clone());
    if q.get("universalName").map(String::as_str) == Some("acme") {
        Ok(Json(fixture("company.json")))
    } else {
        Ok(Json(json!({ "elements": [] })))
    }
}

/// Two pages of jobs: a full page of two hits, then a short page of one.
async fn job_hits(
    State(seen): State<Seen>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<JsonValue>, StatusCode> {
    require_session(&headers)?;
    seen.lock().expect("lock").push(q.clone());
    let start: usize = q.get("start").and_then(|s| s.parse().ok()).unwrap_or_default();
    let posting = |id: i64| {
        json!({
            "$type": "com.linkedin.voyager.jobs.JobPosting",
            "*savingInfo": format!("urn:li:fs_jobSavingInfo:{id}"),
            "companyDetails": { "company": "urn:li:fs_normalized_company:1441" }
        })
    };
    let body = if start == 0 {
        json!({
            "elements": [{}, {}],
            "included": [posting(1), posting(2), { "$type": "com.linkedin.voyager.common.Industry" }]
        })
    } else {
        json!({ "elements": [{}], "included": [posting(3)] })
    };
    Ok(Json(body))
}

async fn blended(headers: HeaderMap, Query(q): Query<HashMap<String, String>>) -> Result<Json<JsonValue>, StatusCode> {
    require_session(&headers)?;
    if q.get("start").map(String::as_str) == Some("0") {
        Ok(Json(fixture("people.json")))
    } else {
        Ok(Json(json!({ "elements": [] })))
    }
}

async fn events(headers: HeaderMap, Query(q): Query<HashMap<String, String>>) -> Result<Json<JsonValue>, StatusCode> {
    require_session(&headers)?;
    match q.get("timeFrame").map(String::as_str) {
        Some("UPCOMING") => Ok(Json(fixture("events_upcoming.json"))),
        Some("PAST") => Err(StatusCode::BAD_REQUEST),
        _ => Ok(Json(json!({ "elements": [] }))),
    }
}

async fn profile_part(
    headers: HeaderMap,
    UrlPath((public_id, part)): UrlPath<(String, String)>,
) -> Result<Json<JsonValue>, StatusCode> {
    require_session(&headers)?;
    if public_id != "jane-doe" {
        return Err(StatusCode::NOT_FOUND);
    }
    match part.as_str() {
        "profileView" => Ok(Json(fixture("profile_view.json"))),
        "profileContactInfo" => Ok(Json(fixture("contact_info.json"))),
        "networkinfo" => Ok(Json(fixture("network_info.json"))),
        "skills" => Ok(Json(fixture("skills.json"))),
        _ => Err(StatusCode::NOT_FOUND),
    }
}

async fn start_site() -> (String, Seen) {
    let seen: Seen = Arc::default();
    let router = Router::new()
        .route("/voyagerOrganizationDashCompanies", get(companies))
        .route("/search/hits", get(job_hits))
        .route("/search/blended", get(blended))
        .route("/voyagerOrganizationOrganizationEvents", get(events))
        .route("/identity/profiles/{public_id}/{part}", get(profile_part))
        .with_state(seen.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    (format!("http://{addr}"), seen)
}

fn sessions(base_url: String) -> VoyagerSessions {
    let http = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
    VoyagerSessions::new(
        Arc::new(http),
        VoyagerConfig {
            base_url,
            page_size: 2,
            max_results: 100,
        },
    )
}

#[tokio::test]
async fn company_lookup_sends_session_headers_and_universal_name() {
    let (base, seen) = start_site().await;
    let source = sessions(base)
        .open(&Credential::new("alice", "session-cookie"))
        .expect("session");

    let found = source.company_by_universal_name("acme").await.expect("lookup");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["entityUrn"], "urn:li:fsd_company:1441");

    assert!(source.company_by_universal_name("ghost").await.expect("lookup").is_empty());

    let seen = seen.lock().expect("lock");
    assert_eq!(seen[0].get("q").map(String::as_str), Some("universalName"));
}

#[tokio::test]
async fn wrong_session_is_an_upstream_error() {
    let (base, _) = start_site().await;
    let source = sessions(base)
        .open(&Credential::new("mallory", "stolen"))
        .expect("session");

    let err = source.company_by_universal_name("acme").await.expect_err("401");
    assert!(err.to_string().contains("401"));
}

#[tokio::test]
async fn job_search_pages_until_short_page_and_keeps_only_postings() {
    let (base, seen) = start_site().await;
    let source = sessions(base)
        .open(&Credential::new("alice", "session-cookie"))
        .expect("session");

    let jobs = source
        .search_jobs(&JobSearch {
            keywords: String::new(),
            company_id: 1441,
            listed_within: Duration::from_secs(86_400),
        })
        .await
        .expect("jobs");

    assert_eq!(jobs.len(), 3);
    let seen = seen.lock().expect("lock");
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].get("start").map(String::as_str), Some("2"));
    assert!(seen[0]["filters"].contains("f_C->1441"));
    assert!(seen[0]["filters"].contains("f_TPR->r86400"));
}

#[tokio::test]
async fn people_search_flattens_clusters() {
    let (base, _) = start_site().await;
    let source = sessions(base)
        .open(&Credential::new("alice", "session-cookie"))
        .expect("session");

    let hits = source
        .search_people(&PeopleSearch {
            keywords: String::new(),
            company_id: 1441,
        })
        .await
        .expect("people");
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0]["publicIdentifier"], "jane-doe");
}

#[tokio::test]
async fn event_windows_are_requested_independently() {
    let (base, _) = start_site().await;
    let source = sessions(base)
        .open(&Credential::new("alice", "session-cookie"))
        .expect("session");

    assert_eq!(source.company_events("acme", EventWindow::Upcoming).await.expect("upcoming").len(), 2);
    assert!(source.company_events("acme", EventWindow::Today).await.expect("today").is_empty());
    assert!(source.company_events("acme", EventWindow::Past).await.is_err());
}

#[tokio::test]
async fn employee_parts_hit_their_own_endpoints() {
    let (base, _) = start_site().await;
    let source = sessions(base)
        .open(&Credential::new("alice", "session-cookie"))
        .expect("session");

    let profile = source.employee_part("jane-doe", EmployeePart::Profile).await.expect("profile");
    assert_eq!(profile["profile"]["firstName"], "Jane");
    let skills = source.employee_part("jane-doe", EmployeePart::Skills).await.expect("skills");
    assert_eq!(skills["elements"][0]["name"], "Robotics");
    assert!(source.employee_part("nobody", EmployeePart::ContactInfo).await.is_err());
}
