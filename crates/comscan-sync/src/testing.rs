//! Fixture-backed `CompanySource` with scriptable outages.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use comscan_core::CompanyProfile;
use comscan_source::{
    CompanySource, Credential, EmployeePart, EventWindow, JobSearch, PeopleSearch, SessionFactory, SourceError,
};
use serde_json::{json, Value as JsonValue};

pub fn fixture(name: &str) -> JsonValue {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/voyager")
        .join(name);
    serde_json::from_str(&std::fs::read_to_string(path).expect("fixture")).expect("fixture json")
}

pub fn acme() -> CompanyProfile {
    CompanyProfile {
        internal_id: 1441,
        display_name: Some("Acme Robotics".to_string()),
        universal_name: Some("acme".to_string()),
        ..CompanyProfile::default()
    }
}

fn outage(what: &str) -> SourceError {
    SourceError::Session(format!("scripted outage: {what}"))
}

#[derive(Default)]
struct Script {
    job_failures_left: usize,
    posts_fail: bool,
    failing_windows: HashSet<EventWindow>,
    failing_parts: HashSet<EmployeePart>,
    people_keywords: Vec<String>,
    calls: HashMap<String, usize>,
}

#[derive(Clone, Default)]
pub struct ScriptedSource {
    script: Arc<Mutex<Script>>,
}

impl ScriptedSource {
    pub fn from_fixtures() -> Self {
        Self::default()
    }

    pub fn failing_window(self, window: EventWindow) -> Self {
        self.script.lock().expect("lock").failing_windows.insert(window);
        self
    }

    pub fn failing_part(self, part: EmployeePart) -> Self {
        self.script.lock().expect("lock").failing_parts.insert(part);
        self
    }

    /// Job searches fail with an upstream error for the next `times` calls.
    pub fn failing_jobs(self, times: usize) -> Self {
        self.script.lock().expect("lock").job_failures_left = times;
        self
    }

    pub fn failing_posts(self) -> Self {
        self.script.lock().expect("lock").posts_fail = true;
        self
    }

    pub fn calls(&self, method: &str) -> usize {
        self.script.lock().expect("lock").calls.get(method).copied().unwrap_or_default()
    }

    pub fn profile_calls(&self, public_id: &str) -> usize {
        self.calls(&format!("profile:{public_id}"))
    }

    pub fn people_keywords(&self) -> Vec<String> {
        self.script.lock().expect("lock").people_keywords.clone()
    }

    fn record(&self, method: impl Into<String>) {
        *self.script.lock().expect("lock").calls.entry(method.into()).or_default() += 1;
    }
}

#[async_trait]
impl CompanySource for ScriptedSource {
    async fn company_by_universal_name(&self, universal_name: &str) -> Result<Vec<JsonValue>, SourceError> {
        self.record("company");
        if universal_name == "acme" {
            Ok(fixture("company.json")["elements"].as_array().cloned().unwrap_or_default())
        } else {
            Ok(Vec::new())
        }
    }

    async fn search_jobs(&self, _search: &JobSearch) -> Result<Vec<JsonValue>, SourceError> {
        self.record("jobs");
        {
            let mut script = self.script.lock().expect("lock");
            if script.job_failures_left > 0 {
                script.job_failures_left -= 1;
                return Err(outage("jobs"));
            }
        }
        let payload = fixture("jobs.json");
        Ok(payload["included"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter(|v| comscan_source::normalize::is_job_posting(v))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn company_updates(&self, _universal_name: &str) -> Result<Vec<JsonValue>, SourceError> {
        self.record("posts");
        if self.script.lock().expect("lock").posts_fail {
            return Err(outage("posts"));
        }
        Ok(fixture("updates.json")["elements"].as_array().cloned().unwrap_or_default())
    }

    async fn company_events(&self, _universal_name: &str, window: EventWindow) -> Result<Vec<JsonValue>, SourceError> {
        self.record(format!("events:{window}"));
        if self.script.lock().expect("lock").failing_windows.contains(&window) {
            return Err(outage("events"));
        }
        Ok(match window {
            EventWindow::Today => Vec::new(),
            _ => fixture("events_upcoming.json")["elements"].as_array().cloned().unwrap_or_default(),
        })
    }

    async fn search_people(&self, search: &PeopleSearch) -> Result<Vec<JsonValue>, SourceError> {
        self.record("people");
        self.script
            .lock()
            .expect("lock")
            .people_keywords
            .push(search.keywords.clone());
        let mut hits = fixture("people.json")["elements"][0]["elements"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        hits.push(json!({ "publicIdentifier": "jane-doe" }));
        Ok(hits)
    }

    async fn employee_part(&self, public_id: &str, part: EmployeePart) -> Result<JsonValue, SourceError> {
        if part == EmployeePart::Profile {
            self.record(format!("profile:{public_id}"));
        }
        if public_id != "jane-doe" || self.script.lock().expect("lock").failing_parts.contains(&part) {
            return Err(outage(part.as_str()));
        }
        Ok(fixture(match part {
            EmployeePart::Profile => "profile_view.json",
            EmployeePart::ContactInfo => "contact_info.json",
            EmployeePart::NetworkInfo => "network_info.json",
            EmployeePart::Skills => "skills.json",
        }))
    }
}

/// Hands out the same scripted source for every credential, or refuses to.
pub struct ScriptedSessions {
    pub source: ScriptedSource,
    pub refuse: bool,
}

impl SessionFactory for ScriptedSessions {
    fn open(&self, credential: &Credential) -> Result<Arc<dyn CompanySource>, SourceError> {
        if self.refuse {
            return Err(SourceError::Session(format!("login rejected for {}", credential.login())));
        }
        Ok(Arc::new(self.source.clone()))
    }
}
