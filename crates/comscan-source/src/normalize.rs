//! Maps raw remote payloads onto the persisted record shapes. Missing optional
//! fields become `None`/empty; only a company without a numeric identity is
//! treated as malformed.

use chrono::{DateTime, TimeZone, Utc};
use comscan_core::{CompanyEvent, CompanyPost, CompanyProfile, EmployeeProfile, IngestError, JobPosting};
use serde_json::Value as JsonValue;

use crate::EventWindow;

pub const UPDATE_V2: &str = "com.linkedin.voyager.feed.render.UpdateV2";
pub const JOB_POSTING_TYPE: &str = "com.linkedin.voyager.jobs.JobPosting";

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

fn json_string(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_str(value, path).map(ToString::to_string)
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let v = json_at(value, path)?;
    v.as_i64()
        .or_else(|| v.as_f64().map(|f| f as i64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn json_bool(value: &JsonValue, path: &[&str]) -> Option<bool> {
    json_at(value, path)?.as_bool()
}

fn json_vec(value: &JsonValue, path: &[&str]) -> Vec<JsonValue> {
    json_at(value, path)
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Text that may arrive either as a bare string or as `{"text": ...}`.
fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    let v = json_at(value, path)?;
    v.as_str()
        .or_else(|| v.get("text").and_then(JsonValue::as_str))
        .map(ToString::to_string)
}

/// Last `:`-separated segment of an URN such as `urn:li:fs_company:1441`.
pub fn urn_tail(urn: &str) -> &str {
    urn.rsplit(':').next().unwrap_or(urn)
}

pub fn epoch_millis(value: &JsonValue) -> Option<DateTime<Utc>> {
    let ms = value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))?;
    Utc.timestamp_millis_opt(ms).single()
}

fn names_of(value: Option<&JsonValue>) -> Vec<String> {
    let name_of = |v: &JsonValue| -> Option<String> {
        v.as_str()
            .or_else(|| v.get("name").and_then(JsonValue::as_str))
            .or_else(|| v.get("localizedName").and_then(JsonValue::as_str))
            .map(ToString::to_string)
    };
    match value {
        Some(JsonValue::Array(items)) => items.iter().filter_map(name_of).collect(),
        Some(JsonValue::Object(map)) => map.values().filter_map(name_of).collect(),
        Some(JsonValue::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

pub fn company_profile(raw: &JsonValue) -> Result<CompanyProfile, IngestError> {
    let urn = json_str(raw, &["entityUrn"])
        .ok_or_else(|| IngestError::MalformedPayload("company payload has no entityUrn".to_string()))?;
    let internal_id = urn_tail(urn).parse::<i64>().map_err(|_| {
        IngestError::MalformedPayload(format!("company identifier `{urn}` is not numeric"))
    })?;

    Ok(CompanyProfile {
        internal_id,
        display_name: json_string(raw, &["name"]),
        universal_name: json_string(raw, &["universalName"]),
        link: json_string(raw, &["url"]),
        website: json_string(raw, &["websiteUrl"]).or_else(|| json_string(raw, &["companyPageUrl"])),
        address: json_at(raw, &["headquarter", "address"])
            .or_else(|| json_at(raw, &["headquarter"]))
            .cloned(),
        employee_count: json_i64(raw, &["employeeCount"]),
        specialities: names_of(json_at(raw, &["specialities"])),
        followers_count: json_i64(raw, &["followingState", "followerCount"])
            .or_else(|| json_i64(raw, &["followingInfo", "followerCount"])),
        tagline: json_string(raw, &["tagline"]),
        description: json_string(raw, &["description"]),
        founded_year: json_i64(raw, &["foundedOn", "year"]).and_then(|y| i32::try_from(y).ok()),
        industry: names_of(json_at(raw, &["industry"]).or_else(|| json_at(raw, &["companyIndustries"]))),
    })
}

pub fn is_job_posting(raw: &JsonValue) -> bool {
    json_str(raw, &["$type"]) == Some(JOB_POSTING_TYPE)
}

/// Company a job listing belongs to. `companyDetails` is a union, so the
/// reference may sit directly on it or one level down.
pub fn job_company_id(raw: &JsonValue) -> Option<i64> {
    let details = json_at(raw, &["companyDetails"])?;
    let direct = |v: &JsonValue| -> Option<i64> {
        ["company", "*companyResolutionResult", "*company"]
            .iter()
            .find_map(|key| v.get(*key).and_then(JsonValue::as_str))
            .and_then(|urn| urn_tail(urn).parse().ok())
    };
    direct(details).or_else(|| details.as_object()?.values().find_map(direct))
}

pub fn job_posting(raw: &JsonValue, company_id: i64) -> Option<JobPosting> {
    let job_id = ["*savingInfo", "entityUrn", "dashEntityUrn"]
        .iter()
        .find_map(|key| json_str(raw, &[*key]))
        .and_then(|urn| urn_tail(urn).parse::<i64>().ok())?;

    Some(JobPosting {
        job_id,
        state: json_string(raw, &["jobState"]),
        title: json_string(raw, &["title"]),
        location: json_string(raw, &["formattedLocation"]),
        listed_at: json_at(raw, &["listedAt"]).and_then(epoch_millis),
        expire_at: json_at(raw, &["expireAt"]).and_then(epoch_millis),
        company_id,
    })
}

fn update_body(raw: &JsonValue) -> &JsonValue {
    json_at(raw, &["value", UPDATE_V2]).unwrap_or(raw)
}

pub fn has_post_content(raw: &JsonValue) -> bool {
    json_at(update_body(raw), &["content"]).is_some()
}

/// Returns `None` for updates without a content block or a permalink.
pub fn company_post(raw: &JsonValue, company_id: i64) -> Option<CompanyPost> {
    let body = update_body(raw);
    let content = json_at(body, &["content"])?.clone();
    let link = json_string(raw, &["permalink"]).or_else(|| json_string(body, &["permalink"]))?;
    Some(CompanyPost {
        link,
        content,
        commentary: json_at(body, &["commentary"]).cloned(),
        company_id,
    })
}

pub fn company_event(raw: &JsonValue, window: EventWindow, company_id: i64) -> Option<CompanyEvent> {
    let event = json_at(raw, &["eventResolutionResult"]).unwrap_or(raw);
    let urn = json_str(event, &["entityUrn"]).or_else(|| json_str(raw, &["entityUrn"]))?;

    Some(CompanyEvent {
        event_id: urn_tail(urn).to_string(),
        state: json_string(event, &["lifecycleState"]).or_else(|| Some(window.as_str().to_string())),
        name: json_text(event, &["localizedName"]).or_else(|| json_text(event, &["name"])),
        description: json_text(event, &["localizedDescription"]).or_else(|| json_text(event, &["description"])),
        display_time: json_at(event, &["timeRange", "start"])
            .or_else(|| json_at(event, &["displayEventTime", "start"]))
            .and_then(epoch_millis),
        attendee_count: json_i64(event, &["attendeeCount"]).or_else(|| json_i64(raw, &["attendeeCount"])),
        company_id,
    })
}

pub fn employee_public_id(hit: &JsonValue) -> Option<String> {
    ["public_id", "publicIdentifier"]
        .iter()
        .find_map(|key| json_str(hit, &[*key]))
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
}

/// Enrichment responses for one person. Only the profile view is mandatory.
#[derive(Debug, Clone, Default)]
pub struct EmployeeParts {
    pub profile: JsonValue,
    pub contact: Option<JsonValue>,
    pub network: Option<JsonValue>,
    pub skills: Option<JsonValue>,
}

fn profile_section(view: &JsonValue, view_key: &str, flat_key: &str) -> Vec<JsonValue> {
    let from_view = json_vec(view, &[view_key, "elements"]);
    if from_view.is_empty() {
        json_vec(view, &[flat_key])
    } else {
        from_view
    }
}

pub fn employee_profile(public_id: &str, parts: &EmployeeParts) -> EmployeeProfile {
    let view = &parts.profile;
    let person = json_at(view, &["profile"]).unwrap_or(view);

    let mut employee = EmployeeProfile {
        public_id: public_id.to_string(),
        first_name: json_string(person, &["firstName"]),
        last_name: json_string(person, &["lastName"]),
        headline: json_string(person, &["headline"]),
        summary: json_string(person, &["summary"]),
        industry_name: json_string(person, &["industryName"]),
        location_name: json_string(person, &["locationName"]),
        student: json_bool(person, &["student"]),
        geo_country_name: json_string(person, &["geoCountryName"]),
        geo_location_name: json_string(person, &["geoLocationName"]),
        experience: profile_section(view, "positionView", "experience"),
        education: profile_section(view, "educationView", "education"),
        languages: profile_section(view, "languageView", "languages"),
        publications: profile_section(view, "publicationView", "publications"),
        certifications: profile_section(view, "certificationView", "certifications"),
        volunteer: profile_section(view, "volunteerExperienceView", "volunteer"),
        honors: profile_section(view, "honorView", "honors"),
        ..EmployeeProfile::default()
    };

    if let Some(contact) = &parts.contact {
        employee.email_address = json_string(contact, &["emailAddress"]);
        employee.websites = json_vec(contact, &["websites"]);
        employee.twitter = json_vec(contact, &["twitterHandles"]);
        employee.birthdate = json_at(contact, &["birthDateOn"]).cloned();
        employee.phone_numbers = json_vec(contact, &["phoneNumbers"]);
    }

    if let Some(network) = &parts.network {
        let data = json_at(network, &["data"]).unwrap_or(network);
        employee.followable = json_bool(data, &["followable"]);
        employee.followers_count = json_i64(data, &["followersCount"]);
        employee.connections_count = json_i64(data, &["connectionsCount"]);
    }

    if let Some(skills) = &parts.skills {
        let listed = json_at(skills, &["elements"]).unwrap_or(skills);
        employee.skills = names_of(Some(listed));
    }

    employee
}
