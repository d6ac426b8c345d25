//! Credential pool and session header derivation.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, COOKIE};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::SourceError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential pool is empty")]
    EmptyPool,
    #[error("credential entry `{0}` is not of the form login:secret")]
    Malformed(String),
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    login: String,
    secret: String,
}

impl Credential {
    pub fn new(login: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            secret: secret.into(),
        }
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Parses a comma separated `login:secret` list. Blank entries are skipped.
    pub fn parse_list(raw: &str) -> Result<Vec<Credential>, CredentialError> {
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(Credential::from_str)
            .collect()
    }
}

impl FromStr for Credential {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((login, secret)) if !login.trim().is_empty() && !secret.is_empty() => {
                Ok(Credential::new(login.trim(), secret))
            }
            _ => Err(CredentialError::Malformed(s.split(':').next().unwrap_or_default().to_string())),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("login", &self.login)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Round-robin over a fixed, non-empty credential pool. Safe to share across
/// workers; each `next` call advances the cursor exactly once.
#[derive(Debug)]
pub struct CredentialRotator {
    pool: Vec<Credential>,
    cursor: AtomicUsize,
}

impl CredentialRotator {
    pub fn new(pool: Vec<Credential>) -> Result<Self, CredentialError> {
        if pool.is_empty() {
            return Err(CredentialError::EmptyPool);
        }
        Ok(Self {
            pool,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn next(&self) -> Credential {
        let len = self.pool.len();
        let previous = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % len))
            .unwrap_or_else(|current| current);
        self.pool[previous % len].clone()
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

/// Supplies the headers that authenticate one session against the remote site.
pub trait AuthHeaderProvider: Send + Sync + fmt::Debug {
    fn headers(&self) -> Result<HeaderMap, SourceError>;
}

/// Cookie-session auth: the secret is the session cookie and the CSRF token is
/// derived deterministically from the credential so it stays stable per login.
#[derive(Clone)]
pub struct SessionCookieAuth {
    login: String,
    session_cookie: String,
    csrf_token: String,
}

impl SessionCookieAuth {
    pub fn from_credential(credential: &Credential) -> Self {
        Self {
            login: credential.login().to_string(),
            session_cookie: credential.secret().to_string(),
            csrf_token: csrf_token_for(credential),
        }
    }

    pub fn csrf_token(&self) -> &str {
        &self.csrf_token
    }
}

impl fmt::Debug for SessionCookieAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCookieAuth")
            .field("login", &self.login)
            .finish_non_exhaustive()
    }
}

impl AuthHeaderProvider for SessionCookieAuth {
    fn headers(&self) -> Result<HeaderMap, SourceError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.linkedin.normalized+json+2.1"));
        headers.insert(
            HeaderName::from_static("x-restli-protocol-version"),
            HeaderValue::from_static("2.0.0"),
        );
        headers.insert(HeaderName::from_static("csrf-token"), header_value(&self.csrf_token)?);
        let cookie = format!("li_at={}; JSESSIONID=\"{}\"", self.session_cookie, self.csrf_token);
        headers.insert(COOKIE, header_value(&cookie)?);
        Ok(headers)
    }
}

fn header_value(raw: &str) -> Result<HeaderValue, SourceError> {
    HeaderValue::from_str(raw).map_err(|err| SourceError::Session(format!("invalid header value: {err}")))
}

fn csrf_token_for(credential: &Credential) -> String {
    let digest = Sha256::digest(format!("{}:{}", credential.login(), credential.secret()).as_bytes());
    let hex = hex::encode(&digest[..8]);
    let number = u64::from_str_radix(&hex, 16).unwrap_or_default();
    format!("ajax:{:019}", number % 10_000_000_000_000_000_000)
}
