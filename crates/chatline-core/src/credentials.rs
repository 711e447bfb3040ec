use chatline_models::credential::Credential;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use http::HeaderMap;
use regex::Regex;
use thiserror::Error;

pub const HEADER_USER_ID: &str = "x-auth-userid";
pub const HEADER_USERNAME: &str = "x-auth-username";
pub const HEADER_EXPIRES_IN: &str = "x-auth-expiresin";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),
    #[error("invalid user id '{0}'")]
    InvalidUserId(String),
    #[error("invalid expiry '{0}'")]
    InvalidExpiry(String),
}

/// Outcome of authenticating one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Authentication {
    /// The URI matched a whitelist pattern; no identity was looked at.
    Whitelisted,
    Authenticated(Credential),
    Absent,
}

impl Authentication {
    pub fn credential(&self) -> Option<&Credential> {
        match self {
            Authentication::Authenticated(credential) => Some(credential),
            _ => None,
        }
    }
}

/// Reads identity headers set by the authenticating proxy, honoring the
/// configured whitelist of URI patterns.
#[derive(Debug, Clone)]
pub struct CredentialExtractor {
    whitelist: Vec<Regex>,
}

impl CredentialExtractor {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let whitelist = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { whitelist })
    }

    pub fn is_whitelisted(&self, uri: &str) -> bool {
        self.whitelist.iter().any(|re| re.is_match(uri))
    }

    pub fn authenticate(&self, uri: &str, headers: &HeaderMap) -> Authentication {
        if self.is_whitelisted(uri) {
            return Authentication::Whitelisted;
        }
        match extract_credential(headers) {
            Ok(credential) => {
                tracing::debug!(
                    user_id = credential.user_id,
                    expires_at = %credential.expires_at,
                    "credential extracted"
                );
                Authentication::Authenticated(credential)
            }
            Err(err) => {
                tracing::info!(uri, error = %err, "credential extraction failed");
                Authentication::Absent
            }
        }
    }
}

pub fn extract_credential(headers: &HeaderMap) -> Result<Credential, CredentialError> {
    let raw_user_id = header_str(headers, HEADER_USER_ID)
        .ok_or(CredentialError::MissingHeader(HEADER_USER_ID))?;
    let user_id = raw_user_id
        .trim()
        .parse::<i64>()
        .map_err(|_| CredentialError::InvalidUserId(raw_user_id.to_string()))?;
    let login = header_str(headers, HEADER_USERNAME).unwrap_or_default();
    let raw_expiry = header_str(headers, HEADER_EXPIRES_IN)
        .ok_or(CredentialError::MissingHeader(HEADER_EXPIRES_IN))?;
    let expires_at = parse_expiry(raw_expiry)?;
    Ok(Credential::new(user_id, login, expires_at))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
}

/// Parse an absolute expiry. Digit-only values are epoch timestamps whose
/// unit follows from their length (s, ms, us, ns); anything else must be a
/// date in one of the accepted formats, read as UTC when it has no offset.
pub fn parse_expiry(raw: &str) -> Result<DateTime<Utc>, CredentialError> {
    let value = raw.trim();
    let invalid = || CredentialError::InvalidExpiry(raw.to_string());

    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        let n: i64 = value.parse().map_err(|_| invalid())?;
        let (secs, nanos) = match value.len() {
            1..=10 => (n, 0),
            13 => (n.div_euclid(1_000), n.rem_euclid(1_000) * 1_000_000),
            16 => (n.div_euclid(1_000_000), n.rem_euclid(1_000_000) * 1_000),
            19 => (n.div_euclid(1_000_000_000), n.rem_euclid(1_000_000_000)),
            _ => return Err(invalid()),
        };
        return DateTime::from_timestamp(secs, nanos as u32).ok_or_else(invalid);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(invalid())
}
