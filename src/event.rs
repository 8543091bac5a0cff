// event.rs
// Provider-agnostic audit event extracted at fetch time

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cloud provider an event was retrieved from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Azure,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Azure => "azure",
        }
    }

    /// Human-facing label used in report titles and summary context
    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Aws => "AWS",
            Provider::Azure => "Azure",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(Provider::Aws),
            "azure" => Ok(Provider::Azure),
            other => Err(format!("unknown provider '{other}' (expected aws or azure)")),
        }
    }
}

/// Severity as reported (or implied) by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Lookback window in UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `hours` leading up to `now`
    pub fn trailing(now: DateTime<Utc>, hours: u32) -> Self {
        Self {
            start: now - Duration::hours(i64::from(hours)),
            end: now,
        }
    }
}

/// Which report section an event lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Error,
    Write,
    Read,
}

/// One normalized audit record, persisted as soon as it is fetched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub mutating: bool,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub provider: Provider,
    #[serde(default)]
    pub raw_payload: serde_json::Value,
}

impl RawEvent {
    /// Creates a successful, read-only event; `actor` is shortened to its last path segment
    pub fn new(provider: Provider, timestamp: DateTime<Utc>, actor: &str, action: &str) -> Self {
        Self {
            timestamp,
            actor: short_actor(actor).to_string(),
            action: action.to_string(),
            mutating: false,
            severity: Severity::Info,
            error_code: None,
            error_message: None,
            provider,
            raw_payload: serde_json::Value::Null,
        }
    }

    pub fn with_mutating(mut self, mutating: bool) -> Self {
        self.mutating = mutating;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Marks the event as a failure
    pub fn with_error(mut self, code: impl Into<String>, message: Option<String>) -> Self {
        self.error_code = Some(code.into());
        self.error_message = message;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.raw_payload = payload;
        self
    }

    /// Non-empty error code, if any
    pub fn error_code(&self) -> Option<&str> {
        self.error_code.as_deref().filter(|code| !code.is_empty())
    }

    /// Error beats mutating; everything else is read noise.
    pub fn classify(&self) -> Classification {
        if self.error_code().is_some() {
            Classification::Error
        } else if self.mutating {
            Classification::Write
        } else {
            Classification::Read
        }
    }
}

/// Last `/` segment of a qualified identity (ARNs, resource ids, UPN paths)
pub fn short_actor(actor: &str) -> &str {
    actor.rsplit('/').next().unwrap_or(actor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn actor_is_shortened_to_last_segment() {
        let event = RawEvent::new(
            Provider::Aws,
            at(),
            "arn:aws:sts::123456789012:assumed-role/Deployer/ci-runner",
            "PutObject",
        );
        assert_eq!(event.actor, "ci-runner");
        assert_eq!(short_actor("alice"), "alice");
        assert_eq!(short_actor("trailing/"), "");
    }

    #[test]
    fn error_code_wins_over_mutating() {
        let event = RawEvent::new(Provider::Aws, at(), "eve", "DeleteBucket")
            .with_mutating(true)
            .with_error("AccessDenied", None);
        assert_eq!(event.classify(), Classification::Error);
    }

    #[test]
    fn empty_error_code_is_not_an_error() {
        let event = RawEvent::new(Provider::Aws, at(), "bob", "PutObject")
            .with_mutating(true)
            .with_error("", None);
        assert_eq!(event.classify(), Classification::Write);

        let read = RawEvent::new(Provider::Aws, at(), "bob", "GetObject");
        assert_eq!(read.classify(), Classification::Read);
    }

    #[test]
    fn serializes_with_camel_case_and_omits_absent_errors() {
        let event = RawEvent::new(Provider::Azure, at(), "carol", "List keys (Succeeded)");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["provider"], "azure");
        assert_eq!(json["severity"], "INFO");
        assert!(json.get("errorCode").is_none());
        assert!(json.get("rawPayload").is_some());

        let back: RawEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn trailing_window_spans_requested_hours() {
        let window = TimeRange::trailing(at(), 24);
        assert_eq!(window.end - window.start, Duration::hours(24));
        assert_eq!(window.end, at());
    }

    #[test]
    fn provider_parses_case_insensitively() {
        assert_eq!("AWS".parse::<Provider>().unwrap(), Provider::Aws);
        assert_eq!("azure".parse::<Provider>().unwrap(), Provider::Azure);
        assert!("gcp".parse::<Provider>().is_err());
    }
}
