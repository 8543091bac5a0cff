//! AWS CloudTrail `LookupEvents`, paged by `NextToken`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::sigv4::{self, Credentials, JsonRequest};
use super::{Page, PageSource};
use crate::clock::Clock;
use crate::config::{non_empty, AwsSettings};
use crate::errors::{DigestError, DigestResult};
use crate::event::{Provider, RawEvent, Severity, TimeRange};

const TARGET: &str = "com.amazonaws.cloudtrail.v20131101.CloudTrail_20131101.LookupEvents";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const SERVICE: &str = "cloudtrail";

/// Largest page `LookupEvents` will return
pub const MAX_RESULTS: u32 = 50;

/// `LookupEvents` is throttled at two requests per second per account and region
const PAGE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LookupEventsResponse {
    #[serde(default)]
    events: Vec<Value>,
    #[serde(default)]
    next_token: Option<String>,
}

pub struct CloudTrailSource {
    client: reqwest::Client,
    endpoint: Url,
    host: String,
    region: String,
    credentials: Credentials,
    clock: Arc<dyn Clock>,
}

impl CloudTrailSource {
    /// `Ok(None)` when no credentials are configured at all; a half-configured
    /// key pair is a configuration error.
    pub fn from_settings(
        settings: &AwsSettings,
        client: reqwest::Client,
        clock: Arc<dyn Clock>,
    ) -> DigestResult<Option<Self>> {
        let access_key_id = non_empty(&settings.access_key_id);
        let secret_access_key = non_empty(&settings.secret_access_key);

        let (access_key_id, secret_access_key) = match (access_key_id, secret_access_key) {
            (None, None) => return Ok(None),
            (Some(id), Some(secret)) => (id, secret),
            (Some(_), None) => {
                return Err(DigestError::configuration("aws", "secret_access_key is missing"))
            }
            (None, Some(_)) => {
                return Err(DigestError::configuration("aws", "access_key_id is missing"))
            }
        };

        let region = settings.region.trim();
        if region.is_empty() {
            return Err(DigestError::configuration("aws", "region is empty"));
        }

        let endpoint = match non_empty(&settings.endpoint) {
            Some(endpoint) => endpoint.to_string(),
            None => format!("https://cloudtrail.{region}.amazonaws.com/"),
        };
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| DigestError::configuration("aws", format!("invalid endpoint '{endpoint}': {e}")))?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(DigestError::configuration("aws", "endpoint has no host"));
            }
        };

        Ok(Some(Self {
            client,
            endpoint,
            host,
            region: region.to_string(),
            credentials: Credentials {
                access_key_id: access_key_id.to_string(),
                secret_access_key: secret_access_key.to_string(),
                session_token: non_empty(&settings.session_token).map(str::to_string),
            },
            clock,
        }))
    }
}

#[async_trait]
impl PageSource for CloudTrailSource {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    fn page_interval(&self) -> Duration {
        PAGE_INTERVAL
    }

    async fn fetch_page(&self, window: &TimeRange, token: Option<&str>) -> DigestResult<Page> {
        let mut body = json!({
            "StartTime": window.start.timestamp(),
            "EndTime": window.end.timestamp(),
            "MaxResults": MAX_RESULTS,
        });
        if let Some(token) = token {
            body["NextToken"] = Value::String(token.to_string());
        }
        let payload = serde_json::to_vec(&body)?;

        let request = JsonRequest {
            host: &self.host,
            region: &self.region,
            service: SERVICE,
            target: TARGET,
            content_type: CONTENT_TYPE,
            payload: &payload,
        };
        let signed = sigv4::sign(&self.credentials, &request, self.clock.now());

        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-target", TARGET);
        for (name, value) in signed {
            builder = builder.header(name, value);
        }

        debug!("📡 Fetching batch from AWS {}...", self.region);
        let response = builder
            .body(payload)
            .send()
            .await
            .map_err(|e| DigestError::network("cloudtrail lookup_events", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("HTTP {status}: {}", text.chars().take(200).collect::<String>());
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    DigestError::configuration("aws", message)
                }
                _ => DigestError::transient(Provider::Aws, message),
            });
        }

        let parsed: LookupEventsResponse = response
            .json()
            .await
            .map_err(|e| DigestError::network("decoding lookup_events response", e))?;

        Ok(Page {
            events: parsed
                .events
                .into_iter()
                .map(|raw| normalize(raw, window.end))
                .collect(),
            next: parsed.next_token,
        })
    }
}

/// `EventTime` arrives as epoch seconds from the JSON API, or RFC 3339 when
/// records were exported by other tooling.
fn event_time(raw: &Value) -> Option<DateTime<Utc>> {
    match raw.get("EventTime")? {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            let whole = secs.trunc() as i64;
            let nanos = ((secs - secs.trunc()) * 1e9).round() as u32;
            DateTime::from_timestamp(whole, nanos.min(999_999_999))
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}

/// Flatten one CloudTrail record. `fallback_time` is used when the record
/// carries no readable `EventTime`.
pub fn normalize(raw: Value, fallback_time: DateTime<Utc>) -> RawEvent {
    // CloudTrailEvent is the full record serialized as a JSON string
    let detail: Value = raw
        .get("CloudTrailEvent")
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or(Value::Null);

    let actor = raw
        .get("Username")
        .and_then(Value::as_str)
        .or_else(|| detail.pointer("/userIdentity/arn").and_then(Value::as_str))
        .unwrap_or("Unknown");
    let action = raw
        .get("EventName")
        .and_then(Value::as_str)
        .unwrap_or("UnknownEvent");
    let mutating = match raw.get("ReadOnly") {
        Some(Value::String(s)) => s.eq_ignore_ascii_case("false"),
        Some(Value::Bool(read_only)) => !read_only,
        _ => false,
    };
    let timestamp = event_time(&raw).unwrap_or(fallback_time);

    let error_code = detail
        .get("errorCode")
        .and_then(Value::as_str)
        .filter(|code| !code.is_empty())
        .map(str::to_string);

    let mut event = RawEvent::new(Provider::Aws, timestamp, actor, action).with_mutating(mutating);
    if let Some(code) = error_code {
        let message = detail
            .get("errorMessage")
            .and_then(Value::as_str)
            .unwrap_or("Denied")
            .to_string();
        event = event.with_error(code, Some(message)).with_severity(Severity::Error);
    }
    event.with_payload(raw)
}
