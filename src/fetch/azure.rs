//! Azure Activity Log (management events), paged by `nextLink`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{Page, PageSource};
use crate::config::{non_empty, AzureSettings};
use crate::errors::{DigestError, DigestResult};
use crate::event::{Provider, RawEvent, Severity, TimeRange};

pub const API_VERSION: &str = "2015-04-01";
const TOKEN_SCOPE: &str = "https://management.azure.com/.default";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityLogResponse {
    #[serde(default)]
    value: Vec<Value>,
    #[serde(default)]
    next_link: Option<String>,
}

/// Where the bearer token comes from
enum Credential {
    Token(String),
    /// Ask the Azure CLI on first use, giving up after `timeout`
    AzureCli { command: String, timeout: Duration },
}

pub struct ActivityLogSource {
    client: reqwest::Client,
    values_url: String,
    credential: Credential,
    token: OnceCell<String>,
}

/// Ask the Azure CLI for a management-plane token.
async fn token_from_azure_cli(command: &str, timeout: Duration) -> DigestResult<String> {
    let mut az = Command::new(command);
    az.args([
        "account",
        "get-access-token",
        "--scope",
        TOKEN_SCOPE,
        "--query",
        "accessToken",
        "--output",
        "tsv",
    ])
    .stdin(Stdio::null())
    .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, az.output()).await {
        Ok(output) => output.map_err(|e| {
            DigestError::configuration("azure", format!("could not run {command}: {e}"))
        })?,
        Err(_) => {
            return Err(DigestError::configuration(
                "azure",
                format!(
                    "{command} get-access-token did not finish within {}s",
                    timeout.as_secs_f64()
                ),
            ))
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DigestError::configuration(
            "azure",
            format!("az get-access-token failed: {}", stderr.trim()),
        ));
    }

    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(DigestError::configuration("azure", "az CLI returned an empty token"));
    }
    Ok(token)
}

impl ActivityLogSource {
    /// `None` when no subscription is configured. Without an explicit access
    /// token the Azure CLI is consulted on the first page request, bounded by
    /// `cli_timeout`.
    pub fn from_settings(
        settings: &AzureSettings,
        client: reqwest::Client,
        cli_timeout: Duration,
    ) -> Option<Self> {
        let subscription_id = non_empty(&settings.subscription_id)?;

        let credential = match non_empty(&settings.access_token) {
            Some(token) => Credential::Token(token.to_string()),
            None => Credential::AzureCli {
                command: settings.az_command.clone(),
                timeout: cli_timeout,
            },
        };

        Some(Self::with_credential(
            client,
            &settings.management_endpoint,
            subscription_id,
            credential,
        ))
    }

    pub fn new(client: reqwest::Client, endpoint: &str, subscription_id: &str, token: String) -> Self {
        Self::with_credential(client, endpoint, subscription_id, Credential::Token(token))
    }

    fn with_credential(
        client: reqwest::Client,
        endpoint: &str,
        subscription_id: &str,
        credential: Credential,
    ) -> Self {
        let values_url = format!(
            "{}/subscriptions/{}/providers/Microsoft.Insights/eventtypes/management/values",
            endpoint.trim_end_matches('/'),
            subscription_id
        );
        Self {
            client,
            values_url,
            credential,
            token: OnceCell::new(),
        }
    }

    async fn bearer_token(&self) -> DigestResult<&str> {
        let token = self
            .token
            .get_or_try_init(|| async {
                match &self.credential {
                    Credential::Token(token) => Ok(token.clone()),
                    Credential::AzureCli { command, timeout } => {
                        info!("🔑 Requesting Azure token from {}", command);
                        token_from_azure_cli(command, *timeout).await
                    }
                }
            })
            .await?;
        Ok(token.as_str())
    }

    fn first_page_url(&self, window: &TimeRange) -> DigestResult<Url> {
        let filter = format!(
            "eventTimestamp ge '{}' and eventTimestamp le '{}'",
            window.start.format("%Y-%m-%dT%H:%M:%SZ"),
            window.end.format("%Y-%m-%dT%H:%M:%SZ")
        );
        Url::parse_with_params(
            &self.values_url,
            &[("api-version", API_VERSION), ("$filter", filter.as_str())],
        )
        .map_err(|e| DigestError::configuration("azure", format!("invalid management endpoint: {e}")))
    }
}

#[async_trait]
impl PageSource for ActivityLogSource {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    async fn fetch_page(&self, window: &TimeRange, token: Option<&str>) -> DigestResult<Page> {
        // nextLink already carries api-version, filter and skip token
        let url = match token {
            Some(next_link) => Url::parse(next_link).map_err(|e| {
                DigestError::transient(Provider::Azure, format!("unusable nextLink: {e}"))
            })?,
            None => self.first_page_url(window)?,
        };

        let bearer = self.bearer_token().await?;

        debug!("📡 Fetching batch from Azure...");
        let response = self
            .client
            .get(url)
            .bearer_auth(bearer)
            .header("content-type", "application/json")
            .send()
            .await
            .map_err(|e| DigestError::network("azure activity log", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("HTTP {status}: {}", text.chars().take(200).collect::<String>());
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    DigestError::configuration("azure", message)
                }
                _ => DigestError::transient(Provider::Azure, message),
            });
        }

        let parsed: ActivityLogResponse = response
            .json()
            .await
            .map_err(|e| DigestError::network("decoding activity log response", e))?;

        Ok(Page {
            events: parsed
                .value
                .into_iter()
                .map(|raw| normalize(raw, window.end))
                .collect(),
            next: parsed.next_link,
        })
    }
}

fn localized<'a>(raw: &'a Value, field: &str) -> Option<&'a str> {
    raw.get(field)?.get("localizedValue")?.as_str()
}

fn severity_of(level: &str) -> Severity {
    match level {
        "Critical" => Severity::Critical,
        "Error" => Severity::Error,
        "Warning" => Severity::Warning,
        _ => Severity::Info,
    }
}

/// Flatten one Activity Log record.
///
/// The action keeps the operation status (`"Delete VM (Succeeded)"`) so that
/// started, accepted and succeeded phases group separately. A record is a
/// failure when its level is Warning or worse, or its status is `Failed`.
pub fn normalize(raw: Value, fallback_time: DateTime<Utc>) -> RawEvent {
    let caller = raw.get("caller").and_then(Value::as_str).unwrap_or("Unknown");
    let operation = localized(&raw, "operationName").unwrap_or("Unknown Op");
    let operation_value = raw
        .pointer("/operationName/value")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase();
    let status = localized(&raw, "status").unwrap_or("Status Unknown");
    let level = raw.get("level").and_then(Value::as_str).unwrap_or("Information");
    let severity = severity_of(level);

    let timestamp = raw
        .get("eventTimestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(fallback_time);

    let mutating = ["/write", "/delete", "/action"]
        .iter()
        .any(|suffix| operation_value.contains(suffix));

    let action = format!("{operation} ({status})");
    let mut event = RawEvent::new(Provider::Azure, timestamp, caller, &action)
        .with_mutating(mutating)
        .with_severity(severity);

    let failed = status == "Failed";
    if failed || severity >= Severity::Warning {
        let sub_status = localized(&raw, "subStatus").filter(|s| !s.is_empty());
        let code = match sub_status {
            Some(sub) => sub,
            None if failed => "Failed",
            None => level,
        };
        let message = raw
            .pointer("/properties/statusMessage")
            .and_then(Value::as_str)
            .map(str::to_string);
        event = event.with_error(code, message);
    }

    event.with_payload(raw)
}
