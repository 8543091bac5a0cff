// config.rs
// Layered runtime configuration: defaults -> TOML file -> CLOUDLOG_* env -> provider-standard env

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{DigestError, DigestResult};

pub const DEFAULT_CONFIG_FILE: &str = "cloudlog.toml";
const REDACTED: &str = "<redacted>";

/// Longest lookback accepted, one year
pub const MAX_WINDOW_HOURS: u32 = 8760;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DigestConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    #[serde(default)]
    pub aws: AwsSettings,
    #[serde(default)]
    pub azure: AzureSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AwsSettings {
    #[serde(default = "default_aws_region")]
    pub region: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    /// Overrides `https://cloudtrail.{region}.amazonaws.com`
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_aws_read_cap")]
    pub read_cap: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AzureSettings {
    #[serde(default)]
    pub subscription_id: Option<String>,
    /// Bearer token; when absent the Azure CLI is asked for one
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_management_endpoint")]
    pub management_endpoint: String,
    #[serde(default = "default_azure_read_cap")]
    pub read_cap: usize,
    /// Azure CLI executable used for the token fallback
    #[serde(default = "default_az_command")]
    pub az_command: String,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_window_hours() -> u32 {
    24
}

fn default_request_timeout() -> u64 {
    30
}

fn default_aws_region() -> String {
    "us-east-1".to_string()
}

fn default_aws_read_cap() -> usize {
    10
}

fn default_management_endpoint() -> String {
    "https://management.azure.com".to_string()
}

fn default_azure_read_cap() -> usize {
    15
}

fn default_az_command() -> String {
    "az".to_string()
}

impl Default for AwsSettings {
    fn default() -> Self {
        AwsSettings {
            region: default_aws_region(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            endpoint: None,
            read_cap: default_aws_read_cap(),
        }
    }
}

impl Default for AzureSettings {
    fn default() -> Self {
        AzureSettings {
            subscription_id: None,
            access_token: None,
            management_endpoint: default_management_endpoint(),
            read_cap: default_azure_read_cap(),
            az_command: default_az_command(),
        }
    }
}

impl Default for DigestConfig {
    fn default() -> Self {
        DigestConfig {
            output_dir: default_output_dir(),
            window_hours: default_window_hours(),
            request_timeout_secs: default_request_timeout(),
            run_timeout_secs: None,
            aws: AwsSettings::default(),
            azure: AzureSettings::default(),
        }
    }
}

/// Map the variables the cloud SDKs already understand onto our keys.
fn standard_env() -> Env {
    Env::raw().filter_map(|key| {
        let mapped = match key.as_str().to_ascii_uppercase().as_str() {
            "AWS_ACCESS_KEY_ID" => "aws.access_key_id",
            "AWS_SECRET_ACCESS_KEY" => "aws.secret_access_key",
            "AWS_SESSION_TOKEN" => "aws.session_token",
            "AWS_REGION" | "AWS_DEFAULT_REGION" => "aws.region",
            "AZURE_SUBSCRIPTION_ID" => "azure.subscription_id",
            "AZURE_ACCESS_TOKEN" => "azure.access_token",
            _ => return None,
        };
        Some(mapped.into())
    })
}

/// Build the figment without extracting, so callers can layer extra providers.
pub fn figment(path: Option<&Path>) -> Figment {
    let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    Figment::from(Serialized::defaults(DigestConfig::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed("CLOUDLOG_").split("__"))
        .merge(standard_env())
}

/// Load and validate configuration.
pub fn load_config(path: Option<&Path>) -> DigestResult<DigestConfig> {
    let config: DigestConfig = figment(path)
        .extract()
        .map_err(|e| DigestError::configuration("global", e.to_string()))?;
    config.validate()?;
    Ok(config)
}

impl DigestConfig {
    pub fn validate(&self) -> DigestResult<()> {
        if self.window_hours == 0 || self.window_hours > MAX_WINDOW_HOURS {
            return Err(DigestError::configuration(
                "global",
                format!("window_hours must be between 1 and {MAX_WINDOW_HOURS}"),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(DigestError::configuration(
                "global",
                "request_timeout_secs must be greater than 0",
            ));
        }
        if self.aws.read_cap == 0 {
            return Err(DigestError::configuration("aws", "read_cap must be greater than 0"));
        }
        if self.azure.read_cap == 0 {
            return Err(DigestError::configuration("azure", "read_cap must be greater than 0"));
        }
        Ok(())
    }

    /// Copy with every credential replaced, safe to print
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        let hide = |value: &mut Option<String>| {
            if value.is_some() {
                *value = Some(REDACTED.to_string());
            }
        };
        hide(&mut copy.aws.secret_access_key);
        hide(&mut copy.aws.session_token);
        hide(&mut copy.azure.access_token);
        copy
    }
}

/// Treat blank strings from env/TOML the same as unset
pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
