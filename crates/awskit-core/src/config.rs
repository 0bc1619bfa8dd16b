//! Toolkit configuration and region handling.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! environment variables. Front-ends apply their own flags last.

use crate::credentials::{default_credentials_path, profile_region, AssumeRoleSource, CredentialSource, Credentials};
use crate::operation::Service;
use crate::retry::{RetryMode, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_REGION: &str = "us-east-1";
pub const ENV_CONFIG_PATH: &str = "AWSKIT_CONFIG";

// ── Regions ─────────────────────────────────────────────────────────

/// Standard AWS regions.
pub const AWS_REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "af-south-1",
    "ap-east-1",
    "ap-south-1",
    "ap-south-2",
    "ap-southeast-1",
    "ap-southeast-2",
    "ap-southeast-3",
    "ap-southeast-4",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-northeast-3",
    "ca-central-1",
    "ca-west-1",
    "eu-central-1",
    "eu-central-2",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "eu-south-1",
    "eu-south-2",
    "eu-north-1",
    "il-central-1",
    "me-south-1",
    "me-central-1",
    "sa-east-1",
    // GovCloud
    "us-gov-east-1",
    "us-gov-west-1",
    // China
    "cn-north-1",
    "cn-northwest-1",
];

/// A region code such as "eu-west-1".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
}

impl Region {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.trim().to_string(),
        }
    }

    pub fn is_known(&self) -> bool {
        AWS_REGIONS.contains(&self.name.as_str())
    }

    /// Partition of this region (aws, aws-cn, aws-us-gov).
    pub fn partition(&self) -> &'static str {
        if self.name.starts_with("cn-") {
            "aws-cn"
        } else if self.name.starts_with("us-gov-") {
            "aws-us-gov"
        } else {
            "aws"
        }
    }

    pub fn dns_suffix(&self) -> &'static str {
        if self.partition() == "aws-cn" {
            "amazonaws.com.cn"
        } else {
            "amazonaws.com"
        }
    }

    /// HTTPS endpoint of `service` in this region.
    pub fn endpoint(&self, service: Service) -> String {
        let prefix = service.endpoint_prefix();
        let suffix = self.dns_suffix();
        match (service, self.partition()) {
            // IAM has one endpoint per partition.
            (Service::Iam, "aws") => "https://iam.amazonaws.com".to_string(),
            (Service::Iam, "aws-us-gov") => "https://iam.us-gov.amazonaws.com".to_string(),
            (Service::Iam, _) => format!("https://iam.cn-north-1.{}", suffix),
            (Service::Sts, "aws") if self.name == "us-east-1" => "https://sts.amazonaws.com".to_string(),
            _ => format!("https://{}.{}.{}", prefix, self.name, suffix),
        }
    }

    /// Region used to sign requests for `service`.
    pub fn signing_region(&self, service: Service) -> String {
        match (service, self.partition()) {
            (Service::Iam, "aws") => "us-east-1".to_string(),
            (Service::Iam, "aws-us-gov") => "us-gov-west-1".to_string(),
            (Service::Iam, _) => "cn-north-1".to_string(),
            _ => self.name.clone(),
        }
    }
}

impl Default for Region {
    fn default() -> Self {
        Self::new(DEFAULT_REGION)
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value '{value}' for {name}")]
    InvalidEnv { name: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Settings ────────────────────────────────────────────────────────

/// How credentials are obtained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialSettings {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    /// Named profile in the shared credentials file.
    pub profile: Option<String>,
    /// Shared credentials file; `~/.aws/credentials` when unset.
    pub credentials_file: Option<PathBuf>,
    /// Role to assume with the credentials above.
    pub role_arn: Option<String>,
    pub role_session_name: Option<String>,
    pub external_id: Option<String>,
    pub role_duration_seconds: Option<u32>,
}

/// All recognized settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolkitConfig {
    /// Explicit region; falls back to the profile's region, then us-east-1.
    pub region: Option<String>,
    pub max_attempts: u32,
    pub max_total_backoff_seconds: u64,
    pub credential_refresh_margin_seconds: u64,
    /// Provider default when unset.
    pub page_size: Option<u32>,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub throttle_backoff_ms: u64,
    pub retry_mode: RetryMode,
    pub attempt_timeout_seconds: u64,
    /// Endpoint override for LocalStack, MinIO and similar.
    pub endpoint_url: Option<String>,
    pub credentials: CredentialSettings,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            region: None,
            max_attempts: 5,
            max_total_backoff_seconds: 30,
            credential_refresh_margin_seconds: 60,
            page_size: None,
            initial_backoff_ms: 100,
            max_backoff_ms: 20_000,
            throttle_backoff_ms: 500,
            retry_mode: RetryMode::Standard,
            attempt_timeout_seconds: 30,
            endpoint_url: None,
            credentials: CredentialSettings::default(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl ToolkitConfig {
    /// Defaults, then `path` (or `$AWSKIT_CONFIG`), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var(ENV_CONFIG_PATH)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_from(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(region) = get("AWS_REGION").or_else(|| get("AWS_DEFAULT_REGION")) {
            self.region = Some(region);
        }
        if let Some(profile) = get("AWS_PROFILE") {
            self.credentials.profile = Some(profile);
        }
        if let Some(v) = get("AWSKIT_MAX_ATTEMPTS") {
            self.max_attempts = parse_env("AWSKIT_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("AWSKIT_MAX_TOTAL_BACKOFF_SECONDS") {
            self.max_total_backoff_seconds = parse_env("AWSKIT_MAX_TOTAL_BACKOFF_SECONDS", &v)?;
        }
        if let Some(v) = get("AWSKIT_REFRESH_MARGIN_SECONDS") {
            self.credential_refresh_margin_seconds = parse_env("AWSKIT_REFRESH_MARGIN_SECONDS", &v)?;
        }
        if let Some(v) = get("AWSKIT_PAGE_SIZE") {
            self.page_size = Some(parse_env("AWSKIT_PAGE_SIZE", &v)?);
        }
        if let Some(v) = get("AWSKIT_ENDPOINT_URL") {
            self.endpoint_url = Some(v);
        }
        if let Some(v) = get("AWSKIT_LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".to_string()));
        }
        if let Some(ref region) = self.region {
            if region.trim().is_empty() {
                return Err(ConfigError::Invalid("region must not be empty".to_string()));
            }
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        if self.page_size == Some(0) {
            return Err(ConfigError::Invalid("page_size must be at least 1".to_string()));
        }
        let creds = &self.credentials;
        if creds.access_key_id.is_some() != creds.secret_access_key.is_some() {
            return Err(ConfigError::Invalid(
                "access_key_id and secret_access_key must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings that are accepted but probably mistaken. Kept out of
    /// [`ToolkitConfig::validate`] so callers can report them once logging is up.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Some(region) = self.region.as_deref().filter(|r| !r.trim().is_empty()) {
            let region = Region::new(region);
            if !region.is_known() {
                warnings.push(format!("region '{}' is not in the known region list", region));
            }
        }
        warnings
    }

    /// Region from config, else from the configured profile, else us-east-1.
    pub fn effective_region(&self) -> Region {
        if let Some(region) = self.region.as_deref().filter(|r| !r.trim().is_empty()) {
            return Region::new(region);
        }
        let profile = self.credentials.profile.as_deref().unwrap_or("default");
        self.credentials
            .credentials_file
            .clone()
            .or_else(default_credentials_path)
            .and_then(|path| profile_region(&path, profile))
            .map(|r| Region::new(&r))
            .unwrap_or_default()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            max_total_backoff: Duration::from_secs(self.max_total_backoff_seconds),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            throttle_backoff: Duration::from_millis(self.throttle_backoff_ms),
            mode: self.retry_mode,
        }
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.credential_refresh_margin_seconds)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_seconds)
    }

    /// Credential source described by the settings.
    ///
    /// Explicit keys win over a named profile; with neither, the environment
    /// and then the `default` profile are tried. A role ARN wraps the result.
    pub fn credential_source(&self) -> CredentialSource {
        let settings = &self.credentials;
        let region = self.effective_region();
        let base = match (&settings.access_key_id, &settings.secret_access_key, &settings.profile) {
            (Some(ak), Some(sk), _) => {
                let mut creds = Credentials::new(ak, sk, &region.name);
                creds.session_token = settings.session_token.clone();
                CredentialSource::Static(creds)
            }
            (_, _, Some(profile)) => CredentialSource::Profile {
                name: profile.clone(),
                path: settings.credentials_file.clone(),
            },
            _ => CredentialSource::Chain(vec![
                CredentialSource::Environment,
                CredentialSource::Profile {
                    name: "default".to_string(),
                    path: settings.credentials_file.clone(),
                },
            ]),
        };
        match settings.role_arn.as_deref().filter(|arn| !arn.is_empty()) {
            Some(arn) => {
                let mut role = AssumeRoleSource::new(arn, base);
                if let Some(ref name) = settings.role_session_name {
                    role.session_name = name.clone();
                }
                role.external_id = settings.external_id.clone();
                role.duration_seconds = settings.role_duration_seconds;
                CredentialSource::AssumeRole(role)
            }
            None => base,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
    })
}
