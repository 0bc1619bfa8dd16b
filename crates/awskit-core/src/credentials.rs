//! Credential material and the sources it can be loaded from.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub const ENV_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
pub const ENV_SHARED_CREDENTIALS_FILE: &str = "AWS_SHARED_CREDENTIALS_FILE";

/// Authentication material for signing requests.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: String,
    /// `None` for long-lived keys.
    pub expiration: Option<DateTime<Utc>>,
    /// Which source produced these credentials ("static", "environment", ...).
    pub provider_name: String,
}

impl Credentials {
    pub fn new(access_key_id: &str, secret_access_key: &str, region: &str) -> Self {
        Self {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            session_token: None,
            region: region.to_string(),
            expiration: None,
            provider_name: "static".to_string(),
        }
    }

    pub fn with_session_token(mut self, token: &str) -> Self {
        self.session_token = Some(token.to_string());
        self
    }

    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_provider(mut self, name: &str) -> Self {
        self.provider_name = name.to_string();
        self
    }

    /// Whether the keys are missing.
    pub fn is_empty(&self) -> bool {
        self.access_key_id.trim().is_empty() || self.secret_access_key.trim().is_empty()
    }

    pub fn is_expired(&self) -> bool {
        self.expires_within(std::time::Duration::ZERO)
    }

    /// Whether the credentials expire within `margin` from now.
    pub fn expires_within(&self, margin: std::time::Duration) -> bool {
        match self.expiration {
            Some(exp) => {
                let margin = ChronoDuration::from_std(margin).unwrap_or_else(|_| ChronoDuration::days(36_500));
                Utc::now().checked_add_signed(margin).map_or(true, |limit| exp <= limit)
            }
            None => false,
        }
    }

    /// Read the standard environment variables through `lookup`.
    pub fn from_env_with<F>(lookup: F, region: &str) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let access_key = lookup(ENV_ACCESS_KEY_ID).filter(|v| !v.trim().is_empty())?;
        let secret_key = lookup(ENV_SECRET_ACCESS_KEY).filter(|v| !v.trim().is_empty())?;
        let mut creds = Credentials::new(&access_key, &secret_key, region).with_provider("environment");
        creds.session_token = lookup(ENV_SESSION_TOKEN).filter(|v| !v.trim().is_empty());
        Some(creds)
    }

    pub fn from_environment(region: &str) -> Option<Self> {
        Self::from_env_with(|name| std::env::var(name).ok(), region)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .field("region", &self.region)
            .field("expiration", &self.expiration)
            .field("provider_name", &self.provider_name)
            .finish()
    }
}

// ── Sources ─────────────────────────────────────────────────────────

/// Where credentials come from.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialSource {
    /// Fixed keys. Never refreshable.
    Static(Credentials),
    /// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`.
    Environment,
    /// A named profile in a shared credentials file.
    Profile { name: String, path: Option<PathBuf> },
    /// Temporary credentials for a role, obtained with the inner source.
    AssumeRole(AssumeRoleSource),
    /// First source that yields credentials wins.
    Chain(Vec<CredentialSource>),
}

impl CredentialSource {
    /// Environment first, then the `default` profile.
    pub fn default_chain() -> Self {
        CredentialSource::Chain(vec![
            CredentialSource::Environment,
            CredentialSource::Profile {
                name: "default".to_string(),
                path: None,
            },
        ])
    }

    pub fn name(&self) -> &'static str {
        match self {
            CredentialSource::Static(_) => "static",
            CredentialSource::Environment => "environment",
            CredentialSource::Profile { .. } => "profile",
            CredentialSource::AssumeRole(_) => "assume_role",
            CredentialSource::Chain(_) => "chain",
        }
    }
}

/// Parameters of a role assumption hop.
#[derive(Debug, Clone, PartialEq)]
pub struct AssumeRoleSource {
    pub role_arn: String,
    pub session_name: String,
    pub external_id: Option<String>,
    pub duration_seconds: Option<u32>,
    /// Credentials used to call the token issuer. May itself be a role.
    pub source: Box<CredentialSource>,
}

impl AssumeRoleSource {
    pub fn new(role_arn: &str, source: CredentialSource) -> Self {
        Self {
            role_arn: role_arn.to_string(),
            session_name: format!("awskit-{}", Utc::now().timestamp()),
            external_id: None,
            duration_seconds: None,
            source: Box::new(source),
        }
    }

    pub fn request(&self) -> AssumeRoleRequest {
        AssumeRoleRequest {
            role_arn: self.role_arn.clone(),
            session_name: self.session_name.clone(),
            external_id: self.external_id.clone(),
            duration_seconds: self.duration_seconds,
        }
    }
}

/// Input to a token issuer's AssumeRole call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssumeRoleRequest {
    pub role_arn: String,
    pub session_name: String,
    pub external_id: Option<String>,
    pub duration_seconds: Option<u32>,
}

// ── Shared credentials file ─────────────────────────────────────────

/// Location of the shared credentials file.
pub fn default_credentials_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(ENV_SHARED_CREDENTIALS_FILE) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::home_dir().map(|home| home.join(".aws").join("credentials"))
}

/// Parse an INI-style credentials file into `profile -> key -> value`.
pub fn parse_profiles(content: &str) -> HashMap<String, HashMap<String, String>> {
    let mut profiles: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current: Option<String> = None;

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = section.trim();
            let name = name.strip_prefix("profile ").unwrap_or(name).trim().to_string();
            profiles.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }
        let Some(profile) = current.as_ref() else {
            continue;
        };
        if let Some((key, value)) = line.split_once('=') {
            profiles
                .entry(profile.clone())
                .or_default()
                .insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    profiles
}

/// Load one profile's credentials from `path`.
///
/// Returns `Ok(None)` when the file or the profile is missing or lacks keys.
pub fn load_profile(path: &Path, name: &str, region: &str) -> std::io::Result<Option<Credentials>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let profiles = parse_profiles(&content);
    let Some(entries) = profiles.get(name) else {
        return Ok(None);
    };
    let (Some(ak), Some(sk)) = (
        entries.get("aws_access_key_id"),
        entries.get("aws_secret_access_key"),
    ) else {
        return Ok(None);
    };
    if ak.is_empty() || sk.is_empty() {
        return Ok(None);
    }
    let region = entries.get("region").map(String::as_str).unwrap_or(region);
    let mut creds = Credentials::new(ak, sk, region).with_provider(&format!("profile:{}", name));
    creds.session_token = entries.get("aws_session_token").filter(|t| !t.is_empty()).cloned();
    if let Some(exp) = entries.get("expiration").and_then(|e| DateTime::parse_from_rfc3339(e).ok()) {
        creds.expiration = Some(exp.with_timezone(&Utc));
    }
    Ok(Some(creds))
}

/// Region configured for a profile, if any.
pub fn profile_region(path: &Path, name: &str) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    parse_profiles(&content).get(name)?.get("region").cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    const SAMPLE: &str = "\
# comment
[default]
aws_access_key_id = AKIADEFAULT
aws_secret_access_key = secretdefault
region = eu-west-1

[profile ci]
aws_access_key_id=AKIACI
aws_secret_access_key=secretci
aws_session_token=tok
expiration=2030-01-01T00:00:00Z

[broken]
aws_access_key_id = AKIAONLY
";

    #[test]
    fn debug_redacts_secrets() {
        let creds = Credentials::new("AKIA", "very-secret", "us-east-1").with_session_token("session-secret");
        let dbg = format!("{:?}", creds);
        assert!(dbg.contains("AKIA"));
        assert!(!dbg.contains("very-secret"));
        assert!(!dbg.contains("session-secret"));
    }

    #[test]
    fn expiry_margin() {
        let soon = Credentials::new("a", "b", "r").with_expiration(Utc::now() + ChronoDuration::seconds(30));
        assert!(soon.expires_within(Duration::from_secs(60)));
        assert!(!soon.expires_within(Duration::from_secs(5)));
        assert!(!soon.is_expired());

        let past = Credentials::new("a", "b", "r").with_expiration(Utc::now() - ChronoDuration::seconds(1));
        assert!(past.is_expired());

        let forever = Credentials::new("a", "b", "r");
        assert!(!forever.expires_within(Duration::from_secs(3600)));
    }

    #[test]
    fn env_lookup() {
        let vars: HashMap<&str, &str> = [
            (ENV_ACCESS_KEY_ID, "AKIAENV"),
            (ENV_SECRET_ACCESS_KEY, "envsecret"),
            (ENV_SESSION_TOKEN, ""),
        ]
        .into_iter()
        .collect();
        let creds = Credentials::from_env_with(|k| vars.get(k).map(|v| v.to_string()), "us-west-2").unwrap();
        assert_eq!(creds.access_key_id, "AKIAENV");
        assert_eq!(creds.session_token, None);
        assert_eq!(creds.provider_name, "environment");

        assert!(Credentials::from_env_with(|_| None, "us-west-2").is_none());
    }

    #[test]
    fn parses_profiles() {
        let profiles = parse_profiles(SAMPLE);
        assert_eq!(profiles["default"]["aws_access_key_id"], "AKIADEFAULT");
        assert_eq!(profiles["ci"]["aws_session_token"], "tok");
        assert!(profiles.contains_key("broken"));
    }

    #[test]
    fn loads_profile_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let default = load_profile(file.path(), "default", "us-east-1").unwrap().unwrap();
        assert_eq!(default.region, "eu-west-1");
        assert_eq!(default.provider_name, "profile:default");

        let ci = load_profile(file.path(), "ci", "us-east-1").unwrap().unwrap();
        assert_eq!(ci.region, "us-east-1");
        assert_eq!(ci.session_token.as_deref(), Some("tok"));
        assert!(ci.expiration.is_some());

        assert!(load_profile(file.path(), "broken", "us-east-1").unwrap().is_none());
        assert!(load_profile(file.path(), "absent", "us-east-1").unwrap().is_none());
        assert_eq!(profile_region(file.path(), "default").as_deref(), Some("eu-west-1"));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope");
        assert!(load_profile(&path, "default", "us-east-1").unwrap().is_none());
    }
}
