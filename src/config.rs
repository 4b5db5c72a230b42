//! Inbox configuration
//!
//! Loaded from an HCL file (or defaults), then overridden from the
//! environment. Every section is optional.
//!
//! ```hcl
//! server {
//!   host = "0.0.0.0"
//!   port = 18800
//! }
//!
//! encryption {
//!   key_id  = "2026-01"
//!   key_env = "A3S_INBOX_ENCRYPTION_KEY"
//!   previous_keys = [{ key_id = "2025-06", key_env = "A3S_INBOX_KEY_2025_06" }]
//! }
//!
//! channels {
//!   request_timeout_ms = 10000
//! }
//!
//! audience {
//!   cache_ttl_secs = 300
//!   sources = [{ provider = "meta_ads", endpoint = "https://analytics.internal/meta" }]
//! }
//!
//! oauth {
//!   apps = [{ provider = "gmail", client_id = "123.apps", client_secret = "GOOGLE_CLIENT_SECRET" }]
//! }
//! ```

use crate::crypto::{decode_key, Aes256GcmCipher};
use crate::error::{InboxError, Result};
use crate::types::Provider;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "A3S_INBOX_";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboxConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub channels: ChannelSettings,
    #[serde(default)]
    pub audience: AudienceSettings,
    #[serde(default)]
    pub oauth: OAuthSettings,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    18800
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default = "default_key_id")]
    pub key_id: String,
    /// Variable holding the base64 key (an inline key is accepted as fallback)
    #[serde(default = "default_key_env")]
    pub key_env: String,
    /// Decrypt-only keys kept around during rotation
    #[serde(default)]
    pub previous_keys: Vec<KeyRef>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key_id: default_key_id(),
            key_env: default_key_env(),
            previous_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyRef {
    pub key_id: String,
    pub key_env: String,
}

fn default_key_id() -> String {
    "default".into()
}
fn default_key_env() -> String {
    "A3S_INBOX_ENCRYPTION_KEY".into()
}

impl EncryptionConfig {
    /// Build the credential cipher from the configured key variables
    pub fn build_cipher(&self) -> Result<Aes256GcmCipher> {
        let active = read_key(&self.key_env)?;
        let mut cipher = Aes256GcmCipher::new(self.key_id.clone(), &active);
        for previous in &self.previous_keys {
            let key = read_key(&previous.key_env)?;
            cipher = cipher.with_previous_key(previous.key_id.clone(), &key);
        }
        Ok(cipher)
    }
}

fn read_key(reference: &str) -> Result<[u8; 32]> {
    decode_key(&resolve_secret(reference)?)
}

/// Timeouts and API endpoints shared by every channel provider
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSettings {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connection_test_timeout_ms")]
    pub connection_test_timeout_ms: u64,
    /// Replay window for timestamped signatures
    #[serde(default = "default_signature_max_age_secs")]
    pub signature_max_age_secs: i64,
    #[serde(default = "default_preview_max_chars")]
    pub preview_max_chars: usize,
    #[serde(default = "default_slack_api_base")]
    pub slack_api_base: String,
    #[serde(default = "default_twilio_api_base")]
    pub twilio_api_base: String,
    #[serde(default = "default_gmail_api_base")]
    pub gmail_api_base: String,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            connection_test_timeout_ms: default_connection_test_timeout_ms(),
            signature_max_age_secs: default_signature_max_age_secs(),
            preview_max_chars: default_preview_max_chars(),
            slack_api_base: default_slack_api_base(),
            twilio_api_base: default_twilio_api_base(),
            gmail_api_base: default_gmail_api_base(),
        }
    }
}

impl ChannelSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connection_test_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_test_timeout_ms)
    }
}

fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_connection_test_timeout_ms() -> u64 {
    5_000
}
fn default_signature_max_age_secs() -> i64 {
    300
}
fn default_preview_max_chars() -> usize {
    120
}
fn default_slack_api_base() -> String {
    "https://slack.com/api".into()
}
fn default_twilio_api_base() -> String {
    "https://api.twilio.com/2010-04-01".into()
}
fn default_gmail_api_base() -> String {
    "https://gmail.googleapis.com/gmail/v1".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudienceSettings {
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// 0 disables the context cache
    #[serde(default)]
    pub cache_ttl_secs: u64,
    /// Below this many successful platforms a diversification tip is issued
    #[serde(default = "default_diversification_threshold")]
    pub diversification_threshold: usize,
    /// HTTP analytics endpoints, one per provider
    #[serde(default)]
    pub sources: Vec<AnalyticsEndpoint>,
}

/// Endpoint returning a provider's analytics as JSON
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AnalyticsEndpoint {
    pub provider: Provider,
    pub endpoint: String,
}

impl Default for AudienceSettings {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: default_fetch_timeout_ms(),
            cache_ttl_secs: 0,
            diversification_threshold: default_diversification_threshold(),
            sources: Vec::new(),
        }
    }
}

impl AudienceSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs))
    }
}

fn default_fetch_timeout_ms() -> u64 {
    8_000
}
fn default_diversification_threshold() -> usize {
    3
}

/// OAuth apps used to refresh expiring tokens
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthSettings {
    #[serde(default = "default_oauth_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub apps: Vec<OAuthAppConfig>,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_oauth_timeout_ms(),
            apps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthAppConfig {
    pub provider: Provider,
    pub client_id: String,
    /// Secret reference, resolved with `resolve_secret`
    pub client_secret: String,
    /// Overrides the provider's well-known token endpoint
    #[serde(default)]
    pub token_url: Option<String>,
}

fn default_oauth_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

impl InboxConfig {
    /// Parse an HCL file
    pub fn from_file(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path)
            .map_err(|e| InboxError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_hcl(&src)
            .map_err(|e| InboxError::Config(format!("{} ({})", e, path.display())))
    }

    /// Parse HCL source
    pub fn from_hcl(src: &str) -> Result<Self> {
        let cfg: InboxConfig =
            hcl::from_str(src).map_err(|e| InboxError::Config(format!("parse error: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from `path` when given, otherwise defaults; then apply env overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `A3S_INBOX_*` overrides from a variable lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(host) = var("HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(json) = var("LOG_JSON") {
            self.log.json = matches!(json.as_str(), "1" | "true" | "yes");
        }
        if let Some(key_id) = var("KEY_ID") {
            self.encryption.key_id = key_id;
        }
        if let Some(ms) = var("REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.channels.request_timeout_ms = ms;
        }
        if let Some(ms) = var("FETCH_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.audience.fetch_timeout_ms = ms;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels.request_timeout_ms == 0 {
            return Err(InboxError::Config(
                "channels.request_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.channels.connection_test_timeout_ms == 0 {
            return Err(InboxError::Config(
                "channels.connection_test_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.channels.preview_max_chars == 0 {
            return Err(InboxError::Config(
                "channels.preview_max_chars must be greater than 0".into(),
            ));
        }
        if self.audience.fetch_timeout_ms == 0 {
            return Err(InboxError::Config(
                "audience.fetch_timeout_ms must be greater than 0".into(),
            ));
        }
        let mut ids = vec![self.encryption.key_id.as_str()];
        for previous in &self.encryption.previous_keys {
            if ids.contains(&previous.key_id.as_str()) {
                return Err(InboxError::Config(format!(
                    "duplicate encryption key id '{}'",
                    previous.key_id
                )));
            }
            ids.push(previous.key_id.as_str());
        }
        Ok(())
    }
}

/// Resolve a secret reference: environment variable first, inline value as fallback
pub fn resolve_secret(reference: &str) -> Result<String> {
    if let Ok(val) = std::env::var(reference).or_else(|_| std::env::var(reference.to_uppercase()))
    {
        return Ok(val);
    }
    if !reference.is_empty() {
        return Ok(reference.to_string());
    }
    Err(InboxError::Config(format!(
        "Failed to resolve secret: {}",
        reference
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = InboxConfig::default();
        assert_eq!(cfg.server.bind_addr(), "127.0.0.1:18800");
        assert_eq!(cfg.encryption.key_env, "A3S_INBOX_ENCRYPTION_KEY");
        assert_eq!(cfg.channels.request_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.channels.signature_max_age_secs, 300);
        assert_eq!(cfg.channels.preview_max_chars, 120);
        assert_eq!(cfg.audience.diversification_threshold, 3);
        assert!(cfg.audience.cache_ttl().is_none());
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn test_parse_hcl() {
        let cfg = InboxConfig::from_hcl(
            r#"
            server {
              host = "0.0.0.0"
              port = 9000
            }
            encryption {
              key_id = "k2"
              previous_keys = [{ key_id = "k1", key_env = "OLD_KEY" }]
            }
            channels {
              connection_test_timeout_ms = 2500
              slack_api_base = "http://localhost:1234"
            }
            audience {
              cache_ttl_secs = 60
              sources = [{ provider = "google_ads", endpoint = "https://analytics.internal/google" }]
            }
            oauth {
              apps = [{ provider = "slack", client_id = "c1", client_secret = "SLACK_SECRET" }]
            }
            "#,
        )
        .unwrap();

        assert_eq!(cfg.server.bind_addr(), "0.0.0.0:9000");
        assert_eq!(cfg.encryption.key_id, "k2");
        assert_eq!(cfg.encryption.previous_keys[0].key_env, "OLD_KEY");
        assert_eq!(
            cfg.channels.connection_test_timeout(),
            Duration::from_millis(2500)
        );
        assert_eq!(cfg.channels.slack_api_base, "http://localhost:1234");
        assert_eq!(cfg.channels.request_timeout_ms, 10_000);
        assert_eq!(cfg.audience.cache_ttl(), Some(Duration::from_secs(60)));
        assert_eq!(cfg.audience.sources[0].provider, Provider::GoogleAds);
        assert_eq!(cfg.oauth.apps[0].provider, Provider::Slack);
        assert!(cfg.oauth.apps[0].token_url.is_none());
    }

    #[test]
    fn test_duplicate_key_ids_rejected() {
        let result = InboxConfig::from_hcl(
            r#"
            encryption {
              key_id = "k1"
              previous_keys = [{ key_id = "k1", key_env = "X" }]
            }
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = InboxConfig::from_hcl("channels {\n request_timeout_ms = 0\n}\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("A3S_INBOX_PORT", "8443"),
            ("A3S_INBOX_LOG_JSON", "true"),
            ("A3S_INBOX_LOG_LEVEL", "debug"),
            ("A3S_INBOX_PORT_IGNORED", "1"),
        ]
        .into_iter()
        .collect();
        let mut cfg = InboxConfig::default();
        cfg.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.server.port, 8443);
        assert!(cfg.log.json);
        assert_eq!(cfg.log.level, "debug");
        assert_eq!(cfg.server.host, "127.0.0.1");
    }

    #[test]
    fn test_invalid_port_override_ignored() {
        let mut cfg = InboxConfig::default();
        cfg.apply_env(|k| (k == "A3S_INBOX_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(cfg.server.port, 18800);
    }

    #[test]
    fn test_resolve_secret_inline_fallback() {
        let value = resolve_secret("inline-secret-value-a3s-inbox").unwrap();
        assert_eq!(value, "inline-secret-value-a3s-inbox");
        assert!(resolve_secret("").is_err());
    }

    #[test]
    fn test_build_cipher_missing_env() {
        let cfg = EncryptionConfig {
            key_id: "k".into(),
            key_env: "A3S_INBOX_TEST_KEY_THAT_IS_NOT_SET".into(),
            previous_keys: Vec::new(),
        };
        assert!(cfg.build_cipher().is_err());
    }
}
