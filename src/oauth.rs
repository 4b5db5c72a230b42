//! OAuth token exchange and refresh
//!
//! `TokenRefresher` is the seam the vault uses for single-flight refresh;
//! `OAuthTokenClient` implements it against standard OAuth 2.0 token
//! endpoints with reqwest.

use crate::credential::TokenData;
use crate::error::{InboxError, Result};
use crate::types::Provider;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Exchanges a refresh token for a fresh token bundle
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, provider: Provider, refresh_token: &str) -> Result<TokenData>;
}

/// OAuth application registered with one provider
#[derive(Debug, Clone)]
pub struct OAuthApp {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl OAuthApp {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Google's token endpoint (Gmail, Google Ads, YouTube)
    pub fn google(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self::new("https://oauth2.googleapis.com/token", client_id, client_secret)
    }

    /// Slack's v2 token endpoint
    pub fn slack(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self::new("https://slack.com/api/oauth.v2.access", client_id, client_secret)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl TokenResponse {
    fn into_token_data(self, provider: Provider) -> Result<TokenData> {
        if let Some(error) = self.error {
            let reason = match self.error_description {
                Some(desc) => format!("{}: {}", error, desc),
                None => error,
            };
            return Err(InboxError::provider(provider.as_str(), reason));
        }
        let access_token = self.access_token.ok_or_else(|| {
            InboxError::provider(provider.as_str(), "token response has no access_token")
        })?;
        Ok(TokenData {
            access_token,
            refresh_token: self.refresh_token,
            expires_at: self
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            token_type: self.token_type,
            scope: self.scope,
            extra: Default::default(),
        })
    }
}

/// reqwest-backed OAuth client for every configured provider
pub struct OAuthTokenClient {
    http: reqwest::Client,
    apps: HashMap<Provider, OAuthApp>,
}

impl OAuthTokenClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            apps: HashMap::new(),
        })
    }

    /// Register the OAuth app used for `provider`
    pub fn with_app(mut self, provider: Provider, app: OAuthApp) -> Self {
        self.apps.insert(provider, app);
        self
    }

    fn app(&self, provider: Provider) -> Result<&OAuthApp> {
        self.apps.get(&provider).ok_or_else(|| {
            InboxError::Config(format!("No OAuth app configured for {}", provider))
        })
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange_code(
        &self,
        provider: Provider,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenData> {
        let app = self.app(provider)?;
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", app.client_id.as_str()),
            ("client_secret", app.client_secret.as_str()),
        ];
        self.request_token(provider, &app.token_url, &form).await
    }

    async fn request_token(
        &self,
        provider: Provider,
        token_url: &str,
        form: &[(&str, &str)],
    ) -> Result<TokenData> {
        let resp = self.http.post(token_url).form(form).send().await?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(InboxError::provider(
                provider.as_str(),
                format!("token endpoint returned {}", status),
            ));
        }
        let body: TokenResponse = resp.json().await.map_err(|e| {
            InboxError::provider(provider.as_str(), format!("invalid token response: {}", e))
        })?;
        let tokens = body.into_token_data(provider)?;
        tracing::debug!(provider = %provider, "OAuth token issued");
        Ok(tokens)
    }
}

#[async_trait]
impl TokenRefresher for OAuthTokenClient {
    async fn refresh(&self, provider: Provider, refresh_token: &str) -> Result<TokenData> {
        let app = self.app(provider)?;
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", app.client_id.as_str()),
            ("client_secret", app.client_secret.as_str()),
        ];
        self.request_token(provider, &app.token_url, &form).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_normalized() {
        let resp: TokenResponse = serde_json::from_value(serde_json::json!({
            "access_token": "ya29.new",
            "expires_in": 3599,
            "token_type": "Bearer",
            "scope": "https://www.googleapis.com/auth/gmail.readonly"
        }))
        .unwrap();

        let tokens = resp.into_token_data(Provider::Gmail).unwrap();
        assert_eq!(tokens.access_token, "ya29.new");
        assert!(tokens.refresh_token.is_none());
        let expires = tokens.expires_at.unwrap();
        assert!(expires > Utc::now() + chrono::Duration::seconds(3500));
    }

    #[test]
    fn test_token_error_response() {
        let resp: TokenResponse = serde_json::from_value(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "Token has been expired or revoked."
        }))
        .unwrap();
        let err = resp.into_token_data(Provider::Gmail).unwrap_err();
        assert!(err.to_string().contains("invalid_grant"));
    }

    #[test]
    fn test_missing_access_token() {
        let resp: TokenResponse = serde_json::from_value(serde_json::json!({"ok": true})).unwrap();
        assert!(resp.into_token_data(Provider::Slack).is_err());
    }

    #[tokio::test]
    async fn test_refresh_without_app_is_config_error() {
        let client = OAuthTokenClient::new(Duration::from_secs(1)).unwrap();
        let err = client.refresh(Provider::Gmail, "r").await.unwrap_err();
        assert!(matches!(err, InboxError::Config(_)));
    }
}
