//! Webhook authenticity
//!
//! A `ChannelAuth` implementation per signature scheme. Every comparison
//! of a computed signature against a received one is constant-time.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::hmac;
use std::collections::{BTreeMap, HashMap};
use subtle::ConstantTimeEq;

/// Outcome of a channel authentication check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Request is authenticated.
    Authenticated {
        /// Channel-specific identity (e.g., workspace ID, account SID).
        identity: String,
    },
    /// Request failed authentication.
    Rejected {
        /// Human-readable reason for rejection.
        reason: String,
    },
    /// Channel relies on a trusted network boundary instead of signatures.
    NotApplicable,
}

impl AuthOutcome {
    /// Returns true if the request is authenticated or auth is not applicable.
    pub fn is_allowed(&self) -> bool {
        matches!(
            self,
            AuthOutcome::Authenticated { .. } | AuthOutcome::NotApplicable
        )
    }

    fn rejected(reason: impl Into<String>) -> Self {
        AuthOutcome::Rejected {
            reason: reason.into(),
        }
    }
}

/// Raw inbound webhook request, as received at the HTTP edge
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    /// Headers with lower-cased names
    pub headers: HashMap<String, String>,
    /// Query string parameters
    pub query: HashMap<String, String>,
    /// Raw body bytes; signatures are computed over these
    pub body: Vec<u8>,
    /// Public URL the provider posted to, when known
    pub url: Option<String>,
}

impl WebhookRequest {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Form-encoded body parameters, sorted by name
    pub fn form_params(&self) -> BTreeMap<String, String> {
        url::form_urlencoded::parse(&self.body)
            .into_owned()
            .collect()
    }
}

/// Verifies inbound webhook requests for one channel.
pub trait ChannelAuth: Send + Sync {
    /// Verify a request; `timestamp_now` is the current Unix time in seconds.
    fn verify_request(&self, request: &WebhookRequest, timestamp_now: i64) -> AuthOutcome;

    /// Channel name for logging/audit.
    fn channel_name(&self) -> &str;

    /// Maximum allowed age of a request timestamp (seconds).
    /// Default: 300 seconds (5 minutes).
    fn max_timestamp_age(&self) -> i64 {
        300
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Compute Slack's `v0=` signature for a request body
pub fn slack_signature(signing_secret: &str, timestamp: &str, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, signing_secret.as_bytes());
    let mut ctx = hmac::Context::with_key(&key);
    ctx.update(b"v0:");
    ctx.update(timestamp.as_bytes());
    ctx.update(b":");
    ctx.update(body);
    format!("v0={}", hex::encode(ctx.sign().as_ref()))
}

/// Compute Twilio's `X-Twilio-Signature` for a URL and its POST parameters
pub fn twilio_signature(auth_token: &str, url: &str, params: &BTreeMap<String, String>) -> String {
    let mut data = String::from(url);
    for (name, value) in params {
        data.push_str(name);
        data.push_str(value);
    }
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, auth_token.as_bytes());
    BASE64.encode(hmac::sign(&key, data.as_bytes()).as_ref())
}

/// Slack request signing (HMAC-SHA256 over `v0:{timestamp}:{body}`).
///
/// Headers: `x-slack-request-timestamp`, `x-slack-signature`.
pub struct SlackAuth {
    signing_secret: String,
    max_age: i64,
}

impl SlackAuth {
    pub fn new(signing_secret: impl Into<String>) -> Self {
        Self {
            signing_secret: signing_secret.into(),
            max_age: 300,
        }
    }

    pub fn with_max_age(mut self, secs: i64) -> Self {
        self.max_age = secs;
        self
    }
}

impl ChannelAuth for SlackAuth {
    fn verify_request(&self, request: &WebhookRequest, timestamp_now: i64) -> AuthOutcome {
        let Some(timestamp) = request.header("x-slack-request-timestamp") else {
            return AuthOutcome::rejected("missing x-slack-request-timestamp");
        };
        let Some(signature) = request.header("x-slack-signature") else {
            return AuthOutcome::rejected("missing x-slack-signature");
        };

        // Replay protection
        let Ok(ts) = timestamp.parse::<i64>() else {
            return AuthOutcome::rejected("invalid timestamp format");
        };
        if (timestamp_now - ts).abs() > self.max_timestamp_age() {
            return AuthOutcome::rejected("request timestamp too old");
        }

        let computed = slack_signature(&self.signing_secret, timestamp, &request.body);
        if !constant_time_eq(&computed, signature) {
            return AuthOutcome::rejected("invalid signature");
        }

        AuthOutcome::Authenticated {
            identity: "slack".into(),
        }
    }

    fn channel_name(&self) -> &str {
        "slack"
    }

    fn max_timestamp_age(&self) -> i64 {
        self.max_age
    }
}

/// Twilio request validation.
///
/// Header: `x-twilio-signature` = base64(HMAC-SHA1(auth_token, url + sorted params)).
/// Twilio requests carry no timestamp, so there is no replay window.
pub struct TwilioAuth {
    account_sid: String,
    auth_token: String,
    webhook_url: Option<String>,
}

impl TwilioAuth {
    /// `webhook_url` must be the exact public URL configured in Twilio;
    /// when absent the request's own URL is used.
    pub fn new(
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        webhook_url: Option<String>,
    ) -> Self {
        Self {
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            webhook_url: webhook_url.filter(|u| !u.is_empty()),
        }
    }
}

impl ChannelAuth for TwilioAuth {
    fn verify_request(&self, request: &WebhookRequest, _timestamp_now: i64) -> AuthOutcome {
        let Some(signature) = request.header("x-twilio-signature") else {
            return AuthOutcome::rejected("missing x-twilio-signature");
        };
        let Some(url) = self.webhook_url.as_deref().or(request.url.as_deref()) else {
            return AuthOutcome::rejected("webhook url unknown; cannot validate signature");
        };

        let params = request.form_params();
        let computed = twilio_signature(&self.auth_token, url, &params);
        if !constant_time_eq(&computed, signature) {
            return AuthOutcome::rejected("invalid signature");
        }

        if let Some(sid) = params.get("AccountSid") {
            if sid != &self.account_sid {
                return AuthOutcome::rejected("account sid mismatch");
            }
        }

        AuthOutcome::Authenticated {
            identity: self.account_sid.clone(),
        }
    }

    fn channel_name(&self) -> &str {
        "sms"
    }
}

/// Shared-token check for Pub/Sub push endpoints.
///
/// Without a configured token the endpoint relies on the network boundary
/// (the push subscription itself) and returns `NotApplicable`.
pub struct PushTokenAuth {
    token: Option<String>,
}

impl PushTokenAuth {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
        }
    }
}

impl ChannelAuth for PushTokenAuth {
    fn verify_request(&self, request: &WebhookRequest, _timestamp_now: i64) -> AuthOutcome {
        let Some(expected) = &self.token else {
            return AuthOutcome::NotApplicable;
        };
        let presented = request
            .query
            .get("token")
            .map(String::as_str)
            .or_else(|| request.header("x-goog-channel-token"));
        match presented {
            Some(token) if constant_time_eq(token, expected) => AuthOutcome::Authenticated {
                identity: "pubsub".into(),
            },
            Some(_) => AuthOutcome::rejected("invalid push token"),
            None => AuthOutcome::rejected("missing push token"),
        }
    }

    fn channel_name(&self) -> &str {
        "email"
    }
}
