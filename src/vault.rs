//! Credential vault
//!
//! Encrypts third-party credentials before they reach the store and
//! decrypts them on the way out. Each envelope's associated data is bound
//! to `user_id:provider`, so a sealed payload copied onto another row
//! fails to open.

use crate::credential::{
    AccountInfo, Credential, CredentialPayload, CredentialRecord, DecryptedCredential,
    ProviderType, TokenData,
};
use crate::crypto::CredentialCipher;
use crate::error::{InboxError, Result};
use crate::oauth::TokenRefresher;
use crate::store::CredentialStore;
use crate::types::Provider;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Refresh tokens this long before they actually expire
const DEFAULT_REFRESH_MARGIN_SECS: i64 = 60;

pub struct CredentialVault {
    store: Arc<dyn CredentialStore>,
    cipher: Arc<dyn CredentialCipher>,
    /// One lock per (user, provider) so only one refresh runs at a time
    refresh_locks: DashMap<(String, Provider), Arc<Mutex<()>>>,
    refresh_margin: chrono::Duration,
}

fn aad(user_id: &str, provider: Provider) -> Vec<u8> {
    format!("{}:{}", user_id, provider.as_str()).into_bytes()
}

impl CredentialVault {
    pub fn new(store: Arc<dyn CredentialStore>, cipher: Arc<dyn CredentialCipher>) -> Self {
        Self {
            store,
            cipher,
            refresh_locks: DashMap::new(),
            refresh_margin: chrono::Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
        }
    }

    pub fn with_refresh_margin(mut self, margin: chrono::Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Encrypt and upsert the credential for `(user_id, provider)`
    pub async fn store(
        &self,
        user_id: &str,
        provider: Provider,
        payload: CredentialPayload,
        provider_type: ProviderType,
        account: Option<AccountInfo>,
    ) -> Result<Credential> {
        let sealed = self
            .cipher
            .seal(&serde_json::to_value(&payload)?, &aad(user_id, provider))?;
        let account = account.unwrap_or_default();
        let now = Utc::now();

        let record = CredentialRecord {
            credential: Credential {
                id: format!("cred-{}", uuid::Uuid::new_v4()),
                user_id: user_id.to_string(),
                provider,
                provider_type,
                account_id: account.account_id,
                account_name: account.account_name,
                expires_at: payload.expires_at,
                is_active: true,
                last_synced_at: None,
                created_at: now,
                updated_at: now,
            },
            sealed,
        };

        let stored = self.store.upsert_credential(record).await?;
        tracing::info!(
            user_id = %user_id,
            provider = %provider,
            credential_id = %stored.credential.id,
            "Credential stored"
        );
        Ok(stored.credential)
    }

    /// Decrypted credential, or `None` when missing, inactive or unreadable
    pub async fn get(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<DecryptedCredential>> {
        let Some(record) = self.store.get_credential(user_id, provider).await? else {
            return Ok(None);
        };
        if !record.credential.is_active {
            return Ok(None);
        }
        match self.open(&record) {
            Ok(payload) => Ok(Some(DecryptedCredential {
                credential: record.credential,
                payload,
            })),
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    provider = %provider,
                    key_id = %record.sealed.key_id,
                    error = %e,
                    "Credential could not be decrypted"
                );
                Ok(None)
            }
        }
    }

    fn open(&self, record: &CredentialRecord) -> Result<CredentialPayload> {
        let value = self.cipher.open(
            &record.sealed,
            &aad(&record.credential.user_id, record.credential.provider),
        )?;
        Ok(serde_json::from_value(value)?)
    }

    /// Active integrations of a user, metadata only
    pub async fn list_integrations(&self, user_id: &str) -> Result<Vec<Credential>> {
        Ok(self
            .store
            .list_credentials(user_id)
            .await?
            .into_iter()
            .filter(|r| r.credential.is_active)
            .map(|r| r.credential)
            .collect())
    }

    /// Whether the credential's expiry has passed
    pub fn is_expired(credential: &Credential) -> bool {
        Self::expires_within(credential, chrono::Duration::zero(), Utc::now())
    }

    fn expires_within(credential: &Credential, margin: chrono::Duration, now: DateTime<Utc>) -> bool {
        credential
            .expires_at
            .map_or(false, |expires_at| expires_at <= now + margin)
    }

    /// Merge new tokens over the stored payload and re-encrypt
    pub async fn refresh(
        &self,
        user_id: &str,
        provider: Provider,
        tokens: TokenData,
    ) -> Result<Credential> {
        let current = self.get(user_id, provider).await?.ok_or_else(|| {
            InboxError::NotFound(format!("No active {} credential for {}", provider, user_id))
        })?;

        let mut payload = current.payload;
        payload.merge_tokens(tokens);
        let account = AccountInfo {
            account_id: current.credential.account_id,
            account_name: current.credential.account_name,
        };

        let credential = self
            .store(
                user_id,
                provider,
                payload,
                current.credential.provider_type,
                Some(account),
            )
            .await?;
        tracing::info!(user_id = %user_id, provider = %provider, "Credential refreshed");
        Ok(credential)
    }

    /// Soft delete
    pub async fn remove(&self, user_id: &str, provider: Provider) -> Result<()> {
        if self.store.deactivate_credential(user_id, provider).await? {
            tracing::info!(user_id = %user_id, provider = %provider, "Credential deactivated");
        }
        Ok(())
    }

    /// Record a successful sync against the credential
    pub async fn mark_synced(&self, user_id: &str, provider: Provider) -> Result<()> {
        self.store
            .touch_credential_sync(user_id, provider, Utc::now())
            .await
    }

    /// Decrypted credential, refreshed first when it is about to expire
    ///
    /// Concurrent callers for the same `(user_id, provider)` wait on one
    /// lock; whoever gets it second re-reads and sees the refreshed row.
    pub async fn get_fresh(
        &self,
        user_id: &str,
        provider: Provider,
        refresher: &dyn TokenRefresher,
    ) -> Result<Option<DecryptedCredential>> {
        let Some(current) = self.get(user_id, provider).await? else {
            return Ok(None);
        };
        if !Self::expires_within(&current.credential, self.refresh_margin, Utc::now()) {
            return Ok(Some(current));
        }

        let lock = self
            .refresh_locks
            .entry((user_id.to_string(), provider))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let Some(current) = self.get(user_id, provider).await? else {
            return Ok(None);
        };
        if !Self::expires_within(&current.credential, self.refresh_margin, Utc::now()) {
            return Ok(Some(current));
        }
        let Some(refresh_token) = current.payload.refresh_token.clone() else {
            tracing::warn!(
                user_id = %user_id,
                provider = %provider,
                "Credential expiring without a refresh token"
            );
            return Ok(Some(current));
        };

        let tokens = refresher.refresh(provider, &refresh_token).await?;
        self.refresh(user_id, provider, tokens).await?;
        self.get(user_id, provider).await
    }
}
