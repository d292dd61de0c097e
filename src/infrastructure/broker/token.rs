//! Access-token lifecycle for the brokerage API.
//!
//! Tokens are valid for roughly a day and the upstream rate-limits the auth
//! endpoint aggressively, so refreshes are deduplicated per account: while
//! one refresh is in flight every additional caller awaits the same shared
//! future instead of issuing a second network call.

use crate::domain::errors::BrokerError;
use crate::domain::repositories::CredentialStore;
use crate::domain::types::Credential;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Fallback lifetime when the upstream omits an absolute expiry.
const DEFAULT_TOKEN_LIFETIME_MIN: i64 = 23 * 60 + 59;

/// Token freshly granted by the upstream, before caching.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Wire access to the auth endpoints, kept behind a trait so the
/// single-flight logic is testable without a network.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn request_token(&self) -> Result<TokenGrant, BrokerError>;

    /// Approval key for the realtime quote socket. Never cached; the
    /// upstream invalidates it per connection.
    async fn request_ws_key(&self) -> Result<String, BrokerError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    access_token_token_expired: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApprovalResponse {
    approval_key: String,
}

/// Auth endpoints of the brokerage REST API.
pub struct HttpTokenEndpoint {
    http: ClientWithMiddleware,
    base_url: String,
    app_key: String,
    app_secret: String,
}

impl HttpTokenEndpoint {
    pub fn new(
        http: ClientWithMiddleware,
        base_url: String,
        app_key: String,
        app_secret: String,
    ) -> Self {
        Self {
            http,
            base_url,
            app_key,
            app_secret,
        }
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn request_token(&self) -> Result<TokenGrant, BrokerError> {
        let body = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": self.app_key,
            "appsecret": self.app_secret,
        });

        let response = self
            .http
            .post(format!("{}/oauth2/tokenP", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BrokerError::AuthFailure {
                reason: format!("auth endpoint returned {status}: {text}"),
            });
        }

        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::invalid(format!("token response: {e}")))?;

        // The upstream reports expiry as a naive UTC datetime string.
        let expires_at = payload.access_token_token_expired.as_deref().and_then(|s| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.and_utc())
        });

        Ok(TokenGrant {
            access_token: payload.access_token,
            expires_at,
        })
    }

    async fn request_ws_key(&self) -> Result<String, BrokerError> {
        let body = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": self.app_key,
            "secretkey": self.app_secret,
        });

        let response = self
            .http
            .post(format!("{}/oauth2/Approval", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BrokerError::AuthFailure {
                reason: format!("approval endpoint returned {status}: {text}"),
            });
        }

        let payload: ApprovalResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::invalid(format!("approval response: {e}")))?;

        Ok(payload.approval_key)
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<Credential, BrokerError>>>;

/// Per-account token cache with single-flight refresh.
pub struct TokenManager {
    endpoint: Arc<dyn TokenEndpoint>,
    store: Arc<dyn CredentialStore>,
    cached: Arc<RwLock<HashMap<String, Credential>>>,
    inflight: Arc<Mutex<HashMap<String, SharedRefresh>>>,
}

impl TokenManager {
    pub fn new(endpoint: Arc<dyn TokenEndpoint>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            endpoint,
            store,
            cached: Arc::new(RwLock::new(HashMap::new())),
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Load a previously persisted credential so a restart does not burn a
    /// refresh while the old token is still valid.
    pub async fn prime_from_store(&self, account_id: &str) {
        match self.store.load(account_id).await {
            Ok(Some(credential)) if !credential.is_expired(Utc::now()) => {
                info!(
                    "TokenManager: reusing stored token for {} (expires {})",
                    account_id, credential.expires_at
                );
                self.cached
                    .write()
                    .await
                    .insert(account_id.to_string(), credential);
            }
            Ok(_) => {}
            Err(e) => warn!("TokenManager: failed to load stored token: {e:#}"),
        }
    }

    /// Return a valid token for the account.
    ///
    /// With `force_refresh == false` a cached unexpired token is returned
    /// without any upstream call. Concurrent refreshes for the same account
    /// collapse into one network request whose result every caller shares.
    pub async fn get_token(
        &self,
        account_id: &str,
        force_refresh: bool,
    ) -> Result<Credential, BrokerError> {
        if !force_refresh
            && let Some(credential) = self.cached.read().await.get(account_id)
            && !credential.is_expired(Utc::now())
        {
            return Ok(credential.clone());
        }

        let (refresh, created) = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(account_id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let fut = Self::refresh(
                        self.endpoint.clone(),
                        self.store.clone(),
                        self.cached.clone(),
                        account_id.to_string(),
                    )
                    .boxed()
                    .shared();
                    inflight.insert(account_id.to_string(), fut.clone());
                    (fut, true)
                }
            }
        };

        let result = refresh.await;

        // Only the caller that created the marker releases it; a late waiter
        // must not evict a newer in-flight refresh.
        if created {
            self.inflight.lock().await.remove(account_id);
        }

        result
    }

    /// Fresh approval key for the quote socket.
    pub async fn ws_approval_key(&self) -> Result<String, BrokerError> {
        self.endpoint.request_ws_key().await
    }

    async fn refresh(
        endpoint: Arc<dyn TokenEndpoint>,
        store: Arc<dyn CredentialStore>,
        cached: Arc<RwLock<HashMap<String, Credential>>>,
        account_id: String,
    ) -> Result<Credential, BrokerError> {
        info!("TokenManager: refreshing access token for {}", account_id);

        let grant = endpoint.request_token().await?;
        let expires_at = grant
            .expires_at
            .unwrap_or_else(|| Utc::now() + Duration::minutes(DEFAULT_TOKEN_LIFETIME_MIN));

        let credential = Credential {
            account_id: account_id.clone(),
            access_token: grant.access_token,
            expires_at,
        };

        // The token is usable even if persistence fails.
        if let Err(e) = store.save(&credential).await {
            warn!("TokenManager: failed to persist token: {e:#}");
        }

        cached.write().await.insert(account_id, credential.clone());

        info!("TokenManager: token refreshed (expires {})", expires_at);
        Ok(credential)
    }
}
