//! Bearer token identity resolution.
//!
//! Tokens are opaque to this service. An [`IdentityProvider`] turns one
//! into a user id and role, either by asking an external identity
//! service or by consulting a static table configured for development.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::config::StaticIdentity;
use crate::error::ApiError;

/// Role required for message-mutating calls.
pub const ROLE_USER: &str = "user";

/// Identity a bearer token resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub role: String,
}

impl AuthenticatedUser {
    pub fn has_user_role(&self) -> bool {
        self.role == ROLE_USER
    }
}

/// Resolves opaque bearer tokens to identities.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve a token, returning `None` for unknown or expired tokens.
    async fn resolve(&self, token: &str) -> Result<Option<AuthenticatedUser>>;
}

pub type SharedIdentity = Arc<dyn IdentityProvider>;

/// Resolve a token or produce the matching API error.
///
/// Unknown tokens map to 401. Identity service failures are server-side
/// and map to 500.
pub async fn require_user(
    identity: &SharedIdentity,
    token: &str,
) -> Result<AuthenticatedUser, ApiError> {
    match identity.resolve(token).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(ApiError::Unauthorized(
            "bearer token not recognized".to_string(),
        )),
        Err(err) => Err(ApiError::Internal(err)),
    }
}

/// Identity provider backed by an external HTTP service.
///
/// The bearer token is passed through unchanged in the `Authorization`
/// header; the service answers with the identity it maps to.
#[derive(Debug, Clone)]
pub struct HttpIdentityProvider {
    endpoint: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct IdentityResponse {
    #[serde(alias = "userId")]
    user_id: String,
    #[serde(default = "default_role")]
    role: String,
}

fn default_role() -> String {
    ROLE_USER.to_string()
}

impl HttpIdentityProvider {
    pub fn new(endpoint: String, timeout_secs: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build identity HTTP client")?;
        Ok(Self { endpoint, http })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn resolve(&self, token: &str) -> Result<Option<AuthenticatedUser>> {
        let response = self
            .http
            .get(&self.endpoint)
            .bearer_auth(token)
            .send()
            .await
            .context("identity service request failed")?;

        match response.status() {
            StatusCode::OK => {
                let body: IdentityResponse = response
                    .json()
                    .await
                    .context("identity service returned an unexpected body")?;
                Ok(Some(AuthenticatedUser {
                    user_id: body.user_id,
                    role: body.role,
                }))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Ok(None),
            status => anyhow::bail!("identity service error: {status}"),
        }
    }
}

/// Identity provider backed by a static token table.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, AuthenticatedUser>,
}

impl StaticIdentityProvider {
    pub fn from_config(table: &HashMap<String, StaticIdentity>) -> Self {
        let tokens = table
            .iter()
            .map(|(token, entry)| {
                (
                    token.clone(),
                    AuthenticatedUser {
                        user_id: entry.user_id.clone(),
                        role: entry.role.clone(),
                    },
                )
            })
            .collect();
        Self { tokens }
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(
            token.into(),
            AuthenticatedUser {
                user_id: user_id.into(),
                role: ROLE_USER.to_string(),
            },
        );
        self
    }

    pub fn with_role(
        mut self,
        token: impl Into<String>,
        user_id: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        self.tokens.insert(
            token.into(),
            AuthenticatedUser {
                user_id: user_id.into(),
                role: role.into(),
            },
        );
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn resolve(&self, token: &str) -> Result<Option<AuthenticatedUser>> {
        Ok(self.tokens.get(token).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_resolves_known_tokens() {
        let provider = StaticIdentityProvider::default()
            .with_token("tok-alice", "alice")
            .with_role("tok-bot", "bot", "service");

        let alice = provider.resolve("tok-alice").await.unwrap().unwrap();
        assert_eq!(alice.user_id, "alice");
        assert!(alice.has_user_role());

        let bot = provider.resolve("tok-bot").await.unwrap().unwrap();
        assert!(!bot.has_user_role());

        assert!(provider.resolve("tok-unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn require_user_maps_unknown_token_to_unauthorized() {
        let identity: SharedIdentity = Arc::new(StaticIdentityProvider::default());
        let err = require_user(&identity, "nope").await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);
    }
}
