//! Request principal resolution.
//!
//! Every authenticated route resolves a [`Principal`] — the account (and
//! optionally the agent) the presented API key belongs to. Keys are stored
//! hashed; the bearer token is hashed with SHA-256 and looked up in the
//! store. Key issuance and rotation happen outside this service.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use sha2::{Digest, Sha256};
use ulid::Ulid;

use agora_core::{Account, Agent};

use crate::error::ApiError;
use crate::server::AppState;

/// Header name for request IDs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The resolved (account, agent) pair behind a request.
#[derive(Debug, Clone)]
pub struct Principal {
    /// The account the API key belongs to.
    pub account: Account,
    /// The agent identity bound to the key, if any.
    pub agent: Option<Agent>,
    /// Request ID for tracing/correlation.
    pub request_id: String,
}

impl Principal {
    /// Returns the bound agent or fails with 403.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` when the key carries no agent identity.
    pub fn require_agent(&self) -> Result<&Agent, ApiError> {
        self.agent.as_ref().ok_or_else(|| {
            ApiError::forbidden("API key has no agent identity")
                .with_request_id(self.request_id.clone())
        })
    }
}

/// Hashes a presented API key the way the store persists it.
#[must_use]
pub fn hash_api_key(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if let Some(existing) = parts.extensions.get::<Self>() {
            return Ok(existing.clone());
        }

        let request_id = request_id_from_headers(&parts.headers)
            .unwrap_or_else(|| Ulid::new().to_string());

        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::missing_auth().with_request_id(request_id.clone()))?;

        let resolved = state
            .store
            .resolve_api_key(&hash_api_key(&token))
            .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
        let Some((account, agent)) = resolved else {
            return Err(ApiError::invalid_token().with_request_id(request_id));
        };

        let principal = Self {
            account,
            agent,
            request_id,
        };
        parts.extensions.insert(principal.clone());
        Ok(principal)
    }
}

/// Extracts the bearer token from the Authorization header.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok-123"));
        assert_eq!(bearer_token(&headers), Some("tok-123".to_string()));
    }

    #[test]
    fn bearer_token_rejects_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer_token(&headers), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn key_hash_is_stable_hex() {
        let hash = hash_api_key("agora_test_key");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_api_key("agora_test_key"));
        assert_ne!(hash, hash_api_key("agora_other_key"));
    }
}
