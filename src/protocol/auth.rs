//! Bearer tokens: issuance on the orchestrator, validation on every agent.
//!
//! Tokens are opaque, minted once at registration and never rotated for the lifetime of a league.
//! An agent validates incoming tokens through an [`Authenticator`]:
//!
//! - [`TokenStore`] on the issuer, which knows every token it minted,
//! - [`TrustedPeers`] for tokens pinned out-of-band (e.g. the league token received at registration),
//! - [`TokenIntrospector`] which asks the issuer about tokens it has not seen yet and caches the answer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::protocol::messages::{methods, TokenInfo, ValidateToken};
use crate::protocol::unix_millis;
use crate::resilience::ResilientClient;

/// A capability credential bound to one registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub value: String,
    pub owner_id: String,
    pub issued_at_ms: u64,
}

/// Resolves a bearer token to the id of the agent owning it.
pub trait Authenticator: Send + Sync {
    /// # Errors
    /// An `AUTH_ERROR` when the token is unknown.
    fn authenticate(&self, token: &str) -> Result<String, ProtocolError>;
}

/// Issuer-side token table.
#[derive(Debug, Default)]
pub struct TokenStore {
    tokens: RwLock<HashMap<String, AuthToken>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh token for `owner_id`.
    pub fn issue(&self, owner_id: &str) -> AuthToken {
        let token = AuthToken {
            value: format!("tok_{:032x}", rand::random::<u128>()),
            owner_id: owner_id.to_string(),
            issued_at_ms: unix_millis(),
        };
        let mut guard = self.tokens.write().expect("poisoned");
        guard.insert(token.value.clone(), token.clone());
        debug!(owner = owner_id, "token issued");
        token
    }

    pub fn validate(&self, token: &str) -> Result<AuthToken, ProtocolError> {
        let guard = self.tokens.read().expect("poisoned");
        guard
            .get(token)
            .cloned()
            .ok_or_else(|| ProtocolError::auth("unknown token"))
    }

    pub fn len(&self) -> usize {
        self.tokens.read().expect("poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Authenticator for TokenStore {
    fn authenticate(&self, token: &str) -> Result<String, ProtocolError> {
        self.validate(token).map(|t| t.owner_id)
    }
}

/// Tokens pinned by the agent itself.
#[derive(Debug, Default)]
pub struct TrustedPeers {
    pinned: RwLock<HashMap<String, String>>,
}

impl TrustedPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&self, token: impl Into<String>, owner_id: impl Into<String>) {
        self.pinned
            .write()
            .expect("poisoned")
            .insert(token.into(), owner_id.into());
    }

    fn lookup(&self, token: &str) -> Option<String> {
        self.pinned.read().expect("poisoned").get(token).cloned()
    }
}

impl Authenticator for TrustedPeers {
    fn authenticate(&self, token: &str) -> Result<String, ProtocolError> {
        self.lookup(token)
            .ok_or_else(|| ProtocolError::auth("token is not trusted by this agent"))
    }
}

#[derive(Debug, Clone)]
struct Issuer {
    endpoint: String,
    own_token: String,
}

/// Validates unknown tokens against the issuer's `validate_token` method.
///
/// Positive answers are cached; tokens never expire, so the cache is never invalidated.
pub struct TokenIntrospector {
    client: Arc<ResilientClient>,
    issuer: RwLock<Option<Issuer>>,
    cache: TrustedPeers,
}

impl TokenIntrospector {
    pub fn new(client: Arc<ResilientClient>) -> Self {
        TokenIntrospector {
            client,
            issuer: RwLock::new(None),
            cache: TrustedPeers::new(),
        }
    }

    /// Point the introspector at the issuer, authenticating with `own_token`.
    pub fn set_issuer(&self, endpoint: impl Into<String>, own_token: impl Into<String>) {
        *self.issuer.write().expect("poisoned") = Some(Issuer {
            endpoint: endpoint.into(),
            own_token: own_token.into(),
        });
    }

    pub fn pin(&self, token: impl Into<String>, owner_id: impl Into<String>) {
        self.cache.pin(token, owner_id);
    }
}

impl Authenticator for TokenIntrospector {
    fn authenticate(&self, token: &str) -> Result<String, ProtocolError> {
        if let Some(owner) = self.cache.lookup(token) {
            return Ok(owner);
        }
        let issuer = self
            .issuer
            .read()
            .expect("poisoned")
            .clone()
            .ok_or_else(|| ProtocolError::auth("unknown token and no issuer to ask"))?;

        let params = serde_json::to_value(ValidateToken {
            token: token.to_string(),
        })?;
        let info: TokenInfo = self
            .client
            .call(
                &issuer.endpoint,
                methods::VALIDATE_TOKEN,
                params,
                Some(&issuer.own_token),
            )
            .map_err(|e| {
                warn!("token introspection failed: {e}");
                e.into_protocol()
            })
            .and_then(|value| Ok(serde_json::from_value(value)?))?;

        self.cache.pin(token, info.owner_id.clone());
        Ok(info.owner_id)
    }
}

/// `validate_token` result body for a known token.
pub(crate) fn token_info(token: &AuthToken) -> serde_json::Value {
    json!({ "owner_id": token.owner_id, "issued_at_ms": token.issued_at_ms })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn issued_tokens_validate_to_their_owner() {
        let store = TokenStore::new();
        let a = store.issue("alice");
        let b = store.issue("bob");
        assert_ne!(a.value, b.value);
        assert!(a.value.starts_with("tok_"));
        assert_eq!(store.authenticate(&a.value).unwrap(), "alice");
        assert_eq!(store.authenticate(&b.value).unwrap(), "bob");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn unknown_token_is_an_auth_error() {
        let store = TokenStore::new();
        store.issue("alice");
        let err = store.authenticate("tok_forged").unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthError);
    }

    #[test]
    fn trusted_peers_only_accept_pinned_tokens() {
        let peers = TrustedPeers::new();
        peers.pin("tok_league", "orchestrator");
        assert_eq!(peers.authenticate("tok_league").unwrap(), "orchestrator");
        assert_eq!(
            peers.authenticate("tok_other").unwrap_err().code,
            ErrorCode::AuthError
        );
    }

    #[test]
    fn token_info_matches_wire_shape() {
        let store = TokenStore::new();
        let token = store.issue("ref-1");
        let info: TokenInfo = serde_json::from_value(token_info(&token)).unwrap();
        assert_eq!(info.owner_id, "ref-1");
        assert_eq!(info.issued_at_ms, token.issued_at_ms);
    }
}
