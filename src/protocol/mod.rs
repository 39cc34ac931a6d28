//! Wire protocol: message envelope, method registry and bearer-token auth.
//!
//! Every call is a `{method, params, auth_token, correlation_id}` [`Request`]; every reply is a
//! `{result | error, correlation_id}` [`Response`]. The protocol does not care how envelopes
//! travel, see [`crate::transport`].

pub mod auth;
pub mod envelope;
pub mod messages;
pub mod registry;

use std::time::{SystemTime, UNIX_EPOCH};

pub use auth::{AuthToken, Authenticator, TokenIntrospector, TokenStore, TrustedPeers};
pub use envelope::{CorrelationIds, ErrorBody, Request, Response};
pub use registry::{
    verify_capabilities, CallContext, MethodDescriptor, MethodRegistry, MethodSpec, Service,
};

/// Milliseconds since the Unix epoch, 0 if the clock is before it.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
