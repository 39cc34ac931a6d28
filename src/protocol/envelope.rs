use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, ProtocolError};

/// A call: `{method, params, auth_token, correlation_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub auth_token: Option<String>,
    pub correlation_id: String,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Value, correlation_id: impl Into<String>) -> Self {
        Request {
            method: method.into(),
            params,
            auth_token: None,
            correlation_id: correlation_id.into(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Rejects envelopes that cannot be routed or correlated.
    pub fn check_envelope(&self) -> Result<(), ProtocolError> {
        if self.method.trim().is_empty() {
            return Err(ProtocolError::protocol("envelope has no method"));
        }
        if self.correlation_id.trim().is_empty() {
            return Err(ProtocolError::protocol(format!(
                "call to '{}' has no correlation id",
                self.method
            )));
        }
        Ok(())
    }
}

/// The error half of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// A reply: `{result | error, correlation_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub correlation_id: String,
}

impl Response {
    pub fn ok(correlation_id: impl Into<String>, result: Value) -> Self {
        Response {
            result: Some(result),
            error: None,
            correlation_id: correlation_id.into(),
        }
    }

    pub fn err(correlation_id: impl Into<String>, error: ProtocolError) -> Self {
        Response {
            result: None,
            error: Some(ErrorBody {
                code: error.code,
                message: error.message,
            }),
            correlation_id: correlation_id.into(),
        }
    }

    /// Collapse the reply into a `Result`. A reply with neither half is malformed.
    pub fn into_result(self) -> Result<Value, ProtocolError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(ProtocolError::new(error.code, error.message)),
            (Some(result), None) => Ok(result),
            (None, None) => Err(ProtocolError::protocol(format!(
                "reply {} carries neither result nor error",
                self.correlation_id
            ))),
        }
    }
}

/// A `result` key that is present stays `Some`, even when it holds `null`.
fn present<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(d).map(Some)
}

/// Produces correlation ids unique within one agent: `<prefix>-<n>`.
#[derive(Debug)]
pub struct CorrelationIds {
    prefix: String,
    next: AtomicU64,
}

impl CorrelationIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        CorrelationIds {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_method_or_correlation_is_rejected() {
        let req = Request::new("", json!({}), "c-1");
        assert_eq!(
            req.check_envelope().unwrap_err().code,
            ErrorCode::ProtocolError
        );
        let req = Request::new("invite", json!({}), " ");
        assert_eq!(
            req.check_envelope().unwrap_err().code,
            ErrorCode::ProtocolError
        );
        assert!(Request::new("invite", json!({}), "c-1")
            .check_envelope()
            .is_ok());
    }

    #[test]
    fn error_reply_wire_shape() {
        let resp = Response::err("c-9", ProtocolError::auth("unknown token"));
        let wire = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            wire,
            json!({"error": {"code": "AUTH_ERROR", "message": "unknown token"}, "correlation_id": "c-9"})
        );
        let back: Response = serde_json::from_value(wire).unwrap();
        assert_eq!(back.into_result().unwrap_err().code, ErrorCode::AuthError);
    }

    #[test]
    fn reply_without_result_or_error_is_malformed() {
        let resp: Response = serde_json::from_value(json!({"correlation_id": "x"})).unwrap();
        assert_eq!(
            resp.into_result().unwrap_err().code,
            ErrorCode::ProtocolError
        );
    }

    #[test]
    fn null_result_is_still_a_result() {
        let resp: Response =
            serde_json::from_value(json!({"result": null, "correlation_id": "x"})).unwrap();
        assert_eq!(resp.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn correlation_ids_are_unique() {
        let ids = CorrelationIds::new("sup-1");
        assert_eq!(ids.next_id(), "sup-1-1");
        assert_eq!(ids.next_id(), "sup-1-2");
    }
}
