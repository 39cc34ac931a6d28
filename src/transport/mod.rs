//! Carriers for protocol envelopes.
//!
//! An agent is reachable only through a [`Handler`]; callers reach it through a [`Transport`].
//! Two transports are provided:
//! - [`InProcessTransport`]: endpoints registered in a shared table, every call on its own thread
//!   so that deadlines are real and late replies are dropped;
//! - [`TcpTransport`] / [`TcpServer`]: newline-delimited JSON over TCP.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{Request, Response};

mod in_process;
mod tcp;

pub use in_process::InProcessTransport;
pub use tcp::{TcpServer, TcpTransport};

/// Something that answers envelopes. Implemented by [`crate::protocol::Service`].
pub trait Handler: Send + Sync {
    fn handle(&self, request: Request) -> Response;
}

/// Carries one request to `endpoint` and waits at most `timeout` for the reply.
pub trait Transport: Send + Sync {
    /// # Errors
    /// A [`TransportError`] when no reply could be obtained. Error replies are not errors here.
    fn call(
        &self,
        endpoint: &str,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, TransportError>;
}

/// Failure to obtain any reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection to {endpoint} refused")]
    Refused { endpoint: String },
    #[error("no reply from {endpoint} within {after:?}")]
    Timeout { endpoint: String, after: Duration },
    #[error("connection to {endpoint} lost: {detail}")]
    Reset { endpoint: String, detail: String },
    #[error("unreadable reply from {endpoint}: {detail}")]
    Codec { endpoint: String, detail: String },
}

impl TransportError {
    /// Connection refused, timeout and reset may succeed on another attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Codec { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}
