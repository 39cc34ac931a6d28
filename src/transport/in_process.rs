use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{trace, warn};

use super::{Handler, Transport, TransportError};
use crate::error::ProtocolError;
use crate::protocol::{Request, Response};

/// Endpoint table shared by every agent living in the same process.
///
/// Cloning is cheap and every clone sees the same table. Agents still share no state: a call
/// only ever reaches the target through its [`Handler`].
#[derive(Clone, Default)]
pub struct InProcessTransport {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    unreachable: RwLock<HashSet<String>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, endpoint: impl Into<String>, handler: Arc<dyn Handler>) {
        let endpoint = endpoint.into();
        trace!(%endpoint, "bound");
        self.inner
            .handlers
            .write()
            .expect("poisoned")
            .insert(endpoint, handler);
    }

    /// Fault injection: calls to an unreachable endpoint are refused.
    pub fn set_unreachable(&self, endpoint: &str, unreachable: bool) {
        let mut guard = self.inner.unreachable.write().expect("poisoned");
        if unreachable {
            guard.insert(endpoint.to_string());
        } else {
            guard.remove(endpoint);
        }
    }

    fn lookup(&self, endpoint: &str) -> Option<Arc<dyn Handler>> {
        if self
            .inner
            .unreachable
            .read()
            .expect("poisoned")
            .contains(endpoint)
        {
            return None;
        }
        self.inner
            .handlers
            .read()
            .expect("poisoned")
            .get(endpoint)
            .cloned()
    }
}

impl Transport for InProcessTransport {
    fn call(
        &self,
        endpoint: &str,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        let handler = self.lookup(endpoint).ok_or_else(|| TransportError::Refused {
            endpoint: endpoint.to_string(),
        })?;

        let (tx, rx) = mpsc::channel();
        let request = request.clone();
        let correlation_id = request.correlation_id.clone();
        thread::spawn(move || {
            let reply = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request)))
                .unwrap_or_else(|_| {
                    Response::err(
                        correlation_id,
                        ProtocolError::internal("handler panicked"),
                    )
                });
            // the caller may have given up already, the reply is then dropped
            let _ = tx.send(reply);
        });

        match rx.recv_timeout(timeout) {
            Ok(reply) => Ok(reply),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(TransportError::Timeout {
                endpoint: endpoint.to_string(),
                after: timeout,
            }),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                warn!(endpoint, "handler thread vanished");
                Err(TransportError::Reset {
                    endpoint: endpoint.to_string(),
                    detail: "handler thread vanished".to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorCode;

    struct Echo;
    impl Handler for Echo {
        fn handle(&self, request: Request) -> Response {
            Response::ok(request.correlation_id, request.params)
        }
    }

    struct Sleepy(Duration);
    impl Handler for Sleepy {
        fn handle(&self, request: Request) -> Response {
            thread::sleep(self.0);
            Response::ok(request.correlation_id, json!(null))
        }
    }

    struct Panicky;
    impl Handler for Panicky {
        fn handle(&self, _request: Request) -> Response {
            panic!("boom")
        }
    }

    #[test]
    fn call_reaches_bound_handler() {
        let t = InProcessTransport::new();
        t.bind("echo", Arc::new(Echo));
        let resp = t
            .call("echo", &Request::new("x", json!({"a": 1}), "c1"), Duration::from_secs(1))
            .unwrap();
        assert_eq!(resp.into_result().unwrap(), json!({"a": 1}));
    }

    #[test]
    fn unknown_or_unreachable_endpoint_is_refused() {
        let t = InProcessTransport::new();
        let req = Request::new("x", json!({}), "c1");
        assert!(matches!(
            t.call("nowhere", &req, Duration::from_secs(1)),
            Err(TransportError::Refused { .. })
        ));

        t.bind("echo", Arc::new(Echo));
        t.set_unreachable("echo", true);
        assert!(matches!(
            t.call("echo", &req, Duration::from_secs(1)),
            Err(TransportError::Refused { .. })
        ));
        t.set_unreachable("echo", false);
        assert!(t.call("echo", &req, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn slow_handler_times_out() {
        let t = InProcessTransport::new();
        t.bind("slow", Arc::new(Sleepy(Duration::from_millis(300))));
        let err = t
            .call("slow", &Request::new("x", json!({}), "c1"), Duration::from_millis(20))
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.is_transient());
    }

    #[test]
    fn panicking_handler_becomes_internal_error() {
        let t = InProcessTransport::new();
        t.bind("bad", Arc::new(Panicky));
        let resp = t
            .call("bad", &Request::new("x", json!({}), "c1"), Duration::from_secs(1))
            .unwrap();
        assert_eq!(resp.into_result().unwrap_err().code, ErrorCode::Internal);
    }
}
