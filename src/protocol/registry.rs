//! Named-method tables ("tools") and the [`Service`] that fronts them on the wire.
//!
//! Every agent builds a [`MethodRegistry`] once at startup and wraps it in a [`Service`].
//! The service owns the order of checks applied to every incoming call:
//!
//! 1. envelope shape (method and correlation id present),
//! 2. method lookup (`list_methods` is always answered),
//! 3. authentication, and the owner check when the method declares an owner parameter,
//! 4. the method body.
//!
//! Nothing past a failed step runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::ProtocolError;
use crate::protocol::auth::Authenticator;
use crate::protocol::envelope::{Request, Response};
use crate::protocol::messages::methods;
use crate::resilience::ResilientClient;
use crate::transport::Handler;

/// Declaration of one exposed method.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: String,
    pub description: String,
    pub params: Value,
    pub authenticated: bool,
    /// Parameter that must name the owner of the caller's token.
    pub owner_param: Option<String>,
}

impl MethodSpec {
    /// A method callable without a token.
    pub fn public(name: &str, description: &str) -> Self {
        MethodSpec {
            name: name.to_string(),
            description: description.to_string(),
            params: Value::Object(Default::default()),
            authenticated: false,
            owner_param: None,
        }
    }

    /// A method requiring a valid bearer token.
    pub fn authenticated(name: &str, description: &str) -> Self {
        MethodSpec {
            authenticated: true,
            ..Self::public(name, description)
        }
    }

    pub fn params(self, schema: Value) -> Self {
        MethodSpec {
            params: schema,
            ..self
        }
    }

    pub fn owned_by(self, param: &str) -> Self {
        MethodSpec {
            owner_param: Some(param.to_string()),
            ..self
        }
    }
}

/// What `list_methods` returns for each method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub description: String,
    pub params: Value,
}

/// Per-call information handed to a method body.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Owner of the token, for authenticated methods.
    pub caller: Option<String>,
    pub correlation_id: String,
}

type MethodFn = Box<dyn Fn(Value, &CallContext) -> Result<Value, ProtocolError> + Send + Sync>;

#[derive(Default)]
pub struct MethodRegistry {
    methods: BTreeMap<String, (MethodSpec, MethodFn)>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, spec: MethodSpec, body: F)
    where
        F: Fn(Value, &CallContext) -> Result<Value, ProtocolError> + Send + Sync + 'static,
    {
        assert!(
            spec.name != methods::LIST_METHODS,
            "list_methods is provided by the service"
        );
        self.methods
            .insert(spec.name.clone(), (spec, Box::new(body)));
    }

    pub fn contains(&self, name: &str) -> bool {
        name == methods::LIST_METHODS || self.methods.contains_key(name)
    }

    /// Descriptors sorted by name, `list_methods` included.
    pub fn describe(&self) -> Vec<MethodDescriptor> {
        let mut out: Vec<MethodDescriptor> = self
            .methods
            .values()
            .map(|(spec, _)| MethodDescriptor {
                name: spec.name.clone(),
                description: spec.description.clone(),
                params: spec.params.clone(),
            })
            .collect();
        out.push(MethodDescriptor {
            name: methods::LIST_METHODS.to_string(),
            description: "List the methods exposed by this agent".to_string(),
            params: Value::Object(Default::default()),
        });
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

/// Wire front of one agent.
pub struct Service {
    agent_id: String,
    registry: MethodRegistry,
    authenticator: Arc<dyn Authenticator>,
}

impl Service {
    pub fn new(
        agent_id: impl Into<String>,
        registry: MethodRegistry,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Service {
            agent_id: agent_id.into(),
            registry,
            authenticator,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn dispatch(&self, request: Request) -> Result<Value, ProtocolError> {
        request.check_envelope()?;

        if request.method == methods::LIST_METHODS {
            return Ok(serde_json::to_value(self.registry.describe())?);
        }

        let (spec, body) = self.registry.methods.get(&request.method).ok_or_else(|| {
            ProtocolError::protocol(format!(
                "{} has no method '{}'",
                self.agent_id, request.method
            ))
        })?;

        let caller = if spec.authenticated {
            Some(self.authenticate(spec, &request)?)
        } else {
            None
        };

        let ctx = CallContext {
            caller,
            correlation_id: request.correlation_id.clone(),
        };
        body(request.params, &ctx)
    }

    fn authenticate(&self, spec: &MethodSpec, request: &Request) -> Result<String, ProtocolError> {
        let token = request
            .auth_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ProtocolError::auth(format!("call to '{}' carries no token", spec.name))
            })?;
        let owner = self.authenticator.authenticate(token)?;

        if let Some(param) = &spec.owner_param {
            let claimed = request
                .params
                .get(param)
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ProtocolError::validation(format!(
                        "'{}' requires parameter '{param}'",
                        spec.name
                    ))
                })?;
            if claimed != owner {
                return Err(ProtocolError::auth(format!(
                    "token owned by '{owner}' used on behalf of '{claimed}'"
                )));
            }
        }
        Ok(owner)
    }
}

impl Handler for Service {
    fn handle(&self, request: Request) -> Response {
        let correlation_id = request.correlation_id.clone();
        let method = request.method.clone();
        trace!(agent = %self.agent_id, %method, %correlation_id, "incoming call");

        match self.dispatch(request) {
            Ok(result) => Response::ok(correlation_id, result),
            Err(e) => {
                if e.code == crate::error::ErrorCode::AuthError {
                    warn!(agent = %self.agent_id, %method, "rejected: {e}");
                } else {
                    debug!(agent = %self.agent_id, %method, "call failed: {e}");
                }
                Response::err(correlation_id, e)
            }
        }
    }
}

/// Fetch a peer's `list_methods` and check that every `required` method is exposed.
pub fn verify_capabilities(
    client: &ResilientClient,
    endpoint: &str,
    required: &[&str],
) -> Result<Vec<MethodDescriptor>, ProtocolError> {
    let listed = client
        .call(endpoint, methods::LIST_METHODS, Value::Null, None)
        .map_err(|e| e.into_protocol())?;
    let listed: Vec<MethodDescriptor> = serde_json::from_value(listed)?;

    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|name| !listed.iter().any(|m| m.name == *name))
        .collect();
    if !missing.is_empty() {
        return Err(ProtocolError::validation(format!(
            "{endpoint} does not expose: {}",
            missing.join(", ")
        )));
    }
    Ok(listed)
}
