//! Tool definition and registry.
//!
//! A [`ToolDefinition`] is a declarative description of a tool: name,
//! parameter schema, authority mode, required context kind, and its phase
//! functions in one of two shapes:
//!
//! - **Handoff form** ([`HandoffPhases`]) - `before` / `client` / `after`.
//!   Phase 1 runs `before` on the trusted host, the client phase runs on the
//!   untrusted side, and phase 2 validates and finalizes in `after`.
//! - **Simple form** ([`SimplePhases`]) - a `server` / `client` function
//!   pair with no `after` step.
//!
//! Each phase is configured through its own explicitly-typed struct and the
//! combination is checked by a validating constructor, so an impossible
//! definition (a client-authority tool with a `before`, say) fails at
//! startup rather than mid-call.
//!
//! # Example
//!
//! ```ignore
//! use handoff_sdk::{ToolDefinition, HandoffPhases, server_fn, client_fn, after_fn};
//!
//! let tool = ToolDefinition::handoff(
//!     "guess",
//!     "Play one round of the guessing game",
//!     json!({"type": "object", "required": ["max"]}),
//!     AuthorityMode::Server,
//!     ContextKind::Interactive,
//!     HandoffPhases {
//!         before: Some(server_fn(|params, _ctx| async move { /* draw */ })),
//!         client: Some(client_fn(|envelope, ctx, _params| async move { /* ask */ })),
//!         after: after_fn(|envelope, pick, _ctx, _params| async move { /* compare */ }),
//!     },
//! )?;
//! ```

use crate::context::ClientContext;
use crate::error::{CallError, ProtocolError};
use crate::types::{AuthorityMode, CallId, ContextKind, Envelope};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context handed to trusted phase functions (`before`, `server`, `after`).
///
/// Deliberately narrow: trusted phases get the call identity and the
/// cancellation signal, nothing else. Capability operations live on
/// [`ClientContext`] and are only reachable from the client phase.
#[derive(Clone, Debug)]
pub struct PhaseContext {
    call_id: CallId,
    signal: CancellationToken,
}

impl PhaseContext {
    #[must_use]
    pub fn new(call_id: CallId, signal: CancellationToken) -> Self {
        Self { call_id, signal }
    }

    #[must_use]
    pub const fn call_id(&self) -> &CallId {
        &self.call_id
    }

    #[must_use]
    pub const fn signal(&self) -> &CancellationToken {
        &self.signal
    }
}

/// Boxed future returned by every phase function.
pub type PhaseFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Trusted phase-1 function: `(params, ctx) -> envelope`.
pub type ServerFn = Arc<dyn Fn(Value, PhaseContext) -> PhaseFuture + Send + Sync>;

/// Untrusted client-phase function: `(envelope, ctx, params) -> client output`.
pub type ClientFn = Arc<dyn Fn(Option<Envelope>, ClientContext, Value) -> PhaseFuture + Send + Sync>;

/// Trusted phase-2 function: `(envelope, client output, ctx, params) -> result`.
pub type AfterFn =
    Arc<dyn Fn(Option<Envelope>, Value, PhaseContext, Value) -> PhaseFuture + Send + Sync>;

/// Wrap an async closure as a [`ServerFn`] (also used for `before`).
pub fn server_fn<F, Fut>(f: F) -> ServerFn
where
    F: Fn(Value, PhaseContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |params, ctx| Box::pin(f(params, ctx)))
}

/// Wrap an async closure as a [`ClientFn`].
pub fn client_fn<F, Fut>(f: F) -> ClientFn
where
    F: Fn(Option<Envelope>, ClientContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |envelope, ctx, params| Box::pin(f(envelope, ctx, params)))
}

/// Wrap an async closure as an [`AfterFn`].
pub fn after_fn<F, Fut>(f: F) -> AfterFn
where
    F: Fn(Option<Envelope>, Value, PhaseContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |envelope, output, ctx, params| Box::pin(f(envelope, output, ctx, params)))
}

/// Phase functions for the three-phase handoff form.
pub struct HandoffPhases {
    /// Trusted phase 1. Required for server authority, forbidden for
    /// client authority.
    pub before: Option<ServerFn>,
    /// In-process client phase. When `None`, the client output must arrive
    /// externally through a `handoff_response` command.
    pub client: Option<ClientFn>,
    /// Trusted phase 2.
    pub after: AfterFn,
}

/// Phase functions for the simple form.
pub struct SimplePhases {
    /// Trusted server step. Its output is cached and returned as the final
    /// result without re-invocation. Required for server authority,
    /// forbidden for client authority.
    pub server: Option<ServerFn>,
    /// Optional in-process client phase.
    pub client: Option<ClientFn>,
}

pub(crate) enum Phases {
    Handoff(HandoffPhases),
    Simple(SimplePhases),
}

/// A declarative description of a tool. Immutable once constructed;
/// registered once at startup and never mutated afterwards.
pub struct ToolDefinition {
    name: String,
    description: String,
    parameter_schema: Value,
    authority: AuthorityMode,
    context_kind: ContextKind,
    phases: Phases,
}

impl ToolDefinition {
    /// Create a handoff-form tool, validating the phase/authority
    /// combination.
    ///
    /// # Errors
    /// Returns [`ProtocolError::InvalidDefinition`] when the phases are
    /// inconsistent with the authority mode.
    pub fn handoff(
        name: impl Into<String>,
        description: impl Into<String>,
        parameter_schema: Value,
        authority: AuthorityMode,
        context_kind: ContextKind,
        phases: HandoffPhases,
    ) -> Result<Self, ProtocolError> {
        let name = name.into();
        match authority {
            AuthorityMode::Server if phases.before.is_none() => {
                return Err(ProtocolError::InvalidDefinition {
                    tool: name,
                    reason: "server-authority handoff tools require a `before` phase".to_string(),
                });
            }
            AuthorityMode::Client if phases.before.is_some() => {
                return Err(ProtocolError::InvalidDefinition {
                    tool: name,
                    reason: "client-authority tools perform no trusted phase-1 computation"
                        .to_string(),
                });
            }
            _ => {}
        }
        Ok(Self {
            name,
            description: description.into(),
            parameter_schema,
            authority,
            context_kind,
            phases: Phases::Handoff(phases),
        })
    }

    /// Create a simple-form tool, validating the phase/authority
    /// combination.
    ///
    /// # Errors
    /// Returns [`ProtocolError::InvalidDefinition`] when the phases are
    /// inconsistent with the authority mode.
    pub fn simple(
        name: impl Into<String>,
        description: impl Into<String>,
        parameter_schema: Value,
        authority: AuthorityMode,
        context_kind: ContextKind,
        phases: SimplePhases,
    ) -> Result<Self, ProtocolError> {
        let name = name.into();
        match authority {
            AuthorityMode::Server if phases.server.is_none() => {
                return Err(ProtocolError::InvalidDefinition {
                    tool: name,
                    reason: "server-authority simple tools require a `server` function".to_string(),
                });
            }
            AuthorityMode::Client if phases.server.is_some() => {
                return Err(ProtocolError::InvalidDefinition {
                    tool: name,
                    reason: "client-authority tools perform no trusted phase-1 computation"
                        .to_string(),
                });
            }
            _ => {}
        }
        Ok(Self {
            name,
            description: description.into(),
            parameter_schema,
            authority,
            context_kind,
            phases: Phases::Simple(phases),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub const fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    #[must_use]
    pub const fn authority(&self) -> AuthorityMode {
        self.authority
    }

    #[must_use]
    pub const fn context_kind(&self) -> ContextKind {
        self.context_kind
    }

    /// True for the three-phase handoff form.
    #[must_use]
    pub const fn uses_handoff(&self) -> bool {
        matches!(self.phases, Phases::Handoff(_))
    }

    /// The trusted phase-1 function, if the authority mode has one.
    #[must_use]
    pub(crate) fn phase_one(&self) -> Option<&ServerFn> {
        match &self.phases {
            Phases::Handoff(p) => p.before.as_ref(),
            Phases::Simple(p) => p.server.as_ref(),
        }
    }

    /// The in-process client phase, if declared.
    #[must_use]
    pub(crate) fn client_phase(&self) -> Option<&ClientFn> {
        match &self.phases {
            Phases::Handoff(p) => p.client.as_ref(),
            Phases::Simple(p) => p.client.as_ref(),
        }
    }

    /// The trusted phase-2 function (handoff form only).
    #[must_use]
    pub(crate) fn phase_two(&self) -> Option<&AfterFn> {
        match &self.phases {
            Phases::Handoff(p) => Some(&p.after),
            Phases::Simple(_) => None,
        }
    }

    /// Validate call parameters against the declared schema, before any
    /// trusted phase runs.
    ///
    /// # Errors
    /// Returns [`CallError::Validation`] when the parameters do not conform.
    pub fn validate_params(&self, params: &Value) -> Result<(), CallError> {
        conforms(&self.parameter_schema, params).map_err(|reason| CallError::Validation {
            tool: self.name.clone(),
            reason,
        })
    }
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("authority", &self.authority)
            .field("context_kind", &self.context_kind)
            .field("uses_handoff", &self.uses_handoff())
            .finish_non_exhaustive()
    }
}

/// Structural conformance check of a value against a JSON schema subset:
/// `type`, `required`, `properties`, and `enum`. Enough to reject malformed
/// parameters and capability responses before they reach trusted code.
pub(crate) fn conforms(schema: &Value, value: &Value) -> Result<(), String> {
    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("{value} is not one of the allowed values"));
        }
        return Ok(());
    }

    if let Some(ty) = schema.get("type").and_then(Value::as_str) {
        let ok = match ty {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "null" => value.is_null(),
            other => return Err(format!("unsupported schema type `{other}`")),
        };
        if !ok {
            return Err(format!("expected {ty}, got {value}"));
        }
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if value.get(key).is_none() {
                return Err(format!("missing required field `{key}`"));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, prop_schema) in props {
            if let Some(field) = value.get(key) {
                conforms(prop_schema, field).map_err(|e| format!("field `{key}`: {e}"))?;
            }
        }
    }

    Ok(())
}

/// Write-once collection of tool definitions, keyed by name.
///
/// Populated at startup; duplicate registration is a startup-time error.
/// The session takes the registry behind an `Arc`, after which it is never
/// mutated.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDefinition>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    ///
    /// # Errors
    /// Returns [`ProtocolError::DuplicateTool`] if a tool with the same
    /// name already exists.
    pub fn register(&mut self, tool: ToolDefinition) -> Result<(), ProtocolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ProtocolError::DuplicateTool(name));
        }
        self.tools.insert(name, Arc::new(tool));
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ToolDefinition>> {
        self.tools.get(name).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Descriptors for advertising the registered tools to the model.
    #[must_use]
    pub fn to_model_tools(&self) -> Vec<crate::model::ToolDescriptor> {
        let mut tools: Vec<_> = self
            .tools
            .values()
            .map(|t| crate::model::ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.parameter_schema().clone(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_after() -> AfterFn {
        after_fn(|_envelope, output, _ctx, _params| async move { Ok(output) })
    }

    #[test]
    fn server_authority_handoff_requires_before() {
        let result = ToolDefinition::handoff(
            "t",
            "",
            json!({}),
            AuthorityMode::Server,
            ContextKind::Headless,
            HandoffPhases {
                before: None,
                client: None,
                after: noop_after(),
            },
        );
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn client_authority_handoff_forbids_before() {
        let result = ToolDefinition::handoff(
            "t",
            "",
            json!({}),
            AuthorityMode::Client,
            ContextKind::Interactive,
            HandoffPhases {
                before: Some(server_fn(|p, _| async move { Ok(p) })),
                client: None,
                after: noop_after(),
            },
        );
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn client_authority_handoff_without_before_is_valid() {
        let tool = ToolDefinition::handoff(
            "t",
            "",
            json!({}),
            AuthorityMode::Client,
            ContextKind::Interactive,
            HandoffPhases {
                before: None,
                client: None,
                after: noop_after(),
            },
        )
        .expect("valid definition");
        assert!(tool.uses_handoff());
        assert!(tool.phase_one().is_none());
    }

    #[test]
    fn simple_server_tool_requires_server_fn() {
        let result = ToolDefinition::simple(
            "t",
            "",
            json!({}),
            AuthorityMode::Server,
            ContextKind::Headless,
            SimplePhases {
                server: None,
                client: None,
            },
        );
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = ToolRegistry::new();
        let make = || {
            ToolDefinition::simple(
                "echo",
                "",
                json!({}),
                AuthorityMode::Server,
                ContextKind::Headless,
                SimplePhases {
                    server: Some(server_fn(|p, _| async move { Ok(p) })),
                    client: None,
                },
            )
            .expect("valid definition")
        };

        registry.register(make()).expect("first registration");
        let err = registry.register(make()).expect_err("duplicate");
        assert!(matches!(err, ProtocolError::DuplicateTool(name) if name == "echo"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn validate_params_checks_required_and_types() {
        let tool = ToolDefinition::simple(
            "t",
            "",
            json!({
                "type": "object",
                "required": ["count"],
                "properties": {"count": {"type": "integer"}}
            }),
            AuthorityMode::Server,
            ContextKind::Headless,
            SimplePhases {
                server: Some(server_fn(|p, _| async move { Ok(p) })),
                client: None,
            },
        )
        .expect("valid definition");

        assert!(tool.validate_params(&json!({"count": 3})).is_ok());
        assert!(matches!(
            tool.validate_params(&json!({})),
            Err(CallError::Validation { .. })
        ));
        assert!(matches!(
            tool.validate_params(&json!({"count": "three"})),
            Err(CallError::Validation { .. })
        ));
    }

    #[test]
    fn conforms_checks_enums() {
        let schema = json!({"enum": ["a", "b"]});
        assert!(conforms(&schema, &json!("a")).is_ok());
        assert!(conforms(&schema, &json!("c")).is_err());
    }

    #[test]
    fn model_tools_are_sorted_by_name() {
        let mut registry = ToolRegistry::new();
        for name in ["zeta", "alpha"] {
            registry
                .register(
                    ToolDefinition::simple(
                        name,
                        "desc",
                        json!({"type": "object"}),
                        AuthorityMode::Server,
                        ContextKind::Headless,
                        SimplePhases {
                            server: Some(server_fn(|p, _| async move { Ok(p) })),
                            client: None,
                        },
                    )
                    .expect("valid definition"),
                )
                .expect("register");
        }

        let tools = registry.to_model_tools();
        assert_eq!(tools[0].name, "alpha");
        assert_eq!(tools[1].name, "zeta");
    }
}
