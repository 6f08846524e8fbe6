//! Execution context providers for the client phase.
//!
//! A [`ClientContext`] is handed to a tool's `client()` function and
//! exposes exactly the capability set the tool declared:
//!
//! - **Interactive** - [`ClientContext::wait_for`]: suspend until a
//!   human-facing surface responds to a rendered request.
//! - **Delegated** - [`ClientContext::prompt`] for structured sub-requests
//!   to a reasoning [`Delegate`], [`ClientContext::emit`] for
//!   fire-and-forget progress steps, and [`ClientContext::join_all`] for
//!   concurrent fan-out with spawn-order results.
//! - **Headless** - no side channel; the client phase is a deterministic
//!   second computation step.
//!
//! All three share the call id, the cancellation signal, and the
//! approval/permission operations (where a trail is attached). Invoking an
//! operation outside the declared capability set is a configuration error.

use crate::definition::conforms;
use crate::error::{CallError, ProtocolError};
use crate::trail::{StepKind, TrailRuntime};
use crate::types::{CallId, ContextKind};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A structured sub-request issued to a reasoning delegate.
#[derive(Clone, Debug)]
pub struct DelegateRequest {
    /// Request type, recorded on the trail step.
    pub name: String,
    /// Payload handed to the delegate.
    pub payload: Value,
    /// Optional schema the delegate's structured reply must match.
    pub response_schema: Option<Value>,
}

impl DelegateRequest {
    #[must_use]
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            response_schema: None,
        }
    }

    /// Require the delegate's reply to conform to a schema.
    #[must_use]
    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

/// A reasoning delegate that answers structured sub-requests.
///
/// Implementations typically wrap a child model interaction; tests script
/// canned replies.
#[async_trait]
pub trait Delegate: Send + Sync {
    /// Answer one sub-request.
    ///
    /// # Errors
    /// Returns an error when the delegate cannot produce a reply.
    async fn prompt(&self, call_id: &CallId, request: &DelegateRequest) -> Result<Value>;
}

/// Capability surface supplied to a tool's client phase.
///
/// Constructed per call by the session for the context kind the tool
/// declared; there is at most one active client phase per call.
#[derive(Clone)]
pub struct ClientContext {
    call_id: CallId,
    kind: ContextKind,
    signal: CancellationToken,
    trail: Option<Arc<TrailRuntime>>,
    delegate: Option<Arc<dyn Delegate>>,
}

impl ClientContext {
    /// Context for an interactive client phase.
    #[must_use]
    pub fn interactive(call_id: CallId, signal: CancellationToken, trail: Arc<TrailRuntime>) -> Self {
        Self {
            call_id,
            kind: ContextKind::Interactive,
            signal,
            trail: Some(trail),
            delegate: None,
        }
    }

    /// Context for a delegated client phase.
    #[must_use]
    pub fn delegated(
        call_id: CallId,
        signal: CancellationToken,
        trail: Arc<TrailRuntime>,
        delegate: Arc<dyn Delegate>,
    ) -> Self {
        Self {
            call_id,
            kind: ContextKind::Delegated,
            signal,
            trail: Some(trail),
            delegate: Some(delegate),
        }
    }

    /// Context for a headless client phase.
    #[must_use]
    pub fn headless(call_id: CallId, signal: CancellationToken) -> Self {
        Self {
            call_id,
            kind: ContextKind::Headless,
            signal,
            trail: None,
            delegate: None,
        }
    }

    #[must_use]
    pub const fn call_id(&self) -> &CallId {
        &self.call_id
    }

    #[must_use]
    pub const fn kind(&self) -> ContextKind {
        self.kind
    }

    #[must_use]
    pub const fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    fn capability(
        &self,
        allowed: &[ContextKind],
        operation: &'static str,
    ) -> Result<&Arc<TrailRuntime>, CallError> {
        if !allowed.contains(&self.kind) {
            return Err(ProtocolError::CapabilityUnavailable {
                kind: self.kind,
                operation,
            }
            .into());
        }
        self.trail.as_ref().ok_or_else(|| {
            ProtocolError::CapabilityUnavailable {
                kind: self.kind,
                operation,
            }
            .into()
        })
    }

    /// Render a request on the human-facing surface and suspend until it
    /// responds. Interactive contexts only.
    ///
    /// # Errors
    /// Capability errors for non-interactive contexts, plus everything
    /// [`TrailRuntime::prompt`] can return.
    pub async fn wait_for(&self, request_type: &str, payload: Value) -> Result<Value, CallError> {
        let trail = self.capability(&[ContextKind::Interactive], "wait_for")?;
        trail.prompt(StepKind::Prompt, request_type, payload).await
    }

    /// Record a fire-and-forget progress step. Delegated contexts only.
    ///
    /// # Errors
    /// Capability errors for non-delegated contexts.
    pub async fn emit(&self, event_type: &str, payload: Value) -> Result<(), CallError> {
        let trail = self.capability(&[ContextKind::Delegated], "emit")?;
        trail.emit(event_type, payload).await
    }

    /// Issue a sub-request to the reasoning delegate and validate its
    /// structured reply. Delegated contexts only.
    ///
    /// # Errors
    /// Capability errors for non-delegated contexts;
    /// [`CallError::ClientPhase`] when the delegate fails or its reply
    /// does not match the declared schema; [`CallError::Cancelled`] when
    /// the call is cancelled while waiting.
    pub async fn prompt(&self, request: DelegateRequest) -> Result<Value, CallError> {
        let trail = self.capability(&[ContextKind::Delegated], "prompt")?;
        let delegate = self.delegate.as_ref().ok_or({
            ProtocolError::CapabilityUnavailable {
                kind: self.kind,
                operation: "prompt",
            }
        })?;

        let step_id = trail
            .open_step(StepKind::Prompt, &request.name, request.payload.clone())
            .await;

        let reply = tokio::select! {
            () = self.signal.cancelled() => return Err(CallError::Cancelled),
            reply = delegate.prompt(&self.call_id, &request) => {
                reply.map_err(|e| CallError::ClientPhase(format!("delegate failed: {e}")))?
            }
        };

        if let Some(schema) = &request.response_schema {
            conforms(schema, &reply).map_err(|reason| {
                CallError::ClientPhase(format!(
                    "delegate reply for `{}` does not match its schema: {reason}",
                    request.name
                ))
            })?;
        }

        trail.complete_direct(&step_id, reply.clone()).await;
        Ok(reply)
    }

    /// Spawn several delegated sub-prompts concurrently and join them.
    ///
    /// Results are returned indexed by spawn order, independent of
    /// completion order; the join point is itself a suspension point.
    ///
    /// # Errors
    /// The first sub-prompt failure (in spawn order) fails the join.
    pub async fn join_all(
        &self,
        requests: Vec<DelegateRequest>,
    ) -> Result<Vec<Value>, CallError> {
        // Capability check up front so an empty fan-out still fails on a
        // non-delegated context.
        self.capability(&[ContextKind::Delegated], "join_all")?;
        let results =
            futures::future::join_all(requests.into_iter().map(|r| self.prompt(r))).await;
        results.into_iter().collect()
    }

    /// Ask the responsible surface for approval. Boolean-shaped prompt,
    /// available wherever a trail is attached.
    ///
    /// # Errors
    /// Capability errors for headless contexts, plus prompt errors.
    pub async fn request_approval(&self, payload: Value) -> Result<bool, CallError> {
        self.boolean_prompt("approval", payload).await
    }

    /// Ask the responsible surface for permission. Boolean-shaped prompt,
    /// available wherever a trail is attached.
    ///
    /// # Errors
    /// Capability errors for headless contexts, plus prompt errors.
    pub async fn request_permission(&self, payload: Value) -> Result<bool, CallError> {
        self.boolean_prompt("permission", payload).await
    }

    async fn boolean_prompt(
        &self,
        request_type: &'static str,
        payload: Value,
    ) -> Result<bool, CallError> {
        let trail = self.capability(
            &[ContextKind::Interactive, ContextKind::Delegated],
            request_type,
        )?;
        let value = trail
            .prompt(StepKind::Approval, request_type, payload)
            .await?;
        // The responder registry already enforced a boolean shape.
        Ok(value.as_bool().unwrap_or(false))
    }
}
