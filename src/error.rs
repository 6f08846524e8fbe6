//! Error taxonomy for the handoff SDK.
//!
//! Two layers of failure exist:
//!
//! - [`ProtocolError`] - misuse of the SDK's contracts (duplicate resumes,
//!   responses for unknown steps, undeclared request types). These indicate
//!   a caller bug and are surfaced synchronously at the point of misuse.
//! - [`CallError`] - failures of an individual tool call: bad parameters,
//!   trusted-phase exceptions, client-phase failures, or cancellation.
//!
//! No automatic retries exist at this layer; retry policy, if wanted,
//! belongs to the caller around the whole call.

use crate::types::{CallId, ContextKind};
use thiserror::Error;

/// Misuse of the SDK's contracts. Always a caller bug, never a recoverable
/// runtime condition, and never silently swallowed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A tool with this name is already registered.
    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),

    /// No tool with this name exists in the registry.
    #[error("unknown tool `{0}`")]
    UnknownTool(String),

    /// A tool definition's phase functions are inconsistent with its
    /// authority mode.
    #[error("invalid definition for tool `{tool}`: {reason}")]
    InvalidDefinition { tool: String, reason: String },

    /// Phase 1 was started twice for the same call.
    #[error("call `{0}` already exists")]
    DuplicateCall(CallId),

    /// No call with this id is known to the engine.
    #[error("unknown call `{0}`")]
    UnknownCall(CallId),

    /// Phase 2 was attempted on a call that already reached a terminal
    /// state. The first resume wins; all later attempts are rejected.
    #[error("call `{0}` was already resumed")]
    DuplicateResume(CallId),

    /// A response arrived for a step that does not exist.
    #[error("unknown step `{step_id}` for call `{call_id}`")]
    UnknownStep { call_id: CallId, step_id: String },

    /// A second response arrived for a step that already completed.
    #[error("step `{step_id}` of call `{call_id}` already has a response")]
    DuplicateStepResponse { call_id: CallId, step_id: String },

    /// A prompt was issued for a request type no responder declared.
    /// This is a configuration error, not a runtime condition.
    #[error("no responder declared for request type `{0}`")]
    UnknownRequestType(String),

    /// A response's shape does not match the schema declared for its
    /// request type. Rejected before it can reach trusted code.
    #[error("response for request type `{request_type}` does not match its declared shape: {reason}")]
    ResponseShape {
        request_type: String,
        reason: String,
    },

    /// A capability operation was invoked on a context kind that does not
    /// provide it.
    #[error("operation `{operation}` is not available in a {kind:?} context")]
    CapabilityUnavailable {
        kind: ContextKind,
        operation: &'static str,
    },
}

/// Failure of an individual tool call.
#[derive(Debug, Error)]
pub enum CallError {
    /// Parameters failed schema validation; rejected before any trusted
    /// phase ran.
    #[error("invalid parameters for tool `{tool}`: {reason}")]
    Validation { tool: String, reason: String },

    /// `before()`, `server()`, or `after()` failed. Fatal to the call;
    /// nothing is retried and no compensating transaction runs.
    #[error("trusted phase `{phase}` failed: {source}")]
    TrustedPhase {
        phase: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The client phase failed or the untrusted side declined. A tool may
    /// instead catch a decline inside its own `client()` and return a
    /// "declined" output; that choice is per-tool, not automatic.
    #[error("client phase failed: {0}")]
    ClientPhase(String),

    /// The call was cancelled at a suspension point. `after()` never ran.
    #[error("call was cancelled")]
    Cancelled,

    /// Contract misuse detected while driving the call.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CallError {
    /// Returns true if the call ended because of cancellation rather than
    /// a failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
