//! Core types for the handoff SDK.
//!
//! This module contains the fundamental types used throughout the SDK:
//!
//! - [`CallId`]: Unique identifier for a tool call, stable across both phases
//! - [`AuthorityMode`]: Which side performs the first trusted computation
//! - [`ContextKind`]: The capability set a tool's client phase requires
//! - [`Envelope`]: The cached, immutable output of phase 1
//! - [`Handoff`]: The descriptor that carries phase-1 output across the boundary
//! - [`CallStatus`]: Lifecycle state of a single tool call
//! - [`SessionConfig`]: Configuration for the session protocol

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a single tool call.
///
/// A `CallId` is created when the session detects a tool request and stays
/// stable across phase 1, the client phase, and phase 2.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side performs the first trusted computation of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityMode {
    /// Phase 1 runs trusted code (`before` or `server`) on the trusted host.
    Server,
    /// Phase 1 performs no trusted computation; the call is immediately
    /// eligible for phase 2 once a client output exists.
    Client,
}

/// The capability set a tool's client phase requires.
///
/// Declared per tool at definition time; the engine supplies a context
/// satisfying exactly this set when the client phase runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// Waits for responses from a human-facing surface.
    Interactive,
    /// Issues structured sub-requests to a reasoning delegate.
    Delegated,
    /// No side channel; the client phase is pure computation.
    Headless,
}

/// The cached output of phase 1.
///
/// Computed exactly once per [`CallId`]; every subsequent read, including
/// phase-2 entry, returns the identical value. Serializable so it can be
/// persisted across a process restart mid-call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(pub serde_json::Value);

impl Envelope {
    #[must_use]
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    #[must_use]
    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

/// Descriptor returned by phase 1.
///
/// This is the only channel by which phase-1 output crosses into untrusted
/// territory. The session layer holds it until phase 2 completes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Handoff {
    /// The call this handoff belongs to.
    pub call_id: CallId,
    /// Name of the tool being invoked.
    pub tool_name: String,
    /// Authority mode of the tool.
    pub authority: AuthorityMode,
    /// Whether the tool uses the three-phase handoff form
    /// (`before`/`client`/`after`) rather than the simple form.
    pub uses_handoff: bool,
    /// Cached phase-1 output. `None` for client-authority tools.
    pub envelope: Option<Envelope>,
}

/// Lifecycle state of a single tool call.
///
/// `Complete`, `Errored`, and `Cancelled` are terminal; a call never leaves
/// a terminal state, and a second resume attempt against one is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Phase 1 is executing.
    Running,
    /// Phase 1 finished; the call is suspended awaiting a client output.
    AwaitingClient,
    /// Phase 2 finished successfully.
    Complete,
    /// A phase failed; the call will not produce a result.
    Errored,
    /// The call was cancelled; `after()` did not run.
    Cancelled,
}

impl CallStatus {
    /// Returns true once the call can no longer make progress.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Errored | Self::Cancelled)
    }
}

/// Configuration for the session protocol.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// System prompt sent with every model request.
    pub system_prompt: String,
    /// Maximum model round-trips per `send` before the turn is forced to end.
    pub max_turns: usize,
    /// Maximum tokens per model response.
    pub max_tokens: u32,
    /// Buffer size of the outgoing patch channel.
    pub patch_buffer: usize,
    /// Buffer size of the incoming command channel.
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            max_turns: 10,
            max_tokens: 4096,
            patch_buffer: 100,
            command_buffer: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_ids_are_unique() {
        let a = CallId::new();
        let b = CallId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn call_id_display_matches_inner() {
        let id = CallId::from_string("call_42");
        assert_eq!(id.to_string(), "call_42");
        assert_eq!(id.as_str(), "call_42");
    }

    #[test]
    fn envelope_serde_is_transparent() {
        let envelope = Envelope::new(serde_json::json!({"secret": 7}));
        let json = serde_json::to_string(&envelope).expect("serialize");
        assert_eq!(json, r#"{"secret":7}"#);

        let restored: Envelope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored, envelope);
    }

    #[test]
    fn terminal_statuses() {
        assert!(CallStatus::Complete.is_terminal());
        assert!(CallStatus::Errored.is_terminal());
        assert!(CallStatus::Cancelled.is_terminal());
        assert!(!CallStatus::Running.is_terminal());
        assert!(!CallStatus::AwaitingClient.is_terminal());
    }

    #[test]
    fn session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_turns, 10);
        assert_eq!(config.max_tokens, 4096);
        assert_eq!(config.patch_buffer, 100);
    }

    #[test]
    fn authority_mode_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&AuthorityMode::Server).expect("serialize"),
            "\"server\""
        );
        assert_eq!(
            serde_json::to_string(&ContextKind::Headless).expect("serialize"),
            "\"headless\""
        );
    }
}
