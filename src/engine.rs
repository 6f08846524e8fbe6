//! The two-phase handoff execution engine.
//!
//! A tool call crosses the trust boundary exactly once:
//!
//! 1. **Phase 1 (trusted)** - [`HandoffEngine::begin`] runs `before()` (or
//!    the simple form's `server()`) and caches its output as the call's
//!    [`Envelope`]. All non-idempotent work belongs here.
//! 2. **Suspend** - the returned [`Handoff`] descriptor is the only channel
//!    by which phase-1 output crosses into untrusted territory.
//! 3. **Client phase** - [`HandoffEngine::client_phase`] runs the tool's
//!    `client()` under the declared context provider, or the client output
//!    arrives externally.
//! 4. **Phase 2 (trusted)** - [`HandoffEngine::resume`] re-enters with the
//!    *cached* envelope and the client output. `before()` is never re-run;
//!    recomputing it is a correctness bug, not an optimization. A second
//!    resume for the same call is rejected.
//!
//! Caching the envelope is what makes resumption safe after an arbitrary
//! delay, including a process restart when an [`EnvelopeStore`] is
//! attached (see [`HandoffEngine::hydrate`]).


use crate::context::ClientContext;
use crate::definition::{PhaseContext, ToolDefinition, ToolRegistry};
use crate::error::{CallError, ProtocolError};
use crate::stores::EnvelopeStore;
use crate::types::{AuthorityMode, CallId, CallStatus, Envelope, Handoff};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One instance per tool call.
///
/// The `call_id` stays stable across both phases; the cancellation signal
/// is observed at every suspension point of the call tree.
#[derive(Clone, Debug)]
pub struct CallInvocation {
    pub call_id: CallId,
    pub params: Value,
    pub signal: CancellationToken,
}

impl CallInvocation {
    /// New invocation with a fresh call id and its own cancellation token.
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self {
            call_id: CallId::new(),
            params,
            signal: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_call_id(mut self, call_id: CallId) -> Self {
        self.call_id = call_id;
        self
    }

    #[must_use]
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = signal;
        self
    }
}

struct CallRecord {
    tool: Arc<ToolDefinition>,
    params: Value,
    envelope: Option<Envelope>,
    status: CallStatus,
    signal: CancellationToken,
}

/// Executes tool calls across the trust boundary with idempotency
/// guarantees.
///
/// Terminal call records are retained so that late duplicate resume
/// attempts keep being rejected rather than silently re-executing work.
pub struct HandoffEngine {
    registry: Arc<ToolRegistry>,
    envelope_store: Option<Arc<dyn EnvelopeStore>>,
    calls: Mutex<HashMap<CallId, CallRecord>>,
}

impl HandoffEngine {
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            envelope_store: None,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a store so envelopes survive a process restart mid-call.
    #[must_use]
    pub fn with_envelope_store(mut self, store: Arc<dyn EnvelopeStore>) -> Self {
        self.envelope_store = Some(store);
        self
    }

    /// Current status of a call, if the engine knows it.
    #[must_use]
    pub fn status(&self, call_id: &CallId) -> Option<CallStatus> {
        self.calls
            .lock()
            .expect("call table lock poisoned")
            .get(call_id)
            .map(|r| r.status)
    }

    fn set_status(&self, call_id: &CallId, status: CallStatus) {
        if let Some(record) = self
            .calls
            .lock()
            .expect("call table lock poisoned")
            .get_mut(call_id)
        {
            record.status = status;
        }
    }

    /// Phase 1. Runs the trusted phase-1 function (for server authority),
    /// caches its output as the call's envelope, and suspends the call.
    ///
    /// # Errors
    /// Unknown tool and duplicate call ids are protocol errors; schema
    /// failures are [`CallError::Validation`]; a phase-1 exception aborts
    /// the call before anything crosses the boundary.
    pub async fn begin(
        &self,
        tool_name: &str,
        invocation: CallInvocation,
    ) -> Result<Handoff, CallError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| ProtocolError::UnknownTool(tool_name.to_string()))?;
        tool.validate_params(&invocation.params)?;

        let CallInvocation {
            call_id,
            params,
            signal,
        } = invocation;

        {
            let mut calls = self.calls.lock().expect("call table lock poisoned");
            if calls.contains_key(&call_id) {
                return Err(ProtocolError::DuplicateCall(call_id).into());
            }
            calls.insert(
                call_id.clone(),
                CallRecord {
                    tool: Arc::clone(&tool),
                    params: params.clone(),
                    envelope: None,
                    status: CallStatus::Running,
                    signal: signal.clone(),
                },
            );
        }

        let envelope = match tool.authority() {
            AuthorityMode::Server => {
                let phase_name = if tool.uses_handoff() { "before" } else { "server" };
                let Some(phase_one) = tool.phase_one() else {
                    // Unreachable for definitions built through the
                    // validating constructors.
                    return Err(ProtocolError::InvalidDefinition {
                        tool: tool_name.to_string(),
                        reason: format!("missing `{phase_name}` function"),
                    }
                    .into());
                };
                debug!(call_id = %call_id, tool = tool_name, phase = phase_name, "running phase 1");

                let ctx = PhaseContext::new(call_id.clone(), signal.clone());
                match phase_one(params, ctx).await {
                    Ok(value) => Some(Envelope::new(value)),
                    Err(e) => {
                        self.set_status(&call_id, CallStatus::Errored);
                        return Err(CallError::TrustedPhase {
                            phase: phase_name,
                            source: e,
                        });
                    }
                }
            }
            // Client authority: no trusted computation; the call is
            // immediately eligible for phase 2.
            AuthorityMode::Client => None,
        };

        if let Some(envelope) = &envelope {
            if let Some(store) = &self.envelope_store {
                if let Err(e) = store.put_envelope(&call_id, envelope.clone()).await {
                    warn!(call_id = %call_id, error = %e, "failed to persist envelope");
                }
            }
        }

        {
            let mut calls = self.calls.lock().expect("call table lock poisoned");
            if let Some(record) = calls.get_mut(&call_id) {
                record.envelope = envelope.clone();
                record.status = CallStatus::AwaitingClient;
            }
        }

        Ok(Handoff {
            call_id,
            tool_name: tool_name.to_string(),
            authority: tool.authority(),
            uses_handoff: tool.uses_handoff(),
            envelope,
        })
    }

    /// Restore a suspended call from the envelope store after a restart.
    ///
    /// The call re-enters `AwaitingClient` with the envelope persisted by
    /// the original phase 1; `before()` is not re-run.
    ///
    /// # Errors
    /// [`ProtocolError::UnknownCall`] when a server-authority call has no
    /// persisted envelope to restore from.
    pub async fn hydrate(
        &self,
        tool_name: &str,
        call_id: CallId,
        params: Value,
        signal: CancellationToken,
    ) -> Result<Handoff, CallError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| ProtocolError::UnknownTool(tool_name.to_string()))?;

        let envelope = match tool.authority() {
            AuthorityMode::Server => {
                let store = self
                    .envelope_store
                    .as_ref()
                    .ok_or_else(|| ProtocolError::UnknownCall(call_id.clone()))?;
                let envelope = store
                    .get_envelope(&call_id)
                    .await
                    .ok()
                    .flatten()
                    .ok_or_else(|| ProtocolError::UnknownCall(call_id.clone()))?;
                Some(envelope)
            }
            AuthorityMode::Client => None,
        };

        {
            let mut calls = self.calls.lock().expect("call table lock poisoned");
            if calls.contains_key(&call_id) {
                return Err(ProtocolError::DuplicateCall(call_id).into());
            }
            calls.insert(
                call_id.clone(),
                CallRecord {
                    tool: Arc::clone(&tool),
                    params,
                    envelope: envelope.clone(),
                    status: CallStatus::AwaitingClient,
                    signal,
                },
            );
        }

        debug!(call_id = %call_id, tool = tool_name, "hydrated suspended call");
        Ok(Handoff {
            call_id,
            tool_name: tool_name.to_string(),
            authority: tool.authority(),
            uses_handoff: tool.uses_handoff(),
            envelope,
        })
    }

    /// Run the tool's in-process client phase under the supplied context.
    ///
    /// # Errors
    /// A client-phase exception marks the call errored; phase 2 never
    /// runs. Cancellation while suspended terminates the call as
    /// cancelled.
    pub async fn client_phase(
        &self,
        call_id: &CallId,
        ctx: ClientContext,
    ) -> Result<Value, CallError> {
        let (tool, params, envelope, signal) = {
            let calls = self.calls.lock().expect("call table lock poisoned");
            let record = calls
                .get(call_id)
                .ok_or_else(|| ProtocolError::UnknownCall(call_id.clone()))?;
            if record.status != CallStatus::AwaitingClient {
                return Err(ProtocolError::DuplicateResume(call_id.clone()).into());
            }
            (
                Arc::clone(&record.tool),
                record.params.clone(),
                record.envelope.clone(),
                record.signal.clone(),
            )
        };

        let Some(client) = tool.client_phase() else {
            return Err(ProtocolError::InvalidDefinition {
                tool: tool.name().to_string(),
                reason: "tool has no in-process client phase".to_string(),
            }
            .into());
        };

        debug!(call_id = %call_id, tool = tool.name(), kind = ?tool.context_kind(), "running client phase");
        let fut = client(envelope, ctx, params);
        tokio::select! {
            // Cancellation wins over a simultaneously completing client
            // phase so the terminal status is deterministic.
            biased;
            () = signal.cancelled() => {
                self.set_status(call_id, CallStatus::Cancelled);
                Err(CallError::Cancelled)
            }
            output = fut => match output {
                Ok(value) => Ok(value),
                Err(_) if signal.is_cancelled() => {
                    self.set_status(call_id, CallStatus::Cancelled);
                    Err(CallError::Cancelled)
                }
                Err(e) => {
                    self.set_status(call_id, CallStatus::Errored);
                    Err(CallError::ClientPhase(e.to_string()))
                }
            }
        }
    }

    /// Phase 2. Re-enters the call with the cached envelope and the
    /// supplied client output, and produces the final result.
    ///
    /// # Errors
    /// A resume against a call that already reached a terminal state is
    /// rejected with [`ProtocolError::DuplicateResume`]. Cancellation
    /// observed here skips `after()` entirely. An `after()` exception
    /// marks the call errored; the client-side work already performed is
    /// not undone.
    pub async fn resume(
        &self,
        call_id: &CallId,
        client_output: Value,
    ) -> Result<Value, CallError> {
        let (tool, params, envelope, signal) = {
            let calls = self.calls.lock().expect("call table lock poisoned");
            let record = calls
                .get(call_id)
                .ok_or_else(|| ProtocolError::UnknownCall(call_id.clone()))?;
            if record.status != CallStatus::AwaitingClient {
                return Err(ProtocolError::DuplicateResume(call_id.clone()).into());
            }
            (
                Arc::clone(&record.tool),
                record.params.clone(),
                record.envelope.clone(),
                record.signal.clone(),
            )
        };

        if signal.is_cancelled() {
            self.set_status(call_id, CallStatus::Cancelled);
            return Err(CallError::Cancelled);
        }

        let result = if let Some(after) = tool.phase_two() {
            debug!(call_id = %call_id, tool = tool.name(), "running phase 2");
            let ctx = PhaseContext::new(call_id.clone(), signal.clone());
            let fut = after(envelope, client_output, ctx, params);
            tokio::select! {
                biased;
                () = signal.cancelled() => {
                    self.set_status(call_id, CallStatus::Cancelled);
                    return Err(CallError::Cancelled);
                }
                result = fut => match result {
                    Ok(value) => value,
                    Err(e) => {
                        self.set_status(call_id, CallStatus::Errored);
                        return Err(CallError::TrustedPhase {
                            phase: "after",
                            source: e,
                        });
                    }
                }
            }
        } else {
            // Simple form: the cached phase-1 output is the result for
            // server authority; the client output is for client authority.
            match tool.authority() {
                AuthorityMode::Server => envelope
                    .map(Envelope::into_value)
                    .unwrap_or(Value::Null),
                AuthorityMode::Client => client_output,
            }
        };

        self.set_status(call_id, CallStatus::Complete);
        if let Some(store) = &self.envelope_store {
            if let Err(e) = store.remove_envelope(call_id).await {
                warn!(call_id = %call_id, error = %e, "failed to discard envelope");
            }
        }
        debug!(call_id = %call_id, tool = tool.name(), "call complete");
        Ok(result)
    }

    /// Mark a call cancelled without entering phase 2. Used by the
    /// session when a turn is aborted while calls are suspended.
    pub fn cancel(&self, call_id: &CallId) {
        let mut calls = self.calls.lock().expect("call table lock poisoned");
        if let Some(record) = calls.get_mut(call_id) {
            if !record.status.is_terminal() {
                record.signal.cancel();
                record.status = CallStatus::Cancelled;
            }
        }
    }
}
