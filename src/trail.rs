//! Execution trail: durable, replayable suspension points.
//!
//! Every capability operation the client phase performs is recorded as a
//! [`Step`] in an append-only trail, one trail per call. `emit` steps are
//! fire-and-forget and complete immediately; `prompt` steps suspend the
//! client phase until a responder supplies a value, which resumes it
//! exactly once. The trail (together with the envelope) is the minimum
//! state that must be durably stored to survive a process restart mid-call.
//!
//! Responders are looked up by declared request type. Prompting with an
//! undeclared type is a fatal configuration error, and a response whose
//! shape fails the declared schema is rejected before it can reach the
//! trusted side.

use crate::definition::conforms;
use crate::error::{CallError, ProtocolError};
use crate::patch::{ChatPatch, PatchSender};
use crate::stores::TrailStore;
use crate::types::CallId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// What kind of suspension point a step records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Fire-and-forget notification; completes immediately.
    Emit,
    /// Awaits a response from an external responder.
    Prompt,
    /// Awaits a boolean approval/denial.
    Approval,
}

/// Lifecycle of a step. A `Prompt` step transitions pending -> complete
/// exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Complete,
}

/// One suspension point recorded during the client phase.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the call, assigned in emission order.
    pub id: String,
    pub kind: StepKind,
    /// The declared request type responders key on.
    pub request_type: String,
    pub payload: Value,
    pub status: StepStatus,
    /// Set exactly once, when the response is received.
    pub response: Option<Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Declared request types and the response shapes they accept.
///
/// `approval` and `permission` are built in with a boolean shape; every
/// other type must be declared before a client phase prompts with it.
#[derive(Clone, Debug)]
pub struct ResponderRegistry {
    schemas: HashMap<String, Value>,
}

impl ResponderRegistry {
    #[must_use]
    pub fn new() -> Self {
        let mut schemas = HashMap::new();
        schemas.insert("approval".to_string(), serde_json::json!({"type": "boolean"}));
        schemas.insert(
            "permission".to_string(),
            serde_json::json!({"type": "boolean"}),
        );
        Self { schemas }
    }

    /// Declare a request type and the schema its responses must match.
    pub fn declare(&mut self, request_type: impl Into<String>, response_schema: Value) {
        self.schemas.insert(request_type.into(), response_schema);
    }

    #[must_use]
    pub fn is_declared(&self, request_type: &str) -> bool {
        self.schemas.contains_key(request_type)
    }

    /// Validate a response against the declared shape for its type.
    ///
    /// # Errors
    /// [`ProtocolError::UnknownRequestType`] if the type was never
    /// declared; [`ProtocolError::ResponseShape`] if the value does not
    /// conform.
    pub fn validate_response(&self, request_type: &str, value: &Value) -> Result<(), ProtocolError> {
        let schema = self
            .schemas
            .get(request_type)
            .ok_or_else(|| ProtocolError::UnknownRequestType(request_type.to_string()))?;
        conforms(schema, value).map_err(|reason| ProtocolError::ResponseShape {
            request_type: request_type.to_string(),
            reason,
        })
    }
}

impl Default for ResponderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-call runtime that records steps and suspends/resumes the client
/// phase.
///
/// Appends are pushed to the patch stream as `tool_step` patches and,
/// when a [`TrailStore`] is attached, persisted for crash recovery. Store
/// failures are logged and do not fail the call.
pub struct TrailRuntime {
    call_id: CallId,
    responders: Arc<ResponderRegistry>,
    steps: Mutex<Vec<Step>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    counter: AtomicU64,
    patches: PatchSender,
    store: Option<Arc<dyn TrailStore>>,
    signal: CancellationToken,
}

impl TrailRuntime {
    #[must_use]
    pub fn new(
        call_id: CallId,
        responders: Arc<ResponderRegistry>,
        patches: PatchSender,
        store: Option<Arc<dyn TrailStore>>,
        signal: CancellationToken,
    ) -> Self {
        Self {
            call_id,
            responders,
            steps: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            patches,
            store,
            signal,
        }
    }

    #[must_use]
    pub const fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Snapshot of the trail so far, in emission order.
    #[must_use]
    pub fn steps(&self) -> Vec<Step> {
        self.steps.lock().expect("trail lock poisoned").clone()
    }

    fn next_step_id(&self) -> String {
        format!("step_{}", self.counter.fetch_add(1, Ordering::Relaxed))
    }

    async fn persist_append(&self, step: &Step) {
        if let Some(store) = &self.store {
            if let Err(e) = store.append_step(&self.call_id, step.clone()).await {
                warn!(call_id = %self.call_id, step_id = %step.id, error = %e, "failed to persist step");
            }
        }
    }

    async fn persist_update(&self, step: &Step) {
        if let Some(store) = &self.store {
            if let Err(e) = store.update_step(&self.call_id, step.clone()).await {
                warn!(call_id = %self.call_id, step_id = %step.id, error = %e, "failed to persist step update");
            }
        }
    }

    async fn publish(&self, step: Step) {
        let _ = self
            .patches
            .send(ChatPatch::ToolStep {
                call_id: self.call_id.clone(),
                step,
            })
            .await;
    }

    /// Append a complete step without suspending.
    pub async fn emit(&self, request_type: &str, payload: Value) -> Result<(), CallError> {
        let step = Step {
            id: self.next_step_id(),
            kind: StepKind::Emit,
            request_type: request_type.to_string(),
            payload,
            status: StepStatus::Complete,
            response: None,
            created_at: OffsetDateTime::now_utc(),
        };
        self.steps
            .lock()
            .expect("trail lock poisoned")
            .push(step.clone());
        self.persist_append(&step).await;
        self.publish(step).await;
        Ok(())
    }

    /// Append a pending step and suspend until a responder supplies a
    /// value for it, observing cancellation.
    ///
    /// # Errors
    /// [`ProtocolError::UnknownRequestType`] when no responder declared
    /// the type; [`CallError::Cancelled`] when the call's token fires
    /// while suspended.
    pub async fn prompt(
        &self,
        kind: StepKind,
        request_type: &str,
        payload: Value,
    ) -> Result<Value, CallError> {
        if !self.responders.is_declared(request_type) {
            return Err(ProtocolError::UnknownRequestType(request_type.to_string()).into());
        }

        let step = Step {
            id: self.next_step_id(),
            kind,
            request_type: request_type.to_string(),
            payload,
            status: StepStatus::Pending,
            response: None,
            created_at: OffsetDateTime::now_utc(),
        };
        let step_id = step.id.clone();

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("trail lock poisoned")
            .insert(step_id.clone(), tx);
        self.steps
            .lock()
            .expect("trail lock poisoned")
            .push(step.clone());
        self.persist_append(&step).await;
        self.publish(step).await;

        tokio::select! {
            biased;
            () = self.signal.cancelled() => Err(CallError::Cancelled),
            response = rx => {
                response.map_err(|_| CallError::ClientPhase("responder dropped before answering".to_string()))
            }
        }
    }

    /// Complete a pending step with an externally supplied value,
    /// resuming the suspended client phase exactly once.
    ///
    /// # Errors
    /// [`ProtocolError::UnknownStep`] for a step that was never recorded,
    /// [`ProtocolError::DuplicateStepResponse`] for a second response, and
    /// [`ProtocolError::ResponseShape`] when the value fails the declared
    /// shape (the step stays pending in that case).
    pub async fn respond(&self, step_id: &str, value: Value) -> Result<(), ProtocolError> {
        let request_type = {
            let steps = self.steps.lock().expect("trail lock poisoned");
            let step = steps.iter().find(|s| s.id == step_id).ok_or_else(|| {
                ProtocolError::UnknownStep {
                    call_id: self.call_id.clone(),
                    step_id: step_id.to_string(),
                }
            })?;
            if step.status == StepStatus::Complete {
                return Err(ProtocolError::DuplicateStepResponse {
                    call_id: self.call_id.clone(),
                    step_id: step_id.to_string(),
                });
            }
            step.request_type.clone()
        };

        // Shape check happens before the step transitions, so a rejected
        // response leaves the step pending for a corrected retry.
        self.responders.validate_response(&request_type, &value)?;

        let sender = self
            .pending
            .lock()
            .expect("trail lock poisoned")
            .remove(step_id)
            .ok_or_else(|| ProtocolError::DuplicateStepResponse {
                call_id: self.call_id.clone(),
                step_id: step_id.to_string(),
            })?;

        let updated = self.finish_step(step_id, value.clone());
        if let Some(step) = updated {
            self.persist_update(&step).await;
            self.publish(step).await;
        }

        // The receiver is gone if the client phase was cancelled while
        // suspended; the step record still completes above.
        let _ = sender.send(value);
        Ok(())
    }

    /// Complete a pending step whose response was obtained in-process
    /// (delegated sub-prompts resolve this way, without `respond`).
    pub(crate) async fn complete_direct(&self, step_id: &str, value: Value) {
        if let Some(step) = self.finish_step(step_id, value) {
            self.persist_update(&step).await;
            self.publish(step).await;
        }
    }

    fn finish_step(&self, step_id: &str, value: Value) -> Option<Step> {
        let mut steps = self.steps.lock().expect("trail lock poisoned");
        let step = steps.iter_mut().find(|s| s.id == step_id)?;
        step.status = StepStatus::Complete;
        step.response = Some(value);
        Some(step.clone())
    }

    /// Append a pending step without suspending on it. Used for delegated
    /// sub-prompts, which resolve through [`Self::complete_direct`].
    pub(crate) async fn open_step(
        &self,
        kind: StepKind,
        request_type: &str,
        payload: Value,
    ) -> String {
        let step = Step {
            id: self.next_step_id(),
            kind,
            request_type: request_type.to_string(),
            payload,
            status: StepStatus::Pending,
            response: None,
            created_at: OffsetDateTime::now_utc(),
        };
        let step_id = step.id.clone();
        self.steps
            .lock()
            .expect("trail lock poisoned")
            .push(step.clone());
        self.persist_append(&step).await;
        self.publish(step).await;
        step_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchSender;
    use serde_json::json;

    fn runtime() -> (Arc<TrailRuntime>, tokio::sync::mpsc::Receiver<crate::patch::PatchEnvelope>) {
        let (patches, rx) = PatchSender::channel(64);
        let mut responders = ResponderRegistry::new();
        responders.declare("choice", json!({"type": "string"}));
        let runtime = TrailRuntime::new(
            CallId::from_string("call_1"),
            Arc::new(responders),
            patches,
            None,
            CancellationToken::new(),
        );
        (Arc::new(runtime), rx)
    }

    #[tokio::test]
    async fn emit_appends_a_complete_step() {
        let (trail, mut rx) = runtime();
        trail
            .emit("progress", json!({"pct": 50}))
            .await
            .expect("emit");

        let steps = trail.steps();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kind, StepKind::Emit);
        assert_eq!(steps[0].status, StepStatus::Complete);

        let envelope = rx.recv().await.expect("patch");
        assert!(matches!(envelope.patch, ChatPatch::ToolStep { .. }));
    }

    #[tokio::test]
    async fn prompt_suspends_until_respond() {
        let (trail, _rx) = runtime();

        let waiter = {
            let trail = Arc::clone(&trail);
            tokio::spawn(async move {
                trail
                    .prompt(StepKind::Prompt, "choice", json!({"question": "pick"}))
                    .await
            })
        };

        // Let the prompt register its pending step.
        tokio::task::yield_now().await;
        let step_id = trail.steps()[0].id.clone();
        trail
            .respond(&step_id, json!("blue"))
            .await
            .expect("respond");

        let value = waiter.await.expect("join").expect("prompt");
        assert_eq!(value, json!("blue"));

        let steps = trail.steps();
        assert_eq!(steps[0].status, StepStatus::Complete);
        assert_eq!(steps[0].response, Some(json!("blue")));
    }

    #[tokio::test]
    async fn respond_twice_is_a_protocol_error() {
        let (trail, _rx) = runtime();

        let waiter = {
            let trail = Arc::clone(&trail);
            tokio::spawn(
                async move { trail.prompt(StepKind::Prompt, "choice", json!({})).await },
            )
        };
        tokio::task::yield_now().await;

        let step_id = trail.steps()[0].id.clone();
        trail.respond(&step_id, json!("first")).await.expect("first");
        let err = trail
            .respond(&step_id, json!("second"))
            .await
            .expect_err("second response must fail");
        assert!(matches!(err, ProtocolError::DuplicateStepResponse { .. }));

        assert_eq!(waiter.await.expect("join").expect("prompt"), json!("first"));
    }

    #[tokio::test]
    async fn respond_to_unknown_step_is_a_protocol_error() {
        let (trail, _rx) = runtime();
        let err = trail
            .respond("step_99", json!("x"))
            .await
            .expect_err("unknown step");
        assert!(matches!(err, ProtocolError::UnknownStep { .. }));
    }

    #[tokio::test]
    async fn prompt_with_undeclared_type_fails_fast() {
        let (trail, _rx) = runtime();
        let err = trail
            .prompt(StepKind::Prompt, "never_declared", json!({}))
            .await
            .expect_err("undeclared type");
        assert!(matches!(
            err,
            CallError::Protocol(ProtocolError::UnknownRequestType(_))
        ));
        assert!(trail.steps().is_empty());
    }

    #[tokio::test]
    async fn mismatched_response_shape_leaves_step_pending() {
        let (trail, _rx) = runtime();

        let waiter = {
            let trail = Arc::clone(&trail);
            tokio::spawn(
                async move { trail.prompt(StepKind::Prompt, "choice", json!({})).await },
            )
        };
        tokio::task::yield_now().await;
        let step_id = trail.steps()[0].id.clone();

        // "choice" responses must be strings.
        let err = trail
            .respond(&step_id, json!(42))
            .await
            .expect_err("bad shape");
        assert!(matches!(err, ProtocolError::ResponseShape { .. }));
        assert_eq!(trail.steps()[0].status, StepStatus::Pending);

        // A corrected response still resumes the client phase.
        trail.respond(&step_id, json!("ok")).await.expect("retry");
        assert_eq!(waiter.await.expect("join").expect("prompt"), json!("ok"));
    }

    #[tokio::test]
    async fn cancellation_unwinds_a_suspended_prompt() {
        let (patches, _rx) = PatchSender::channel(64);
        let mut responders = ResponderRegistry::new();
        responders.declare("choice", json!({"type": "string"}));
        let signal = CancellationToken::new();
        let trail = Arc::new(TrailRuntime::new(
            CallId::from_string("call_1"),
            Arc::new(responders),
            patches,
            None,
            signal.clone(),
        ));

        let waiter = {
            let trail = Arc::clone(&trail);
            tokio::spawn(
                async move { trail.prompt(StepKind::Prompt, "choice", json!({})).await },
            )
        };
        tokio::task::yield_now().await;

        signal.cancel();
        let result = waiter.await.expect("join");
        assert!(matches!(result, Err(CallError::Cancelled)));
    }
}
