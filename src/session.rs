//! The session protocol: commands in, an ordered patch stream out.
//!
//! A [`Session`] owns one conversation. It accepts [`SessionCommand`]s,
//! streams model output, detects tool invocations, drives each one through
//! the [`HandoffEngine`], and emits every observable state transition as a
//! patch on the channel returned from [`SessionBuilder::spawn`].
//!
//! Turn state machine: `Idle -> Streaming -> (ToolPending)* -> Idle`, with
//! `Errored` and `Aborted` reachable from any non-idle state. A new `send`
//! is accepted from `Idle`, `Errored`, or `Aborted`.
//!
//! Ordering guarantee: patches for one call are emitted in the order
//! `pending_handoff`, the trail's steps in emission order, then
//! `handoff_complete`. Patches across concurrent calls may interleave but
//! never reorder within a call.
//!
//! # Example
//!
//! ```ignore
//! let (handle, mut patches) = Session::builder()
//!     .provider(provider)
//!     .registry(registry)
//!     .spawn();
//!
//! handle.send("Play a round").await?;
//! while let Some(envelope) = patches.recv().await {
//!     println!("{:?}", envelope.patch);
//! }
//! ```

#[cfg(test)]
mod test_utils;

use crate::context::{ClientContext, Delegate};
use crate::definition::ToolRegistry;
use crate::engine::{CallInvocation, HandoffEngine};
use crate::error::{CallError, ProtocolError};
use crate::model::{ContentBlock, Message, ModelDelta, ModelProvider, ModelRequest, StopReason};
use crate::patch::{ChatPatch, PatchEnvelope, PatchSender};
use crate::stores::{EnvelopeStore, TrailStore};
use crate::trail::{ResponderRegistry, TrailRuntime};
use crate::types::{CallId, ContextKind, SessionConfig};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Commands accepted by a running session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Submit user input and start a turn.
    Send { content: String },
    /// Finalize the turn with whatever partial content has accumulated.
    Abort {
        partial_content: Option<String>,
        partial_html: Option<String>,
    },
    /// Clear all session state.
    Reset,
    /// Supply the client output for a suspended call.
    HandoffResponse { call_id: CallId, output: Value },
    /// Respond to an individual trail step.
    StepResponse {
        call_id: CallId,
        step_id: String,
        value: Value,
    },
}

/// Turn state of the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Streaming,
    ToolPending,
    Errored,
    Aborted,
}

impl TurnState {
    const fn accepts_send(self) -> bool {
        matches!(self, Self::Idle | Self::Errored | Self::Aborted)
    }
}

/// Handle for issuing commands to a spawned session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Submit user input.
    ///
    /// # Errors
    /// Returns an error when the session task is gone.
    pub async fn send(&self, content: impl Into<String>) -> anyhow::Result<()> {
        self.command(SessionCommand::Send {
            content: content.into(),
        })
        .await
    }

    /// Abort the current turn.
    ///
    /// # Errors
    /// Returns an error when the session task is gone.
    pub async fn abort(
        &self,
        partial_content: Option<String>,
        partial_html: Option<String>,
    ) -> anyhow::Result<()> {
        self.command(SessionCommand::Abort {
            partial_content,
            partial_html,
        })
        .await
    }

    /// Clear all session state.
    ///
    /// # Errors
    /// Returns an error when the session task is gone.
    pub async fn reset(&self) -> anyhow::Result<()> {
        self.command(SessionCommand::Reset).await
    }

    /// Supply the client output for a suspended call.
    ///
    /// # Errors
    /// Returns an error when the session task is gone.
    pub async fn handoff_response(&self, call_id: CallId, output: Value) -> anyhow::Result<()> {
        self.command(SessionCommand::HandoffResponse { call_id, output })
            .await
    }

    /// Respond to an individual trail step.
    ///
    /// # Errors
    /// Returns an error when the session task is gone.
    pub async fn step_response(
        &self,
        call_id: CallId,
        step_id: impl Into<String>,
        value: Value,
    ) -> anyhow::Result<()> {
        self.command(SessionCommand::StepResponse {
            call_id,
            step_id: step_id.into(),
            value,
        })
        .await
    }

    async fn command(&self, command: SessionCommand) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("session task is gone"))
    }
}

/// Builder for spawning a [`Session`].
pub struct SessionBuilder {
    provider: Option<Arc<dyn ModelProvider>>,
    registry: Option<Arc<ToolRegistry>>,
    config: SessionConfig,
    responders: ResponderRegistry,
    delegate: Option<Arc<dyn Delegate>>,
    trail_store: Option<Arc<dyn TrailStore>>,
    envelope_store: Option<Arc<dyn EnvelopeStore>>,
}

impl SessionBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            provider: None,
            registry: None,
            config: SessionConfig::default(),
            responders: ResponderRegistry::new(),
            delegate: None,
            trail_store: None,
            envelope_store: None,
        }
    }

    /// Set the model provider.
    #[must_use]
    pub fn provider(mut self, provider: impl ModelProvider + 'static) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    /// Set the tool registry.
    #[must_use]
    pub fn registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// Set the session configuration.
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the responder registry for interactive request types.
    #[must_use]
    pub fn responders(mut self, responders: ResponderRegistry) -> Self {
        self.responders = responders;
        self
    }

    /// Set the reasoning delegate for delegated client phases.
    #[must_use]
    pub fn delegate(mut self, delegate: impl Delegate + 'static) -> Self {
        self.delegate = Some(Arc::new(delegate));
        self
    }

    /// Persist step trails across restarts.
    #[must_use]
    pub fn trail_store(mut self, store: Arc<dyn TrailStore>) -> Self {
        self.trail_store = Some(store);
        self
    }

    /// Persist phase-1 envelopes across restarts.
    #[must_use]
    pub fn envelope_store(mut self, store: Arc<dyn EnvelopeStore>) -> Self {
        self.envelope_store = Some(store);
        self
    }

    /// Spawn the session task.
    ///
    /// Returns the command handle and the patch stream.
    ///
    /// # Panics
    ///
    /// Panics if a provider or registry has not been set.
    #[must_use]
    pub fn spawn(self) -> (SessionHandle, mpsc::Receiver<PatchEnvelope>) {
        let provider = self.provider.expect("provider is required");
        let registry = self.registry.expect("registry is required");

        let mut engine = HandoffEngine::new(Arc::clone(&registry));
        if let Some(store) = &self.envelope_store {
            engine = engine.with_envelope_store(Arc::clone(store));
        }

        let (patches, patch_rx) = PatchSender::channel(self.config.patch_buffer);
        let (command_tx, command_rx) = mpsc::channel(self.config.command_buffer);
        let (internal_tx, internal_rx) = mpsc::channel(self.config.patch_buffer);

        let worker = SessionWorker {
            provider,
            registry,
            engine: Arc::new(engine),
            config: self.config,
            responders: Arc::new(self.responders),
            delegate: self.delegate,
            trail_store: self.trail_store,
            patches,
            internal_tx,
            state: TurnState::Idle,
            history: Vec::new(),
            turn: 0,
            turn_token: CancellationToken::new(),
            round_text: String::new(),
            round_tool_uses: Vec::new(),
            pending: HashMap::new(),
            turn_results: Vec::new(),
        };
        tokio::spawn(worker.run(command_rx, internal_rx));

        (
            SessionHandle {
                commands: command_tx,
            },
            patch_rx,
        )
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point for the session protocol.
pub struct Session;

impl Session {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }
}

enum InternalEvent {
    Delta(ModelDelta),
    /// The provider stream ended without a `Done` delta.
    StreamClosed,
    ClientDone {
        call_id: CallId,
        output: Result<Value, CallError>,
    },
}

struct PendingCall {
    tool_name: String,
    trail: Option<Arc<TrailRuntime>>,
    /// True when the client output arrives through a `handoff_response`
    /// command instead of an in-process client phase.
    external: bool,
}

struct SessionWorker {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    engine: Arc<HandoffEngine>,
    config: SessionConfig,
    responders: Arc<ResponderRegistry>,
    delegate: Option<Arc<dyn Delegate>>,
    trail_store: Option<Arc<dyn TrailStore>>,
    patches: PatchSender,
    internal_tx: mpsc::Sender<InternalEvent>,

    state: TurnState,
    history: Vec<Message>,
    /// Model round-trips within the current turn.
    turn: usize,
    turn_token: CancellationToken,
    round_text: String,
    round_tool_uses: Vec<(String, String, Value)>,
    pending: HashMap<CallId, PendingCall>,
    turn_results: Vec<(CallId, String, bool)>,
}

impl SessionWorker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut internal: mpsc::Receiver<InternalEvent>,
    ) {
        loop {
            tokio::select! {
                Some(event) = internal.recv() => self.handle_internal(event).await,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // All handles dropped; the session is over.
                    None => break,
                },
            }
        }
        debug!("session task finished");
    }

    async fn emit(&self, patch: ChatPatch) {
        if let Err(e) = self.patches.send(patch).await {
            warn!(error = %e, "dropping patch, consumer is gone");
        }
    }

    async fn emit_error(&self, call_id: Option<CallId>, message: impl Into<String>) {
        let message = message.into();
        error!(call_id = ?call_id, message = %message, "session error");
        self.emit(ChatPatch::Error { call_id, message }).await;
    }

    // ===================
    // Commands
    // ===================

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Send { content } => self.handle_send(content).await,
            SessionCommand::Abort {
                partial_content,
                partial_html,
            } => self.handle_abort(partial_content, partial_html).await,
            SessionCommand::Reset => self.handle_reset().await,
            SessionCommand::HandoffResponse { call_id, output } => {
                self.handle_handoff_response(call_id, output).await;
            }
            SessionCommand::StepResponse {
                call_id,
                step_id,
                value,
            } => self.handle_step_response(call_id, &step_id, value).await,
        }
    }

    async fn handle_send(&mut self, content: String) {
        if !self.state.accepts_send() {
            self.emit_error(None, "a turn is already active").await;
            return;
        }

        info!(turn_state = ?self.state, "starting turn");
        self.history.push(Message::user(content.clone()));
        self.emit(ChatPatch::MessageAdded {
            role: "user".to_string(),
            content,
        })
        .await;

        self.turn = 1;
        self.turn_token = CancellationToken::new();
        self.turn_results.clear();
        self.start_stream();
    }

    async fn handle_abort(
        &mut self,
        partial_content: Option<String>,
        partial_html: Option<String>,
    ) {
        self.cancel_turn();

        let partial_content = partial_content.or_else(|| {
            if self.round_text.is_empty() {
                None
            } else {
                Some(self.round_text.clone())
            }
        });
        if let Some(partial) = &partial_content {
            self.history.push(Message::assistant(partial.clone()));
        }

        self.state = TurnState::Aborted;
        self.emit(ChatPatch::AbortComplete {
            partial_content,
            partial_html,
        })
        .await;
    }

    async fn handle_reset(&mut self) {
        self.cancel_turn();
        self.history.clear();
        self.turn = 0;
        self.state = TurnState::Idle;
        self.emit(ChatPatch::Reset).await;
    }

    fn cancel_turn(&mut self) {
        self.turn_token.cancel();
        for call_id in self.pending.keys() {
            self.engine.cancel(call_id);
        }
        self.pending.clear();
        self.round_tool_uses.clear();
        self.turn_results.clear();
    }

    async fn handle_handoff_response(&mut self, call_id: CallId, output: Value) {
        match self.pending.get(&call_id) {
            Some(pending) if !pending.external => {
                self.emit_error(
                    Some(call_id),
                    "call has an in-process client phase; its output cannot be supplied externally",
                )
                .await;
                return;
            }
            _ => {}
        }
        self.finish_call(call_id, Ok(output)).await;
    }

    async fn handle_step_response(&mut self, call_id: CallId, step_id: &str, value: Value) {
        let Some(trail) = self.pending.get(&call_id).and_then(|p| p.trail.clone()) else {
            self.emit_error(
                Some(call_id.clone()),
                format!("no suspended call `{call_id}` with a trail"),
            )
            .await;
            return;
        };

        if let Err(e) = trail.respond(step_id, value).await {
            self.emit_error(Some(call_id), e.to_string()).await;
        }
    }

    // ===================
    // Model streaming
    // ===================

    fn start_stream(&mut self) {
        self.state = TurnState::Streaming;
        self.round_text.clear();
        self.round_tool_uses.clear();

        let request = ModelRequest::new(
            &self.config,
            self.history.clone(),
            self.registry.to_model_tools(),
        );
        let provider = Arc::clone(&self.provider);
        let internal = self.internal_tx.clone();
        let token = self.turn_token.clone();

        debug!(turn = self.turn, model = provider.model(), "starting model round");
        tokio::spawn(async move {
            let mut stream = match provider.stream(request).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = internal
                        .send(InternalEvent::Delta(ModelDelta::Error {
                            message: e.to_string(),
                        }))
                        .await;
                    return;
                }
            };

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    delta = stream.next() => match delta {
                        Some(delta) => {
                            let last = matches!(
                                delta,
                                ModelDelta::Done { .. } | ModelDelta::Error { .. }
                            );
                            if internal.send(InternalEvent::Delta(delta)).await.is_err() {
                                break;
                            }
                            if last {
                                break;
                            }
                        }
                        None => {
                            let _ = internal.send(InternalEvent::StreamClosed).await;
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Delta(delta) => self.handle_delta(delta).await,
            InternalEvent::StreamClosed => {
                if self.state == TurnState::Streaming {
                    self.finish_round(StopReason::EndTurn).await;
                }
            }
            InternalEvent::ClientDone { call_id, output } => {
                if self.pending.contains_key(&call_id) {
                    self.finish_call(call_id, output).await;
                } else {
                    // The turn was aborted or reset while the client phase
                    // was finishing.
                    debug!(call_id = %call_id, "ignoring client output for a call no longer pending");
                }
            }
        }
    }

    async fn handle_delta(&mut self, delta: ModelDelta) {
        if self.state != TurnState::Streaming {
            return;
        }
        match delta {
            ModelDelta::TextDelta { delta } => {
                self.round_text.push_str(&delta);
                self.emit(ChatPatch::StreamingText { delta }).await;
            }
            ModelDelta::ThinkingDelta { delta } => {
                self.emit(ChatPatch::StreamingThinking { delta }).await;
            }
            ModelDelta::ToolUse { id, name, input } => {
                self.round_tool_uses.push((id, name, input));
            }
            ModelDelta::Done { stop_reason } => {
                self.finish_round(stop_reason).await;
            }
            ModelDelta::Error { message } => {
                self.emit_error(None, format!("model stream failed: {message}"))
                    .await;
                self.state = TurnState::Errored;
            }
        }
    }

    async fn finish_round(&mut self, stop_reason: StopReason) {
        let text = std::mem::take(&mut self.round_text);
        let tool_uses = std::mem::take(&mut self.round_tool_uses);

        if !text.is_empty() {
            self.emit(ChatPatch::MessageAdded {
                role: "assistant".to_string(),
                content: text.clone(),
            })
            .await;
        }

        if tool_uses.is_empty() {
            if !text.is_empty() {
                self.history.push(Message::assistant(text));
            }
            info!(turn = self.turn, stop = ?stop_reason, "turn complete");
            self.emit(ChatPatch::TurnComplete { turn: self.turn }).await;
            self.state = TurnState::Idle;
            return;
        }

        // Store the assistant message carrying the tool requests before
        // the results.
        let mut blocks = Vec::new();
        if !text.is_empty() {
            blocks.push(ContentBlock::Text { text });
        }
        for (id, name, input) in &tool_uses {
            blocks.push(ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            });
        }
        self.history.push(Message::assistant_blocks(blocks));

        self.state = TurnState::ToolPending;
        for (id, name, input) in tool_uses {
            self.start_call(CallId::from_string(id), &name, input).await;
        }
        self.maybe_advance().await;
    }

    // ===================
    // Tool calls
    // ===================

    async fn start_call(&mut self, call_id: CallId, tool_name: &str, params: Value) {
        let signal = self.turn_token.child_token();
        let invocation = CallInvocation::new(params)
            .with_call_id(call_id.clone())
            .with_signal(signal.clone());

        let handoff = match self.engine.begin(tool_name, invocation).await {
            Ok(handoff) => handoff,
            Err(e) => {
                self.emit_error(Some(call_id.clone()), e.to_string()).await;
                self.turn_results.push((call_id, e.to_string(), true));
                return;
            }
        };

        self.emit(ChatPatch::PendingHandoff {
            call_id: handoff.call_id.clone(),
            tool_name: handoff.tool_name.clone(),
            authority: handoff.authority,
            envelope: handoff.envelope.clone(),
        })
        .await;

        let tool = self
            .registry
            .get(tool_name)
            .expect("begin succeeded for a registered tool");

        if tool.client_phase().is_none() {
            // The client output arrives through a handoff_response command.
            self.pending.insert(
                call_id,
                PendingCall {
                    tool_name: tool_name.to_string(),
                    trail: None,
                    external: true,
                },
            );
            return;
        }

        let trail = match tool.context_kind() {
            ContextKind::Headless => None,
            ContextKind::Interactive | ContextKind::Delegated => Some(Arc::new(TrailRuntime::new(
                call_id.clone(),
                Arc::clone(&self.responders),
                self.patches.clone(),
                self.trail_store.clone(),
                signal.clone(),
            ))),
        };

        let ctx = match tool.context_kind() {
            ContextKind::Headless => ClientContext::headless(call_id.clone(), signal.clone()),
            ContextKind::Interactive => ClientContext::interactive(
                call_id.clone(),
                signal.clone(),
                Arc::clone(trail.as_ref().expect("interactive trail")),
            ),
            ContextKind::Delegated => {
                let Some(delegate) = self.delegate.clone() else {
                    let err = ProtocolError::CapabilityUnavailable {
                        kind: ContextKind::Delegated,
                        operation: "prompt",
                    };
                    self.emit_error(Some(call_id.clone()), err.to_string()).await;
                    self.turn_results.push((call_id, err.to_string(), true));
                    return;
                };
                ClientContext::delegated(
                    call_id.clone(),
                    signal.clone(),
                    Arc::clone(trail.as_ref().expect("delegated trail")),
                    delegate,
                )
            }
        };

        self.pending.insert(
            call_id.clone(),
            PendingCall {
                tool_name: tool_name.to_string(),
                trail,
                external: false,
            },
        );

        let engine = Arc::clone(&self.engine);
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let output = engine.client_phase(&call_id, ctx).await;
            let _ = internal
                .send(InternalEvent::ClientDone { call_id, output })
                .await;
        });
    }

    /// Drive phase 2 for a call whose client output is available.
    async fn finish_call(&mut self, call_id: CallId, output: Result<Value, CallError>) {
        let removed = self.pending.remove(&call_id);
        let was_pending = removed.is_some();
        let tool_name = removed.map(|p| p.tool_name).unwrap_or_default();

        match output {
            Ok(client_output) => match self.engine.resume(&call_id, client_output).await {
                Ok(result) => {
                    let summary = result.to_string();
                    self.emit(ChatPatch::HandoffComplete {
                        call_id: call_id.clone(),
                        result,
                    })
                    .await;
                    self.turn_results.push((call_id, summary, false));
                }
                Err(CallError::Cancelled) => {
                    debug!(call_id = %call_id, tool = %tool_name, "call cancelled at resume");
                }
                Err(e) => {
                    self.emit_error(Some(call_id.clone()), e.to_string()).await;
                    // A response for a call this turn never owned gets the
                    // error patch but must not fabricate a tool result.
                    if was_pending {
                        self.turn_results.push((call_id, e.to_string(), true));
                    }
                }
            },
            Err(CallError::Cancelled) => {
                debug!(call_id = %call_id, tool = %tool_name, "client phase cancelled");
            }
            Err(e) => {
                self.emit_error(Some(call_id.clone()), e.to_string()).await;
                if was_pending {
                    self.turn_results.push((call_id, e.to_string(), true));
                }
            }
        }

        self.maybe_advance().await;
    }

    /// Once every call of the round reached a terminal state, feed the
    /// results back to the model and continue the turn.
    async fn maybe_advance(&mut self) {
        if self.state != TurnState::ToolPending || !self.pending.is_empty() {
            return;
        }

        for (call_id, content, is_error) in std::mem::take(&mut self.turn_results) {
            self.history
                .push(Message::tool_result(call_id.0, content, is_error));
        }

        self.turn += 1;
        if self.turn > self.config.max_turns {
            warn!(max_turns = self.config.max_turns, "maximum turns reached");
            self.emit_error(None, format!("maximum turns ({}) reached", self.config.max_turns))
                .await;
            self.state = TurnState::Errored;
            return;
        }
        self.start_stream();
    }
}
