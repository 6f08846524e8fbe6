//! Handoff SDK - two-phase tool execution across a trust boundary.
//!
//! This crate provides the building blocks for LLM-driven conversations
//! whose tool calls cross a trust/location boundary exactly once:
//!
//! - Two-phase handoff engine with envelope caching and idempotent resume
//! - Execution trail of durable, replayable suspension points
//! - Interactive, delegated, and headless client-phase contexts
//! - A session protocol that emits an ordered, immutable patch stream
//!
//! # Example
//!
//! ```ignore
//! use handoff_sdk::{
//!     AuthorityMode, ContextKind, HandoffPhases, Session, ToolDefinition,
//!     ToolRegistry, after_fn, client_fn, server_fn,
//! };
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(ToolDefinition::handoff(
//!     "guess",
//!     "Play one round of the guessing game",
//!     serde_json::json!({"type": "object"}),
//!     AuthorityMode::Server,
//!     ContextKind::Interactive,
//!     HandoffPhases {
//!         before: Some(server_fn(|_params, _ctx| async move {
//!             Ok(serde_json::json!({"draw": rand_draw()}))
//!         })),
//!         client: Some(client_fn(|_envelope, ctx, _params| async move {
//!             Ok(ctx.wait_for("choice", serde_json::json!({})).await?)
//!         })),
//!         after: after_fn(|envelope, pick, _ctx, _params| async move {
//!             let draw = envelope.unwrap().into_value();
//!             Ok(serde_json::json!({"correct": pick == draw["draw"]}))
//!         }),
//!     },
//! )?)?;
//!
//! let (handle, mut patches) = Session::builder()
//!     .provider(my_provider)
//!     .registry(registry)
//!     .spawn();
//!
//! handle.send("Play a round").await?;
//! while let Some(envelope) = patches.recv().await {
//!     println!("{:?}", envelope.patch);
//! }
//! ```

#![forbid(unsafe_code)]

mod context;
mod definition;
mod engine;
mod error;
pub mod model;
mod patch;
mod session;
mod stores;
mod trail;
mod types;

pub use context::{ClientContext, Delegate, DelegateRequest};
pub use definition::{
    AfterFn, ClientFn, HandoffPhases, PhaseContext, PhaseFuture, ServerFn, SimplePhases,
    ToolDefinition, ToolRegistry, after_fn, client_fn, server_fn,
};
pub use engine::{CallInvocation, HandoffEngine};
pub use error::{CallError, ProtocolError};
pub use patch::{ChatPatch, PatchEnvelope, PatchSender, SequenceCounter};
pub use session::{Session, SessionBuilder, SessionCommand, SessionHandle, TurnState};
pub use stores::{EnvelopeStore, InMemoryStore, TrailStore};
pub use trail::{ResponderRegistry, Step, StepKind, StepStatus, TrailRuntime};
pub use types::{
    AuthorityMode, CallId, CallStatus, ContextKind, Envelope, Handoff, SessionConfig,
};
