use crate::model::{ModelDelta, ModelProvider, ModelRequest, ModelStream, StopReason};
use crate::patch::{ChatPatch, PatchEnvelope};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ===================
// Scripted model provider
// ===================

/// Provider that replays one scripted delta sequence per round and records
/// every request it receives.
pub struct ScriptedProvider {
    rounds: Mutex<Vec<Vec<ModelDelta>>>,
    requests: Arc<Mutex<Vec<ModelRequest>>>,
    call_count: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(rounds: Vec<Vec<ModelDelta>>) -> Self {
        Self {
            rounds: Mutex::new(rounds),
            requests: Arc::new(Mutex::new(Vec::new())),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Handle for asserting on the requests the session built.
    pub fn requests(&self) -> Arc<Mutex<Vec<ModelRequest>>> {
        Arc::clone(&self.requests)
    }

    /// A round that streams text in two chunks and ends the turn.
    pub fn text_round(text: &str) -> Vec<ModelDelta> {
        let mid = text.len() / 2;
        vec![
            ModelDelta::TextDelta {
                delta: text[..mid].to_string(),
            },
            ModelDelta::TextDelta {
                delta: text[mid..].to_string(),
            },
            ModelDelta::Done {
                stop_reason: StopReason::EndTurn,
            },
        ]
    }

    /// A round that requests tool invocations.
    pub fn tool_round(text: Option<&str>, uses: Vec<(&str, &str, Value)>) -> Vec<ModelDelta> {
        let mut deltas = Vec::new();
        if let Some(text) = text {
            deltas.push(ModelDelta::TextDelta {
                delta: text.to_string(),
            });
        }
        for (id, name, input) in uses {
            deltas.push(ModelDelta::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            });
        }
        deltas.push(ModelDelta::Done {
            stop_reason: StopReason::ToolUse,
        });
        deltas
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn stream(&self, request: ModelRequest) -> Result<ModelStream> {
        self.requests.lock().expect("lock poisoned").push(request);
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        let deltas = {
            let rounds = self.rounds.lock().expect("lock poisoned");
            if idx < rounds.len() {
                rounds[idx].clone()
            } else {
                Self::text_round("Done")
            }
        };
        Ok(Box::pin(futures::stream::iter(deltas)))
    }

    fn model(&self) -> &'static str {
        "scripted-model"
    }
}

// ===================
// Patch stream helpers
// ===================

/// Receive patches until one matches, returning everything received up to
/// and including it. Panics after five seconds.
pub async fn collect_until<F>(
    rx: &mut mpsc::Receiver<PatchEnvelope>,
    mut matches: F,
) -> Vec<PatchEnvelope>
where
    F: FnMut(&ChatPatch) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for patch")
            .expect("patch channel closed");
        let done = matches(&envelope.patch);
        seen.push(envelope);
        if done {
            return seen;
        }
    }
}

/// Receive patches until one matches, returning only the matching one.
pub async fn next_matching<F>(rx: &mut mpsc::Receiver<PatchEnvelope>, matches: F) -> PatchEnvelope
where
    F: FnMut(&ChatPatch) -> bool,
{
    collect_until(rx, matches)
        .await
        .pop()
        .expect("collect_until returns at least one patch")
}
