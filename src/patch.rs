//! The session's observable output: an ordered stream of immutable patches.
//!
//! Every state transition a consumer can observe is described by one
//! [`ChatPatch`]. Patches are produced in strict causal order, never mutated
//! after emission, and consumers build their own state by folding the
//! sequence. For a given call the order is always
//! `pending_handoff`, the trail's steps in emission order, then
//! `handoff_complete`.

use crate::trail::Step;
use crate::types::{AuthorityMode, CallId, Envelope};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio::sync::mpsc;

/// One observable change to the conversation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatPatch {
    /// A complete message entered the conversation.
    MessageAdded {
        role: String,
        content: String,
    },

    /// A text delta from the streaming model response.
    StreamingText {
        delta: String,
    },

    /// A thinking delta from the streaming model response.
    StreamingThinking {
        delta: String,
    },

    /// Phase 1 finished and the call is suspended awaiting its client
    /// output. Carries everything the untrusted side is allowed to see.
    PendingHandoff {
        call_id: CallId,
        tool_name: String,
        authority: AuthorityMode,
        envelope: Option<Envelope>,
    },

    /// A trail step was recorded or completed.
    ToolStep {
        call_id: CallId,
        step: Step,
    },

    /// Phase 2 finished and the call produced its final result.
    HandoffComplete {
        call_id: CallId,
        result: serde_json::Value,
    },

    /// One model round-trip finished.
    TurnComplete {
        turn: usize,
    },

    /// An error occurred. `call_id` is set when the error belongs to a
    /// specific tool call.
    Error {
        call_id: Option<CallId>,
        message: String,
    },

    /// The turn was aborted; whatever partial content had accumulated is
    /// attached.
    AbortComplete {
        partial_content: Option<String>,
        partial_html: Option<String>,
    },

    /// All session state was cleared.
    Reset,
}

/// Monotonically increasing per-session counter for patch ordering.
///
/// `Arc`-wrapped so the session task and client-phase tasks can share it.
/// `Ordering::Relaxed` is sufficient because the mpsc channel provides the
/// happens-before ordering between sender and receiver.
#[derive(Clone, Debug)]
pub struct SequenceCounter(Arc<AtomicU64>);

impl SequenceCounter {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(0)))
    }

    /// Get the next sequence number, incrementing the counter.
    #[must_use]
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Envelope wrapping every [`ChatPatch`] with replay metadata.
///
/// Consumers use `sequence` for ordering after persistence, `patch_id` for
/// deduplication on retry, and `timestamp` for display. The `patch` field is
/// flattened so the envelope fields and the patch's `type` discriminant
/// appear at the same JSON level.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatchEnvelope {
    /// Unique identifier (UUID v4) for this emission.
    pub patch_id: uuid::Uuid,
    /// Monotonically increasing sequence number within one session.
    pub sequence: u64,
    /// UTC timestamp of when the patch was emitted.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// The actual patch payload.
    #[serde(flatten)]
    pub patch: ChatPatch,
}

impl PatchEnvelope {
    /// Wrap a patch, assigning it a unique id, the next sequence number,
    /// and the current UTC timestamp.
    #[must_use]
    pub fn wrap(patch: ChatPatch, seq: &SequenceCounter) -> Self {
        Self {
            patch_id: uuid::Uuid::new_v4(),
            sequence: seq.next(),
            timestamp: OffsetDateTime::now_utc(),
            patch,
        }
    }
}

/// Shared handle for emitting sequenced patches.
///
/// Cloned into every task that needs to emit (the session loop, trail
/// runtimes inside client phases). The bounded channel applies backpressure
/// to producers rather than dropping patches.
#[derive(Clone)]
pub struct PatchSender {
    tx: mpsc::Sender<PatchEnvelope>,
    seq: SequenceCounter,
}

impl PatchSender {
    /// Create a sender/receiver pair with the given buffer size.
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<PatchEnvelope>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                tx,
                seq: SequenceCounter::new(),
            },
            rx,
        )
    }

    /// Emit a patch. Returns an error only when the consumer side is gone.
    pub async fn send(&self, patch: ChatPatch) -> anyhow::Result<()> {
        self.tx
            .send(PatchEnvelope::wrap(patch, &self.seq))
            .await
            .map_err(|_| anyhow::anyhow!("patch channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sample_patch() -> ChatPatch {
        ChatPatch::StreamingText {
            delta: "hello".to_string(),
        }
    }

    #[test]
    fn sequence_counter_increments_monotonically() {
        let seq = SequenceCounter::new();
        for expected in 0..100 {
            assert_eq!(seq.next(), expected);
        }
    }

    #[test]
    fn sequence_counter_clones_share_state() {
        let seq = SequenceCounter::new();
        let clone = seq.clone();

        assert_eq!(seq.next(), 0);
        assert_eq!(clone.next(), 1);
        assert_eq!(seq.next(), 2);
    }

    #[test]
    fn wrap_assigns_unique_patch_ids() {
        let seq = SequenceCounter::new();
        let ids: HashSet<uuid::Uuid> = (0..100)
            .map(|_| PatchEnvelope::wrap(sample_patch(), &seq).patch_id)
            .collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn wrap_assigns_incrementing_sequences() {
        let seq = SequenceCounter::new();
        let envelopes: Vec<PatchEnvelope> = (0..10)
            .map(|_| PatchEnvelope::wrap(sample_patch(), &seq))
            .collect();

        for (i, env) in envelopes.iter().enumerate() {
            assert_eq!(env.sequence, i as u64);
        }
    }

    #[test]
    fn envelope_serializes_flat_json() {
        let seq = SequenceCounter::new();
        let envelope = PatchEnvelope::wrap(sample_patch(), &seq);
        let json: serde_json::Value = serde_json::to_value(&envelope).expect("serialize");

        assert!(json.get("patch_id").is_some());
        assert!(json.get("sequence").is_some());
        assert!(json.get("timestamp").is_some());

        // Flattened patch fields at the same level
        assert_eq!(
            json.get("type").and_then(|v| v.as_str()),
            Some("streaming_text")
        );
        assert_eq!(json.get("delta").and_then(|v| v.as_str()), Some("hello"));

        // No nested "patch" key
        assert!(json.get("patch").is_none());
    }

    #[test]
    fn envelope_roundtrip_serde() {
        let seq = SequenceCounter::new();
        let original = PatchEnvelope::wrap(
            ChatPatch::PendingHandoff {
                call_id: CallId::from_string("call_1"),
                tool_name: "guess".to_string(),
                authority: AuthorityMode::Server,
                envelope: Some(Envelope::new(serde_json::json!({"n": 3}))),
            },
            &seq,
        );

        let json = serde_json::to_string(&original).expect("serialize");
        let restored: PatchEnvelope = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(restored.patch_id, original.patch_id);
        assert_eq!(restored.sequence, original.sequence);
        match &restored.patch {
            ChatPatch::PendingHandoff {
                call_id, envelope, ..
            } => {
                assert_eq!(call_id.as_str(), "call_1");
                assert_eq!(
                    envelope.as_ref().map(Envelope::as_value),
                    Some(&serde_json::json!({"n": 3}))
                );
            }
            other => panic!("expected PendingHandoff, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn patch_sender_preserves_emission_order() {
        let (sender, mut rx) = PatchSender::channel(10);

        for i in 0..5 {
            sender
                .send(ChatPatch::StreamingText {
                    delta: format!("chunk {i}"),
                })
                .await
                .expect("send");
        }
        drop(sender);

        let mut sequences = Vec::new();
        while let Some(envelope) = rx.recv().await {
            sequences.push(envelope.sequence);
        }
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    }
}
