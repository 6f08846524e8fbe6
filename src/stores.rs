//! Storage traits for the durable mid-call state.
//!
//! The trail and the envelope are the minimum state that must survive a
//! process restart mid-call; everything else is derivable by replaying the
//! patch stream. Two abstractions cover them:
//!
//! - [`TrailStore`] - persists the append-only step trail per call
//! - [`EnvelopeStore`] - persists the cached phase-1 envelope per call
//!
//! # Built-in Implementation
//!
//! [`InMemoryStore`] implements both traits and is suitable for testing
//! and single-process deployments. For durability across restarts,
//! implement custom stores backed by your database.

use crate::trail::Step;
use crate::types::{CallId, Envelope};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// Trait for persisting the step trail of a call.
#[async_trait]
pub trait TrailStore: Send + Sync {
    /// Append a newly recorded step.
    ///
    /// # Errors
    /// Returns an error if the step cannot be stored.
    async fn append_step(&self, call_id: &CallId, step: Step) -> Result<()>;

    /// Update a step after its response arrived.
    ///
    /// # Errors
    /// Returns an error if the step cannot be updated.
    async fn update_step(&self, call_id: &CallId, step: Step) -> Result<()>;

    /// Load the full trail for a call, in emission order.
    ///
    /// # Errors
    /// Returns an error if the trail cannot be retrieved.
    async fn load_trail(&self, call_id: &CallId) -> Result<Vec<Step>>;
}

/// Trait for persisting the cached phase-1 envelope of a call.
#[async_trait]
pub trait EnvelopeStore: Send + Sync {
    /// Store the envelope produced by phase 1.
    ///
    /// # Errors
    /// Returns an error if the envelope cannot be stored.
    async fn put_envelope(&self, call_id: &CallId, envelope: Envelope) -> Result<()>;

    /// Load the envelope for a call.
    ///
    /// # Errors
    /// Returns an error if the envelope cannot be retrieved.
    async fn get_envelope(&self, call_id: &CallId) -> Result<Option<Envelope>>;

    /// Discard the envelope once phase 2 completed.
    ///
    /// # Errors
    /// Returns an error if the envelope cannot be removed.
    async fn remove_envelope(&self, call_id: &CallId) -> Result<()>;
}

/// In-memory implementation of [`TrailStore`] and [`EnvelopeStore`].
/// Useful for testing and simple use cases.
#[derive(Default)]
pub struct InMemoryStore {
    trails: RwLock<HashMap<String, Vec<Step>>>,
    envelopes: RwLock<HashMap<String, Envelope>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrailStore for InMemoryStore {
    async fn append_step(&self, call_id: &CallId, step: Step) -> Result<()> {
        self.trails
            .write()
            .ok()
            .context("lock poisoned")?
            .entry(call_id.0.clone())
            .or_default()
            .push(step);
        Ok(())
    }

    async fn update_step(&self, call_id: &CallId, step: Step) -> Result<()> {
        let mut trails = self.trails.write().ok().context("lock poisoned")?;
        let trail = trails
            .get_mut(&call_id.0)
            .with_context(|| format!("no trail for call {call_id}"))?;
        let existing = trail
            .iter_mut()
            .find(|s| s.id == step.id)
            .with_context(|| format!("no step {} in trail for call {call_id}", step.id))?;
        *existing = step;
        Ok(())
    }

    async fn load_trail(&self, call_id: &CallId) -> Result<Vec<Step>> {
        let trails = self.trails.read().ok().context("lock poisoned")?;
        Ok(trails.get(&call_id.0).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl EnvelopeStore for InMemoryStore {
    async fn put_envelope(&self, call_id: &CallId, envelope: Envelope) -> Result<()> {
        self.envelopes
            .write()
            .ok()
            .context("lock poisoned")?
            .insert(call_id.0.clone(), envelope);
        Ok(())
    }

    async fn get_envelope(&self, call_id: &CallId) -> Result<Option<Envelope>> {
        let envelopes = self.envelopes.read().ok().context("lock poisoned")?;
        Ok(envelopes.get(&call_id.0).cloned())
    }

    async fn remove_envelope(&self, call_id: &CallId) -> Result<()> {
        self.envelopes
            .write()
            .ok()
            .context("lock poisoned")?
            .remove(&call_id.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trail::{StepKind, StepStatus};
    use serde_json::json;
    use time::OffsetDateTime;

    fn step(id: &str) -> Step {
        Step {
            id: id.to_string(),
            kind: StepKind::Prompt,
            request_type: "choice".to_string(),
            payload: json!({}),
            status: StepStatus::Pending,
            response: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn trail_store_appends_and_updates() -> Result<()> {
        let store = InMemoryStore::new();
        let call_id = CallId::from_string("call_1");

        store.append_step(&call_id, step("step_0")).await?;
        store.append_step(&call_id, step("step_1")).await?;

        let mut updated = step("step_0");
        updated.status = StepStatus::Complete;
        updated.response = Some(json!("blue"));
        store.update_step(&call_id, updated).await?;

        let trail = store.load_trail(&call_id).await?;
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].status, StepStatus::Complete);
        assert_eq!(trail[0].response, Some(json!("blue")));
        assert_eq!(trail[1].status, StepStatus::Pending);

        Ok(())
    }

    #[tokio::test]
    async fn update_unknown_step_fails() {
        let store = InMemoryStore::new();
        let call_id = CallId::from_string("call_1");
        assert!(store.update_step(&call_id, step("step_0")).await.is_err());
    }

    #[tokio::test]
    async fn envelope_store_round_trip() -> Result<()> {
        let store = InMemoryStore::new();
        let call_id = CallId::from_string("call_1");

        assert!(store.get_envelope(&call_id).await?.is_none());

        let envelope = Envelope::new(json!({"draw": 4}));
        store.put_envelope(&call_id, envelope.clone()).await?;
        assert_eq!(store.get_envelope(&call_id).await?, Some(envelope));

        store.remove_envelope(&call_id).await?;
        assert!(store.get_envelope(&call_id).await?.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn trails_are_isolated_per_call() -> Result<()> {
        let store = InMemoryStore::new();
        let a = CallId::from_string("call_a");
        let b = CallId::from_string("call_b");

        store.append_step(&a, step("step_0")).await?;

        assert_eq!(store.load_trail(&a).await?.len(), 1);
        assert!(store.load_trail(&b).await?.is_empty());

        Ok(())
    }
}
