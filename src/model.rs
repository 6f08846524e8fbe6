//! Model-facing interface.
//!
//! The session drives a [`ModelProvider`] and observes its output as a
//! stream of [`ModelDelta`] values. Concrete HTTP adapters live outside
//! this crate; the trait plus the message/content types here are the full
//! contract they implement. Tests script providers directly.

use crate::types::SessionConfig;
use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

/// One message in the conversation history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
}

impl Message {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::Text(text.into()),
        }
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Text(text.into()),
        }
    }

    /// Assistant message carrying the tool requests of a turn, as stored
    /// back into history before the tool results.
    #[must_use]
    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Blocks(blocks),
        }
    }

    /// Tool result fed back to the model after a call completes.
    #[must_use]
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::User,
            content: Content::Blocks(vec![ContentBlock::ToolResult {
                call_id: call_id.into(),
                content: content.into(),
                is_error,
            }]),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        call_id: String,
        content: String,
        is_error: bool,
    },
}

/// A registered tool as advertised to the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One request to the model.
#[derive(Clone, Debug)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
    pub max_tokens: u32,
}

impl ModelRequest {
    /// Assemble a request from session config, history, and tool
    /// descriptors.
    #[must_use]
    pub fn new(config: &SessionConfig, messages: Vec<Message>, tools: Vec<ToolDescriptor>) -> Self {
        Self {
            system: config.system_prompt.clone(),
            messages,
            tools,
            max_tokens: config.max_tokens,
        }
    }
}

/// Why the model stopped producing output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of the assistant turn.
    EndTurn,
    /// The model requested one or more tool invocations.
    ToolUse,
    /// The response hit the token limit.
    MaxTokens,
}

/// Events yielded while streaming one model response.
#[derive(Clone, Debug)]
pub enum ModelDelta {
    /// A text fragment.
    TextDelta { delta: String },
    /// A thinking fragment.
    ThinkingDelta { delta: String },
    /// A complete tool invocation request.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// The response finished.
    Done { stop_reason: StopReason },
    /// The stream failed.
    Error { message: String },
}

/// Boxed stream of model deltas.
pub type ModelStream = Pin<Box<dyn Stream<Item = ModelDelta> + Send>>;

/// Provider of streaming model interactions.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Start one streaming response.
    ///
    /// # Errors
    /// Returns an error when the stream cannot be started at all;
    /// mid-stream failures surface as [`ModelDelta::Error`].
    async fn stream(&self, request: ModelRequest) -> Result<ModelStream>;

    /// Model identifier, for logging.
    fn model(&self) -> &str;
}
