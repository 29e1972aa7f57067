//! OpenAI response shaping.
//!
//! Streaming responses are assembled chunk by chunk from agent events:
//!
//! ```text
//! data: {"choices":[{"delta":{"role":"assistant","content":""}, ...}], ...}
//!
//! data: {"choices":[{"delta":{"content":"Hi"}, ...}], ...}
//!
//! data: {"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{...}, ...}
//!
//! data: [DONE]
//! ```
//!
//! Non-streaming responses are built from the single JSON document the agent
//! prints at exit.

use serde::Deserialize;
use serde_json::Value;

use crate::classify::ErrorClassification;
use crate::error::BridgeError;
use crate::events::StreamEvent;
use crate::types::{
    AssistantMessage, ChatCompletion, ChatCompletionChunk, ChunkChoice, CompletionChoice, Delta,
    Usage,
};

pub const SSE_DONE: &str = "data: [DONE]\n\n";

const FINISH_STOP: &str = "stop";

/// `ceil(chars / chars_per_token)`.
pub fn estimate_tokens(text: &str, chars_per_token: f64) -> u64 {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    (chars as f64 / chars_per_token).ceil() as u64
}

pub fn estimate_usage(prompt: &str, completion: &str, chars_per_token: f64) -> Usage {
    Usage::new(
        estimate_tokens(prompt, chars_per_token),
        estimate_tokens(completion, chars_per_token),
    )
}

/// Format one SSE frame.
pub fn sse_frame(chunk: &ChatCompletionChunk) -> String {
    // Serializing plain structs with string keys cannot fail.
    let json = serde_json::to_string(chunk).unwrap_or_default();
    format!("data: {}\n\n", json)
}

/// Identity shared by every chunk/document of one request.
#[derive(Debug, Clone)]
pub struct CompletionIdentity {
    pub id: String,
    pub created: i64,
    pub model: String,
}

impl CompletionIdentity {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
        }
    }

    pub fn chunk(&self, delta: Delta, finish_reason: Option<&str>, usage: Option<Usage>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
            usage,
        }
    }

    pub fn role_chunk(&self) -> ChatCompletionChunk {
        self.chunk(
            Delta {
                role: Some("assistant".to_string()),
                content: Some(String::new()),
            },
            None,
            None,
        )
    }

    pub fn content_chunk(&self, content: &str) -> ChatCompletionChunk {
        self.chunk(
            Delta {
                role: None,
                content: Some(content.to_string()),
            },
            None,
            None,
        )
    }

    pub fn finish_chunk(&self, usage: Usage) -> ChatCompletionChunk {
        self.chunk(Delta::default(), Some(FINISH_STOP), Some(usage))
    }

    pub fn document(&self, content: String, usage: Usage) -> ChatCompletion {
        ChatCompletion {
            id: self.id.clone(),
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: FINISH_STOP.to_string(),
            }],
            usage,
        }
    }
}

/// Turns the agent's event sequence into OpenAI chunks for one request.
#[derive(Debug)]
pub struct StreamAssembler {
    identity: CompletionIdentity,
    prompt: String,
    chars_per_token: f64,
    content: String,
    reported_usage: Option<Usage>,
}

impl StreamAssembler {
    pub fn new(identity: CompletionIdentity, prompt: &str, chars_per_token: f64) -> Self {
        Self {
            identity,
            prompt: prompt.to_string(),
            chars_per_token,
            content: String::new(),
            reported_usage: None,
        }
    }

    pub fn identity(&self) -> &CompletionIdentity {
        &self.identity
    }

    /// Chunk announcing the assistant role, sent before any output exists.
    pub fn start(&self) -> ChatCompletionChunk {
        self.identity.role_chunk()
    }

    /// Apply one event, returning the chunk to forward, if any.
    pub fn on_event(&mut self, event: &StreamEvent) -> Option<ChatCompletionChunk> {
        match event {
            StreamEvent::ToolUse { tool_name, tool_id } => {
                tracing::debug!(
                    request_id = %self.identity.id,
                    tool = tool_name.as_deref().unwrap_or("unknown"),
                    tool_id = tool_id.as_deref().unwrap_or(""),
                    "agent tool call"
                );
            }
            StreamEvent::ToolResult { tool_id, status } => {
                tracing::debug!(
                    request_id = %self.identity.id,
                    tool_id = tool_id.as_deref().unwrap_or(""),
                    status = status.as_deref().unwrap_or("unknown"),
                    "agent tool result"
                );
            }
            StreamEvent::Error { message, severity } => {
                tracing::warn!(
                    request_id = %self.identity.id,
                    severity = severity.as_deref().unwrap_or("error"),
                    message = message.as_deref().unwrap_or(""),
                    "agent reported an error event"
                );
            }
            StreamEvent::Result { .. } => {
                if let Some(usage) = event.usage() {
                    self.reported_usage = Some(usage);
                }
            }
            StreamEvent::Message { .. } => {
                if let Some(delta) = event.assistant_delta() {
                    self.content.push_str(delta);
                    return Some(self.identity.content_chunk(delta));
                }
            }
            StreamEvent::Other => {}
        }
        None
    }

    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn usage(&self) -> Usage {
        self.reported_usage
            .unwrap_or_else(|| estimate_usage(&self.prompt, &self.content, self.chars_per_token))
    }

    /// Final chunks once the process is gone. `failure` is the classified
    /// error when the run did not succeed.
    ///
    /// A failure is only made visible when nothing was streamed yet; partial
    /// content already delivered stands as the answer. Reported usage only
    /// decides the counters of the finish chunk.
    pub fn finish(&mut self, failure: Option<&ErrorClassification>) -> Vec<ChatCompletionChunk> {
        let mut chunks = Vec::with_capacity(2);

        if let Some(failure) = failure.filter(|_| !self.has_content()) {
            let text = format!("Error: {}", failure.message);
            chunks.push(self.identity.content_chunk(&text));
            self.content.push_str(&text);
        }

        chunks.push(self.identity.finish_chunk(self.usage()));
        chunks
    }
}

/// The agent's `--output-format json` document.
#[derive(Debug, Deserialize)]
struct AgentDocument {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    stats: Option<Value>,
}

/// Text and usage extracted from a single-document run.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentOutput {
    pub response: String,
    pub usage: Option<Usage>,
}

/// Decode stdout of a successful single-document run.
///
/// Leading banner text before the first `{` and anything after the first
/// complete JSON value are ignored.
pub fn parse_single_document(stdout: &[u8], model: &str) -> Result<DocumentOutput, BridgeError> {
    let text = String::from_utf8_lossy(stdout);
    let start = text
        .find('{')
        .ok_or_else(|| BridgeError::Parse("no JSON object in agent output".to_string()))?;

    let mut values = serde_json::Deserializer::from_str(&text[start..]).into_iter::<AgentDocument>();
    let doc = match values.next() {
        Some(Ok(doc)) => doc,
        Some(Err(e)) => return Err(BridgeError::Parse(e.to_string())),
        None => return Err(BridgeError::Parse("empty agent output".to_string())),
    };

    let response = doc
        .response
        .ok_or_else(|| BridgeError::Parse("agent output has no `response` field".to_string()))?;
    let usage = doc.stats.as_ref().and_then(|stats| model_usage(stats, model));

    Ok(DocumentOutput { response, usage })
}

/// `stats.models.<model>.tokens.{prompt,candidates,total}`.
fn model_usage(stats: &Value, model: &str) -> Option<Usage> {
    let tokens = stats.get("models")?.get(model)?.get("tokens")?;
    let prompt = tokens.get("prompt").and_then(Value::as_u64)?;
    let completion = tokens
        .get("candidates")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let total = tokens
        .get("total")
        .and_then(Value::as_u64)
        .unwrap_or(prompt + completion);
    Some(Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    })
}

/// Build the `chat.completion` document for a successful single-document run.
pub fn completion_document(
    identity: &CompletionIdentity,
    prompt: &str,
    output: DocumentOutput,
    chars_per_token: f64,
) -> ChatCompletion {
    let usage = output
        .usage
        .unwrap_or_else(|| estimate_usage(prompt, &output.response, chars_per_token));
    identity.document(output.response, usage)
}
