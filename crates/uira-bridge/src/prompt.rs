//! Chat history -> flat prompt translation.
//!
//! The agent CLI takes a single prompt string, so the OpenAI message list is
//! flattened into role-labeled sections:
//!
//! ```text
//! [System Instructions]
//! You are a helpful assistant.
//!
//! [User]
//! What is 2 + 2?
//! ```

use crate::error::BridgeError;
use crate::types::{ChatMessage, Role};

/// Injected when the request carries no `system` message.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful assistant. Answer the \
conversation's final user message directly, using the earlier turns as context.";

const SYSTEM_LABEL: &str = "[System Instructions]";

/// A prompt built from one request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt(String);

impl Prompt {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length in characters, the unit used for transfer-mode selection and
    /// token estimation.
    pub fn char_len(&self) -> usize {
        self.0.chars().count()
    }
}

impl std::fmt::Display for Prompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn section_label(message: &ChatMessage) -> String {
    match message.role {
        Role::System => SYSTEM_LABEL.to_string(),
        Role::User => "[User]".to_string(),
        Role::Assistant => "[Assistant]".to_string(),
        Role::Tool => format!(
            "[Tool Result ({})]",
            message.tool_call_id.as_deref().unwrap_or("unknown")
        ),
    }
}

/// Flatten `messages` into a [`Prompt`].
///
/// Sections keep the original message order and messages whose extracted
/// text is empty contribute nothing.
pub fn build_prompt(messages: &[ChatMessage]) -> Result<Prompt, BridgeError> {
    if messages.is_empty() {
        return Err(BridgeError::InvalidRequest(
            "messages must be a non-empty array".to_string(),
        ));
    }

    let mut sections = Vec::with_capacity(messages.len() + 1);

    if !messages.iter().any(|m| m.role == Role::System) {
        sections.push(format!("{}\n{}", SYSTEM_LABEL, DEFAULT_SYSTEM_INSTRUCTION));
    }

    // The default section alone carries no request content.
    let mut has_content = false;
    for message in messages {
        let text = message
            .content
            .as_ref()
            .map(|c| c.to_plaintext())
            .unwrap_or_default();
        if text.trim().is_empty() {
            continue;
        }
        sections.push(format!("{}\n{}", section_label(message), text));
        has_content = true;
    }

    if !has_content {
        return Err(BridgeError::InvalidRequest(
            "messages contain no text content".to_string(),
        ));
    }

    let prompt = sections.join("\n\n");
    if prompt.trim().is_empty() {
        return Err(BridgeError::InvalidRequest("prompt is empty".to_string()));
    }

    Ok(Prompt(prompt))
}
