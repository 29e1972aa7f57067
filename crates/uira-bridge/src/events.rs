//! Incremental decoding of the agent's `stream-json` output.
//!
//! The agent writes one JSON event per line on stdout, but it also interleaves
//! plain log lines (update notices, credential banners, Node warnings). Lines
//! that do not decode as an event are dropped; they are never an error.

use serde::Deserialize;

use crate::types::Usage;

/// An unterminated line longer than this is discarded instead of buffered.
const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;

/// One decoded `stream-json` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A message delta. The agent echoes the user turn as well, so only
    /// assistant-authored deltas reach the client.
    Message {
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        content: Option<String>,
    },
    /// The agent started a tool call. Tool execution is owned by the agent.
    ToolUse {
        #[serde(default, alias = "name")]
        tool_name: Option<String>,
        #[serde(default, alias = "id")]
        tool_id: Option<String>,
    },
    ToolResult {
        #[serde(default, alias = "id")]
        tool_id: Option<String>,
        #[serde(default)]
        status: Option<String>,
    },
    /// Terminal event with run statistics.
    Result {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        stats: Option<ResultStats>,
    },
    /// Diagnostic from the agent. Process exit, not this event, ends the run.
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        severity: Option<String>,
    },
    /// `init` and any tag this bridge does not know about.
    #[serde(other)]
    Other,
}

impl StreamEvent {
    /// Content that should be forwarded to the client, if any.
    pub fn assistant_delta(&self) -> Option<&str> {
        match self {
            StreamEvent::Message { role, content } => {
                let from_assistant = role.as_deref().map_or(true, |r| r == "assistant");
                content
                    .as_deref()
                    .filter(|c| from_assistant && !c.is_empty())
            }
            _ => None,
        }
    }

    pub fn usage(&self) -> Option<Usage> {
        match self {
            StreamEvent::Result {
                stats: Some(stats), ..
            } => stats.usage(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResultStats {
    #[serde(default, alias = "prompt_tokens")]
    pub input_tokens: u64,
    #[serde(default, alias = "completion_tokens")]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl ResultStats {
    /// `None` when the agent reported no token counters at all.
    pub fn usage(&self) -> Option<Usage> {
        if self.input_tokens == 0 && self.output_tokens == 0 && self.total_tokens == 0 {
            return None;
        }
        let total = if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.input_tokens + self.output_tokens
        };
        Some(Usage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: total,
        })
    }
}

/// Line splitter + decoder over raw stdout bytes.
///
/// Buffers bytes rather than text so a UTF-8 sequence split across two reads
/// decodes correctly once the line is complete.
#[derive(Debug, Default)]
pub struct EventStreamParser {
    pending: Vec<u8>,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning the events of every line it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(event) = decode_line(&line) {
                events.push(event);
            }
        }

        if self.pending.len() > MAX_PENDING_BYTES {
            tracing::warn!(
                bytes = self.pending.len(),
                "discarding oversized unterminated agent output line"
            );
            self.pending.clear();
        }

        events
    }

    /// Decode whatever is left once stdout reached EOF.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let rest = std::mem::take(&mut self.pending);
        decode_line(&rest).into_iter().collect()
    }
}

fn decode_line(line: &[u8]) -> Option<StreamEvent> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    match serde_json::from_str::<StreamEvent>(text) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::trace!(error = %e, line = %text, "skipping non-event agent output");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSCRIPT: &str = concat!(
        "Loaded cached credentials.\n",
        r#"{"type":"init","session_id":"s1","model":"gemini-2.5-pro"}"#,
        "\n",
        r#"{"type":"message","role":"user","content":"hi"}"#,
        "\n",
        r#"{"type":"message","role":"assistant","content":"Héllo","delta":true}"#,
        "\n",
        "[WARN] something noisy {not json\n",
        r#"{"type":"tool_use","tool_name":"read_file","tool_id":"t1","parameters":{}}"#,
        "\n",
        r#"{"type":"tool_result","tool_id":"t1","status":"success"}"#,
        "\n",
        r#"{"type":"error","severity":"warning","message":"retrying"}"#,
        "\r\n",
        r#"{"type":"message","role":"assistant","content":" world","delta":true}"#,
        "\n",
        r#"{"type":"result","status":"success","stats":{"input_tokens":3,"output_tokens":2,"total_tokens":5}}"#,
        "\n",
    );

    fn feed_in_chunks(data: &[u8], size: usize) -> Vec<StreamEvent> {
        let mut parser = EventStreamParser::new();
        let mut events = Vec::new();
        for chunk in data.chunks(size) {
            events.extend(parser.feed(chunk));
        }
        events.extend(parser.finish());
        events
    }

    #[test]
    fn test_decodes_events_and_skips_noise() {
        let events = feed_in_chunks(TRANSCRIPT.as_bytes(), TRANSCRIPT.len());

        assert_eq!(events.len(), 8);
        assert_eq!(events[0], StreamEvent::Other);
        assert_eq!(events[1].assistant_delta(), None);
        assert_eq!(events[2].assistant_delta(), Some("Héllo"));
        assert!(matches!(&events[3], StreamEvent::ToolUse { tool_name: Some(n), .. } if n == "read_file"));
        assert!(matches!(&events[4], StreamEvent::ToolResult { status: Some(s), .. } if s == "success"));
        assert!(matches!(&events[5], StreamEvent::Error { message: Some(m), .. } if m == "retrying"));
        assert_eq!(events[6].assistant_delta(), Some(" world"));
        assert_eq!(events[7].usage(), Some(Usage::new(3, 2)));
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let whole = feed_in_chunks(TRANSCRIPT.as_bytes(), TRANSCRIPT.len());
        for size in [1, 2, 3, 7, 16, 64, 255] {
            assert_eq!(feed_in_chunks(TRANSCRIPT.as_bytes(), size), whole, "chunk size {size}");
        }
    }

    #[test]
    fn test_invalid_line_does_not_stop_parsing() {
        let mut parser = EventStreamParser::new();
        let events = parser.feed(b"{\"type\":\"message\",\"content\":\n{\"type\":\"message\",\"content\":\"ok\"}\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].assistant_delta(), Some("ok"));
    }

    #[test]
    fn test_pending_line_survives_across_chunks() {
        let mut parser = EventStreamParser::new();
        assert!(parser.feed(br#"{"type":"message","#).is_empty());
        assert!(parser.feed(br#""content":"late"}"#).is_empty());
        let events = parser.feed(b"\n");
        assert_eq!(events[0].assistant_delta(), Some("late"));
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut parser = EventStreamParser::new();
        assert!(parser.feed(br#"{"type":"result","stats":{}}"#).is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].usage(), None);
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn test_empty_delta_is_not_forwarded() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"type":"message","role":"assistant","content":""}"#).unwrap();
        assert_eq!(event.assistant_delta(), None);
    }

    #[test]
    fn test_usage_total_falls_back_to_sum() {
        let stats = ResultStats {
            input_tokens: 4,
            output_tokens: 6,
            total_tokens: 0,
        };
        assert_eq!(stats.usage(), Some(Usage::new(4, 6)));
    }
}
