//! Uira Bridge - OpenAI-compatible chat completions backed by the Gemini CLI.
//!
//! Every `POST /v1/chat/completions` request spawns one agent process. The
//! chat history is flattened into a single prompt, the agent's stdout is
//! translated back into `chat.completion` documents or SSE chunks, and the
//! process is supervised with an absolute deadline plus an inactivity
//! watchdog.
//!
//! Request flow:
//! - `prompt` flattens messages into one prompt text.
//! - `launcher` builds the command line and spawns the agent.
//! - `events` decodes `stream-json` lines (streaming requests).
//! - `emitter` shapes OpenAI chunks/documents and token usage.
//! - `supervisor` enforces the deadline and idle timeout.
//! - `classify` maps failures onto OpenAI-style error categories.
//! - `session` drives one request from spawn to close.

pub mod classify;
pub mod config;
pub mod emitter;
pub mod error;
pub mod events;
pub mod launcher;
pub mod prompt;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod telemetry;
pub mod types;

pub use classify::{classify_failure, ErrorCategory, ErrorClassification};
pub use config::BridgeConfig;
pub use error::{BridgeError, LaunchError};
pub use server::{serve, BridgeServer};
pub use telemetry::{init_subscriber, TelemetryConfig};
