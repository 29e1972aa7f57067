//! Per-request lifecycle.
//!
//! Each request owns exactly one agent process. A single task drives it: a
//! `select!` over stdout, stderr, the stdin feed, process exit and the
//! supervisor timers. Dropping the context at any point (client disconnect,
//! handler error) kills the process group and removes the staged prompt.
//!
//! ```text
//! Spawned ──stdout──▶ Streaming ──exit──▶ Draining ──EOF/grace──▶ Closed
//!    └───────────────────exit──────────────────┘
//! ```

use std::convert::Infallible;
use std::process::ExitStatus;

use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::time::{sleep_until, Instant};

use crate::classify::{match_category, ErrorCategory, ErrorClassification};
use crate::config::BridgeConfig;
use crate::emitter::{
    completion_document, parse_single_document, sse_frame, CompletionIdentity, StreamAssembler,
    SSE_DONE,
};
use crate::error::BridgeError;
use crate::events::EventStreamParser;
use crate::launcher::{launch, OutputShape, StagedPrompt, StdinFeed, TransferMode};
use crate::prompt::Prompt;
use crate::supervisor::{
    force_kill, terminate_gracefully, Supervisor, SupervisorAction, SupervisorSettings,
    TerminationReason,
};
use crate::types::ChatCompletion;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Stderr beyond this is dropped; the head carries the diagnostics.
const MAX_STDERR_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Process started, no output yet.
    Spawned,
    /// Stdout is flowing.
    Streaming,
    /// Process exited; remaining pipe output is being collected.
    Draining,
    /// Outcome delivered.
    Closed,
}

/// How the agent process ended.
#[derive(Debug, Clone)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub termination: Option<TerminationReason>,
    pub stderr: String,
}

impl ExitOutcome {
    fn from_status(
        status: ExitStatus,
        termination: Option<TerminationReason>,
        stderr: &[u8],
    ) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            termination,
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
    }

    /// Exit code zero and never terminated by the supervisor.
    pub fn success(&self) -> bool {
        self.termination.is_none() && self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("agent process exited with code {}", code),
            (None, Some(signal)) => format!("agent process terminated by signal {}", signal),
            (None, None) => "agent process exited abnormally".to_string(),
        }
    }

    /// Classify a failed run from stderr, falling back to the exit status.
    ///
    /// A supervisor termination yields `timeout` unless stderr names a more
    /// specific backend cause. Auth and missing-binary matches are not
    /// trusted there: a process that ran until it was killed was neither.
    pub fn classify(&self) -> ErrorClassification {
        let raw = if self.stderr.trim().is_empty() {
            self.describe()
        } else {
            self.stderr.clone()
        };
        let matched = match_category(&raw);

        if let Some(reason) = self.termination {
            return match matched {
                Some(category)
                    if !matches!(
                        category,
                        ErrorCategory::AuthError | ErrorCategory::BinaryNotFound
                    ) =>
                {
                    ErrorClassification::with_detail(category, &raw)
                }
                _ => ErrorClassification::with_detail(ErrorCategory::Timeout, &reason.describe()),
            };
        }
        match matched {
            Some(category) => ErrorClassification::with_detail(category, &raw),
            None => crate::classify::classify_failure(&raw),
        }
    }
}

/// Output of the agent process, in arrival order.
#[derive(Debug)]
pub enum ProcessEvent {
    Stdout(Bytes),
    /// Always the last event.
    Exited(ExitOutcome),
}

/// A running agent process and its supervision state.
pub struct AgentProcess {
    child: Child,
    pid: Option<u32>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    stdin_feed: Option<StdinFeed>,
    _staged: Option<StagedPrompt>,
    supervisor: Supervisor,
    state: ContextState,
    status: Option<ExitStatus>,
    drain_deadline: Option<Instant>,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    stderr_acc: Vec<u8>,
    request_id: String,
}

impl AgentProcess {
    fn new(
        mut child: Child,
        pid: Option<u32>,
        stdin_feed: Option<StdinFeed>,
        staged: Option<StagedPrompt>,
        settings: SupervisorSettings,
        request_id: String,
    ) -> Self {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        Self {
            child,
            pid,
            stdout,
            stderr,
            stdin_feed,
            _staged: staged,
            supervisor: Supervisor::start(settings),
            state: ContextState::Spawned,
            status: None,
            drain_deadline: None,
            stdout_buf: vec![0; READ_BUFFER_SIZE],
            stderr_buf: vec![0; READ_BUFFER_SIZE],
            stderr_acc: Vec::new(),
            request_id,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Next stdout chunk or the exit outcome; `None` once closed.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        loop {
            if self.state == ContextState::Closed {
                return None;
            }
            if let Some(status) = self.status {
                if self.stdout.is_none() && self.stderr.is_none() {
                    return Some(ProcessEvent::Exited(self.close(status)));
                }
            }

            tokio::select! {
                read = read_pipe(&mut self.stdout, &mut self.stdout_buf) => match read {
                    Ok(0) => self.stdout = None,
                    Ok(n) => {
                        self.supervisor.record_activity();
                        if self.state == ContextState::Spawned {
                            self.state = ContextState::Streaming;
                        }
                        return Some(ProcessEvent::Stdout(Bytes::copy_from_slice(&self.stdout_buf[..n])));
                    }
                    Err(e) => {
                        tracing::debug!(request_id = %self.request_id, error = %e, "agent stdout read failed");
                        self.stdout = None;
                    }
                },
                read = read_pipe(&mut self.stderr, &mut self.stderr_buf) => match read {
                    Ok(0) => self.stderr = None,
                    Ok(n) => {
                        self.supervisor.record_activity();
                        let room = MAX_STDERR_BYTES.saturating_sub(self.stderr_acc.len());
                        self.stderr_acc.extend_from_slice(&self.stderr_buf[..n.min(room)]);
                    }
                    Err(e) => {
                        tracing::debug!(request_id = %self.request_id, error = %e, "agent stderr read failed");
                        self.stderr = None;
                    }
                },
                fed = drive_feed(&mut self.stdin_feed) => {
                    self.stdin_feed = None;
                    match fed {
                        Ok(bytes) => tracing::debug!(request_id = %self.request_id, bytes, "prompt written to agent stdin"),
                        // The agent may exit without reading its input.
                        Err(e) => tracing::debug!(request_id = %self.request_id, error = %e, "stdin feed ended early"),
                    }
                },
                status = self.child.wait(), if self.status.is_none() => {
                    match status {
                        Ok(status) => self.on_exit(status),
                        Err(e) => {
                            tracing::warn!(request_id = %self.request_id, error = %e, "failed to wait for agent process");
                            force_kill(&mut self.child, self.pid);
                            self.stdout = None;
                            self.stderr = None;
                            self.on_exit(failed_wait_status());
                        }
                    }
                },
                action = self.supervisor.next_action(), if self.status.is_none() => {
                    self.apply(action);
                },
                _ = sleep_until_opt(self.drain_deadline) => {
                    tracing::debug!(request_id = %self.request_id, "pipes still open after exit, closing");
                    self.stdout = None;
                    self.stderr = None;
                },
            }
        }
    }

    fn on_exit(&mut self, status: ExitStatus) {
        self.status = Some(status);
        self.state = ContextState::Draining;
        self.stdin_feed = None;
        self.drain_deadline = Some(Instant::now() + self.supervisor.grace());
    }

    fn apply(&mut self, action: SupervisorAction) {
        match action {
            SupervisorAction::Terminate(reason) => {
                tracing::warn!(
                    request_id = %self.request_id,
                    pid = ?self.pid,
                    reason = %reason.describe(),
                    "terminating agent process"
                );
                terminate_gracefully(&mut self.child, self.pid);
            }
            SupervisorAction::Kill => {
                tracing::warn!(
                    request_id = %self.request_id,
                    pid = ?self.pid,
                    grace_ms = self.supervisor.grace().as_millis() as u64,
                    "agent ignored termination, killing"
                );
                force_kill(&mut self.child, self.pid);
            }
        }
    }

    fn close(&mut self, status: ExitStatus) -> ExitOutcome {
        self.state = ContextState::Closed;
        self.drain_deadline = None;
        ExitOutcome::from_status(status, self.supervisor.termination(), &self.stderr_acc)
    }
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        if self.status.is_none() {
            tracing::debug!(request_id = %self.request_id, pid = ?self.pid, "killing abandoned agent process");
            force_kill(&mut self.child, self.pid);
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize> {
    match pipe {
        Some(pipe) => pipe.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn drive_feed(feed: &mut Option<StdinFeed>) -> std::io::Result<u64> {
    match feed {
        Some(feed) => feed.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Stand-in status when `wait` itself failed; reported as a failure.
fn failed_wait_status() -> ExitStatus {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(1 << 8)
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::ExitStatusExt;
        ExitStatus::from_raw(1)
    }
}

/// Everything one chat completion request owns.
pub struct RequestContext {
    identity: CompletionIdentity,
    prompt: Prompt,
    chars_per_token: f64,
    transfer: TransferMode,
    started_at: Instant,
    process: AgentProcess,
}

impl RequestContext {
    /// Launch the agent for `prompt`. Nothing is left behind on failure.
    pub fn spawn(
        config: &BridgeConfig,
        model: String,
        prompt: Prompt,
        shape: OutputShape,
    ) -> Result<Self, BridgeError> {
        let identity = CompletionIdentity::new(model);
        let launched = launch(config, &identity.model, shape, &prompt).map_err(|e| {
            tracing::error!(request_id = %identity.id, model = %identity.model, error = %e, "failed to launch agent");
            BridgeError::from(e)
        })?;

        tracing::info!(
            request_id = %identity.id,
            model = %identity.model,
            pid = ?launched.pid,
            transfer = launched.transfer.as_str(),
            stream = shape == OutputShape::Stream,
            "agent process started"
        );

        let process = AgentProcess::new(
            launched.child,
            launched.pid,
            launched.stdin_feed,
            launched.staged,
            SupervisorSettings::from_config(config),
            identity.id.clone(),
        );

        Ok(Self {
            identity,
            prompt,
            chars_per_token: config.chars_per_token,
            transfer: launched.transfer,
            started_at: Instant::now(),
            process,
        })
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn transfer(&self) -> TransferMode {
        self.transfer
    }

    pub fn state(&self) -> ContextState {
        self.process.state()
    }

    fn log_outcome(&self, outcome: &ExitOutcome, failure: Option<&ErrorClassification>) {
        let elapsed_ms = self.started_at.elapsed().as_millis() as u64;
        match failure {
            None => tracing::info!(
                request_id = %self.identity.id,
                model = %self.identity.model,
                exit_code = ?outcome.code,
                elapsed_ms,
                "agent process finished"
            ),
            Some(failure) => tracing::warn!(
                request_id = %self.identity.id,
                model = %self.identity.model,
                exit_code = ?outcome.code,
                signal = ?outcome.signal,
                category = %failure.category,
                elapsed_ms,
                "agent process failed"
            ),
        }
    }

    /// SSE body: role chunk, content chunks in stdout order, finish chunk,
    /// `[DONE]`.
    pub fn into_sse_stream(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
        let mut ctx = self;
        async_stream::stream! {
            let mut assembler = StreamAssembler::new(
                ctx.identity.clone(),
                ctx.prompt.as_str(),
                ctx.chars_per_token,
            );
            let mut parser = EventStreamParser::new();
            let mut outcome = None;

            yield Ok::<Bytes, Infallible>(Bytes::from(sse_frame(&assembler.start())));

            while let Some(event) = ctx.process.next_event().await {
                match event {
                    ProcessEvent::Stdout(bytes) => {
                        for event in parser.feed(&bytes) {
                            if let Some(chunk) = assembler.on_event(&event) {
                                yield Ok(Bytes::from(sse_frame(&chunk)));
                            }
                        }
                    }
                    ProcessEvent::Exited(exit) => outcome = Some(exit),
                }
            }
            for event in parser.finish() {
                if let Some(chunk) = assembler.on_event(&event) {
                    yield Ok(Bytes::from(sse_frame(&chunk)));
                }
            }

            let failure = match &outcome {
                Some(exit) if !exit.success() => Some(exit.classify()),
                Some(_) => None,
                None => Some(ErrorClassification::new(
                    ErrorCategory::ServerError,
                    "agent process ended without an exit status",
                )),
            };
            if let Some(exit) = &outcome {
                ctx.log_outcome(exit, failure.as_ref());
            }

            for chunk in assembler.finish(failure.as_ref()) {
                yield Ok(Bytes::from(sse_frame(&chunk)));
            }
            yield Ok(Bytes::from_static(SSE_DONE.as_bytes()));
        }
    }

    /// Buffer the whole run and build one `chat.completion` document.
    pub async fn complete(mut self) -> Result<ChatCompletion, BridgeError> {
        let mut stdout = Vec::new();
        let mut outcome = None;
        while let Some(event) = self.process.next_event().await {
            match event {
                ProcessEvent::Stdout(bytes) => stdout.extend_from_slice(&bytes),
                ProcessEvent::Exited(exit) => outcome = Some(exit),
            }
        }

        let outcome = outcome.ok_or_else(|| {
            BridgeError::Agent(ErrorClassification::new(
                ErrorCategory::ServerError,
                "agent process ended without an exit status",
            ))
        })?;

        if !outcome.success() {
            let failure = outcome.classify();
            self.log_outcome(&outcome, Some(&failure));
            return Err(BridgeError::Agent(failure));
        }
        self.log_outcome(&outcome, None);

        let output = parse_single_document(&stdout, &self.identity.model).map_err(|e| {
            tracing::warn!(request_id = %self.identity.id, error = %e, "undecodable agent output");
            e
        })?;
        Ok(completion_document(
            &self.identity,
            self.prompt.as_str(),
            output,
            self.chars_per_token,
        ))
    }
}
