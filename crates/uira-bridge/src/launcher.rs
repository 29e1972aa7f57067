//! Agent process invocation.
//!
//! Short prompts travel as a `--prompt` argument. Prompts above
//! `inline_prompt_limit` would risk `E2BIG` on exec, so they are staged in a
//! temp file and streamed into stdin instead. The staged file is owned by the
//! launched process handle and removed when that handle drops, whichever way
//! the request ends.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::BoxFuture;
use futures::FutureExt;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::config::BridgeConfig;
use crate::error::LaunchError;
use crate::prompt::Prompt;

/// Output format requested from the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    /// Newline-delimited JSON events.
    Stream,
    /// One JSON document written at exit.
    SingleDocument,
}

impl OutputShape {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::Stream => "stream-json",
            Self::SingleDocument => "json",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Inline,
    Piped,
}

impl TransferMode {
    pub fn select(prompt: &Prompt, inline_limit: usize) -> Self {
        if prompt.char_len() <= inline_limit {
            Self::Inline
        } else {
            Self::Piped
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Piped => "piped",
        }
    }
}

/// Fully resolved command line for one request.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub env: Vec<(String, OsString)>,
    pub transfer: TransferMode,
}

impl Invocation {
    pub fn build(config: &BridgeConfig, model: &str, shape: OutputShape, prompt: &Prompt) -> Self {
        Self::build_with_env(config, model, shape, prompt, |key| std::env::var_os(key))
    }

    /// Like [`Invocation::build`], reading passthrough variables via `lookup`.
    pub fn build_with_env<F>(
        config: &BridgeConfig,
        model: &str,
        shape: OutputShape,
        prompt: &Prompt,
        lookup: F,
    ) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let transfer = TransferMode::select(prompt, config.inline_prompt_limit);

        let mut args = vec![
            "--model".to_string(),
            model.to_string(),
            "--output-format".to_string(),
            shape.as_arg().to_string(),
        ];
        if !config.approval_mode.is_empty() {
            args.push("--approval-mode".to_string());
            args.push(config.approval_mode.clone());
        }
        args.push("--prompt".to_string());
        match transfer {
            TransferMode::Inline => args.push(prompt.as_str().to_string()),
            TransferMode::Piped => args.push(config.stdin_prompt_sentinel.clone()),
        }
        args.extend(config.extra_args.iter().cloned());

        let mut env: Vec<(String, OsString)> = config
            .env_passthrough
            .iter()
            .filter_map(|key| lookup(key).map(|value| (key.clone(), value)))
            .collect();
        for (key, value) in &config.env {
            env.retain(|(k, _)| k != key);
            env.push((key.clone(), OsString::from(value)));
        }

        Self {
            program: config.gemini_bin.clone(),
            args,
            workdir: config.workdir.clone(),
            env,
            transfer,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.workdir)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_os_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match self.transfer {
            TransferMode::Inline => cmd.stdin(Stdio::null()),
            TransferMode::Piped => cmd.stdin(Stdio::piped()),
        };

        // Own process group so termination also reaches the agent's helpers.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

/// A prompt written to a temp file for stdin transfer. Deleted on drop.
#[derive(Debug)]
pub struct StagedPrompt {
    path: TempPath,
}

impl StagedPrompt {
    pub fn create(dir: &Path, prompt: &Prompt) -> std::io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("uira-bridge-prompt-")
            .suffix(".txt")
            .tempfile_in(dir)?;
        file.write_all(prompt.as_str().as_bytes())?;
        file.flush()?;
        Ok(Self {
            path: file.into_temp_path(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Future copying the staged prompt into the child's stdin, then closing it.
pub type StdinFeed = BoxFuture<'static, std::io::Result<u64>>;

/// A spawned agent process plus the resources scoped to it.
pub struct LaunchedProcess {
    pub child: Child,
    pub pid: Option<u32>,
    pub transfer: TransferMode,
    pub stdin_feed: Option<StdinFeed>,
    pub staged: Option<StagedPrompt>,
}

/// Stage input if needed and spawn the agent.
///
/// On spawn failure the staged prompt is dropped, and thus removed, before
/// the error is returned.
pub fn launch(
    config: &BridgeConfig,
    model: &str,
    shape: OutputShape,
    prompt: &Prompt,
) -> Result<LaunchedProcess, LaunchError> {
    let invocation = Invocation::build(config, model, shape, prompt);
    launch_invocation(&invocation, &config.staging_dir(), prompt)
}

pub fn launch_invocation(
    invocation: &Invocation,
    staging_dir: &Path,
    prompt: &Prompt,
) -> Result<LaunchedProcess, LaunchError> {
    let staged = match invocation.transfer {
        TransferMode::Inline => None,
        TransferMode::Piped => {
            Some(StagedPrompt::create(staging_dir, prompt).map_err(LaunchError::Staging)?)
        }
    };

    let mut child = invocation
        .command()
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            program: invocation.program.display().to_string(),
            source,
        })?;
    let pid = child.id();

    let stdin_feed = match (&staged, child.stdin.take()) {
        (Some(staged), Some(mut stdin)) => {
            let path = staged.path().to_path_buf();
            let feed = async move {
                let mut file = tokio::fs::File::open(&path).await?;
                let written = tokio::io::copy(&mut file, &mut stdin).await?;
                stdin.shutdown().await?;
                Ok(written)
            };
            Some(feed.boxed())
        }
        _ => None,
    };

    tracing::debug!(
        program = %invocation.program.display(),
        pid = ?pid,
        transfer = invocation.transfer.as_str(),
        prompt_chars = prompt.char_len(),
        "spawned agent process"
    );

    Ok(LaunchedProcess {
        child,
        pid,
        transfer: invocation.transfer,
        stdin_feed,
        staged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::build_prompt;
    use crate::types::{ChatMessage, MessageContent, Role};
    use tempfile::TempDir;

    fn prompt_of(text: &str) -> Prompt {
        build_prompt(&[ChatMessage {
            role: Role::User,
            content: Some(MessageContent::Text(text.to_string())),
            tool_call_id: None,
        }])
        .unwrap()
    }

    fn staged_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_transfer_mode_threshold() {
        let prompt = prompt_of("hello");
        let len = prompt.char_len();
        assert_eq!(TransferMode::select(&prompt, len), TransferMode::Inline);
        assert_eq!(TransferMode::select(&prompt, len - 1), TransferMode::Piped);
    }

    #[test]
    fn test_inline_arguments() {
        let config = BridgeConfig {
            extra_args: vec!["--sandbox".to_string()],
            ..BridgeConfig::default()
        };
        let prompt = prompt_of("hello");
        let inv = Invocation::build_with_env(&config, "gemini-2.5-flash", OutputShape::Stream, &prompt, |_| None);

        assert_eq!(inv.transfer, TransferMode::Inline);
        assert_eq!(
            &inv.args[..6],
            &[
                "--model",
                "gemini-2.5-flash",
                "--output-format",
                "stream-json",
                "--approval-mode",
                "yolo",
            ]
        );
        assert_eq!(inv.args[6], "--prompt");
        assert_eq!(inv.args[7], prompt.as_str());
        assert_eq!(inv.args[8], "--sandbox");
        assert_eq!(inv.args.len(), 9);
    }

    #[test]
    fn test_piped_arguments_use_sentinel() {
        let config = BridgeConfig {
            inline_prompt_limit: 4,
            stdin_prompt_sentinel: "-".to_string(),
            ..BridgeConfig::default()
        };
        let prompt = prompt_of("a prompt longer than four chars");
        let inv = Invocation::build_with_env(&config, "m", OutputShape::SingleDocument, &prompt, |_| None);

        assert_eq!(inv.transfer, TransferMode::Piped);
        assert!(inv.args.contains(&"json".to_string()));
        assert_eq!(inv.args.last().map(String::as_str), Some("-"));
        assert!(!inv.args.iter().any(|a| a.contains("longer than four")));
    }

    #[test]
    fn test_environment_is_explicit() {
        let mut config = BridgeConfig {
            env_passthrough: vec!["PATH".to_string(), "GEMINI_API_KEY".to_string(), "MISSING".to_string()],
            ..BridgeConfig::default()
        };
        config.env.insert("GEMINI_API_KEY".to_string(), "override".to_string());
        config.env.insert("NO_COLOR".to_string(), "1".to_string());

        let inv = Invocation::build_with_env(&config, "m", OutputShape::Stream, &prompt_of("x"), |key| {
            match key {
                "PATH" => Some(OsString::from("/usr/bin")),
                "GEMINI_API_KEY" => Some(OsString::from("from-env")),
                _ => None,
            }
        });

        let get = |k: &str| inv.env.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());
        assert_eq!(get("PATH"), Some(OsString::from("/usr/bin")));
        assert_eq!(get("GEMINI_API_KEY"), Some(OsString::from("override")));
        assert_eq!(get("NO_COLOR"), Some(OsString::from("1")));
        assert_eq!(get("MISSING"), None);
        assert_eq!(inv.env.iter().filter(|(k, _)| k == "GEMINI_API_KEY").count(), 1);
    }

    #[test]
    fn test_staged_prompt_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let prompt = prompt_of("staged");
        let staged = StagedPrompt::create(dir.path(), &prompt).unwrap();
        let path = staged.path().to_path_buf();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), prompt.as_str());
        drop(staged);
        assert!(!path.exists());
        assert_eq!(staged_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_removes_staged_prompt() {
        let dir = TempDir::new().unwrap();
        let config = BridgeConfig {
            gemini_bin: PathBuf::from("/nonexistent/uira-bridge-test/gemini"),
            inline_prompt_limit: 0,
            staging_dir: Some(dir.path().to_path_buf()),
            ..BridgeConfig::default()
        };

        let err = launch(&config, "m", OutputShape::Stream, &prompt_of("hello")).err().unwrap();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert_eq!(staged_files(dir.path()), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_piped_prompt_reaches_stdin() {
        use tokio::io::AsyncReadExt;

        let dir = TempDir::new().unwrap();
        let config = BridgeConfig {
            gemini_bin: PathBuf::from("/bin/cat"),
            inline_prompt_limit: 0,
            approval_mode: String::new(),
            staging_dir: Some(dir.path().to_path_buf()),
            workdir: dir.path().to_path_buf(),
            ..BridgeConfig::default()
        };
        // `cat` treats the flags as file names; only stdin matters here.
        let mut inv = Invocation::build(&config, "m", OutputShape::Stream, &prompt_of("through stdin"));
        inv.args = vec!["-".to_string()];

        let prompt = prompt_of("through stdin");
        let mut launched = launch_invocation(&inv, dir.path(), &prompt).unwrap();
        assert_eq!(staged_files(dir.path()), 1);

        let written = launched.stdin_feed.take().unwrap().await.unwrap();
        assert_eq!(written as usize, prompt.as_str().len());

        let mut out = String::new();
        launched
            .child
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, prompt.as_str());
        assert!(launched.child.wait().await.unwrap().success());

        drop(launched);
        assert_eq!(staged_files(dir.path()), 0);
    }
}
