//! Bridge configuration.
//!
//! Built once at startup and shared read-only (`Arc<BridgeConfig>`) by every
//! request. Layers, later wins:
//!
//! 1. compiled defaults
//! 2. a YAML file (`--config`, `./uira-bridge.yml`, `~/.config/uira-bridge/config.yml`)
//! 3. environment variables
//! 4. CLI flags (applied by the binary)
//!
//! ```yaml
//! gemini_bin: /usr/local/bin/gemini
//! workdir: /srv/agent-workspace
//! default_model: gemini-2.5-pro
//! approval_mode: yolo
//! timeout_ms: 300000
//! inactivity_timeout_ms: 120000
//! ```
//!
//! **Environment variables:**
//! - `HOST`, `PORT`: listen address (default: 127.0.0.1:8787)
//! - `GEMINI_BIN`: agent binary (default: `gemini` on `PATH`)
//! - `GEMINI_WORKDIR`: working directory for the agent
//! - `GEMINI_MODEL`: default model when a request omits `model`
//! - `GEMINI_APPROVAL_MODE`: value passed to `--approval-mode`
//! - `BRIDGE_TIMEOUT_MS`, `BRIDGE_INACTIVITY_TIMEOUT_MS`, `BRIDGE_KILL_GRACE_MS`
//! - `BRIDGE_INLINE_PROMPT_LIMIT`: max prompt chars passed as an argument
//! - `BRIDGE_CHARS_PER_TOKEN`: usage estimation ratio

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const CONFIG_CANDIDATES: &[&str] = &["uira-bridge.yml", "uira-bridge.yaml"];

/// Variables forwarded from the bridge's own environment to the agent.
/// Everything else is cleared before spawning.
pub const DEFAULT_ENV_PASSTHROUGH: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "TERM",
    "TMPDIR",
    "XDG_CONFIG_HOME",
    "NODE_OPTIONS",
    "HTTPS_PROXY",
    "HTTP_PROXY",
    "NO_PROXY",
    "GEMINI_API_KEY",
    "GOOGLE_API_KEY",
    "GOOGLE_CLOUD_PROJECT",
    "GOOGLE_CLOUD_LOCATION",
    "GOOGLE_GENAI_USE_VERTEXAI",
    "GOOGLE_APPLICATION_CREDENTIALS",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub gemini_bin: PathBuf,
    pub workdir: PathBuf,
    pub default_model: String,
    pub models: Vec<String>,
    pub approval_mode: String,
    pub timeout_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub kill_grace_ms: u64,
    pub watchdog_interval_ms: u64,
    /// Prompts longer than this (in chars) are piped through stdin.
    pub inline_prompt_limit: usize,
    pub chars_per_token: f64,
    /// Where piped prompts are staged; the system temp dir when unset.
    pub staging_dir: Option<PathBuf>,
    /// `--prompt` value used when the prompt arrives on stdin.
    pub stdin_prompt_sentinel: String,
    pub env_passthrough: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub extra_args: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            gemini_bin: PathBuf::from("gemini"),
            workdir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            default_model: "gemini-2.5-pro".to_string(),
            models: vec![
                "gemini-2.5-pro".to_string(),
                "gemini-2.5-flash".to_string(),
                "gemini-2.5-flash-lite".to_string(),
            ],
            approval_mode: "yolo".to_string(),
            timeout_ms: 300_000,
            inactivity_timeout_ms: 120_000,
            kill_grace_ms: 5_000,
            watchdog_interval_ms: 1_000,
            inline_prompt_limit: 32_768,
            chars_per_token: 4.0,
            staging_dir: None,
            stdin_prompt_sentinel: String::new(),
            env_passthrough: DEFAULT_ENV_PASSTHROUGH
                .iter()
                .map(|s| s.to_string())
                .collect(),
            env: BTreeMap::new(),
            extra_args: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Defaults, then the first config file found (or `path`), then the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path.map(Path::to_path_buf).or_else(find_config_file) {
            Some(path) => Self::from_yaml_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml_ng::from_str(content).context("Failed to parse YAML")
    }

    /// Overlay environment variables, reading them through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HOST") {
            self.host = v;
        }
        if let Some(v) = lookup("PORT") {
            self.port = parse_var("PORT", &v)?;
        }
        if let Some(v) = lookup("GEMINI_BIN") {
            self.gemini_bin = PathBuf::from(v);
        }
        if let Some(v) = lookup("GEMINI_WORKDIR") {
            self.workdir = PathBuf::from(v);
        }
        if let Some(v) = lookup("GEMINI_MODEL") {
            self.default_model = v;
        }
        if let Some(v) = lookup("GEMINI_APPROVAL_MODE") {
            self.approval_mode = v;
        }
        if let Some(v) = lookup("BRIDGE_TIMEOUT_MS") {
            self.timeout_ms = parse_var("BRIDGE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("BRIDGE_INACTIVITY_TIMEOUT_MS") {
            self.inactivity_timeout_ms = parse_var("BRIDGE_INACTIVITY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("BRIDGE_KILL_GRACE_MS") {
            self.kill_grace_ms = parse_var("BRIDGE_KILL_GRACE_MS", &v)?;
        }
        if let Some(v) = lookup("BRIDGE_INLINE_PROMPT_LIMIT") {
            self.inline_prompt_limit = parse_var("BRIDGE_INLINE_PROMPT_LIMIT", &v)?;
        }
        if let Some(v) = lookup("BRIDGE_CHARS_PER_TOKEN") {
            self.chars_per_token = parse_var("BRIDGE_CHARS_PER_TOKEN", &v)?;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.timeout_ms == 0 {
            bail!("timeout_ms must be greater than zero");
        }
        if self.inactivity_timeout_ms == 0 {
            bail!("inactivity_timeout_ms must be greater than zero");
        }
        if self.watchdog_interval_ms == 0 {
            bail!("watchdog_interval_ms must be greater than zero");
        }
        if !(self.chars_per_token.is_finite() && self.chars_per_token > 0.0) {
            bail!(
                "chars_per_token must be a positive number, got {}",
                self.chars_per_token
            );
        }
        if self.default_model.trim().is_empty() {
            bail!("default_model must not be empty");
        }
        if !self.models.iter().any(|m| m == &self.default_model) {
            self.models.insert(0, self.default_model.clone());
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Model requested by the client, or the configured default.
    pub fn resolve_model(&self, requested: Option<&str>) -> String {
        requested
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.default_model)
            .to_string()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(env::temp_dir)
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", name, value))
}

fn find_config_file() -> Option<PathBuf> {
    for candidate in CONFIG_CANDIDATES {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Some(path);
        }
    }

    let path = dirs::config_dir()?.join("uira-bridge").join("config.yml");
    path.exists().then_some(path)
}
