//! `~/.forgeline/config.toml` plus environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ai::AiClientConfig;
use crate::constants;
use crate::pipeline::PipelineSettings;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgelineConfig {
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
    pub build: BuildConfig,
    pub ai: AiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: constants::server::DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_retries: u32,
    pub checkpoint_timeout_secs: u64,
    /// Grace window after a session reaches a terminal status.
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Defaults to `~/.forgeline/workspaces`.
    pub workspace_root: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: constants::pipeline::DEFAULT_MAX_RETRIES,
            checkpoint_timeout_secs: constants::pipeline::DEFAULT_CHECKPOINT_TIMEOUT_SECS,
            session_ttl_secs: constants::pipeline::DEFAULT_SESSION_TTL_SECS,
            sweep_interval_secs: constants::pipeline::DEFAULT_SWEEP_INTERVAL_SECS,
            workspace_root: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub timeout_secs: u64,
    /// Replaces build-system detection when set.
    pub command: Option<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            timeout_secs: constants::build::DEFAULT_TIMEOUT_SECS,
            command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub base_url: String,
    pub model: String,
    pub max_tokens: usize,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            base_url: constants::ai::DEFAULT_BASE_URL.to_string(),
            model: constants::ai::DEFAULT_MODEL.to_string(),
            max_tokens: constants::ai::MAX_OUTPUT_TOKENS,
            request_timeout_secs: constants::ai::REQUEST_TIMEOUT_SECS,
            max_attempts: constants::ai::MAX_ATTEMPTS,
            api_key: None,
        }
    }
}

impl ForgelineConfig {
    /// Load from `path` (or the default location), then apply environment
    /// overrides. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(crate::paths::config_file);
        let mut config = Self::from_file(&path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Apply `FORGELINE_*` overrides read through `lookup`. Unparseable
    /// numbers are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(port) = var("FORGELINE_PORT") {
            parse_into(&mut self.server.port, "FORGELINE_PORT", &port);
        }
        if let Some(retries) = var("FORGELINE_MAX_RETRIES") {
            parse_into(&mut self.pipeline.max_retries, "FORGELINE_MAX_RETRIES", &retries);
        }
        if let Some(root) = var("FORGELINE_WORKSPACE_ROOT") {
            self.pipeline.workspace_root = Some(PathBuf::from(root));
        }
        if let Some(url) = var("FORGELINE_AI_BASE_URL") {
            self.ai.base_url = url;
        }
        if let Some(model) = var("FORGELINE_AI_MODEL") {
            self.ai.model = model;
        }
        if let Some(key) = var("FORGELINE_API_KEY").or_else(|| var("ANTHROPIC_API_KEY")) {
            self.ai.api_key = Some(key);
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            max_retries: self.pipeline.max_retries,
            checkpoint_timeout: Duration::from_secs(self.pipeline.checkpoint_timeout_secs),
            session_ttl: Duration::from_secs(self.pipeline.session_ttl_secs),
            workspace_root: self
                .pipeline
                .workspace_root
                .clone()
                .unwrap_or_else(crate::paths::workspaces_dir),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.pipeline.sweep_interval_secs.max(1))
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build.timeout_secs)
    }

    pub fn ai_client_config(&self) -> AiClientConfig {
        AiClientConfig {
            base_url: self.ai.base_url.clone(),
            model: self.ai.model.clone(),
            max_tokens: self.ai.max_tokens,
            api_key: self.ai.api_key.clone(),
            request_timeout: Duration::from_secs(self.ai.request_timeout_secs),
            max_attempts: self.ai.max_attempts,
        }
    }
}

fn parse_into<T: std::str::FromStr>(slot: &mut T, key: &str, raw: &str) {
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = raw, "Ignoring unparseable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ForgelineConfig::from_file(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, ForgelineConfig::default());
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.pipeline.max_retries, 3);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[pipeline]\nmax_retries = 5\nworkspace_root = \"/srv/ws\"\n\n[build]\ncommand = \"make check\"\n",
        )
        .unwrap();

        let config = ForgelineConfig::from_file(&path).unwrap();
        assert_eq!(config.pipeline.max_retries, 5);
        assert_eq!(config.pipeline.checkpoint_timeout_secs, 1800);
        assert_eq!(config.build.command.as_deref(), Some("make check"));

        let settings = config.pipeline_settings();
        assert_eq!(settings.workspace_root, PathBuf::from("/srv/ws"));
        assert_eq!(settings.session_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = \"eighty\"").unwrap();
        assert!(ForgelineConfig::from_file(&path).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("FORGELINE_PORT", "8088"),
            ("FORGELINE_MAX_RETRIES", "not-a-number"),
            ("FORGELINE_AI_MODEL", "claude-opus-4-1"),
            ("FORGELINE_API_KEY", " sk-test "),
        ]
        .into_iter()
        .collect();

        let mut config = ForgelineConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.server.port, 8088);
        assert_eq!(config.pipeline.max_retries, 3);
        assert_eq!(config.ai.model, "claude-opus-4-1");
        assert_eq!(config.ai_client_config().api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn api_key_is_never_serialized() {
        let mut config = ForgelineConfig::default();
        config.ai.api_key = Some("sk-secret".into());
        let text = toml::to_string(&config).unwrap();
        assert!(!text.contains("sk-secret"));
    }
}
