//! CLI configuration file support
//!
//! Loads configuration from ~/.config/agentrelay/config.toml

use std::path::PathBuf;
use std::time::Duration;

use agentrelay_core::heartbeat::{DEFAULT_HEARTBEAT_PROMPT, DEFAULT_IDLE_SENTINEL};
use agentrelay_core::orchestrator::DEFAULT_MODEL;
use agentrelay_core::{BackendConfig, CallbackConfig, HeartbeatConfig, OrchestratorConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

const CLAUDE_BIN_ENV: &str = "AGENTRELAY_CLAUDE_BIN";
const CODEX_BIN_ENV: &str = "AGENTRELAY_CODEX_BIN";

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Model used when neither the request nor the context picks one
    pub default_model: String,
    /// Directory agents run in; defaults to the current directory
    pub working_dir: Option<PathBuf>,
    /// Appended to every agent's system prompt
    pub system_prompt: Option<String>,
    pub claude_binary: String,
    pub codex_binary: String,
    /// Snapshot file; defaults to ~/.agentrelay/state.json
    pub state_path: Option<PathBuf>,
    pub heartbeat: HeartbeatSection,
    pub callbacks: CallbackSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    pub default_interval_minutes: u64,
    pub default_prompt: String,
    pub idle_sentinel: String,
    pub rate_limit_buffer_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackSection {
    /// Unset means callbacks may chain indefinitely
    pub max_chain_depth: Option<u32>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            working_dir: None,
            system_prompt: None,
            claude_binary: "claude".to_string(),
            codex_binary: "codex".to_string(),
            state_path: None,
            heartbeat: HeartbeatSection::default(),
            callbacks: CallbackSection::default(),
        }
    }
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            default_interval_minutes: 30,
            default_prompt: DEFAULT_HEARTBEAT_PROMPT.to_string(),
            idle_sentinel: DEFAULT_IDLE_SENTINEL.to_string(),
            rate_limit_buffer_secs: 120,
        }
    }
}

impl RelayConfig {
    /// Load configuration from default path, then apply env overrides
    pub fn load() -> Self {
        let mut config = Self::load_from_path(Self::default_path());
        config.apply_env();
        config
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Invalid config file, using defaults");
                Self::default()
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read config file, using defaults");
                Self::default()
            }
        }
    }

    /// Get the default configuration file path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("agentrelay").join("config.toml"))
    }

    fn apply_env(&mut self) {
        if let Ok(bin) = std::env::var(CLAUDE_BIN_ENV)
            && !bin.trim().is_empty()
        {
            self.claude_binary = bin;
        }
        if let Ok(bin) = std::env::var(CODEX_BIN_ENV)
            && !bin.trim().is_empty()
        {
            self.codex_binary = bin;
        }
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            claude_binary: self.claude_binary.clone(),
            codex_binary: self.codex_binary.clone(),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            default_model: self.default_model.clone(),
            system_prompt: self.system_prompt.clone(),
        }
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            idle_sentinel: self.heartbeat.idle_sentinel.clone(),
            default_prompt: self.heartbeat.default_prompt.clone(),
            rate_limit_buffer: Duration::from_secs(self.heartbeat.rate_limit_buffer_secs),
        }
    }

    pub fn callback_config(&self) -> CallbackConfig {
        CallbackConfig {
            max_chain_depth: self.callbacks.max_chain_depth,
        }
    }

    pub fn default_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.default_interval_minutes.saturating_mul(60))
    }
}
