//! ACC configuration, grounded on `config/mod.rs`'s per-subsystem
//! nested-struct pattern with `#[serde(default = "fn")]` value functions,
//! trimmed of `ServerConfig`/`CronJob`/`HooksConfig`/tailscale fields (those
//! backed non-goal features, see `DESIGN.md`).
//!
//! Config is optional: `AccConfig::default()` plus `AGENT_*` environment
//! overrides are sufficient to start a run with no file on disk.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fallback inter-step pause used wherever a caller needs a duration and
/// not a full `AccConfig` (e.g. `ActionSink::execute(Wait)`).
pub const STEP_DELAY_MS: u64 = 1500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub decider: DeciderConfig,
    #[serde(default)]
    pub screen: ScreenConfig,
}

impl Default for AccConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            decider: DeciderConfig::default(),
            screen: ScreenConfig::default(),
        }
    }
}

impl AccConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
        let mut config: Self = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn default_with_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Config-struct-first, override-after: same convention `main.rs`
    /// uses for its Tailscale env overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("AGENT_REMOTE_ENDPOINT") {
            self.decider.remote.get_or_insert_with(RemoteDeciderConfig::default).endpoint = v;
        }
        if let Ok(v) = std::env::var("AGENT_REMOTE_API_KEY") {
            self.decider.remote.get_or_insert_with(RemoteDeciderConfig::default).api_key = v;
        }
        if let Ok(v) = std::env::var("AGENT_MODEL_ID") {
            self.decider.remote.get_or_insert_with(RemoteDeciderConfig::default).model = v;
        }
        if let Ok(v) = std::env::var("AGENT_MAX_STEPS") {
            if let Ok(n) = v.parse() {
                self.orchestrator.max_steps = n;
            }
        }
        if let Ok(v) = std::env::var("AGENT_MAX_DURATION_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.orchestrator.max_duration_secs = n / 1000;
            }
        }
        if let Ok(v) = std::env::var("AGENT_STEP_DELAY_MS") {
            if let Ok(n) = v.parse() {
                self.orchestrator.step_delay_ms = n;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_duration_secs: default_max_duration_secs(),
            step_delay_ms: default_step_delay_ms(),
            max_tool_iterations: default_max_tool_iterations(),
        }
    }
}

fn default_max_steps() -> u32 {
    20
}
fn default_max_duration_secs() -> u64 {
    120
}
fn default_step_delay_ms() -> u64 {
    1500
}
fn default_max_tool_iterations() -> u32 {
    5
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeciderConfig {
    #[serde(default)]
    pub remote: Option<RemoteDeciderConfig>,
    #[serde(default)]
    pub local: Option<LocalDeciderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteDeciderConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_remote_model")]
    pub model: String,
    #[serde(default)]
    pub vision_enabled: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_remote_max_tokens")]
    pub max_tokens: u32,
}

impl Default for RemoteDeciderConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            model: default_remote_model(),
            vision_enabled: false,
            temperature: default_temperature(),
            max_tokens: default_remote_max_tokens(),
        }
    }
}

fn default_remote_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f32 {
    0.0
}
fn default_remote_max_tokens() -> u32 {
    384
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDeciderConfig {
    #[serde(default = "default_local_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_local_model")]
    pub model: String,
    #[serde(default = "default_local_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LocalDeciderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_local_endpoint(),
            model: default_local_model(),
            max_tokens: default_local_max_tokens(),
        }
    }
}

fn default_local_endpoint() -> String {
    "http://localhost:11434".to_string()
}
fn default_local_model() -> String {
    "qwen2.5:3b".to_string()
}
fn default_local_max_tokens() -> u32 {
    96
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenConfig {
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self { max_elements: default_max_elements(), max_text_length: default_max_text_length() }
    }
}

fn default_max_elements() -> usize {
    30
}
fn default_max_text_length() -> usize {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_screen_budget() {
        let config = AccConfig::default();
        assert_eq!(config.screen.max_elements, 30);
        assert_eq!(config.screen.max_text_length, 50);
    }

    #[test]
    fn default_orchestrator_budget_within_spec_range() {
        let config = AccConfig::default();
        assert!((15..=30).contains(&config.orchestrator.max_steps));
        assert!((60..=180).contains(&config.orchestrator.max_duration_secs));
        assert_eq!(config.orchestrator.max_tool_iterations, 5);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_str = r#"
            [orchestrator]
            max_steps = 25
        "#;
        let config: AccConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.orchestrator.max_steps, 25);
        assert_eq!(config.orchestrator.step_delay_ms, default_step_delay_ms());
    }
}
