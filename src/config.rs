use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{PilotError, PilotResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub detection: DetectionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub api_base: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Optional API key stored in config.toml (falls back to env var
    /// SCREENPILOT_API_KEY).
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            model: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            api_key: None,
        }
    }
}

impl ModelConfig {
    pub fn resolve_api_key(&self) -> String {
        self.api_key
            .clone()
            .or_else(|| std::env::var("SCREENPILOT_API_KEY").ok())
            .unwrap_or_default()
    }
}

/// Loop-level limits and pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    /// Hard cap on reasoning iterations before the run ends with `timeout`.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// How many recent image-bearing transcript turns keep their payloads.
    #[serde(default = "default_history_image_turns")]
    pub history_image_turns: usize,
    /// Minimum template-match confidence.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Pause between iterations, letting the UI settle after an action.
    #[serde(default = "default_iteration_wait_ms")]
    pub iteration_wait_ms: u64,
    /// Granularity of the stop-flag poll during the inter-iteration wait.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            history_image_turns: default_history_image_turns(),
            confidence_threshold: default_confidence_threshold(),
            iteration_wait_ms: default_iteration_wait_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Screen-change and stuck-detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionSettings {
    /// Sampled byte-difference ratio above which consecutive screenshots
    /// count as a significant change.
    #[serde(default = "default_change_threshold")]
    pub change_threshold: f64,
    /// Ratio below which a difference is attributed to cursor blink / clock
    /// ticks and treated as unchanged.
    #[serde(default = "default_noise_threshold")]
    pub noise_threshold: f64,
    /// Consecutive identical actions before the run is considered looping.
    #[serde(default = "default_repeat_action_threshold")]
    pub repeat_action_threshold: u32,
    /// Consecutive unchanged screenshots required alongside the repeated
    /// actions before declaring the agent stuck.
    #[serde(default = "default_unchanged_screen_threshold")]
    pub unchanged_screen_threshold: u32,
    /// Size of the rolling action window inspected for loops.
    #[serde(default = "default_action_window")]
    pub action_window: usize,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            change_threshold: default_change_threshold(),
            noise_threshold: default_noise_threshold(),
            repeat_action_threshold: default_repeat_action_threshold(),
            unchanged_screen_threshold: default_unchanged_screen_threshold(),
            action_window: default_action_window(),
        }
    }
}

fn default_temperature() -> f64 {
    0.1
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_max_iterations() -> u32 {
    40
}

fn default_history_image_turns() -> usize {
    3
}

fn default_confidence_threshold() -> f32 {
    0.7
}

fn default_iteration_wait_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_change_threshold() -> f64 {
    0.05
}

fn default_noise_threshold() -> f64 {
    0.005
}

fn default_repeat_action_threshold() -> u32 {
    3
}

fn default_unchanged_screen_threshold() -> u32 {
    5
}

fn default_action_window() -> usize {
    10
}

fn resolve_config_path() -> PilotResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(PilotError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

pub fn load_config() -> PilotResult<AgentConfig> {
    let path = resolve_config_path()?;
    let content = std::fs::read_to_string(&path)?;
    let config: AgentConfig = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), model = %config.model.model, "config loaded");
    Ok(config)
}

pub fn save_config(config: &AgentConfig) -> PilotResult<()> {
    let path = resolve_config_path()?;
    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}
