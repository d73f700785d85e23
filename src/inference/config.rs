//! Application configuration loading.
//!
//! Reads `coderelay.yaml` and resolves environment variables. Config is the
//! single source of truth for the remote provider, the local model, retry
//! tuning, local admission limits, and default generation parameters.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::errors::InferenceError;

/// File names searched for, in order, in each directory walking upward.
const CONFIG_CANDIDATES: [&str; 2] = ["coderelay.yaml", ".coderelay/config.yaml"];

// ─── Public Types ────────────────────────────────────────────────────────────

/// Remote provider settings (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
}

impl RemoteConfig {
    /// Credentials are present and non-blank.
    pub fn has_credentials(&self) -> bool {
        self.api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty())
            && !self.base_url.trim().is_empty()
    }
}

/// Local model settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Path to the model weights file. Used for validity and footprint.
    #[serde(default)]
    pub model_path: Option<String>,
    /// Local OpenAI-compatible server (llama-server, Ollama) serving the model.
    #[serde(default = "default_local_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub model_name: Option<String>,
    /// Deadline for one local prediction. `None` means no deadline.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Retry tuning for remote calls.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_suggested_delay_ms")]
    pub max_suggested_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_suggested_delay_ms: default_max_suggested_delay_ms(),
        }
    }
}

/// Admission-control limits for local inference.
///
/// These are tunable heuristics, not correctness-critical constants.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Live memory as a multiple of the on-disk model size.
    #[serde(default = "default_memory_multiplier")]
    pub memory_multiplier: f64,
    #[serde(default = "default_min_memory_mb")]
    pub min_memory_mb: u64,
    /// Memory kept free for the rest of the system.
    #[serde(default = "default_safety_buffer_mb")]
    pub safety_buffer_mb: u64,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            memory_multiplier: default_memory_multiplier(),
            min_memory_mb: default_min_memory_mb(),
            safety_buffer_mb: default_safety_buffer_mb(),
        }
    }
}

/// Default generation parameters applied when a request doesn't override them.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationDefaults {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
    #[serde(default)]
    pub presence_penalty: f32,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stop: Vec::new(),
        }
    }
}

/// Top-level configuration (mirrors `coderelay.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub local: Option<LocalConfig>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub resources: ResourceSettings,
    #[serde(default)]
    pub generation: GenerationDefaults,
}

fn default_remote_timeout_secs() -> u64 {
    60
}
fn default_local_endpoint() -> String {
    "http://localhost:8080/v1".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_max_suggested_delay_ms() -> u64 {
    60_000
}
fn default_max_concurrent() -> usize {
    4
}
fn default_memory_multiplier() -> f64 {
    3.0
}
fn default_min_memory_mb() -> u64 {
    2_048
}
fn default_safety_buffer_mb() -> u64 {
    1_024
}
fn default_max_tokens() -> u32 {
    2_048
}
fn default_temperature() -> f32 {
    0.2
}
fn default_top_p() -> f32 {
    1.0
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `CODERELAY_CONFIG` first, then searches upward from `start`.
/// Returns `None` when no file exists; callers fall back to defaults.
pub fn find_config_path(start: &Path) -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CODERELAY_CONFIG") {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Some(candidate);
        }
        tracing::warn!(path = %candidate.display(), "CODERELAY_CONFIG points to a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        for name in CONFIG_CANDIDATES {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Load and parse the configuration file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_config(path: &Path) -> Result<AppConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_config(&raw)
}

/// Parse configuration text (after env interpolation).
pub fn parse_config(raw: &str) -> Result<AppConfig, InferenceError> {
    let interpolated = interpolate_env_vars(raw);
    let config: AppConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;
    validate(&config)?;
    Ok(config)
}

/// Find and load the config, or return defaults when none exists.
pub fn load_or_default(start: &Path) -> Result<AppConfig, InferenceError> {
    match find_config_path(start) {
        Some(path) => {
            let config = load_config(&path)?;
            tracing::info!(
                path = %path.display(),
                remote = config.remote.is_some(),
                local = config.local.is_some(),
                "loaded configuration"
            );
            Ok(config)
        }
        None => {
            tracing::info!("no configuration file found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

fn validate(config: &AppConfig) -> Result<(), InferenceError> {
    if config.resources.max_concurrent == 0 {
        return Err(InferenceError::ConfigError {
            reason: "resources.max_concurrent must be at least 1".into(),
        });
    }
    if !(config.resources.memory_multiplier.is_finite() && config.resources.memory_multiplier > 0.0) {
        return Err(InferenceError::ConfigError {
            reason: "resources.memory_multiplier must be a positive number".into(),
        });
    }
    Ok(())
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__CODERELAY_TEST_MISSING__");
        let result = interpolate_env_vars("${__CODERELAY_TEST_MISSING__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__CODERELAY_TEST_KEY__", "sk-test");
        let result = interpolate_env_vars("api_key: ${__CODERELAY_TEST_KEY__}");
        assert_eq!(result, "api_key: sk-test");
        std::env::remove_var("__CODERELAY_TEST_KEY__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with $dollar but no braces";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/models/coder.gguf");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/models/coder.gguf"));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("{}").unwrap();
        assert!(config.remote.is_none());
        assert!(config.local.is_none());
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.retry.max_delay_ms, 10_000);
        assert_eq!(config.resources.max_concurrent, 4);
        assert_eq!(config.resources.min_memory_mb, 2_048);
        assert_eq!(config.resources.safety_buffer_mb, 1_024);
    }

    #[test]
    fn test_full_config_parses() {
        let yaml = r#"
            remote:
              base_url: "https://api.example.com/v1"
              api_key: "sk-abc"
              model: "coder-large"
            local:
              model_path: "/models/coder.gguf"
              timeout_secs: 120
            resources:
              max_concurrent: 2
              memory_multiplier: 2.5
            generation:
              max_tokens: 512
              stop: ["```"]
        "#;
        let config = parse_config(yaml).unwrap();
        let remote = config.remote.unwrap();
        assert!(remote.has_credentials());
        assert_eq!(remote.timeout_secs, 60);
        let local = config.local.unwrap();
        assert_eq!(local.endpoint, "http://localhost:8080/v1");
        assert_eq!(local.timeout_secs, Some(120));
        assert_eq!(config.resources.max_concurrent, 2);
        assert_eq!(config.generation.max_tokens, 512);
        assert_eq!(config.generation.stop, vec!["```".to_string()]);
    }

    #[test]
    fn test_blank_api_key_is_not_credentials() {
        let yaml = r#"
            remote:
              base_url: "https://api.example.com/v1"
              api_key: "   "
              model: "m"
        "#;
        let config = parse_config(yaml).unwrap();
        assert!(!config.remote.unwrap().has_credentials());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = parse_config("resources:\n  max_concurrent: 0\n").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_find_config_path_walks_upward() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("coderelay.yaml"), "{}").unwrap();

        std::env::remove_var("CODERELAY_CONFIG");
        let found = find_config_path(&nested).unwrap();
        assert_eq!(found, dir.path().join("coderelay.yaml"));
    }
}
