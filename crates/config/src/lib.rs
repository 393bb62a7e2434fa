//! Model and runner configuration.
//!
//! Resolution order for every knob: CLI flag → environment variable →
//! built-in default.  The API key additionally walks a provider fallback
//! chain (`DEEPSEEK_API_KEY` → `OPENAI_API_KEY` → `KIMI_API_KEY`) so the
//! same binary works against whichever provider the operator has set up.

use std::env;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment keys checked, in order, when no explicit API key is given.
pub const API_KEY_ENV_CHAIN: &[&str] = &["DEEPSEEK_API_KEY", "OPENAI_API_KEY", "KIMI_API_KEY"];

pub const MODEL_NAME_ENV: &str = "MODEL_NAME";
pub const MODEL_BASE_URL_ENV: &str = "MODEL_BASE_URL";

const DEFAULT_MODEL_NAME: &str = "deepseek-chat";
const DEFAULT_BASE_URL: &str = "https://api.deepseek.com/v1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "no API key configured (pass --api-key or set one of DEEPSEEK_API_KEY / OPENAI_API_KEY / KIMI_API_KEY)"
    )]
    MissingApiKey,
    #[error("model name is empty")]
    EmptyModelName,
    #[error("base URL is empty")]
    EmptyBaseUrl,
}

/// How hard a reasoning model should think.  Forwarded verbatim in the
/// request payload when set; providers that don't support it ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

/// Connection settings for one chat model endpoint.
///
/// The pipeline builds one of these for the stage agents and, optionally, a
/// second one with its own overrides for the Watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub api_key: Option<String>,
    pub model_name: String,
    pub base_url: String,
    pub stream: bool,
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model_name: DEFAULT_MODEL_NAME.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            stream: false,
            reasoning_effort: None,
        }
    }
}

impl ModelConfig {
    /// Build a config from explicit values, falling back to the environment
    /// for anything not provided.
    pub fn resolve(
        api_key: Option<String>,
        model_name: Option<String>,
        base_url: Option<String>,
        stream: bool,
    ) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()).or_else(api_key_from_env),
            model_name: env::var(MODEL_NAME_ENV)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .or(model_name)
                .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
            base_url: env::var(MODEL_BASE_URL_ENV)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .or(base_url)
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            stream,
            reasoning_effort: None,
        }
    }

    pub fn with_reasoning_effort(mut self, effort: Option<ReasoningEffort>) -> Self {
        self.reasoning_effort = effort;
        self
    }

    /// Fatal-at-startup checks: a run never begins with an unusable model
    /// endpoint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
            return Err(ConfigError::MissingApiKey);
        }
        if self.model_name.trim().is_empty() {
            return Err(ConfigError::EmptyModelName);
        }
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::EmptyBaseUrl);
        }
        Ok(())
    }
}

/// Walk the provider fallback chain and return the first non-empty key.
pub fn api_key_from_env() -> Option<String> {
    API_KEY_ENV_CHAIN
        .iter()
        .filter_map(|name| env::var(name).ok())
        .find(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep each one self-contained by
    // clearing the chain first.
    fn clear_env() {
        for key in API_KEY_ENV_CHAIN {
            unsafe { env::remove_var(key) };
        }
        unsafe {
            env::remove_var(MODEL_NAME_ENV);
            env::remove_var(MODEL_BASE_URL_ENV);
        }
    }

    #[test]
    fn validate_rejects_missing_key() {
        let config = ModelConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingApiKey)));
    }

    #[test]
    fn validate_accepts_explicit_key() {
        let config = ModelConfig {
            api_key: Some("sk-test".to_string()),
            ..ModelConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn explicit_key_wins_over_resolution() {
        let config = ModelConfig::resolve(Some("explicit".to_string()), None, None, false);
        assert_eq!(config.api_key.as_deref(), Some("explicit"));
    }

    #[test]
    fn blank_explicit_key_is_discarded() {
        clear_env();
        let config = ModelConfig::resolve(Some("   ".to_string()), None, None, false);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn resolve_uses_defaults_without_env() {
        clear_env();
        let config = ModelConfig::resolve(None, None, None, false);
        assert_eq!(config.model_name, DEFAULT_MODEL_NAME);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert!(!config.stream);
    }

    #[test]
    fn reasoning_effort_serializes_lowercase() {
        let json = serde_json::to_string(&ReasoningEffort::Medium).unwrap();
        assert_eq!(json, "\"medium\"");
    }
}
