use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::PanelError;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_MAX_TOKENS: u32 = 8000;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;
pub const DEFAULT_TAB_DELAY_MS: u64 = 500;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Deployment-level configuration. User-editable values (API key, model,
/// retention) live in [`super::settings::AppSettings`] instead.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store_path: Option<PathBuf>,
    pub remote_url: Option<String>,
    pub remote_key: Option<String>,
    pub default_model: String,
    pub default_base_url: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub debounce_ms: u64,
    pub tab_delay_ms: u64,
    pub sweep_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            remote_url: None,
            remote_key: None,
            default_model: DEFAULT_MODEL.to_string(),
            default_base_url: DEFAULT_BASE_URL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            tab_delay_ms: DEFAULT_TAB_DELAY_MS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, PanelError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PanelError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Ok(Self {
            store_path: text("SIDEBRIEF_STORE_PATH").map(PathBuf::from),
            remote_url: text("SIDEBRIEF_REMOTE_URL"),
            remote_key: text("SIDEBRIEF_REMOTE_KEY"),
            default_model: text("SIDEBRIEF_DEFAULT_MODEL").unwrap_or(defaults.default_model),
            default_base_url: text("SIDEBRIEF_DEFAULT_BASE_URL")
                .unwrap_or(defaults.default_base_url),
            max_tokens: parse_var("SIDEBRIEF_MAX_TOKENS", text("SIDEBRIEF_MAX_TOKENS"))?
                .unwrap_or(defaults.max_tokens),
            temperature: parse_var("SIDEBRIEF_TEMPERATURE", text("SIDEBRIEF_TEMPERATURE"))?
                .unwrap_or(defaults.temperature),
            debounce_ms: parse_var("SIDEBRIEF_DEBOUNCE_MS", text("SIDEBRIEF_DEBOUNCE_MS"))?
                .unwrap_or(defaults.debounce_ms),
            tab_delay_ms: parse_var("SIDEBRIEF_TAB_DELAY_MS", text("SIDEBRIEF_TAB_DELAY_MS"))?
                .unwrap_or(defaults.tab_delay_ms),
            sweep_interval_secs: parse_var(
                "SIDEBRIEF_SWEEP_INTERVAL_SECS",
                text("SIDEBRIEF_SWEEP_INTERVAL_SECS"),
            )?
            .unwrap_or(defaults.sweep_interval_secs),
        })
    }

    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub fn tab_delay(&self) -> Duration {
        Duration::from_millis(self.tab_delay_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_var<T>(name: &str, raw: Option<String>) -> Result<Option<T>, PanelError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|value| {
        value
            .trim()
            .parse::<T>()
            .map_err(|e| PanelError::ConfigError(format!("{name}: {e}")))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = AppConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.debounce(), Duration::from_millis(300));
        assert_eq!(config.tab_delay(), Duration::from_millis(500));
        assert_eq!(config.max_tokens, 8000);
        assert!(config.remote_url.is_none());
        assert!(config.store_path.is_none());
    }

    #[test]
    fn overrides_are_read() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("SIDEBRIEF_REMOTE_URL", "https://db.example.com"),
            ("SIDEBRIEF_DEBOUNCE_MS", "50"),
            ("SIDEBRIEF_DEFAULT_MODEL", "qwen-turbo"),
        ]))
        .unwrap();
        assert_eq!(config.remote_url.as_deref(), Some("https://db.example.com"));
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.default_model, "qwen-turbo");
    }

    #[test]
    fn malformed_number_is_a_config_error() {
        let err = AppConfig::from_lookup(lookup_from(&[("SIDEBRIEF_MAX_TOKENS", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("SIDEBRIEF_MAX_TOKENS"));
    }
}
