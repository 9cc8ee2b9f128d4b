//! User-editable settings, persisted as the `appSettings` blob.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::models::SummaryType;

pub const DEFAULT_RETENTION_DAYS: u32 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub show_previews: bool,
    pub dark_mode: bool,
    /// Kept as a string to stay compatible with the settings form.
    pub data_retention: String,
    pub extract_html: bool,
    pub extract_text: bool,
    pub extract_images: bool,
    pub extract_links: bool,
    pub extract_meta: bool,
    pub extract_styles: bool,
    pub extract_scripts: bool,
    pub extract_article: bool,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub ai_model: String,
    pub full_summary_prompt: Option<String>,
    pub keyinfo_summary_prompt: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            show_previews: true,
            dark_mode: false,
            data_retention: DEFAULT_RETENTION_DAYS.to_string(),
            extract_html: true,
            extract_text: true,
            extract_images: true,
            extract_links: true,
            extract_meta: true,
            extract_styles: false,
            extract_scripts: false,
            extract_article: true,
            openai_api_key: String::new(),
            openai_base_url: String::new(),
            ai_model: String::new(),
            full_summary_prompt: None,
            keyinfo_summary_prompt: None,
        }
    }
}

impl AppSettings {
    /// The trimmed API key, or `None` when the user never configured one.
    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        Some(self.openai_api_key.trim()).filter(|k| !k.is_empty())
    }

    #[must_use]
    pub fn prompt_override(&self, summary_type: SummaryType) -> Option<&str> {
        let raw = match summary_type {
            SummaryType::Full => self.full_summary_prompt.as_deref(),
            SummaryType::KeyInfo => self.keyinfo_summary_prompt.as_deref(),
        };
        raw.filter(|p| !p.trim().is_empty())
    }

    #[must_use]
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::parse(&self.data_retention)
    }
}

/// How long persisted entities live. `retention_days == 0` means forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retention_days: u32,
}

impl RetentionPolicy {
    #[must_use]
    pub const fn new(retention_days: u32) -> Self {
        Self { retention_days }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<u32>() {
            Ok(days) => Self::new(days),
            Err(e) => {
                warn!(value = %raw, "Unparsable data retention setting, using default: {e}");
                Self::new(DEFAULT_RETENTION_DAYS)
            }
        }
    }

    #[must_use]
    pub const fn never_expires(&self) -> bool {
        self.retention_days == 0
    }

    /// Entities created before the returned instant are expired.
    #[must_use]
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.never_expires() {
            return None;
        }
        Some(now - Duration::days(i64::from(self.retention_days)))
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_DAYS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"openaiApiKey":"sk-1","dataRetention":"30"}"#).unwrap();
        assert_eq!(settings.api_key(), Some("sk-1"));
        assert!(settings.extract_article);
        assert!(!settings.extract_scripts);
        assert_eq!(settings.retention_policy(), RetentionPolicy::new(30));
    }

    #[test]
    fn blank_key_counts_as_missing() {
        let settings = AppSettings {
            openai_api_key: "   ".to_string(),
            ..AppSettings::default()
        };
        assert_eq!(settings.api_key(), None);
    }

    #[test]
    fn zero_retention_has_no_cutoff() {
        assert_eq!(RetentionPolicy::new(0).cutoff(Utc::now()), None);
    }

    #[test]
    fn garbage_retention_uses_default() {
        assert_eq!(RetentionPolicy::parse("forever"), RetentionPolicy::default());
    }

    #[test]
    fn cutoff_is_retention_days_before_now() {
        let now = Utc::now();
        let cutoff = RetentionPolicy::new(7).cutoff(now).unwrap();
        assert_eq!(now - cutoff, Duration::days(7));
    }
}
