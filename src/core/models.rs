use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Storage key prefix for summary artifacts (`aiSummary_{url}_{type}`).
pub const SUMMARY_KEY_PREFIX: &str = "aiSummary_";
pub const EXTRACTED_DATA_KEY: &str = "extractedData";
pub const CHAT_HISTORY_KEY: &str = "chatHistory";
pub const REFERENCE_LIST_KEY: &str = "referenceList";
pub const APP_SETTINGS_KEY: &str = "appSettings";

#[must_use]
pub fn summary_key(url: &str, summary_type: SummaryType) -> String {
    format!("{SUMMARY_KEY_PREFIX}{url}_{summary_type}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryType {
    #[default]
    Full,
    KeyInfo,
}

impl SummaryType {
    pub const ALL: [SummaryType; 2] = [SummaryType::Full, SummaryType::KeyInfo];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SummaryType::Full => "full",
            SummaryType::KeyInfo => "keyinfo",
        }
    }
}

impl fmt::Display for SummaryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SummaryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(SummaryType::Full),
            "keyinfo" => Ok(SummaryType::KeyInfo),
            other => Err(format!("unknown summary type: {other}")),
        }
    }
}

/// One unit of summarization work. Built per call, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRequest {
    pub url: String,
    pub summary_type: SummaryType,
    pub content: String,
}

/// A summary as held in the fast tier, keyed by `(url, summary_type)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryArtifact {
    pub content: String,
    pub summary_type: SummaryType,
    pub created_at: DateTime<Utc>,
    pub url: String,
}

impl SummaryArtifact {
    #[must_use]
    pub fn new(url: impl Into<String>, summary_type: SummaryType, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            summary_type,
            created_at: Utc::now(),
            url: url.into(),
        }
    }

    #[must_use]
    pub fn key(&self) -> String {
        summary_key(&self.url, self.summary_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Loading,
    Complete,
}

/// A host navigation signal after it has been resolved to a concrete tab state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationEvent {
    pub url: String,
    pub is_active_tab: bool,
    pub load_status: LoadStatus,
}

/// Row shape of the remote `News` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub url: String,
    #[serde(default)]
    pub summarizer: Option<String>,
    #[serde(default)]
    pub ai_key_info: Option<String>,
}

impl RemoteRecord {
    /// Text answering the given summary type, if the row carries a non-blank one.
    #[must_use]
    pub fn content_for(&self, summary_type: SummaryType) -> Option<&str> {
        let text = match summary_type {
            SummaryType::Full => self.summarizer.as_deref(),
            SummaryType::KeyInfo => self.ai_key_info.as_deref(),
        };
        text.filter(|t| !t.trim().is_empty())
    }
}

/// Snapshot returned by the page-context extraction callback.
///
/// Only the fields the core reads are typed; everything else the extractor
/// reports (images, links, meta, ...) is carried through untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedPage {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub article: Option<String>,
    #[serde(default)]
    pub word_count: usize,
    #[serde(default)]
    pub extracted_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExtractedPage {
    /// The text worth summarising: the readable article when one was found,
    /// otherwise the full page text.
    #[must_use]
    pub fn summarizable_content(&self) -> &str {
        match self.article.as_deref() {
            Some(article) if !article.trim().is_empty() => article,
            _ => &self.text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
