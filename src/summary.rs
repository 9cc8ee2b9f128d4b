//! Summary lookup and generation.
//!
//! A request walks three tiers in order: the local cache, the shared remote
//! table, then a streamed completion. Remote lookups run on the
//! `databaseQuery` channel and generation on `aiSummary`, so a newer request
//! on either channel cancels the older one. Only a completed generation is
//! ever written back; a cancelled or failed stream leaves the cache alone.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::ai::client::{
    CompletionProvider, CompletionRequest, ProviderAuth, StreamedText, build_summary_prompt,
    stream_text,
};
use crate::cancel::{Cancellable, CancellationRegistry, Channel, ChannelHandle};
use crate::core::config::AppConfig;
use crate::core::models::{SummaryArtifact, SummaryRequest, SummaryType};
use crate::core::settings::AppSettings;
use crate::prompt::summary_system_prompt;
use crate::storage::cache::CacheStore;

pub const MISSING_API_KEY_MESSAGE: &str = "Configure an API key in settings first";
pub const NO_CACHED_DATA_MESSAGE: &str = "No cached data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryOutcome {
    Cached(SummaryArtifact),
    FromRemote(SummaryArtifact),
    Generated(SummaryArtifact),
    NotFound,
    Cancelled,
    ConfigError(String),
    ProviderError(String),
    /// Another generation is in flight.
    Busy,
    /// The same url is already being generated.
    Skipped,
    NoContent,
}

impl SummaryOutcome {
    /// The artifact carried by a successful outcome.
    #[must_use]
    pub const fn artifact(&self) -> Option<&SummaryArtifact> {
        match self {
            Self::Cached(a) | Self::FromRemote(a) | Self::Generated(a) => Some(a),
            _ => None,
        }
    }
}

/// Model parameters used when the user's settings leave them blank.
#[derive(Debug, Clone)]
pub struct GenerationDefaults {
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl From<&AppConfig> for GenerationDefaults {
    fn from(config: &AppConfig) -> Self {
        Self {
            model: config.default_model.clone(),
            base_url: config.default_base_url.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl GenerationDefaults {
    /// Credentials and model for one call, preferring the user's settings.
    /// `None` when no API key is configured.
    #[must_use]
    pub fn resolve(&self, settings: &AppSettings) -> Option<(ProviderAuth, String)> {
        let api_key = settings.api_key()?;
        let pick = |user: &str, fallback: &str| {
            let user = user.trim();
            if user.is_empty() { fallback.to_string() } else { user.to_string() }
        };
        Some((
            ProviderAuth {
                api_key: api_key.to_string(),
                base_url: pick(&settings.openai_base_url, &self.base_url),
            },
            pick(&settings.ai_model, &self.model),
        ))
    }
}

/// Clears the in-flight marker when generation ends, however it ends.
struct InFlightGuard<'a> {
    slot: &'a Mutex<Option<String>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

pub struct SummaryEngine {
    cache: Arc<CacheStore>,
    provider: Arc<dyn CompletionProvider>,
    registry: Arc<CancellationRegistry>,
    defaults: GenerationDefaults,
    in_flight: Mutex<Option<String>>,
}

impl SummaryEngine {
    #[must_use]
    pub fn new(
        cache: Arc<CacheStore>,
        provider: Arc<dyn CompletionProvider>,
        registry: Arc<CancellationRegistry>,
        defaults: GenerationDefaults,
    ) -> Self {
        Self {
            cache,
            provider,
            registry,
            defaults,
            in_flight: Mutex::new(None),
        }
    }

    /// Url of the generation in flight, if any.
    #[must_use]
    pub fn in_flight(&self) -> Option<String> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.in_flight().is_some()
    }

    /// Local cache, then the remote table. Never generates.
    pub async fn lookup(&self, url: &str, summary_type: SummaryType) -> SummaryOutcome {
        if let Some(artifact) = self.cache.get_fast(url, summary_type) {
            debug!(url = %url, summary_type = %summary_type, "Summary served from local cache");
            return SummaryOutcome::Cached(artifact);
        }

        let handle = self.registry.begin(Channel::DatabaseQuery);
        let result = self.cache.get_slow(url, &handle).await;
        self.registry.end(&handle);

        let records = match result {
            Ok(Cancellable::Completed(records)) => records,
            Ok(Cancellable::Cancelled) => return SummaryOutcome::Cancelled,
            Err(e) => {
                warn!(url = %url, "Remote summary lookup failed: {e}");
                return SummaryOutcome::NotFound;
            }
        };

        let Some(record) = records.iter().find(|r| r.url == url) else {
            debug!(url = %url, "No remote summary row");
            return SummaryOutcome::NotFound;
        };

        // Fill every type the row answers, without clobbering fresher local entries.
        let mut requested = None;
        for candidate in SummaryType::ALL {
            let Some(content) = record.content_for(candidate) else {
                continue;
            };
            let artifact = SummaryArtifact::new(url, candidate, content);
            if let Err(e) = self.cache.put_fast_if_absent(&artifact) {
                warn!(url = %url, summary_type = %candidate, "Failed to cache remote summary: {e}");
            }
            if candidate == summary_type {
                requested = Some(artifact);
            }
        }

        match requested {
            Some(artifact) => {
                info!(url = %url, summary_type = %summary_type, "Summary served from remote table");
                SummaryOutcome::FromRemote(artifact)
            }
            None => SummaryOutcome::NotFound,
        }
    }

    /// Full lookup, falling through to a streamed generation. `on_partial`
    /// receives the accumulated text after every delta.
    pub async fn generate(
        &self,
        request: &SummaryRequest,
        settings: &AppSettings,
        on_partial: &(dyn Fn(&str) + Send + Sync),
    ) -> SummaryOutcome {
        let _guard = {
            let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(current) = slot.as_deref() {
                debug!(url = %request.url, in_flight = %current, "Generation already running");
                return SummaryOutcome::Busy;
            }
            *slot = Some(request.url.clone());
            InFlightGuard {
                slot: &self.in_flight,
            }
        };

        if request.content.trim().is_empty() {
            debug!(url = %request.url, "Nothing to summarise");
            return SummaryOutcome::NoContent;
        }

        match self.lookup(&request.url, request.summary_type).await {
            SummaryOutcome::NotFound => {}
            other => return other,
        }

        let Some((auth, model)) = self.defaults.resolve(settings) else {
            return SummaryOutcome::ConfigError(MISSING_API_KEY_MESSAGE.to_string());
        };

        let system_prompt =
            summary_system_prompt(request.summary_type, settings.prompt_override(request.summary_type));
        let completion = CompletionRequest {
            model,
            messages: build_summary_prompt(&system_prompt, &request.content),
            max_tokens: self.defaults.max_tokens,
            temperature: self.defaults.temperature,
        };

        let handle = self.registry.begin(Channel::AiSummary);
        let outcome = self.stream_summary(request, &auth, completion, &handle, on_partial).await;
        self.registry.end(&handle);
        outcome
    }

    async fn stream_summary(
        &self,
        request: &SummaryRequest,
        auth: &ProviderAuth,
        completion: CompletionRequest,
        handle: &ChannelHandle,
        on_partial: &(dyn Fn(&str) + Send + Sync),
    ) -> SummaryOutcome {
        info!(url = %request.url, summary_type = %request.summary_type, "Generating summary");

        let text = match stream_text(self.provider.as_ref(), auth, completion, handle, on_partial).await {
            StreamedText::Completed(text) => text,
            StreamedText::Cancelled => return SummaryOutcome::Cancelled,
            StreamedText::Failed(msg) => return SummaryOutcome::ProviderError(msg),
        };
        if text.trim().is_empty() {
            return SummaryOutcome::ProviderError("The provider returned an empty summary".to_string());
        }

        let artifact = SummaryArtifact::new(&request.url, request.summary_type, text);
        if let Err(e) = self.cache.put_fast(&artifact) {
            warn!(url = %request.url, "Failed to cache generated summary: {e}");
        }
        info!(
            url = %request.url,
            summary_type = %request.summary_type,
            chars = artifact.content.chars().count(),
            "Summary generated"
        );
        SummaryOutcome::Generated(artifact)
    }

    /// Local cache only. Never reaches the remote table or the provider.
    #[must_use]
    pub fn switch_type(&self, url: &str, summary_type: SummaryType) -> SummaryOutcome {
        match self.in_flight().as_deref() {
            Some(current) if current == url => {
                debug!(url = %url, "Switch skipped, this url is being generated");
                return SummaryOutcome::Skipped;
            }
            Some(_) => return SummaryOutcome::Busy,
            None => {}
        }

        match self.cache.get_fast(url, summary_type) {
            Some(artifact) => SummaryOutcome::Cached(artifact),
            None => SummaryOutcome::NotFound,
        }
    }

    /// Evicts one cached summary.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the removal.
    pub fn clear_cached(
        &self,
        url: &str,
        summary_type: SummaryType,
    ) -> Result<(), crate::errors::PanelError> {
        self.cache.evict_fast(url, summary_type)?;
        info!(url = %url, summary_type = %summary_type, "Cleared cached summary");
        Ok(())
    }
}
