//! Top-level display state machine for the panel.
//!
//! Every navigation bumps an epoch and blanks the display before any new data
//! arrives. Extraction and lookup results are written back only while their
//! url and epoch are still the current ones. A generation only needs its url
//! to still be on show, since navigating to any other page cancels it. The
//! check and the write happen under one lock with no suspension point between
//! them, so a slow answer for an old page can never overwrite a newer one.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cancel::{Cancellable, CancellationRegistry, Channel};
use crate::core::models::{ExtractedPage, SummaryRequest, SummaryType};
use crate::errors::PanelError;
use crate::storage::cache::CacheStore;
use crate::summary::{NO_CACHED_DATA_MESSAGE, SummaryEngine, SummaryOutcome};
use crate::tabs::NavigationSink;

pub const NO_PAGE_CONTENT_MESSAGE: &str = "No page content to summarise";

/// Reads the content of a page the host has loaded.
#[async_trait]
pub trait PageExtractor: Send + Sync {
    async fn extract(&self, url: &str) -> Result<ExtractedPage, PanelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Loading,
    Generating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarySource {
    Local,
    Remote,
    Generated,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SummaryView {
    #[default]
    Blank,
    Summary {
        content: String,
        source: SummarySource,
        created_at: DateTime<Utc>,
    },
    /// Accumulated text of a generation still streaming.
    Streaming(String),
    Empty(Option<String>),
    Error {
        message: String,
        needs_settings: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisplayState {
    pub url: Option<String>,
    pub summary_type: SummaryType,
    pub phase: Phase,
    pub view: SummaryView,
}

#[derive(Debug, Default)]
struct NavState {
    last_processed_url: Option<String>,
    epoch: u64,
    selected_type: SummaryType,
    extracted: Option<ExtractedPage>,
}

impl NavState {
    fn is_current(&self, url: &str, epoch: u64) -> bool {
        self.epoch == epoch && self.last_processed_url.as_deref() == Some(url)
    }
}

pub struct RefreshCoordinator {
    cache: Arc<CacheStore>,
    engine: Arc<SummaryEngine>,
    extractor: Arc<dyn PageExtractor>,
    registry: Arc<CancellationRegistry>,
    nav: Mutex<NavState>,
    display: watch::Sender<DisplayState>,
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new(
        cache: Arc<CacheStore>,
        engine: Arc<SummaryEngine>,
        extractor: Arc<dyn PageExtractor>,
        registry: Arc<CancellationRegistry>,
    ) -> Self {
        let (display, _) = watch::channel(DisplayState::default());
        Self {
            cache,
            engine,
            extractor,
            registry,
            nav: Mutex::new(NavState::default()),
            display,
        }
    }

    fn nav(&self) -> MutexGuard<'_, NavState> {
        self.nav.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DisplayState> {
        self.display.subscribe()
    }

    #[must_use]
    pub fn display(&self) -> DisplayState {
        self.display.borrow().clone()
    }

    #[must_use]
    pub fn last_processed_url(&self) -> Option<String> {
        self.nav().last_processed_url.clone()
    }

    #[must_use]
    pub fn selected_type(&self) -> SummaryType {
        self.nav().selected_type
    }

    #[must_use]
    pub fn extracted(&self) -> Option<ExtractedPage> {
        self.nav().extracted.clone()
    }

    /// Applies `update` to the display if `(url, epoch)` is still current.
    fn publish_if_current(&self, url: &str, epoch: u64, update: impl FnOnce(&mut DisplayState)) -> bool {
        let nav = self.nav();
        if !nav.is_current(url, epoch) {
            debug!(url = %url, epoch, current_epoch = nav.epoch, "Dropping stale result");
            return false;
        }
        self.display.send_modify(update);
        true
    }

    /// Applies `update` to the display if `url` is still the page on show,
    /// whatever navigations to it happened since.
    fn publish_if_showing(&self, url: &str, update: impl FnOnce(&mut DisplayState)) -> bool {
        let nav = self.nav();
        if nav.last_processed_url.as_deref() != Some(url) {
            debug!(url = %url, "Dropping result for a page no longer shown");
            return false;
        }
        self.display.send_modify(update);
        true
    }

    /// The user is now looking at `url`.
    pub async fn navigated(&self, url: &str) {
        let (epoch, summary_type, regenerating) = {
            let mut nav = self.nav();
            // A generation can start while the panel is still loading, so the
            // engine is asked directly rather than trusting the phase alone.
            let generating = self.engine.in_flight();
            let loading_other =
                self.display.borrow().phase != Phase::Idle && nav.last_processed_url.as_deref() != Some(url);
            let generating_other = generating.as_deref().is_some_and(|current| current != url);
            if loading_other || generating_other {
                info!(url = %url, "Navigation while busy, cancelling in-flight work");
                self.registry.cancel_all();
            }

            // A reload of the page being generated keeps the stream on display.
            let regenerating = generating.as_deref() == Some(url);
            let shown = self.display.borrow().view.clone();
            nav.last_processed_url = Some(url.to_string());
            nav.epoch += 1;
            nav.extracted = None;
            self.display.send_replace(DisplayState {
                url: Some(url.to_string()),
                summary_type: nav.selected_type,
                phase: if regenerating { Phase::Generating } else { Phase::Loading },
                view: match shown {
                    streaming @ SummaryView::Streaming(_) if regenerating => streaming,
                    _ if regenerating => SummaryView::Streaming(String::new()),
                    _ => SummaryView::Blank,
                },
            });
            (nav.epoch, nav.selected_type, regenerating)
        };
        debug!(url = %url, epoch, "Refreshing panel");

        if regenerating {
            // The running generation answers for this page.
            self.extract_page(url, epoch).await;
        } else {
            let lookup = async {
                let outcome = self.engine.lookup(url, summary_type).await;
                self.apply_outcome(url, Some(epoch), &outcome, false);
            };
            tokio::join!(self.extract_page(url, epoch), lookup);
        }

        // A generation started meanwhile owns the phase from here on.
        self.publish_if_current(url, epoch, |d| {
            if d.phase == Phase::Loading {
                d.phase = Phase::Idle;
            }
        });
    }

    async fn extract_page(&self, url: &str, epoch: u64) {
        let handle = self.registry.begin(Channel::DataExtraction);
        let result = handle.run(self.extractor.extract(url)).await;
        self.registry.end(&handle);

        let mut page = match result {
            Cancellable::Cancelled => {
                debug!(url = %url, "Extraction cancelled");
                return;
            }
            Cancellable::Completed(Err(e)) => {
                warn!(url = %url, "Page extraction failed: {e}");
                return;
            }
            Cancellable::Completed(Ok(page)) => page,
        };
        page.extracted_at.get_or_insert_with(Utc::now);

        let mut nav = self.nav();
        if !nav.is_current(url, epoch) {
            debug!(url = %url, "Discarding extraction for an old navigation");
            return;
        }
        if let Err(e) = self.cache.save_extracted(&page) {
            warn!(url = %url, "Failed to persist extracted page: {e}");
        }
        info!(url = %url, words = page.word_count, "Page extracted");
        nav.extracted = Some(page);
    }

    /// Generates a summary of the current page for the selected type. Partial
    /// text is streamed into the display while the page stays on show, reloads
    /// of it included. Navigating to another page cancels the generation.
    pub async fn generate_summary(&self) -> SummaryOutcome {
        if self.engine.is_busy() {
            return SummaryOutcome::Busy;
        }

        let request = {
            let nav = self.nav();
            let Some(url) = nav.last_processed_url.clone() else {
                return SummaryOutcome::NoContent;
            };
            let content = nav
                .extracted
                .as_ref()
                .map(|page| page.summarizable_content().to_string())
                .unwrap_or_default();
            let request = SummaryRequest {
                url,
                summary_type: nav.selected_type,
                content,
            };
            self.display.send_modify(|d| {
                d.phase = Phase::Generating;
                d.view = SummaryView::Streaming(String::new());
            });
            request
        };

        let settings = self.cache.load_settings();
        let url = request.url.as_str();
        let on_partial = |partial: &str| {
            self.publish_if_showing(url, |d| {
                d.view = SummaryView::Streaming(partial.to_string());
            });
        };
        let outcome = self.engine.generate(&request, &settings, &on_partial).await;
        self.apply_outcome(url, None, &outcome, true);
        outcome
    }

    /// Whether `url` already has a row in the shared table. Runs on the
    /// `bookmarkCheck` channel, so a newer check cancels this one. A failed
    /// query reads as not bookmarked.
    pub async fn check_bookmark(&self, url: &str) -> Cancellable<bool> {
        let handle = self.registry.begin(Channel::BookmarkCheck);
        let result = self.cache.is_bookmarked(url, &handle).await;
        self.registry.end(&handle);

        result.unwrap_or_else(|e| {
            warn!(url = %url, "Bookmark check failed: {e}");
            Cancellable::Completed(false)
        })
    }

    /// Shows the cached summary of the selected type, never fetching or
    /// generating one.
    pub fn switch_summary_type(&self, summary_type: SummaryType) -> SummaryOutcome {
        let mut nav = self.nav();
        let Some(url) = nav.last_processed_url.clone() else {
            nav.selected_type = summary_type;
            self.display.send_modify(|d| d.summary_type = summary_type);
            return SummaryOutcome::NotFound;
        };

        let outcome = self.engine.switch_type(&url, summary_type);
        if matches!(outcome, SummaryOutcome::Busy | SummaryOutcome::Skipped) {
            debug!(url = %url, summary_type = %summary_type, "Type switch refused while generating");
            return outcome;
        }

        nav.selected_type = summary_type;
        self.display.send_modify(|d| {
            d.summary_type = summary_type;
            d.view = match &outcome {
                SummaryOutcome::Cached(artifact) => SummaryView::Summary {
                    content: artifact.content.clone(),
                    source: SummarySource::Local,
                    created_at: artifact.created_at,
                },
                _ => SummaryView::Empty(Some(NO_CACHED_DATA_MESSAGE.to_string())),
            };
        });
        outcome
    }

    /// Evicts the summary currently on display.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the removal.
    pub fn clear_summary_cache(&self) -> Result<(), PanelError> {
        let nav = self.nav();
        let Some(url) = nav.last_processed_url.as_deref() else {
            return Ok(());
        };
        self.engine.clear_cached(url, nav.selected_type)?;
        self.display.send_modify(|d| d.view = SummaryView::Empty(None));
        Ok(())
    }

    /// Publishes `outcome`. With an epoch the result must belong to that exact
    /// navigation; without one it only needs `url` to still be on show.
    /// `finish` marks the end of a generation, which ends a `Generating` phase.
    fn apply_outcome(&self, url: &str, epoch: Option<u64>, outcome: &SummaryOutcome, finish: bool) {
        let view = match outcome {
            SummaryOutcome::Cached(a) => Some(summary_view(a.content.clone(), SummarySource::Local, a.created_at)),
            SummaryOutcome::FromRemote(a) => {
                Some(summary_view(a.content.clone(), SummarySource::Remote, a.created_at))
            }
            SummaryOutcome::Generated(a) => {
                Some(summary_view(a.content.clone(), SummarySource::Generated, a.created_at))
            }
            SummaryOutcome::NotFound => Some(SummaryView::Empty(None)),
            SummaryOutcome::NoContent => Some(SummaryView::Empty(Some(NO_PAGE_CONTENT_MESSAGE.to_string()))),
            SummaryOutcome::ConfigError(message) => Some(SummaryView::Error {
                message: message.clone(),
                needs_settings: true,
            }),
            SummaryOutcome::ProviderError(message) => Some(SummaryView::Error {
                message: message.clone(),
                needs_settings: false,
            }),
            // Another operation owns the display.
            SummaryOutcome::Busy | SummaryOutcome::Skipped => return,
            SummaryOutcome::Cancelled => None,
        };

        let update = |d: &mut DisplayState| {
            // A lookup never replaces a generation's stream or its finished summary.
            let generated_on_show =
                d.phase == Phase::Generating || matches!(d.view, SummaryView::Summary { .. });
            if let Some(view) = view.filter(|_| finish || !generated_on_show) {
                d.view = view;
            }
            if finish && d.phase == Phase::Generating {
                d.phase = Phase::Idle;
            }
        };
        match epoch {
            Some(epoch) => self.publish_if_current(url, epoch, update),
            None => self.publish_if_showing(url, update),
        };
    }
}

fn summary_view(content: String, source: SummarySource, created_at: DateTime<Utc>) -> SummaryView {
    SummaryView::Summary {
        content,
        source,
        created_at,
    }
}

#[async_trait]
impl NavigationSink for RefreshCoordinator {
    async fn navigated(&self, url: String) {
        RefreshCoordinator::navigated(self, &url).await;
    }
}
