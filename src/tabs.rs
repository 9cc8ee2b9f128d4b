//! Turns raw tab and navigation signals from the host browser into one
//! "the user is now looking at this page" call per distinct navigation.
//!
//! Update-style signals are coalesced in a debounce window where the last one
//! wins. A newly created active tab is re-read after a short delay because the
//! host reports it before its url is known. Repeats of the url currently being
//! processed are dropped; a repeat after processing finished (a reload) goes
//! through.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::cancel::TaskHandle;
use crate::core::config::AppConfig;
use crate::core::models::{LoadStatus, NavigationEvent};
use crate::errors::PanelError;

pub type TabId = i64;

/// Only the top-level frame's navigations matter.
pub const MAIN_FRAME: i64 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub id: TabId,
    pub url: Option<String>,
    pub active: bool,
    pub status: LoadStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabSignal {
    Created(TabInfo),
    Activated {
        tab_id: TabId,
    },
    Updated {
        tab_id: TabId,
        status: Option<LoadStatus>,
        tab: TabInfo,
    },
    NavigationCommitted {
        tab_id: TabId,
        url: String,
        frame_id: i64,
    },
    NavigationCompleted {
        tab_id: TabId,
        url: String,
        frame_id: i64,
    },
    NavigationError {
        tab_id: TabId,
        url: String,
        frame_id: i64,
    },
    HistoryStateUpdated {
        tab_id: TabId,
        url: String,
        frame_id: i64,
    },
}

impl TabInfo {
    /// The tab as a navigation, taking the reported change status over the
    /// tab's own. `None` while the tab has no url.
    #[must_use]
    pub fn navigation_event(&self, status: Option<LoadStatus>) -> Option<NavigationEvent> {
        Some(NavigationEvent {
            url: self.url.clone()?,
            is_active_tab: self.active,
            load_status: status.unwrap_or(self.status),
        })
    }
}

#[async_trait]
pub trait TabHost: Send + Sync {
    async fn get_tab(&self, tab_id: TabId) -> Result<Option<TabInfo>, PanelError>;
}

#[async_trait]
pub trait NavigationSink: Send + Sync {
    async fn navigated(&self, url: String);
}

/// True for pages the panel can read: web pages and local files.
#[must_use]
pub fn is_page_url(raw: &str) -> bool {
    Url::parse(raw).is_ok_and(|u| matches!(u.scheme(), "http" | "https" | "file"))
}

#[derive(Debug, Default)]
struct DedupState {
    last_processed_url: Option<String>,
    processing: bool,
    generation: u64,
}

/// Signal waiting out the debounce window.
#[derive(Debug)]
enum PendingUpdate {
    Tab {
        status: Option<LoadStatus>,
        tab: TabInfo,
    },
    Navigation {
        tab_id: TabId,
        url: String,
        complete: bool,
    },
}

impl PendingUpdate {
    const fn tab_id(&self) -> TabId {
        match self {
            Self::Tab { tab, .. } => tab.id,
            Self::Navigation { tab_id, .. } => *tab_id,
        }
    }
}

struct Shared {
    host: Arc<dyn TabHost>,
    sink: Arc<dyn NavigationSink>,
    dedup: Mutex<DedupState>,
}

impl Shared {
    /// Applies the de-dup rule and, if the url passes, hands it to the sink on
    /// its own task so signal intake never waits for a refresh.
    fn process(self: &Arc<Self>, url: String, source: &'static str) {
        if !is_page_url(&url) {
            debug!(url = %url, source, "Ignoring non-page url");
            return;
        }

        let generation = {
            let mut state = self.dedup.lock().unwrap_or_else(PoisonError::into_inner);
            if state.processing && state.last_processed_url.as_deref() == Some(url.as_str()) {
                debug!(url = %url, source, "Already processing this url");
                return;
            }
            state.last_processed_url = Some(url.clone());
            state.processing = true;
            state.generation += 1;
            state.generation
        };

        info!(url = %url, source, "Navigation accepted");
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.sink.navigated(url).await;
            let mut state = shared.dedup.lock().unwrap_or_else(PoisonError::into_inner);
            if state.generation == generation {
                state.processing = false;
            }
        });
    }

    async fn process_tab(self: &Arc<Self>, tab_id: TabId, source: &'static str) {
        match self.host.get_tab(tab_id).await {
            Ok(Some(TabInfo { url: Some(url), .. })) => self.process(url, source),
            Ok(_) => debug!(tab_id, source, "Tab has no url yet"),
            Err(e) => warn!(tab_id, source, "Failed to read tab: {e}"),
        }
    }

    async fn flush(self: &Arc<Self>, pending: PendingUpdate) {
        match pending {
            PendingUpdate::Tab { status, tab } => {
                let tab_id = tab.id;
                match tab.navigation_event(status) {
                    Some(event) if event.is_active_tab && event.load_status == LoadStatus::Complete => {
                        self.process(event.url, "updated");
                    }
                    other => debug!(tab_id, event = ?other, "Skipping tab update"),
                }
            }
            PendingUpdate::Navigation {
                tab_id,
                url,
                complete,
            } => {
                if !complete {
                    debug!(tab_id, url = %url, "Skipping navigation still loading");
                    return;
                }
                match self.host.get_tab(tab_id).await {
                    Ok(Some(tab)) if tab.active => self.process(url, "navigation"),
                    Ok(_) => debug!(tab_id, "Skipping navigation in background tab"),
                    Err(e) => warn!(tab_id, "Failed to read tab: {e}"),
                }
            }
        }
    }
}

pub struct TabActivityWatcher {
    shared: Arc<Shared>,
    debounce: Duration,
    tab_delay: Duration,
}

impl TabActivityWatcher {
    #[must_use]
    pub fn new(
        host: Arc<dyn TabHost>,
        sink: Arc<dyn NavigationSink>,
        debounce: Duration,
        tab_delay: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                host,
                sink,
                dedup: Mutex::new(DedupState::default()),
            }),
            debounce,
            tab_delay,
        }
    }

    #[must_use]
    pub fn from_config(
        host: Arc<dyn TabHost>,
        sink: Arc<dyn NavigationSink>,
        config: &AppConfig,
    ) -> Self {
        Self::new(host, sink, config.debounce(), config.tab_delay())
    }

    #[must_use]
    pub fn last_processed_url(&self) -> Option<String> {
        self.shared
            .dedup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_processed_url
            .clone()
    }

    /// Spawns the intake loop over `signals`.
    #[must_use]
    pub fn spawn(self, signals: mpsc::Receiver<TabSignal>) -> TaskHandle {
        let cancel = CancellationToken::new();
        let loop_token = cancel.clone();
        let task = tokio::spawn(async move { self.run(signals, loop_token).await });
        TaskHandle::new(cancel, task)
    }

    /// Runs until `shutdown` fires or every signal sender is gone. A pending
    /// debounced update is dropped on exit.
    pub async fn run(&self, mut signals: mpsc::Receiver<TabSignal>, shutdown: CancellationToken) {
        let mut pending: Option<(PendingUpdate, Instant)> = None;

        loop {
            let deadline = pending.as_ref().map(|(_, at)| *at);
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some((update, _)) = pending.take() {
                        self.shared.flush(update).await;
                    }
                }
                signal = signals.recv() => match signal {
                    Some(signal) => self.on_signal(signal, &mut pending).await,
                    None => break,
                },
            }
        }
        debug!("Tab watcher stopped");
    }

    async fn on_signal(&self, signal: TabSignal, pending: &mut Option<(PendingUpdate, Instant)>) {
        let restart = |update: PendingUpdate| Some((update, Instant::now() + self.debounce));

        match signal {
            TabSignal::Created(tab) => {
                if !tab.active {
                    return;
                }
                let shared = Arc::clone(&self.shared);
                let delay = self.tab_delay;
                tokio::spawn(async move {
                    sleep(delay).await;
                    shared.process_tab(tab.id, "created").await;
                });
            }
            TabSignal::Activated { tab_id } => self.shared.process_tab(tab_id, "activated").await,
            TabSignal::Updated { status, tab, .. } => {
                *pending = restart(PendingUpdate::Tab { status, tab });
            }
            TabSignal::NavigationCommitted {
                tab_id,
                url,
                frame_id,
            } if frame_id == MAIN_FRAME => {
                *pending = restart(PendingUpdate::Navigation {
                    tab_id,
                    url,
                    complete: false,
                });
            }
            TabSignal::NavigationCompleted {
                tab_id,
                url,
                frame_id,
            }
            | TabSignal::HistoryStateUpdated {
                tab_id,
                url,
                frame_id,
            } if frame_id == MAIN_FRAME => {
                *pending = restart(PendingUpdate::Navigation {
                    tab_id,
                    url,
                    complete: true,
                });
            }
            TabSignal::NavigationError {
                tab_id,
                url,
                frame_id,
            } if frame_id == MAIN_FRAME => {
                warn!(tab_id, url = %url, "Navigation failed");
                if pending.as_ref().is_some_and(|(p, _)| p.tab_id() == tab_id) {
                    *pending = None;
                }
            }
            other => debug!(signal = ?other, "Ignoring sub-frame signal"),
        }
    }
}
