/// Sidebrief - the request-lifecycle and cache core of a browser side panel
/// that summarises the page the user is looking at.
///
/// The host browser feeds tab and navigation signals in; the panel shows a
/// summary for the current page, looked up in a local cache, then a shared
/// remote table, and generated on demand through a streaming chat-completions
/// endpoint.
///
/// # Architecture
///
/// - `tabs` turns noisy host signals into one navigation per page
/// - `coordinator` owns the display state and guards it against stale results
/// - `summary` walks the cache tiers and streams generations
/// - `chat` runs reference-augmented chat sessions
/// - `storage` holds the key-value store, remote source, cache and sweeper
/// - `cancel` keeps one cancellable operation per channel
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use async_trait::async_trait;
/// use sidebrief::ai::ChatCompletionsClient;
/// use sidebrief::cancel::CancellationRegistry;
/// use sidebrief::coordinator::{PageExtractor, RefreshCoordinator};
/// use sidebrief::core::config::AppConfig;
/// use sidebrief::core::models::ExtractedPage;
/// use sidebrief::errors::PanelError;
/// use sidebrief::storage::{CacheStore, RetentionSweeper};
/// use sidebrief::summary::{GenerationDefaults, SummaryEngine};
///
/// struct Extractor;
///
/// #[async_trait]
/// impl PageExtractor for Extractor {
///     async fn extract(&self, url: &str) -> Result<ExtractedPage, PanelError> {
///         Ok(ExtractedPage { url: url.to_string(), ..ExtractedPage::default() })
///     }
/// }
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() -> Result<(), PanelError> {
///     sidebrief::setup_logging();
///
///     let config = AppConfig::from_env()?;
///     let cache = Arc::new(CacheStore::from_config(&config)?);
///     let _sweeper = RetentionSweeper::new(cache.clone(), config.sweep_interval()).spawn();
///     let registry = Arc::new(CancellationRegistry::new());
///     let engine = Arc::new(SummaryEngine::new(
///         cache.clone(),
///         Arc::new(ChatCompletionsClient::new()?),
///         registry.clone(),
///         GenerationDefaults::from(&config),
///     ));
///     let coordinator = RefreshCoordinator::new(cache, engine, Arc::new(Extractor), registry);
///
///     coordinator.navigated("https://example.com/article").await;
///     println!("{:?}", coordinator.display());
///     Ok(())
/// }
/// ```
// Module declarations
pub mod ai;
pub mod cancel;
pub mod chat;
pub mod coordinator;
pub mod core;
pub mod errors;
pub mod prompt;
pub mod storage;
pub mod summary;
pub mod tabs;

/// Configure structured JSON logging.
///
/// The level comes from `RUST_LOG` and defaults to `info` (`debug` with the
/// `debug-logs` feature). Calling it again after a subscriber is installed is
/// a no-op.
///
/// # Example
///
/// ```
/// sidebrief::setup_logging();
/// ```
pub fn setup_logging() {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    #[cfg(feature = "debug-logs")]
    let default_level = "debug";
    #[cfg(not(feature = "debug-logs"))]
    let default_level = "info";

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let fmt_layer = tracing_subscriber::fmt::layer().json().with_target(true);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
