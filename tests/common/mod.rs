//! Test doubles shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use sidebrief::ai::{CompletionProvider, CompletionRequest, CompletionStream, ProviderAuth, StreamEvent};
use sidebrief::cancel::CancellationRegistry;
use sidebrief::coordinator::{PageExtractor, RefreshCoordinator};
use sidebrief::core::models::{ExtractedPage, RemoteRecord};
use sidebrief::core::settings::AppSettings;
use sidebrief::errors::PanelError;
use sidebrief::storage::{CacheStore, MemoryStore, RemoteSummarySource};
use sidebrief::summary::{GenerationDefaults, SummaryEngine};

struct Scripted {
    events: VecDeque<StreamEvent>,
}

#[async_trait]
impl CompletionStream for Scripted {
    async fn next_event(&mut self) -> Result<Option<StreamEvent>, PanelError> {
        Ok(self.events.pop_front())
    }
}

/// Replays a fixed event script. With a gate set, every stream waits for the
/// gate after announcing itself on `entered`.
#[derive(Default)]
pub struct ScriptedProvider {
    pub calls: AtomicUsize,
    pub script: Vec<StreamEvent>,
    pub gate: Option<Arc<Notify>>,
    pub entered: Notify,
}

impl ScriptedProvider {
    pub fn replying(parts: &[&str]) -> Self {
        let mut script: Vec<StreamEvent> = parts
            .iter()
            .map(|p| StreamEvent::TextDelta((*p).to_string()))
            .collect();
        script.push(StreamEvent::Finished("stop".to_string()));
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn stream(
        &self,
        _auth: &ProviderAuth,
        _request: CompletionRequest,
    ) -> Result<Box<dyn CompletionStream>, PanelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(Box::new(Scripted {
            events: self.script.iter().cloned().collect(),
        }))
    }
}

/// Remote table keyed by url. Urls with a gate block until it is released.
#[derive(Default)]
pub struct FakeRemote {
    pub calls: AtomicUsize,
    pub rows: Mutex<HashMap<String, RemoteRecord>>,
    pub gates: Mutex<HashMap<String, Arc<Notify>>>,
    pub entered: Notify,
}

impl FakeRemote {
    pub fn with_row(self, url: &str, full: &str) -> Self {
        self.rows.lock().unwrap().insert(
            url.to_string(),
            RemoteRecord {
                url: url.to_string(),
                summarizer: Some(full.to_string()),
                ai_key_info: None,
            },
        );
        self
    }

    pub fn gate(&self, url: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().unwrap().insert(url.to_string(), gate.clone());
        gate
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSummarySource for FakeRemote {
    async fn fetch(&self, url: &str) -> Result<Vec<RemoteRecord>, PanelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        let gate = self.gates.lock().unwrap().get(url).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self.rows.lock().unwrap().get(url).cloned().into_iter().collect())
    }
}

#[derive(Default)]
pub struct FakeExtractor {
    pub calls: AtomicUsize,
}

#[async_trait]
impl PageExtractor for FakeExtractor {
    async fn extract(&self, url: &str) -> Result<ExtractedPage, PanelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExtractedPage {
            url: url.to_string(),
            title: "Title".to_string(),
            text: format!("Body of {url}"),
            word_count: 3,
            ..ExtractedPage::default()
        })
    }
}

pub struct Harness {
    pub cache: Arc<CacheStore>,
    pub registry: Arc<CancellationRegistry>,
    pub engine: Arc<SummaryEngine>,
    pub coordinator: Arc<RefreshCoordinator>,
    pub provider: Arc<ScriptedProvider>,
    pub remote: Arc<FakeRemote>,
}

impl Harness {
    pub fn new(provider: ScriptedProvider, remote: FakeRemote) -> Self {
        let provider = Arc::new(provider);
        let remote = Arc::new(remote);
        let cache = Arc::new(CacheStore::new(
            Arc::new(MemoryStore::new()),
            Some(remote.clone() as Arc<dyn RemoteSummarySource>),
        ));
        let registry = Arc::new(CancellationRegistry::new());
        let engine = Arc::new(SummaryEngine::new(
            cache.clone(),
            provider.clone(),
            registry.clone(),
            GenerationDefaults::default(),
        ));
        let coordinator = Arc::new(RefreshCoordinator::new(
            cache.clone(),
            engine.clone(),
            Arc::new(FakeExtractor::default()),
            registry.clone(),
        ));
        Self {
            cache,
            registry,
            engine,
            coordinator,
            provider,
            remote,
        }
    }

    pub fn with_api_key(self) -> Self {
        self.cache
            .save_settings(&AppSettings {
                openai_api_key: "sk-test".to_string(),
                ..AppSettings::default()
            })
            .unwrap();
        self
    }
}
