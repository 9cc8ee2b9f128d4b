//! Reference-augmented chat sessions on the `chat` channel.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use openai_api_rs::v1::chat_completion::{ChatCompletionMessage, MessageRole};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ai::client::{CompletionProvider, CompletionRequest, StreamedText, stream_text, text_message};
use crate::cancel::{CancellationRegistry, Channel};
use crate::core::models::{ChatMessage, ChatRole, ChatSession, ExtractedPage};
use crate::core::settings::AppSettings;
use crate::errors::PanelError;
use crate::prompt::chat_system_prompt;
use crate::storage::cache::CacheStore;
use crate::summary::{GenerationDefaults, MISSING_API_KEY_MESSAGE};

pub const DEFAULT_CHAT_TITLE: &str = "New chat";
const TITLE_MAX_CHARS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    Replied(ChatMessage),
    Busy,
    NoContent,
    ConfigError(String),
    ProviderError(String),
    Cancelled,
}

#[derive(Debug, Default)]
struct ChatState {
    current_id: Option<String>,
    sending: bool,
}

struct SendingGuard<'a> {
    state: &'a Mutex<ChatState>,
}

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sending = false;
    }
}

/// Sessions and references live in the store; only the selected session and
/// the sending flag are held here.
pub struct ChatEngine {
    cache: Arc<CacheStore>,
    provider: Arc<dyn CompletionProvider>,
    registry: Arc<CancellationRegistry>,
    defaults: GenerationDefaults,
    state: Mutex<ChatState>,
}

fn title_from(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() > TITLE_MAX_CHARS {
        let head: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
        format!("{head}...")
    } else {
        trimmed.to_string()
    }
}

impl ChatEngine {
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
            state: Mutex::new(ChatState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<ChatSession> {
        self.cache.load_chat_history()
    }

    #[must_use]
    pub fn current_id(&self) -> Option<String> {
        self.lock().current_id.clone()
    }

    #[must_use]
    pub fn current(&self) -> Option<ChatSession> {
        let id = self.current_id()?;
        self.sessions().into_iter().find(|s| s.id == id)
    }

    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.lock().sending
    }

    /// Starts an empty session, selects it and stores it first in the history.
    ///
    /// # Errors
    ///
    /// Returns an error if the history cannot be saved.
    pub fn new_chat(&self) -> Result<ChatSession, PanelError> {
        let now = Utc::now();
        let session = ChatSession {
            id: Uuid::new_v4().to_string(),
            title: DEFAULT_CHAT_TITLE.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        let mut history = self.cache.load_chat_history();
        history.insert(0, session.clone());
        self.cache.save_chat_history(&history)?;
        self.lock().current_id = Some(session.id.clone());
        info!(chat_id = %session.id, "Created chat");
        Ok(session)
    }

    /// Selects a stored session.
    pub fn load_chat(&self, id: &str) -> Option<ChatSession> {
        let session = self.sessions().into_iter().find(|s| s.id == id)?;
        self.lock().current_id = Some(session.id.clone());
        Some(session)
    }

    /// # Errors
    ///
    /// Returns an error if the history cannot be saved.
    pub fn delete_chat(&self, id: &str) -> Result<bool, PanelError> {
        let mut history = self.cache.load_chat_history();
        let before = history.len();
        history.retain(|s| s.id != id);
        if history.len() == before {
            return Ok(false);
        }
        self.cache.save_chat_history(&history)?;

        let mut state = self.lock();
        if state.current_id.as_deref() == Some(id) {
            state.current_id = None;
        }
        info!(chat_id = %id, "Deleted chat");
        Ok(true)
    }

    /// # Errors
    ///
    /// Returns an error if the history cannot be saved.
    pub fn rename_chat(&self, id: &str, title: &str) -> Result<bool, PanelError> {
        let renamed = self.update_session(id, |session| {
            session.title = title.trim().to_string();
        })?;
        Ok(renamed.is_some())
    }

    fn update_session<F>(&self, id: &str, apply: F) -> Result<Option<ChatSession>, PanelError>
    where
        F: FnOnce(&mut ChatSession),
    {
        let mut history = self.cache.load_chat_history();
        let Some(session) = history.iter_mut().find(|s| s.id == id) else {
            return Ok(None);
        };
        apply(session);
        session.updated_at = Utc::now();
        let updated = session.clone();
        self.cache.save_chat_history(&history)?;
        Ok(Some(updated))
    }

    #[must_use]
    pub fn references(&self) -> Vec<ExtractedPage> {
        self.cache.load_references()
    }

    /// Adds a page to the chat context. Pages without text and pages whose url
    /// is already referenced are refused.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference list cannot be saved.
    pub fn add_reference(&self, page: ExtractedPage) -> Result<bool, PanelError> {
        if page.summarizable_content().trim().is_empty() {
            debug!(url = %page.url, "Reference without text refused");
            return Ok(false);
        }
        let mut references = self.cache.load_references();
        if references.iter().any(|r| r.url == page.url) {
            debug!(url = %page.url, "Reference already present");
            return Ok(false);
        }
        info!(url = %page.url, "Added chat reference");
        references.push(page);
        self.cache.save_references(&references)?;
        Ok(true)
    }

    /// # Errors
    ///
    /// Returns an error if the reference list cannot be saved.
    pub fn remove_reference(&self, index: usize) -> Result<Option<ExtractedPage>, PanelError> {
        let mut references = self.cache.load_references();
        if index >= references.len() {
            return Ok(None);
        }
        let removed = references.remove(index);
        self.cache.save_references(&references)?;
        Ok(Some(removed))
    }

    /// Cancels the reply being streamed, if any.
    pub fn abort(&self) {
        self.registry.cancel(Channel::Chat);
    }

    /// Sends `text` in the selected session (creating one if needed) and
    /// streams the reply. `on_partial` receives the accumulated reply.
    pub async fn send_message(
        &self,
        text: &str,
        settings: &AppSettings,
        on_partial: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<ChatOutcome, PanelError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(ChatOutcome::NoContent);
        }

        let _guard = {
            let mut state = self.lock();
            if state.sending {
                return Ok(ChatOutcome::Busy);
            }
            state.sending = true;
            SendingGuard { state: &self.state }
        };

        let Some((auth, model)) = self.defaults.resolve(settings) else {
            return Ok(ChatOutcome::ConfigError(MISSING_API_KEY_MESSAGE.to_string()));
        };

        let chat_id = match self.current() {
            Some(session) => session.id,
            None => self.new_chat()?.id,
        };

        let user_message = ChatMessage {
            role: ChatRole::User,
            content: text.to_string(),
            timestamp: Utc::now(),
        };
        let Some(session) = self.update_session(&chat_id, |session| {
            let first_user_turn = !session.messages.iter().any(|m| m.role == ChatRole::User);
            if first_user_turn && session.title == DEFAULT_CHAT_TITLE {
                session.title = title_from(text);
            }
            session.messages.push(user_message.clone());
        })?
        else {
            return Err(PanelError::StorageError(format!("chat {chat_id} disappeared")));
        };

        let request = CompletionRequest {
            model,
            messages: self.build_messages(&session),
            max_tokens: self.defaults.max_tokens,
            temperature: self.defaults.temperature,
        };

        let handle = self.registry.begin(Channel::Chat);
        let streamed = stream_text(self.provider.as_ref(), &auth, request, &handle, on_partial).await;
        self.registry.end(&handle);

        match streamed {
            StreamedText::Completed(reply) => {
                let assistant = ChatMessage {
                    role: ChatRole::Assistant,
                    content: reply,
                    timestamp: Utc::now(),
                };
                self.update_session(&chat_id, |session| session.messages.push(assistant.clone()))?;
                info!(chat_id = %chat_id, "Chat reply stored");
                Ok(ChatOutcome::Replied(assistant))
            }
            StreamedText::Cancelled => {
                debug!(chat_id = %chat_id, "Chat reply cancelled");
                Ok(ChatOutcome::Cancelled)
            }
            StreamedText::Failed(msg) => {
                // The failed question is dropped so a retry does not repeat it.
                self.update_session(&chat_id, |session| {
                    if session.messages.last() == Some(&user_message) {
                        session.messages.pop();
                    }
                })?;
                warn!(chat_id = %chat_id, "Chat reply failed: {msg}");
                Ok(ChatOutcome::ProviderError(msg))
            }
        }
    }

    fn build_messages(&self, session: &ChatSession) -> Vec<ChatCompletionMessage> {
        let mut messages = vec![text_message(
            MessageRole::system,
            chat_system_prompt(&self.references()),
        )];
        messages.extend(session.messages.iter().filter_map(|m| match m.role {
            ChatRole::User => Some(text_message(MessageRole::user, m.content.clone())),
            ChatRole::Assistant => Some(text_message(MessageRole::assistant, m.content.clone())),
            ChatRole::System => None,
        }));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::client::{CompletionStream, ProviderAuth};
    use crate::ai::sse::StreamEvent;
    use crate::storage::kv::MemoryStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct Scripted(VecDeque<StreamEvent>);

    #[async_trait]
    impl CompletionStream for Scripted {
        async fn next_event(&mut self) -> Result<Option<StreamEvent>, PanelError> {
            Ok(self.0.pop_front())
        }
    }

    /// Replies with a fixed script and remembers the prompts it saw.
    struct EchoProvider {
        script: Vec<StreamEvent>,
        seen: Mutex<Vec<Vec<ChatCompletionMessage>>>,
    }

    #[async_trait]
    impl CompletionProvider for EchoProvider {
        async fn stream(
            &self,
            _auth: &ProviderAuth,
            request: CompletionRequest,
        ) -> Result<Box<dyn CompletionStream>, PanelError> {
            self.seen.lock().unwrap().push(request.messages);
            Ok(Box::new(Scripted(self.script.iter().cloned().collect())))
        }
    }

    fn engine(script: Vec<StreamEvent>) -> (Arc<EchoProvider>, ChatEngine) {
        let provider = Arc::new(EchoProvider {
            script,
            seen: Mutex::new(Vec::new()),
        });
        let cache = Arc::new(CacheStore::new(Arc::new(MemoryStore::new()), None));
        let engine = ChatEngine::new(
            cache,
            provider.clone(),
            Arc::new(CancellationRegistry::new()),
            GenerationDefaults::default(),
        );
        (provider, engine)
    }

    fn settings() -> AppSettings {
        AppSettings {
            openai_api_key: "sk-test".to_string(),
            ..AppSettings::default()
        }
    }

    fn page(url: &str, text: &str) -> ExtractedPage {
        ExtractedPage {
            url: url.to_string(),
            title: "Title".to_string(),
            text: text.to_string(),
            ..ExtractedPage::default()
        }
    }

    #[tokio::test]
    async fn first_message_creates_and_titles_chat() {
        let (_, engine) = engine(vec![
            StreamEvent::TextDelta("Sure".to_string()),
            StreamEvent::Finished("stop".to_string()),
        ]);

        let outcome = engine
            .send_message("What is this page about, in short?", &settings(), &|_: &str| {})
            .await
            .unwrap();

        assert!(matches!(outcome, ChatOutcome::Replied(ref m) if m.content == "Sure"));
        let session = engine.current().unwrap();
        assert_eq!(session.title, "What is this page ab...");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].role, ChatRole::Assistant);
        assert!(!engine.is_sending());
    }

    #[tokio::test]
    async fn references_reach_the_system_prompt() {
        let (provider, engine) = engine(vec![StreamEvent::TextDelta("ok".to_string())]);
        assert!(engine.add_reference(page("https://a.example", "alpha body")).unwrap());
        assert!(!engine.add_reference(page("https://a.example", "again")).unwrap());

        engine.send_message("hi", &settings(), &|_: &str| {}).await.unwrap();

        let seen = provider.seen.lock().unwrap();
        let system = &seen[0][0];
        assert!(matches!(system.role, MessageRole::system));
        match &system.content {
            openai_api_rs::v1::chat_completion::Content::Text(t) => assert!(t.contains("alpha body")),
            other => panic!("expected text content, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_reply_drops_the_question() {
        let (_, engine) = engine(vec![StreamEvent::Error("overloaded".to_string())]);

        let outcome = engine.send_message("hello", &settings(), &|_: &str| {}).await.unwrap();

        assert_eq!(outcome, ChatOutcome::ProviderError("overloaded".to_string()));
        assert!(engine.current().unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn abort_mid_reply_keeps_the_question() {
        let (_, engine) = engine(vec![
            StreamEvent::TextDelta("Half an".to_string()),
            StreamEvent::TextDelta(" answer".to_string()),
            StreamEvent::Finished("stop".to_string()),
        ]);

        let outcome = engine
            .send_message("hello", &settings(), &|_: &str| engine.abort())
            .await
            .unwrap();

        assert_eq!(outcome, ChatOutcome::Cancelled);
        let messages = engine.current().unwrap().messages;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, ChatRole::User);
        assert_eq!(messages[0].content, "hello");
        assert!(!engine.is_sending());
        assert!(engine.registry.current(Channel::Chat).is_none());
    }

    #[tokio::test]
    async fn missing_key_changes_nothing() {
        let (_, engine) = engine(Vec::new());
        let outcome = engine
            .send_message("hello", &AppSettings::default(), &|_: &str| {})
            .await
            .unwrap();
        assert!(matches!(outcome, ChatOutcome::ConfigError(_)));
        assert!(engine.sessions().is_empty());
    }

    #[test]
    fn session_management() {
        let (_, engine) = engine(Vec::new());
        let first = engine.new_chat().unwrap();
        let second = engine.new_chat().unwrap();

        let ids: Vec<String> = engine.sessions().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![second.id.clone(), first.id.clone()]);

        assert!(engine.rename_chat(&first.id, " Research ").unwrap());
        assert_eq!(engine.load_chat(&first.id).unwrap().title, "Research");
        assert_eq!(engine.current_id(), Some(first.id.clone()));

        assert!(engine.delete_chat(&first.id).unwrap());
        assert_eq!(engine.current_id(), None);
        assert!(!engine.delete_chat(&first.id).unwrap());
    }

    #[test]
    fn remove_reference_by_index() {
        let (_, engine) = engine(Vec::new());
        engine.add_reference(page("a", "one")).unwrap();
        engine.add_reference(page("b", "two")).unwrap();

        assert_eq!(engine.remove_reference(0).unwrap().unwrap().url, "a");
        assert!(engine.remove_reference(5).unwrap().is_none());
        assert_eq!(engine.references().len(), 1);
    }
}
