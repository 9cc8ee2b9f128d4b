//! Completion provider client.
//!
//! Talks to any OpenAI-compatible `/chat/completions` endpoint in streaming
//! mode. The engines only see the [`CompletionProvider`] and
//! [`CompletionStream`] traits, so tests drive them with scripted streams.

use async_trait::async_trait;
use futures::StreamExt;
use openai_api_rs::v1::chat_completion::{ChatCompletionMessage, Content, MessageRole};
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::sse::{ParseResult, SseParser, StreamEvent};
use crate::cancel::{Cancellable, ChannelHandle};
use crate::errors::PanelError;

const REQUEST_TIMEOUT_SECS: u64 = 300;

#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4 + 1
}

/// Builds a text-only chat message.
#[must_use]
pub fn text_message(role: MessageRole, text: impl Into<String>) -> ChatCompletionMessage {
    ChatCompletionMessage {
        role,
        content: Content::Text(text.into()),
        name: None,
        tool_calls: None,
        tool_call_id: None,
    }
}

/// System prompt followed by the page content as the user turn.
#[must_use]
pub fn build_summary_prompt(system_prompt: &str, content: &str) -> Vec<ChatCompletionMessage> {
    vec![
        text_message(MessageRole::system, system_prompt),
        text_message(MessageRole::user, content),
    ]
}

/// Endpoint credentials, taken from user settings at call time.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderAuth {
    pub api_key: String,
    pub base_url: String,
}

impl std::fmt::Debug for ProviderAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAuth")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatCompletionMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A live streamed completion.
#[async_trait]
pub trait CompletionStream: Send {
    /// Returns the next event, or `None` once the stream has finished.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures or a stream that ends without content.
    async fn next_event(&mut self) -> Result<Option<StreamEvent>, PanelError>;
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Opens a streamed completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent or the provider rejects it.
    async fn stream(
        &self,
        auth: &ProviderAuth,
        request: CompletionRequest,
    ) -> Result<Box<dyn CompletionStream>, PanelError>;
}

/// How a cancellable streamed completion ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamedText {
    Completed(String),
    Cancelled,
    Failed(String),
}

/// Opens a completion and reads it to the end under `handle`, reporting the
/// accumulated text to `on_partial` after every delta. Every read races the
/// handle, so cancellation drops the in-flight request.
pub async fn stream_text(
    provider: &dyn CompletionProvider,
    auth: &ProviderAuth,
    request: CompletionRequest,
    handle: &ChannelHandle,
    on_partial: &(dyn Fn(&str) + Send + Sync),
) -> StreamedText {
    let mut stream = match handle.run(provider.stream(auth, request)).await {
        Cancellable::Cancelled => return StreamedText::Cancelled,
        Cancellable::Completed(Ok(stream)) => stream,
        Cancellable::Completed(Err(e)) => {
            warn!(channel = %handle.channel(), "Failed to open completion stream: {e}");
            return StreamedText::Failed(e.to_string());
        }
    };

    let mut accumulated = String::new();
    loop {
        let event = match handle.run(stream.next_event()).await {
            Cancellable::Cancelled => {
                debug!(channel = %handle.channel(), "Completion stream cancelled");
                return StreamedText::Cancelled;
            }
            Cancellable::Completed(Ok(event)) => event,
            Cancellable::Completed(Err(e)) => {
                warn!(channel = %handle.channel(), "Completion stream failed: {e}");
                return StreamedText::Failed(e.to_string());
            }
        };

        match event {
            Some(StreamEvent::TextDelta(delta)) => {
                if delta.is_empty() {
                    continue;
                }
                accumulated.push_str(&delta);
                on_partial(&accumulated);
            }
            Some(StreamEvent::Finished(reason)) => {
                debug!(channel = %handle.channel(), reason = %reason, "Completion finished");
                break;
            }
            Some(StreamEvent::Error(msg)) => {
                warn!(channel = %handle.channel(), "Provider reported an error: {msg}");
                return StreamedText::Failed(msg);
            }
            None => break,
        }
    }

    // A cancel that lands after the last read still wins.
    if handle.is_cancelled() {
        return StreamedText::Cancelled;
    }
    StreamedText::Completed(accumulated)
}

/// reqwest-backed client for OpenAI-compatible chat-completions endpoints.
#[derive(Debug, Clone)]
pub struct ChatCompletionsClient {
    http: Client,
}

impl ChatCompletionsClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self, PanelError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| PanelError::HttpError(format!("Failed to build completion HTTP client: {e}")))?;
        Ok(Self { http })
    }
}

#[must_use]
pub fn completions_endpoint(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim().trim_end_matches('/'))
}

#[async_trait]
impl CompletionProvider for ChatCompletionsClient {
    async fn stream(
        &self,
        auth: &ProviderAuth,
        request: CompletionRequest,
    ) -> Result<Box<dyn CompletionStream>, PanelError> {
        #[cfg(feature = "debug-logs")]
        info!("Using completion prompt:\n{:?}", request.messages);

        let estimated_input_tokens = request
            .messages
            .iter()
            .map(|msg| match &msg.content {
                Content::Text(t) => estimate_tokens(t),
                Content::ImageUrl(_) => 0,
            })
            .sum::<usize>();
        info!(
            model = %request.model,
            messages = request.messages.len(),
            estimated_input_tokens,
            "Opening streamed completion"
        );

        let request_body = json!({
            "model": request.model,
            "messages": messages_to_json(&request.messages),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": true
        });

        let mut headers = reqwest::header::HeaderMap::new();
        let auth_value = format!("Bearer {}", auth.api_key)
            .parse()
            .map_err(|e| PanelError::HttpError(format!("Invalid Authorization header: {e}")))?;
        headers.insert("Authorization", auth_value);
        let accept_value = "text/event-stream"
            .parse()
            .map_err(|e| PanelError::HttpError(format!("Invalid Accept header: {e}")))?;
        headers.insert("Accept", accept_value);

        let response = self
            .http
            .post(completions_endpoint(&auth.base_url))
            .headers(headers)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| PanelError::HttpError(format!("Completion request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|e| {
                format!("Failed to read error response body (status {status}): {e}")
            });
            return Err(PanelError::ProviderError(format!(
                "Completion API error (status {status}): {error_text}"
            )));
        }

        Ok(Box::new(SseCompletionStream::new(Box::pin(
            response.bytes_stream(),
        ))))
    }
}

type ByteStream = Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

/// Turns a raw SSE byte stream into [`StreamEvent`]s.
pub struct SseCompletionStream {
    byte_stream: ByteStream,
    parser: SseParser,
    pending_results: VecDeque<ParseResult>,
    utf8_buffer: Vec<u8>,
    saw_finish: bool,
    saw_any_text: bool,
    completed: bool,
}

impl std::fmt::Debug for SseCompletionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseCompletionStream")
            .field("completed", &self.completed)
            .field("saw_finish", &self.saw_finish)
            .field("saw_any_text", &self.saw_any_text)
            .field("pending_results_len", &self.pending_results.len())
            .field("utf8_buffer_len", &self.utf8_buffer.len())
            .field("parser_buffer_len", &self.parser.remaining_buffer().len())
            .finish_non_exhaustive()
    }
}

impl SseCompletionStream {
    #[must_use]
    pub fn new(byte_stream: ByteStream) -> Self {
        Self {
            byte_stream,
            parser: SseParser::new(),
            pending_results: VecDeque::new(),
            utf8_buffer: Vec::new(),
            saw_finish: false,
            saw_any_text: false,
            completed: false,
        }
    }

    fn drain_pending_results(&mut self) -> Result<Option<StreamEvent>, PanelError> {
        while let Some(result) = self.pending_results.pop_front() {
            match result {
                ParseResult::Event(event) => match event {
                    StreamEvent::Finished(_) => {
                        self.saw_finish = true;
                        self.completed = true;
                        return Ok(Some(event));
                    }
                    StreamEvent::Error(_) => {
                        self.completed = true;
                        return Ok(Some(event));
                    }
                    StreamEvent::TextDelta(ref delta) => {
                        if !delta.is_empty() {
                            self.saw_any_text = true;
                        }
                        return Ok(Some(event));
                    }
                },
                ParseResult::Done => {
                    self.completed = true;
                    return self.end_of_stream("[DONE]");
                }
                ParseResult::Ignored(tag) => {
                    debug!(chunk = %tag, "Ignoring completion chunk without text");
                }
            }
        }

        Ok(None)
    }

    /// A stream that carried text but no `finish_reason` still produced a
    /// usable answer, so it is reported as finished.
    fn end_of_stream(&mut self, how: &str) -> Result<Option<StreamEvent>, PanelError> {
        if self.saw_finish {
            return Ok(None);
        }
        if self.saw_any_text {
            warn!(terminator = how, "Completion stream ended without finish_reason; treating as finished");
            self.saw_finish = true;
            return Ok(Some(StreamEvent::Finished("stop".to_string())));
        }
        warn!(terminator = how, "Completion stream ended before any content");
        Err(PanelError::ProviderError(
            "Completion stream ended before any content".to_string(),
        ))
    }

    fn feed_bytes(&mut self, bytes: &[u8]) -> Result<(), PanelError> {
        self.utf8_buffer.extend_from_slice(bytes);

        // Keep an incomplete trailing UTF-8 sequence until the next chunk arrives.
        match std::str::from_utf8(&self.utf8_buffer) {
            Ok(valid_str) => {
                self.pending_results.extend(self.parser.feed(valid_str));
                self.utf8_buffer.clear();
                Ok(())
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                if valid_up_to > 0 {
                    let valid_prefix = std::str::from_utf8(&self.utf8_buffer[..valid_up_to])
                        .map_err(|e| {
                            PanelError::ProviderError(format!(
                                "Invalid UTF-8 in completion stream prefix: {e}"
                            ))
                        })?;
                    self.pending_results.extend(self.parser.feed(valid_prefix));
                    self.utf8_buffer.drain(..valid_up_to);
                }

                if e.error_len().is_some() {
                    return Err(PanelError::ProviderError(
                        "Invalid UTF-8 in completion stream".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl CompletionStream for SseCompletionStream {
    async fn next_event(&mut self) -> Result<Option<StreamEvent>, PanelError> {
        if self.completed {
            return Ok(None);
        }

        loop {
            // Several frames can arrive in one HTTP chunk.
            if let Some(event) = self.drain_pending_results()? {
                return Ok(Some(event));
            }
            if self.completed {
                return Ok(None);
            }

            match self.byte_stream.next().await {
                Some(Ok(bytes)) => {
                    if let Err(e) = self.feed_bytes(&bytes) {
                        self.completed = true;
                        return Err(e);
                    }
                }
                Some(Err(e)) => {
                    self.completed = true;
                    return Err(PanelError::HttpError(format!(
                        "Error reading streaming response: {e}"
                    )));
                }
                None => {
                    self.completed = true;
                    return self.end_of_stream("eof");
                }
            }
        }
    }
}

/// Chat-completions wire shape: `{ role, content }` with plain-text content.
/// Image parts are dropped.
pub(crate) fn messages_to_json(messages: &[ChatCompletionMessage]) -> Vec<Value> {
    messages
        .iter()
        .filter_map(|m| {
            let role = match m.role {
                MessageRole::system => "system",
                MessageRole::user | MessageRole::function | MessageRole::tool => "user",
                MessageRole::assistant => "assistant",
            };
            match &m.content {
                Content::Text(t) => Some(json!({ "role": role, "content": t })),
                Content::ImageUrl(_) => None,
            }
        })
        .collect()
}
