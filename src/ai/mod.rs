//! Completion provider access: SSE parsing and the streaming client.

pub mod client;
pub mod sse;

pub use client::{
    ChatCompletionsClient, CompletionProvider, CompletionRequest, CompletionStream, ProviderAuth,
    StreamedText, build_summary_prompt, estimate_tokens, stream_text, text_message,
};
pub use sse::StreamEvent;
