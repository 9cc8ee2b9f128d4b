//! Server-Sent Events (SSE) parser for chat-completions streaming responses.
//!
//! Handles frames split across TCP chunks, several frames in one read, and
//! chunks that carry no text (role announcements, keep-alive comments).
//! Each `data:` payload is a `chat.completion.chunk` object; the stream ends
//! with a `data: [DONE]` sentinel.

use serde_json::Value;

/// Events surfaced from a chat-completions stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Text from `choices[0].delta.content`.
    TextDelta(String),
    /// The provider reported a `finish_reason`.
    Finished(String),
    /// The provider sent an error object, or the payload was unreadable.
    Error(String),
}

/// Result of parsing an SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    Event(StreamEvent),
    /// A well-formed chunk with nothing for the caller, tagged with what it carried.
    Ignored(String),
    /// End of stream signal (`[DONE]`).
    Done,
}

/// Stateful SSE parser that buffers incomplete frames across chunk boundaries.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    /// Feeds a chunk of data to the parser and returns every complete frame's results.
    pub fn feed(&mut self, chunk: &str) -> Vec<ParseResult> {
        self.buffer.push_str(chunk);
        let mut results = Vec::new();

        while let Some(event_end) = self.find_event_boundary() {
            let event_text = self.buffer[..event_end].to_string();
            self.buffer = self.buffer[event_end..]
                .trim_start_matches(['\r', '\n'])
                .to_string();

            Self::parse_event(&event_text, &mut results);
        }

        results
    }

    fn find_event_boundary(&self) -> Option<usize> {
        let lf = self.buffer.find("\n\n").map(|pos| pos + 2);
        let crlf = self.buffer.find("\r\n\r\n").map(|pos| pos + 4);
        match (lf, crlf) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn parse_event(event_text: &str, results: &mut Vec<ParseResult>) {
        let data_lines: Vec<&str> = event_text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with(':'))
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim)
            .filter(|data| !data.is_empty())
            .collect();

        if data_lines.is_empty() {
            return;
        }

        let data = data_lines.join("\n");
        if data == "[DONE]" {
            results.push(ParseResult::Done);
            return;
        }

        Self::parse_json_event(&data, results);
    }

    /// One chunk may carry both a final delta and its `finish_reason`, so a
    /// payload can yield two results.
    fn parse_json_event(data: &str, results: &mut Vec<ParseResult>) {
        let json: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                results.push(ParseResult::Event(StreamEvent::Error(format!(
                    "Failed to parse SSE JSON payload: {e}"
                ))));
                return;
            }
        };

        if let Some(error) = json.get("error") {
            results.push(ParseResult::Event(StreamEvent::Error(extract_error_message(
                error,
            ))));
            return;
        }

        let Some(choice) = json
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        else {
            let object = json.get("object").and_then(Value::as_str).unwrap_or("unknown");
            results.push(ParseResult::Ignored(object.to_string()));
            return;
        };

        let content = choice
            .get("delta")
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str);
        let finish_reason = choice.get("finish_reason").and_then(Value::as_str);

        if let Some(text) = content.filter(|t| !t.is_empty()) {
            results.push(ParseResult::Event(StreamEvent::TextDelta(text.to_string())));
        }
        if let Some(reason) = finish_reason {
            results.push(ParseResult::Event(StreamEvent::Finished(reason.to_string())));
        }
        if content.is_none_or(str::is_empty) && finish_reason.is_none() {
            let tag = if choice
                .get("delta")
                .and_then(|delta| delta.get("role"))
                .is_some()
            {
                "role"
            } else {
                "empty"
            };
            results.push(ParseResult::Ignored(tag.to_string()));
        }
    }

    /// Returns any remaining buffered data.
    #[must_use]
    pub fn remaining_buffer(&self) -> &str {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

fn extract_error_message(error: &Value) -> String {
    if let Some(msg) = error.get("message").and_then(Value::as_str) {
        return msg.to_string();
    }
    if let Some(msg) = error.as_str() {
        return msg.to_string();
    }
    "Unknown error".to_string()
}
