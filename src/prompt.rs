use tracing::warn;

use crate::core::models::{ExtractedPage, SummaryType};

/// List of disallowed patterns in custom prompts (prompt injection protection)
pub const DISALLOWED_PATTERNS: [&str; 4] = ["system:", "assistant:", "user:", "{{"];

/// Maximum length of a prompt override, checked in the settings form and
/// enforced again at request time
pub const MAX_CUSTOM_PROMPT_LENGTH: usize = 800;

/// Per-reference cap when page snapshots are folded into a chat context
pub const MAX_REFERENCE_CHARS: usize = 6000;

pub const DEFAULT_FULL_PROMPT: &str = "Summarise the content provided by the user. Be concise and \
    clear, highlight the main points, and do not leave out any key or important information.";

pub const DEFAULT_KEYINFO_PROMPT: &str = "Extract the key information from the content provided by \
    the user: main topics, important figures and data, key people, and times and places.";

pub const CHAT_BASE_PROMPT: &str = "You are a helpful assistant inside a browser side panel. \
    Answer the user's questions. When reference pages are supplied, ground your answers in them \
    and say so when they do not contain the answer.";

/// Validates a prompt override typed into the settings form.
/// Returns the sanitized prompt or a message suitable for the form.
pub fn sanitize_custom_prompt(prompt: &str) -> Result<String, String> {
    if prompt.chars().count() > MAX_CUSTOM_PROMPT_LENGTH {
        return Err(format!(
            "Custom prompt exceeds maximum length of {} characters",
            MAX_CUSTOM_PROMPT_LENGTH
        ));
    }

    let lowered = prompt.to_lowercase();
    for pattern in DISALLOWED_PATTERNS.iter() {
        if lowered.contains(pattern) {
            return Err(format!(
                "Custom prompt contains disallowed pattern: {}",
                pattern
            ));
        }
    }

    let sanitized = prompt
        .chars()
        .filter(|&c| !c.is_control())
        .collect::<String>();

    Ok(sanitized)
}

/// Remove control characters and hard-truncate for internal use
pub fn sanitize_custom_internal(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control())
        .take(MAX_CUSTOM_PROMPT_LENGTH)
        .collect()
}

#[must_use]
pub const fn default_system_prompt(summary_type: SummaryType) -> &'static str {
    match summary_type {
        SummaryType::Full => DEFAULT_FULL_PROMPT,
        SummaryType::KeyInfo => DEFAULT_KEYINFO_PROMPT,
    }
}

/// System prompt for a summary request: the user's override when it survives
/// sanitization, the built-in default otherwise.
#[must_use]
pub fn summary_system_prompt(summary_type: SummaryType, override_opt: Option<&str>) -> String {
    let accepted = override_opt.and_then(|raw| match sanitize_custom_prompt(raw) {
        Ok(clean) => Some(sanitize_custom_internal(&clean)),
        Err(reason) => {
            warn!(summary_type = %summary_type, "Ignoring prompt override: {reason}");
            None
        }
    });

    accepted
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default_system_prompt(summary_type).to_string())
}

/// System prompt for a chat turn, with each reference page appended as a
/// numbered block.
#[must_use]
pub fn chat_system_prompt(references: &[ExtractedPage]) -> String {
    let mut prompt = CHAT_BASE_PROMPT.to_string();
    if references.is_empty() {
        return prompt;
    }

    prompt.push_str("\n\nReference pages:");
    for (idx, page) in references.iter().enumerate() {
        let body: String = page
            .summarizable_content()
            .chars()
            .take(MAX_REFERENCE_CHARS)
            .collect();
        prompt.push_str(&format!(
            "\n\n[{}] {} ({})\n{}",
            idx + 1,
            page.title,
            page.url,
            body
        ));
    }
    prompt
}
