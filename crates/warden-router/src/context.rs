//! Per-message routing context.
//!
//! Built once from a [`MessageEvent`] and discarded after dispatch. Never
//! persisted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use warden_access::PolicyInput;

const PRIVATE_CHAT_TYPE: &str = "private";
const RETRY_KEYWORDS: [&str; 2] = ["retry", "/retry"];
const EXPLAIN_KEYWORDS: [&str; 3] = ["explain", "/explain", "why"];
const SUMMARY_KEYWORDS: [&str; 5] = ["summarize", "summarise", "summary", "/summary", "tldr"];
const DEFAULT_FEEDBACK_PREFIXES: [&str; 3] = ["feedback:", "fb:", "#feedback"];

/// Inbound message as normalized by a platform adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub channel: String,
    pub chat_id: String,
    #[serde(default)]
    pub chat_type: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub reply_to_text: Option<String>,
    #[serde(default)]
    pub text: String,
    /// Adapter-detected addressing (entity mention, reply to the bot).
    #[serde(default)]
    pub mentions_bot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplicitIntent {
    Explain,
    Summarize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSettings {
    /// Usernames without the leading `@`, compared case-insensitively.
    #[serde(default)]
    pub bot_usernames: Vec<String>,
    #[serde(default = "default_feedback_prefixes")]
    pub feedback_prefixes: Vec<String>,
    #[serde(default)]
    pub default_project_id: Option<String>,
    #[serde(default)]
    pub project_by_chat: BTreeMap<String, String>,
    #[serde(default)]
    pub window_spec_by_project: BTreeMap<String, String>,
    #[serde(default)]
    pub default_window_spec_id: Option<String>,
}

fn default_feedback_prefixes() -> Vec<String> {
    DEFAULT_FEEDBACK_PREFIXES
        .iter()
        .map(|prefix| prefix.to_string())
        .collect()
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            bot_usernames: Vec::new(),
            feedback_prefixes: default_feedback_prefixes(),
            default_project_id: None,
            project_by_chat: BTreeMap::new(),
            window_spec_by_project: BTreeMap::new(),
            default_window_spec_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteContext {
    pub event: MessageEvent,
    pub is_group: bool,
    pub mentions_bot: bool,
    pub has_reply: bool,
    pub raw_text: String,
    pub cleaned_text: String,
    pub is_slash_command: bool,
    pub explicit_intent: Option<ExplicitIntent>,
    pub feedback: bool,
    pub allow_resolve: bool,
    pub explicit_retry: bool,
    pub project_id: Option<String>,
    pub window_spec_id: Option<String>,
}

impl RouteContext {
    pub fn build(event: MessageEvent, settings: &RouteSettings) -> Self {
        let raw_text = event.text.clone();
        let chat_type = event.chat_type.trim().to_ascii_lowercase();
        let is_group = !chat_type.is_empty() && chat_type != PRIVATE_CHAT_TYPE;

        let (without_mentions, text_mention) = strip_bot_mentions(raw_text.trim(), settings);
        let mentions_bot = event.mentions_bot || text_mention;
        let mut cleaned = if is_group && mentions_bot {
            without_mentions
        } else {
            raw_text.trim().to_string()
        };

        let feedback = match strip_feedback_prefix(&cleaned, &settings.feedback_prefixes) {
            Some(rest) => {
                cleaned = rest;
                true
            }
            None => false,
        };

        let explicit_retry = match strip_leading_keyword(&cleaned, &RETRY_KEYWORDS) {
            Some(rest) => {
                cleaned = rest;
                true
            }
            None => false,
        };

        let explicit_intent = first_word(&cleaned).and_then(|word| {
            let word = word.to_ascii_lowercase();
            if EXPLAIN_KEYWORDS.contains(&word.as_str()) {
                Some(ExplicitIntent::Explain)
            } else if SUMMARY_KEYWORDS.contains(&word.as_str()) {
                Some(ExplicitIntent::Summarize)
            } else {
                None
            }
        });
        let is_slash_command = cleaned.starts_with('/');
        let allow_resolve = !is_slash_command && (!is_group || mentions_bot);

        let project_id = settings
            .project_by_chat
            .get(event.chat_id.trim())
            .cloned()
            .or_else(|| settings.default_project_id.clone());
        let window_spec_id = project_id
            .as_deref()
            .and_then(|project| settings.window_spec_by_project.get(project).cloned())
            .or_else(|| settings.default_window_spec_id.clone());
        let has_reply = event
            .reply_to_id
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty());

        Self {
            event,
            is_group,
            mentions_bot,
            has_reply,
            raw_text,
            cleaned_text: cleaned,
            is_slash_command,
            explicit_intent,
            feedback,
            allow_resolve,
            explicit_retry,
            project_id,
            window_spec_id,
        }
    }

    pub fn policy_input(&self, capability: &str) -> PolicyInput {
        PolicyInput {
            channel: self.event.channel.trim().to_string(),
            chat_id: self.event.chat_id.trim().to_string(),
            chat_type: self.event.chat_type.trim().to_ascii_lowercase(),
            user_id: self.event.user_id.trim().to_string(),
            capability: capability.to_string(),
            is_group: self.is_group,
            mentions_bot: self.mentions_bot,
            has_reply: self.has_reply,
        }
    }

    /// Cleaned text with the first word removed.
    pub fn arguments(&self) -> &str {
        self.cleaned_text
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim())
            .unwrap_or("")
    }

    pub fn first_word_lowercase(&self) -> Option<String> {
        first_word(&self.cleaned_text).map(str::to_ascii_lowercase)
    }
}

fn first_word(text: &str) -> Option<&str> {
    text.split_whitespace().next()
}

/// Removes `@bot` tokens (and `/cmd@bot` suffixes). Returns the cleaned text
/// and whether any configured username was present.
fn strip_bot_mentions(text: &str, settings: &RouteSettings) -> (String, bool) {
    if settings.bot_usernames.is_empty() {
        return (text.to_string(), false);
    }
    let usernames: Vec<String> = settings
        .bot_usernames
        .iter()
        .map(|name| name.trim().trim_start_matches('@').to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    let mut mentioned = false;
    let mut kept = Vec::new();
    for token in text.split_whitespace() {
        let (head, mention) = match token.rsplit_once('@') {
            Some((head, name)) => (head, name.trim_end_matches([',', ':', '.', '!', '?'])),
            None => (token, ""),
        };
        if !mention.is_empty() && usernames.contains(&mention.to_ascii_lowercase()) {
            mentioned = true;
            if !head.is_empty() {
                kept.push(head);
            }
            continue;
        }
        kept.push(token);
    }
    (kept.join(" "), mentioned)
}

fn strip_feedback_prefix(text: &str, prefixes: &[String]) -> Option<String> {
    let lowered = text.to_ascii_lowercase();
    prefixes
        .iter()
        .map(|prefix| prefix.trim().to_ascii_lowercase())
        .filter(|prefix| !prefix.is_empty())
        .find(|prefix| lowered.starts_with(prefix.as_str()))
        .map(|prefix| text[prefix.len()..].trim().to_string())
}

fn strip_leading_keyword(text: &str, keywords: &[&str]) -> Option<String> {
    let word = first_word(text)?;
    if !keywords.contains(&word.to_ascii_lowercase().as_str()) {
        return None;
    }
    Some(text.trim_start()[word.len()..].trim().to_string())
}
