//! Core data model: messages, topics, index projections, and rules.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::similarity::strip_reply_marker;

/// Storage cap for identifier and subject fields.
pub const SHORT_FIELD_MAX: usize = 254;

/// Storage cap for free-text fields (bodies, address lists, references).
pub const LONG_FIELD_MAX: usize = 65_499;

/// A topic id derived from a `Thread-Index` header keeps only this prefix.
pub const THREAD_INDEX_ID_MAX: usize = 30;

// ── Message ─────────────────────────────────────────────────────────

/// Whether a message's content was extractable or withheld.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    #[default]
    Normal,
    Encrypted,
}

/// A binary part routed out of a message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    /// Content-ID header value, if the part declared one.
    pub content_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub data: Vec<u8>,
}

/// One ingested email, normalized from a raw MIME body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Source-assigned unique key, angle brackets stripped.
    pub message_id: String,
    /// Conversation key; mutable during topic resolution.
    pub topic_id: String,
    pub subject: String,
    /// Subject at time of topic assignment (`Thread-Topic` when present).
    pub topic_subject: String,
    pub in_reply_to: String,
    pub references: String,
    /// Raw address-list strings as carried by the headers.
    pub from: String,
    pub to: String,
    pub cc: String,
    /// Raw `Date` header.
    pub date: String,
    /// Parsed instant, when the raw header was decodable.
    pub decoded_date: Option<DateTime<Utc>>,
    /// Classifier output.
    pub message_type: String,
    pub sensitivity: Sensitivity,
    pub body_text: String,
    pub body_html: String,
    pub attachments: Vec<Attachment>,
    /// Content-ID → assigned attachment filename, for `cid:` rewriting.
    pub inline_content_ids: HashMap<String, String>,
    /// Full mails extracted from `message/rfc822` parts.
    pub embedded_messages: Vec<Message>,
    /// Set on messages extracted from a `message/rfc822` part.
    pub is_attached_mail: bool,
    /// Message id of the enclosing mail, for attached mails.
    pub parent_message: Option<String>,
    /// True when no resolvable ancestor was found.
    pub is_first_in_topic: bool,
    /// Mailing-list tags matched against from/to/cc.
    pub tags: Vec<String>,
}

impl Message {
    /// Clamp every textual field to its storage cap. Applied once,
    /// immediately before the persistence boundary.
    pub fn apply_storage_limits(&mut self) {
        truncate_chars(&mut self.message_id, SHORT_FIELD_MAX);
        truncate_chars(&mut self.topic_id, SHORT_FIELD_MAX);
        truncate_chars(&mut self.subject, SHORT_FIELD_MAX);
        truncate_chars(&mut self.topic_subject, SHORT_FIELD_MAX);
        truncate_chars(&mut self.in_reply_to, LONG_FIELD_MAX);
        truncate_chars(&mut self.references, LONG_FIELD_MAX);
        truncate_chars(&mut self.from, LONG_FIELD_MAX);
        truncate_chars(&mut self.to, LONG_FIELD_MAX);
        truncate_chars(&mut self.cc, LONG_FIELD_MAX);
        truncate_chars(&mut self.body_text, LONG_FIELD_MAX);
        truncate_chars(&mut self.body_html, LONG_FIELD_MAX);
        for embedded in &mut self.embedded_messages {
            embedded.apply_storage_limits();
        }
    }
}

/// Truncate a string to at most `max` characters, in place.
pub fn truncate_chars(s: &mut String, max: usize) {
    if let Some((idx, _)) = s.char_indices().nth(max) {
        s.truncate(idx);
    }
}

/// Strip surrounding whitespace and one pair of angle brackets from a
/// message-id header value.
pub fn clean_message_id(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed)
        .to_string()
}

/// Initial conversation key for a freshly parsed message: the
/// `Thread-Index` prefix when present, else the first `References`
/// entry, else the message id itself.
pub fn derive_topic_id(thread_index: Option<&str>, references: &str, message_id: &str) -> String {
    if let Some(index) = thread_index {
        let mut id = index.trim().to_string();
        truncate_chars(&mut id, THREAD_INDEX_ID_MAX);
        if !id.is_empty() {
            return id;
        }
    }
    if let Some(first) = references.split_whitespace().next() {
        return clean_message_id(first);
    }
    message_id.to_string()
}

/// Initial topic subject: `Thread-Topic` when present, else the subject
/// with one leading reply/forward marker stripped.
pub fn derive_topic_subject(thread_topic: Option<&str>, subject: &str) -> String {
    match thread_topic {
        Some(topic) if !topic.trim().is_empty() => topic.trim().to_string(),
        _ => strip_reply_marker(subject).trim().to_string(),
    }
}

// ── Topic ───────────────────────────────────────────────────────────

/// One reconstructed conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub topic_id: String,
    pub subject: String,
    /// Address of the earliest-known member message.
    pub author: String,
    pub start_date: Option<DateTime<Utc>>,
    pub last_update_date: Option<DateTime<Utc>>,
    pub topic_type: String,
    pub tags: Vec<String>,
}

impl Topic {
    /// Build the topic record for a message that starts a new conversation.
    pub fn from_first_message(message: &Message) -> Self {
        Self {
            topic_id: message.topic_id.clone(),
            subject: message.topic_subject.clone(),
            author: message.from.clone(),
            start_date: message.decoded_date,
            last_update_date: message.decoded_date,
            topic_type: message.message_type.clone(),
            tags: message.tags.clone(),
        }
    }
}

// ── Index projections ───────────────────────────────────────────────

/// Known-topic index value: the minimal projection the resolver needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSummary {
    pub location_ref: String,
    pub subject: String,
}

/// Known-message index value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSummary {
    pub subject: String,
    pub topic_id: String,
    pub location_ref: String,
}

/// In-memory snapshot of all archived topics, keyed by topic id.
pub type KnownTopics = HashMap<String, TopicSummary>;

/// In-memory snapshot of all archived messages, keyed by message id.
pub type KnownMessages = HashMap<String, MessageSummary>;

// ── Classification rules ────────────────────────────────────────────

/// Message field a classifier pattern matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    From,
    To,
    Cc,
    Subject,
}

impl MatchField {
    /// Raw field value on a message.
    pub fn value<'a>(&self, message: &'a Message) -> &'a str {
        match self {
            Self::From => &message.from,
            Self::To => &message.to,
            Self::Cc => &message.cc,
            Self::Subject => &message.subject,
        }
    }
}

/// One pattern entry of a type rule: the regex must match at least one
/// of the listed fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRule {
    pub fields: Vec<MatchField>,
    pub pattern: String,
}

/// A configured message type: all pattern entries must match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeRule {
    pub name: String,
    #[serde(default)]
    pub icon: String,
    pub patterns: Vec<PatternRule>,
}

/// Tags messages whose address fields contain a mailing-list address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailingListRule {
    pub match_substring: String,
    pub display_name: String,
    pub tag: String,
}
