//! Persistence boundary — the archive store contract.
//!
//! Any backend satisfying [`ArchiveStore`] can hold the archive; the
//! core never assumes a schema. All calls are individually atomic; the
//! core performs no multi-record transactions.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{KnownMessages, KnownTopics, Message, Topic};

/// Stored message projection used by the reply-chain walk.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: String,
    pub in_reply_to: String,
    pub topic_id: String,
    pub topic_subject: String,
}

/// Partial topic update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TopicUpdate {
    pub author: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub last_update_date: Option<DateTime<Utc>>,
}

impl TopicUpdate {
    pub fn is_empty(&self) -> bool {
        self.author.is_none() && self.start_date.is_none() && self.last_update_date.is_none()
    }
}

/// Backend-agnostic persistence contract for the mail archive.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Snapshot of all archived topics, keyed by topic id.
    async fn load_known_topics(&self) -> Result<KnownTopics, StoreError>;

    /// Snapshot of all archived messages, keyed by message id.
    async fn load_known_messages(&self) -> Result<KnownMessages, StoreError>;

    /// Full topic record, for the topic-update rule.
    async fn load_topic(&self, topic_id: &str) -> Result<Option<Topic>, StoreError>;

    /// Threading projection of a stored message, for ancestor walks.
    async fn load_message(&self, message_id: &str) -> Result<Option<StoredMessage>, StoreError>;

    /// Persist a new topic. Returns its location reference.
    async fn create_topic(&self, topic: &Topic) -> Result<String, StoreError>;

    /// Apply a partial update to an existing topic.
    async fn update_topic(&self, topic_id: &str, update: TopicUpdate) -> Result<(), StoreError>;

    /// Persist a new message. Returns its location reference.
    async fn create_message(&self, message: &Message) -> Result<String, StoreError>;

    /// Re-link an already archived message to another topic.
    async fn update_message_topic_link(
        &self,
        message_id: &str,
        new_topic_id: &str,
    ) -> Result<(), StoreError>;
}
