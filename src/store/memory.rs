//! In-memory archive store.
//!
//! Default backing for the binary and the test double for the session
//! coordinator. Location references use a stable `topics/{id}` /
//! `messages/{id}` scheme.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::model::{KnownMessages, KnownTopics, Message, MessageSummary, Topic, TopicSummary};
use crate::store::{ArchiveStore, StoredMessage, TopicUpdate};

#[derive(Debug, Default)]
pub struct MemoryStore {
    topics: RwLock<HashMap<String, Topic>>,
    messages: RwLock<HashMap<String, Message>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored topics.
    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    /// Number of stored messages.
    pub async fn message_count(&self) -> usize {
        self.messages.read().await.len()
    }

    /// Fetch a stored message by id, for assertions in tests.
    pub async fn message(&self, message_id: &str) -> Option<Message> {
        self.messages.read().await.get(message_id).cloned()
    }

    /// Fetch a stored topic by id, for assertions in tests.
    pub async fn topic(&self, topic_id: &str) -> Option<Topic> {
        self.topics.read().await.get(topic_id).cloned()
    }

    fn topic_ref(topic_id: &str) -> String {
        format!("topics/{topic_id}")
    }

    fn message_ref(message_id: &str) -> String {
        format!("messages/{message_id}")
    }
}

#[async_trait]
impl ArchiveStore for MemoryStore {
    async fn load_known_topics(&self) -> Result<KnownTopics, StoreError> {
        Ok(self
            .topics
            .read()
            .await
            .iter()
            .map(|(id, topic)| {
                (
                    id.clone(),
                    TopicSummary {
                        location_ref: Self::topic_ref(id),
                        subject: topic.subject.clone(),
                    },
                )
            })
            .collect())
    }

    async fn load_known_messages(&self) -> Result<KnownMessages, StoreError> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .map(|(id, message)| {
                (
                    id.clone(),
                    MessageSummary {
                        subject: message.subject.clone(),
                        topic_id: message.topic_id.clone(),
                        location_ref: Self::message_ref(id),
                    },
                )
            })
            .collect())
    }

    async fn load_topic(&self, topic_id: &str) -> Result<Option<Topic>, StoreError> {
        Ok(self.topics.read().await.get(topic_id).cloned())
    }

    async fn load_message(&self, message_id: &str) -> Result<Option<StoredMessage>, StoreError> {
        Ok(self
            .messages
            .read()
            .await
            .get(message_id)
            .map(|m| StoredMessage {
                message_id: m.message_id.clone(),
                in_reply_to: m.in_reply_to.clone(),
                topic_id: m.topic_id.clone(),
                topic_subject: m.topic_subject.clone(),
            }))
    }

    async fn create_topic(&self, topic: &Topic) -> Result<String, StoreError> {
        let mut topics = self.topics.write().await;
        if topics.contains_key(&topic.topic_id) {
            return Err(StoreError::Conflict {
                entity: "topic",
                id: topic.topic_id.clone(),
            });
        }
        topics.insert(topic.topic_id.clone(), topic.clone());
        Ok(Self::topic_ref(&topic.topic_id))
    }

    async fn update_topic(&self, topic_id: &str, update: TopicUpdate) -> Result<(), StoreError> {
        let mut topics = self.topics.write().await;
        let topic = topics.get_mut(topic_id).ok_or_else(|| StoreError::NotFound {
            entity: "topic",
            id: topic_id.to_string(),
        })?;
        if let Some(author) = update.author {
            topic.author = author;
        }
        if let Some(start) = update.start_date {
            topic.start_date = Some(start);
        }
        if let Some(last) = update.last_update_date {
            topic.last_update_date = Some(last);
        }
        Ok(())
    }

    async fn create_message(&self, message: &Message) -> Result<String, StoreError> {
        let mut messages = self.messages.write().await;
        if messages.contains_key(&message.message_id) {
            return Err(StoreError::Conflict {
                entity: "message",
                id: message.message_id.clone(),
            });
        }
        messages.insert(message.message_id.clone(), message.clone());
        Ok(Self::message_ref(&message.message_id))
    }

    async fn update_message_topic_link(
        &self,
        message_id: &str,
        new_topic_id: &str,
    ) -> Result<(), StoreError> {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(message_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "message",
                id: message_id.to_string(),
            })?;
        message.topic_id = new_topic_id.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Sensitivity;
    use chrono::Utc;

    fn topic(id: &str, subject: &str) -> Topic {
        Topic {
            topic_id: id.into(),
            subject: subject.into(),
            author: "alice@example.com".into(),
            start_date: Some(Utc::now()),
            last_update_date: Some(Utc::now()),
            topic_type: "mail".into(),
            tags: Vec::new(),
        }
    }

    fn message(id: &str, topic_id: &str) -> Message {
        Message {
            message_id: id.into(),
            topic_id: topic_id.into(),
            subject: "s".into(),
            topic_subject: "s".into(),
            in_reply_to: String::new(),
            references: String::new(),
            from: String::new(),
            to: String::new(),
            cc: String::new(),
            date: String::new(),
            decoded_date: None,
            message_type: "mail".into(),
            sensitivity: Sensitivity::Normal,
            body_text: String::new(),
            body_html: String::new(),
            attachments: Vec::new(),
            inline_content_ids: HashMap::new(),
            embedded_messages: Vec::new(),
            is_attached_mail: false,
            parent_message: None,
            is_first_in_topic: false,
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn snapshots_project_minimal_fields() {
        let store = MemoryStore::new();
        store.create_topic(&topic("t1", "Launch plan")).await.unwrap();
        store.create_message(&message("m1", "t1")).await.unwrap();

        let topics = store.load_known_topics().await.unwrap();
        assert_eq!(topics["t1"].subject, "Launch plan");
        assert_eq!(topics["t1"].location_ref, "topics/t1");

        let messages = store.load_known_messages().await.unwrap();
        assert_eq!(messages["m1"].topic_id, "t1");
    }

    #[tokio::test]
    async fn duplicate_create_is_a_conflict() {
        let store = MemoryStore::new();
        store.create_message(&message("m1", "t1")).await.unwrap();
        let err = store.create_message(&message("m1", "t1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { entity: "message", .. }));
    }

    #[tokio::test]
    async fn partial_update_leaves_other_fields() {
        let store = MemoryStore::new();
        let original = topic("t1", "Subject");
        store.create_topic(&original).await.unwrap();

        store
            .update_topic(
                "t1",
                TopicUpdate {
                    author: Some("bob@example.com".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let updated = store.topic("t1").await.unwrap();
        assert_eq!(updated.author, "bob@example.com");
        assert_eq!(updated.start_date, original.start_date);
    }

    #[tokio::test]
    async fn topic_link_update_rewrites_only_link() {
        let store = MemoryStore::new();
        store.create_message(&message("m1", "t1")).await.unwrap();
        store.update_message_topic_link("m1", "t2").await.unwrap();
        assert_eq!(store.message("m1").await.unwrap().topic_id, "t2");
    }

    #[tokio::test]
    async fn update_missing_entity_is_not_found() {
        let store = MemoryStore::new();
        let err = store.update_message_topic_link("nope", "t").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
