//! Topic resolution: decide which conversation an incoming message
//! belongs to, or whether it starts a new one.
//!
//! Real-world reply headers are noisy. `In-Reply-To` may be missing,
//! point at mail never archived, or carry a recycled thread id, so the
//! resolver tries progressively weaker signals before declaring a new
//! conversation: the reply chain, then the message's own topic id,
//! then an exact subject match.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::model::{KnownMessages, KnownTopics, Message};
use crate::similarity::similar;
use crate::store::ArchiveStore;

/// Outcome of resolving one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The message belongs to an already archived conversation.
    Existing { topic_id: String },
    /// No suitable conversation exists; the caller creates one keyed by
    /// the message's (possibly reassigned) topic id.
    NewTopic,
}

/// Resolve a message against the session's index snapshots.
///
/// Mutates only the message itself (topic id reassignment, reply-header
/// clearing, first-in-topic marking). The indices are read-only here;
/// the coordinator applies index updates after persisting.
pub async fn resolve(
    message: &mut Message,
    known_topics: &KnownTopics,
    known_messages: &KnownMessages,
    store: &dyn ArchiveStore,
) -> Resolution {
    // Step 1: walk the reply chain backwards through known messages,
    // as long as subjects stay similar.
    if let Some(ancestor) = walk_reply_chain(message, known_messages, store).await {
        let topic_id = known_messages[&ancestor].topic_id.clone();
        debug!(
            message_id = %message.message_id,
            ancestor = %ancestor,
            topic_id = %topic_id,
            "Resolved through reply chain"
        );
        message.is_first_in_topic = false;
        return Resolution::Existing { topic_id };
    }

    // Step 2: the message's own topic id matches a known topic with a
    // similar subject.
    if let Some(topic) = known_topics.get(&message.topic_id) {
        if similar(&message.topic_subject, &topic.subject) {
            debug!(
                message_id = %message.message_id,
                topic_id = %message.topic_id,
                "Resolved by direct topic id"
            );
            return Resolution::Existing {
                topic_id: message.topic_id.clone(),
            };
        }
        debug!(
            message_id = %message.message_id,
            topic_id = %message.topic_id,
            "Topic id known but subjects are too different"
        );
    }

    // Step 3: scan for a topic with exactly the same subject.
    let wanted = message.topic_subject.trim().to_lowercase();
    for (topic_id, topic) in known_topics {
        if topic.subject.trim().to_lowercase() != wanted {
            continue;
        }
        if !message.in_reply_to.is_empty() {
            debug!(
                message_id = %message.message_id,
                topic_id = %topic_id,
                "Resolved by exact subject"
            );
            return Resolution::Existing {
                topic_id: topic_id.clone(),
            };
        }
        // The message claims to start a thread. Attach it anyway when
        // its topic id was already seen once: some clients recycle a
        // thread id without setting reply headers.
        if known_topics.contains_key(&message.topic_id) {
            debug!(
                message_id = %message.message_id,
                topic_id = %topic_id,
                "Resolved by exact subject and previously seen topic id"
            );
            return Resolution::Existing {
                topic_id: topic_id.clone(),
            };
        }
    }

    // Step 4: new conversation. A topic id colliding with an unrelated
    // known topic is replaced by the message id, which is globally
    // unique within the archive.
    if known_topics.contains_key(&message.topic_id) {
        debug!(
            message_id = %message.message_id,
            topic_id = %message.topic_id,
            "Topic id collides with an unrelated topic, rekeying to message id"
        );
        message.topic_id = message.message_id.clone();
        message.in_reply_to.clear();
    }
    message.is_first_in_topic = true;
    Resolution::NewTopic
}

/// Follow `In-Reply-To` pointers backwards while each ancestor is known
/// and its subject stays similar to the subject tracked so far.
///
/// Returns the id of the last matched ancestor when the walk advanced
/// at least one hop. A repeated id (cycle) or a failed ancestor load
/// simply stops the walk.
async fn walk_reply_chain(
    message: &Message,
    known_messages: &KnownMessages,
    store: &dyn ArchiveStore,
) -> Option<String> {
    let mut reply_id = message.in_reply_to.clone();
    let mut tracked_subject = message.topic_subject.clone();
    let mut last_matched: Option<String> = None;
    let mut visited: HashSet<String> = HashSet::new();

    while !reply_id.is_empty() && known_messages.contains_key(&reply_id) {
        if !visited.insert(reply_id.clone()) {
            warn!(
                message_id = %message.message_id,
                reply_id = %reply_id,
                "Reply chain cycle detected, stopping walk"
            );
            break;
        }
        let ancestor = match store.load_message(&reply_id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                debug!(reply_id = %reply_id, "Indexed ancestor has no stored record, stopping walk");
                break;
            }
            Err(e) => {
                warn!(reply_id = %reply_id, error = %e, "Failed to load ancestor, stopping walk");
                break;
            }
        };
        if !similar(&tracked_subject, &ancestor.topic_subject) {
            debug!(
                reply_id = %reply_id,
                "Ancestor subject is too different, stopping walk"
            );
            break;
        }
        last_matched = Some(reply_id.clone());
        reply_id = ancestor.in_reply_to;
        tracked_subject = ancestor.topic_subject;
    }

    last_matched
}
