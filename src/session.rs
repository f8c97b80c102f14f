//! Ingestion session coordination.
//!
//! One session: load the index snapshots, visit every configured
//! source in order, pull unseen mail, and drive extraction,
//! classification, and topic resolution for each message. Failures are
//! contained at the smallest possible scope: a failing message or
//! source is counted and logged, never fatal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::classify::Classifier;
use crate::config::{ArchiverConfig, SourceConfig};
use crate::error::{Error, SessionError};
use crate::extract;
use crate::model::{KnownMessages, KnownTopics, Message, MessageSummary, Topic, TopicSummary};
use crate::resolve::{self, Resolution};
use crate::source::{MailTransport, RawMail};
use crate::store::{ArchiveStore, TopicUpdate};

// ── Cancellation ────────────────────────────────────────────────────

/// Cooperative cancellation flag, checked between sources and between
/// messages. Cancelling yields an orderly partial session, not a failure.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ── Reports ─────────────────────────────────────────────────────────

/// Terminal state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Completed,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Per-source ingestion counts.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub name: String,
    /// `"ok"` or the connection-failure label.
    pub connection: String,
    /// When the connection check ran, if the source was reachable.
    pub checked_at: Option<DateTime<Utc>>,
    /// Unseen messages reported by the connection check.
    pub unseen_at_check: Option<usize>,
    /// Messages returned by the source this pass.
    pub seen: usize,
    /// Newly archived messages.
    pub loaded: usize,
    /// Duplicates, including corrected topic linkages.
    pub skipped: usize,
    /// Messages that failed to ingest.
    pub failed: usize,
}

impl SourceReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            connection: "ok".to_string(),
            checked_at: None,
            unseen_at_check: None,
            seen: 0,
            loaded: 0,
            skipped: 0,
            failed: 0,
        }
    }
}

/// Session-level summary handed back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub sources: Vec<SourceReport>,
}

impl SessionReport {
    pub fn seen(&self) -> usize {
        self.sources.iter().map(|s| s.seen).sum()
    }

    pub fn loaded(&self) -> usize {
        self.sources.iter().map(|s| s.loaded).sum()
    }

    pub fn skipped(&self) -> usize {
        self.sources.iter().map(|s| s.skipped).sum()
    }

    pub fn failed(&self) -> usize {
        self.sources.iter().map(|s| s.failed).sum()
    }
}

/// Result of asking the coordinator for a session.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The session ran; individual sources or messages may still have failed.
    Completed(SessionReport),
    /// Another session holds the in-progress flag; nothing was done.
    AlreadyRunning,
    /// The session aborted before any source was attempted.
    Failed(SessionError),
}

// ── Coordinator ─────────────────────────────────────────────────────

enum IngestOutcome {
    Loaded,
    DuplicateSkipped,
    LinkCorrected,
}

/// Owns one archive's ingestion: configuration, store, transport, and
/// the single in-progress flag.
pub struct SessionCoordinator {
    config: ArchiverConfig,
    store: Arc<dyn ArchiveStore>,
    transport: Arc<dyn MailTransport>,
    classifier: Classifier,
    in_progress: AtomicBool,
}

/// Releases the in-progress flag on every exit path.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SessionCoordinator {
    pub fn new(
        config: ArchiverConfig,
        store: Arc<dyn ArchiveStore>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        let classifier = Classifier::new(&config.type_rules, &config.mailing_lists);
        Self {
            config,
            store,
            transport,
            classifier,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Run one ingestion session over all configured sources.
    ///
    /// Non-blocking exclusivity: a second caller observing a running
    /// session returns [`SessionOutcome::AlreadyRunning`] immediately.
    pub async fn run(&self, cancel: &CancelToken) -> SessionOutcome {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("Ingestion session already in progress, refusing to start another");
            return SessionOutcome::AlreadyRunning;
        }
        let _guard = RunningGuard(&self.in_progress);

        let started_at = Utc::now();
        info!("Starting mail ingestion session");

        let snapshots = async {
            let topics = self.store.load_known_topics().await?;
            let messages = self.store.load_known_messages().await?;
            Ok::<_, crate::error::StoreError>((topics, messages))
        }
        .await;
        let (mut known_topics, mut known_messages) = match snapshots {
            Ok(snapshots) => snapshots,
            Err(e) => {
                error!(error = %e, "Failed to load index snapshots, aborting session");
                return SessionOutcome::Failed(SessionError::IndexLoad(e));
            }
        };
        debug!(
            topics = known_topics.len(),
            messages = known_messages.len(),
            "Index snapshots loaded"
        );

        let mut sources = Vec::with_capacity(self.config.sources.len());
        for source in &self.config.sources {
            if cancel.is_cancelled() {
                info!(source = %source.name, "Session cancelled, stopping before source");
                break;
            }
            sources.push(
                self.process_source(source, &mut known_topics, &mut known_messages, cancel)
                    .await,
            );
        }

        let report = SessionReport {
            state: SessionState::Completed,
            started_at,
            finished_at: Utc::now(),
            cancelled: cancel.is_cancelled(),
            sources,
        };
        info!(
            seen = report.seen(),
            loaded = report.loaded(),
            skipped = report.skipped(),
            failed = report.failed(),
            "Ingestion session completed"
        );
        SessionOutcome::Completed(report)
    }

    /// Ingest one source. Connection failures are classified and
    /// recorded; they never propagate.
    async fn process_source(
        &self,
        source: &SourceConfig,
        known_topics: &mut KnownTopics,
        known_messages: &mut KnownMessages,
        cancel: &CancelToken,
    ) -> SourceReport {
        info!(source = %source.name, host = %source.host, "Loading mail from source");
        let mut report = SourceReport::new(&source.name);

        let mut connection = match self.transport.connect(source).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(source = %source.name, error = %e, "Connection failed, skipping source");
                report.connection = e.label().to_string();
                return report;
            }
        };

        report.checked_at = Some(Utc::now());
        match connection.unseen_count(&source.folder).await {
            Ok(count) => report.unseen_at_check = Some(count),
            Err(e) => debug!(source = %source.name, error = %e, "Connection check count failed"),
        }

        let mails = match connection
            .fetch_unseen(&source.folder, source.max_messages)
            .await
        {
            Ok(mails) => mails,
            Err(e) => {
                warn!(source = %source.name, error = %e, "Fetch failed, skipping source");
                report.connection = e.label().to_string();
                if let Err(e) = connection.close().await {
                    debug!(source = %source.name, error = %e, "Could not close connection");
                }
                return report;
            }
        };
        report.seen = mails.len();
        debug!(source = %source.name, count = mails.len(), "Fetched unseen messages");

        for mail in &mails {
            if cancel.is_cancelled() {
                info!(source = %source.name, "Session cancelled, stopping mid-source");
                break;
            }
            match self.ingest_one(mail, known_topics, known_messages).await {
                Ok(IngestOutcome::Loaded) => report.loaded += 1,
                Ok(IngestOutcome::DuplicateSkipped | IngestOutcome::LinkCorrected) => {
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(
                        source = %source.name,
                        uid = %mail.uid,
                        error = %e,
                        "Failed to ingest message"
                    );
                    report.failed += 1;
                }
            }
        }

        if let Err(e) = connection.close().await {
            debug!(source = %source.name, error = %e, "Could not close connection");
        }
        report
    }

    /// Extract, classify, resolve, and persist one raw message.
    async fn ingest_one(
        &self,
        mail: &RawMail,
        known_topics: &mut KnownTopics,
        known_messages: &mut KnownMessages,
    ) -> Result<IngestOutcome, Error> {
        let mut message = extract::parse_mail(&mail.raw);
        message.message_type = self.classifier.classify(&message).to_string();
        message.tags = self.classifier.tags(&message);

        let resolution =
            resolve::resolve(&mut message, known_topics, known_messages, self.store.as_ref())
                .await;
        let topic_id = match &resolution {
            Resolution::Existing { topic_id } => topic_id.clone(),
            Resolution::NewTopic => message.topic_id.clone(),
        };
        message.topic_id = topic_id.clone();

        // Duplicate: at most the topic linkage gets corrected.
        if let Some(existing) = known_messages.get(&message.message_id) {
            if existing.topic_id == topic_id {
                debug!(message_id = %message.message_id, "Message already archived, nothing to update");
                return Ok(IngestOutcome::DuplicateSkipped);
            }
            info!(
                message_id = %message.message_id,
                old_topic = %existing.topic_id,
                new_topic = %topic_id,
                "Correcting topic linkage of archived message"
            );
            self.store
                .update_message_topic_link(&message.message_id, &topic_id)
                .await?;
            if let Some(entry) = known_messages.get_mut(&message.message_id) {
                entry.topic_id = topic_id;
            }
            return Ok(IngestOutcome::LinkCorrected);
        }

        match &resolution {
            Resolution::NewTopic => {
                let topic = Topic::from_first_message(&message);
                let location_ref = self.store.create_topic(&topic).await?;
                debug!(topic_id = %topic.topic_id, subject = %topic.subject, "Created new topic");
                known_topics.insert(
                    topic.topic_id.clone(),
                    TopicSummary {
                        location_ref,
                        subject: topic.subject,
                    },
                );
            }
            Resolution::Existing { topic_id } => {
                self.update_existing_topic(topic_id, &message).await?;
            }
        }

        message.apply_storage_limits();
        let embedded = std::mem::take(&mut message.embedded_messages);
        let location_ref = self.store.create_message(&message).await?;
        debug!(
            message_id = %message.message_id,
            topic_id = %message.topic_id,
            message_type = %message.message_type,
            "Archived message"
        );
        known_messages.insert(
            message.message_id.clone(),
            MessageSummary {
                subject: message.subject.clone(),
                topic_id: message.topic_id.clone(),
                location_ref,
            },
        );

        // Attached mails become subordinate messages in the parent's
        // topic; they are never topic-resolved themselves.
        for mut sub in embedded {
            if known_messages.contains_key(&sub.message_id) {
                debug!(message_id = %sub.message_id, "Attached mail already archived");
                continue;
            }
            sub.topic_id = message.topic_id.clone();
            match self.store.create_message(&sub).await {
                Ok(location_ref) => {
                    known_messages.insert(
                        sub.message_id.clone(),
                        MessageSummary {
                            subject: sub.subject.clone(),
                            topic_id: sub.topic_id.clone(),
                            location_ref,
                        },
                    );
                }
                Err(e) => {
                    warn!(message_id = %sub.message_id, error = %e, "Failed to archive attached mail");
                }
            }
        }

        Ok(IngestOutcome::Loaded)
    }

    /// Fold a member message into an existing topic's author and date
    /// range. Each branch fires independently.
    async fn update_existing_topic(
        &self,
        topic_id: &str,
        message: &Message,
    ) -> Result<(), crate::error::StoreError> {
        let Some(topic) = self.store.load_topic(topic_id).await? else {
            warn!(topic_id, "Resolved topic has no stored record, skipping update");
            return Ok(());
        };

        let is_more_recent = message
            .decoded_date
            .zip(topic.last_update_date)
            .is_some_and(|(date, last)| date > last);
        let is_more_ancient = message
            .decoded_date
            .zip(topic.start_date)
            .is_some_and(|(date, start)| date < start);

        if !(message.is_first_in_topic || is_more_recent) {
            return Ok(());
        }

        let mut update = TopicUpdate::default();
        if (topic.author != message.from && is_more_ancient) || topic.author.is_empty() {
            update.author = Some(message.from.clone());
        }
        if (topic.start_date.is_none() || is_more_ancient) && message.decoded_date.is_some() {
            update.start_date = message.decoded_date;
        }
        if is_more_recent {
            update.last_update_date = message.decoded_date;
        }

        if !update.is_empty() {
            debug!(
                topic_id,
                author = update.author.is_some(),
                start_date = update.start_date.is_some(),
                last_update_date = update.last_update_date.is_some(),
                "Updating topic from member message"
            );
            self.store.update_topic(topic_id, update).await?;
        }
        Ok(())
    }
}
