//! Mail source boundary: transports, connections, and the standalone
//! connection check.

pub mod imap;

pub use imap::ImapTransport;

use async_trait::async_trait;

use crate::config::SourceConfig;
use crate::error::SourceError;

/// One raw message as fetched from a source, headers and body included.
#[derive(Debug, Clone)]
pub struct RawMail {
    /// Source-native sequence id, for diagnostics.
    pub uid: String,
    pub raw: Vec<u8>,
}

/// An open connection to one mailbox.
#[async_trait]
pub trait MailConnection: Send {
    /// Fetch up to `max` unseen messages from `folder`, in mailbox order.
    async fn fetch_unseen(&mut self, folder: &str, max: usize)
    -> Result<Vec<RawMail>, SourceError>;

    /// Count unseen messages without fetching them.
    async fn unseen_count(&mut self, folder: &str) -> Result<usize, SourceError>;

    /// Close the connection. Safe to call once; further use of the
    /// connection is an illegal state.
    async fn close(&mut self) -> Result<(), SourceError>;
}

/// Opens connections for configured sources.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn connect(&self, source: &SourceConfig)
    -> Result<Box<dyn MailConnection>, SourceError>;
}

/// Standalone connection diagnostic: connect, count unseen messages,
/// close. Usable independently of an ingestion session.
pub async fn check_source(
    transport: &dyn MailTransport,
    source: &SourceConfig,
) -> Result<usize, SourceError> {
    let mut connection = transport.connect(source).await?;
    let count = connection.unseen_count(&source.folder).await;
    if let Err(e) = connection.close().await {
        tracing::debug!(source = %source.name, error = %e, "Could not close connection after check");
    }
    count
}
