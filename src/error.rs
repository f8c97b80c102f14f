//! Error types for the mail archiver.

/// Top-level error type for the archiver.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Mail source error: {0}")]
    Source(#[from] SourceError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Connection-level failures for a mail source.
///
/// One variant per diagnosable outcome; these are reported per source
/// and never abort an ingestion session.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Invalid source preferences: {0}")]
    InvalidPreferences(String),

    #[error("Authentication failed for {host}")]
    AuthenticationFailed { host: String },

    #[error("Folder not found: {folder}")]
    FolderNotFound { folder: String },

    #[error("Unknown host: {host}")]
    UnknownHost { host: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Illegal connection state: {0}")]
    IllegalState(String),

    #[error("Unexpected source failure: {0}")]
    Unexpected(String),
}

impl SourceError {
    /// Stable label for session reports and diagnostics output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::InvalidPreferences(_) => "invalid_preferences",
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::FolderNotFound { .. } => "folder_not_found",
            Self::UnknownHost { .. } => "unknown_host",
            Self::Connection(_) => "connection_error",
            Self::IllegalState(_) => "illegal_state",
            Self::Unexpected(_) => "unexpected_failure",
        }
    }
}

/// Persistence-boundary errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Entity already exists: {entity} with id {id}")]
    Conflict { entity: &'static str, id: String },
}

/// Session-fatal errors. Anything less (a failing source, a failing
/// message) is counted and logged, never raised.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to load archive index snapshots: {0}")]
    IndexLoad(#[source] StoreError),
}

/// Result type alias for the archiver.
pub type Result<T> = std::result::Result<T, Error>;
