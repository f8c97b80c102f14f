//! Archiver configuration, loaded from a TOML file.

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::model::{MailingListRule, TypeRule};

/// Mailbox protocol of a configured source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Imap,
    Imaps,
    Pop3,
}

/// Connection descriptor for one remote mailbox.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub username: String,
    pub password: SecretString,
    #[serde(default = "default_folder")]
    pub folder: String,
    /// Upper bound on messages ingested from this source per pass.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

fn default_folder() -> String {
    "INBOX".to_string()
}

fn default_max_messages() -> usize {
    200
}

fn default_timeout_secs() -> u64 {
    30
}

/// Full archiver configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiverConfig {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub type_rules: Vec<TypeRule>,
    #[serde(default)]
    pub mailing_lists: Vec<MailingListRule>,
    /// Network timeout for connect/read/write, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl ArchiverConfig {
    /// Load and validate a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "sources".into(),
                hint: "Configure at least one [[sources]] entry.".into(),
            });
        }
        for source in &self.sources {
            if source.host.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: format!("sources.{}.host", source.name),
                    message: "host must not be empty".into(),
                });
            }
            if source.port == 0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("sources.{}.port", source.name),
                    message: "port must be non-zero".into(),
                });
            }
        }
        let mut names: Vec<&str> = self.sources.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.sources.len() {
            return Err(ConfigError::InvalidValue {
                key: "sources".into(),
                message: "source names must be unique".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        connect_timeout_secs = 10

        [[sources]]
        name = "team"
        host = "imap.example.com"
        port = 993
        protocol = "imaps"
        username = "archiver"
        password = "hunter2"

        [[sources]]
        name = "support"
        host = "mail.example.org"
        port = 143
        protocol = "imap"
        username = "support"
        password = "s3cret"
        folder = "Archive"
        max_messages = 50

        [[type_rules]]
        name = "Release"
        icon = "tag"

        [[type_rules.patterns]]
        fields = ["subject"]
        pattern = 'v\d+\.\d+'

        [[mailing_lists]]
        match_substring = "dev@example.com"
        display_name = "Dev list"
        tag = "dev"
    "#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn sample_config_parses() {
        let file = write_config(SAMPLE);
        let config = ArchiverConfig::from_path(file.path()).unwrap();
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].folder, "INBOX");
        assert_eq!(config.sources[0].max_messages, 200);
        assert_eq!(config.sources[1].folder, "Archive");
        assert_eq!(config.sources[1].max_messages, 50);
        assert_eq!(config.sources[1].protocol, Protocol::Imap);
        assert_eq!(config.type_rules.len(), 1);
        assert_eq!(config.mailing_lists[0].tag, "dev");
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn empty_sources_rejected() {
        let file = write_config("connect_timeout_secs = 5\n");
        let err = ArchiverConfig::from_path(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn duplicate_source_names_rejected() {
        let config = r#"
            [[sources]]
            name = "dup"
            host = "a.example.com"
            port = 993
            protocol = "imaps"
            username = "u"
            password = "p"

            [[sources]]
            name = "dup"
            host = "b.example.com"
            port = 993
            protocol = "imaps"
            username = "u"
            password = "p"
        "#;
        let file = write_config(config);
        let err = ArchiverConfig::from_path(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn zero_port_rejected() {
        let config = r#"
            [[sources]]
            name = "bad"
            host = "a.example.com"
            port = 0
            protocol = "imap"
            username = "u"
            password = "p"
        "#;
        let file = write_config(config);
        let err = ArchiverConfig::from_path(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn unparsable_toml_reported() {
        let file = write_config("not [valid toml");
        let err = ArchiverConfig::from_path(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = ArchiverConfig::from_path("/nonexistent/config.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
