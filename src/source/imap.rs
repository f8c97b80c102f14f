//! Raw IMAP/IMAPS transport over rustls.
//!
//! Deliberately small: LOGIN, SELECT, SEARCH UNSEEN, FETCH RFC822,
//! STORE \Seen, LOGOUT. Blocking socket I/O runs under
//! `spawn_blocking`; every operation honors the configured timeout so
//! a dead server surfaces as a connection error instead of a hung
//! session.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::config::{Protocol, SourceConfig};
use crate::error::SourceError;
use crate::source::{MailConnection, MailTransport, RawMail};

/// Default network timeout when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens raw IMAP/IMAPS connections.
#[derive(Debug, Clone)]
pub struct ImapTransport {
    timeout: Duration,
}

impl ImapTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ImapTransport {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl MailTransport for ImapTransport {
    async fn connect(
        &self,
        source: &SourceConfig,
    ) -> Result<Box<dyn MailConnection>, SourceError> {
        if source.protocol == Protocol::Pop3 {
            return Err(SourceError::InvalidPreferences(format!(
                "source {} requests pop3, which this transport does not speak",
                source.name
            )));
        }
        let source = source.clone();
        let timeout = self.timeout;
        let session = tokio::task::spawn_blocking(move || ImapSession::open(&source, timeout))
            .await
            .map_err(|e| SourceError::Unexpected(format!("connect task panicked: {e}")))??;
        Ok(Box::new(ImapConnection {
            session: Some(session),
        }))
    }
}

/// An open IMAP connection. The blocking session moves into
/// `spawn_blocking` for each call and back out afterwards.
pub struct ImapConnection {
    session: Option<ImapSession>,
}

impl ImapConnection {
    fn take_session(&mut self) -> Result<ImapSession, SourceError> {
        self.session
            .take()
            .ok_or_else(|| SourceError::IllegalState("connection is closed".into()))
    }
}

#[async_trait]
impl MailConnection for ImapConnection {
    async fn fetch_unseen(
        &mut self,
        folder: &str,
        max: usize,
    ) -> Result<Vec<RawMail>, SourceError> {
        let mut session = self.take_session()?;
        let folder = folder.to_string();
        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = session.fetch_unseen(&folder, max);
            (session, result)
        })
        .await
        .map_err(|e| SourceError::Unexpected(format!("fetch task panicked: {e}")))?;
        self.session = Some(session);
        result
    }

    async fn unseen_count(&mut self, folder: &str) -> Result<usize, SourceError> {
        let mut session = self.take_session()?;
        let folder = folder.to_string();
        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = session.unseen_count(&folder);
            (session, result)
        })
        .await
        .map_err(|e| SourceError::Unexpected(format!("search task panicked: {e}")))?;
        self.session = Some(session);
        result
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || session.logout())
            .await
            .map_err(|e| SourceError::Unexpected(format!("logout task panicked: {e}")))?
    }
}

// ── Blocking session ────────────────────────────────────────────────

enum ImapStream {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Read for ImapStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for ImapStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

struct ImapSession {
    stream: ImapStream,
    tag: u32,
}

impl ImapSession {
    fn open(source: &SourceConfig, timeout: Duration) -> Result<Self, SourceError> {
        let host = source.host.as_str();
        let addr = (host, source.port)
            .to_socket_addrs()
            .map_err(|_| SourceError::UnknownHost {
                host: source.host.clone(),
            })?
            .next()
            .ok_or_else(|| SourceError::UnknownHost {
                host: source.host.clone(),
            })?;

        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| SourceError::Connection(format!("connect to {host}: {e}")))?;
        tcp.set_read_timeout(Some(timeout))
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        tcp.set_write_timeout(Some(timeout))
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        let stream = match source.protocol {
            Protocol::Imap => ImapStream::Plain(tcp),
            Protocol::Imaps => {
                let mut root_store = rustls::RootCertStore::empty();
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                let tls_config = Arc::new(
                    rustls::ClientConfig::builder()
                        .with_root_certificates(root_store)
                        .with_no_client_auth(),
                );
                let server_name: rustls::pki_types::ServerName<'_> =
                    rustls::pki_types::ServerName::try_from(source.host.clone()).map_err(
                        |e| SourceError::InvalidPreferences(format!("bad host name {host}: {e}")),
                    )?;
                let conn = rustls::ClientConnection::new(tls_config, server_name)
                    .map_err(|e| SourceError::Connection(format!("TLS setup: {e}")))?;
                ImapStream::Tls(Box::new(rustls::StreamOwned::new(conn, tcp)))
            }
            Protocol::Pop3 => {
                return Err(SourceError::InvalidPreferences(
                    "pop3 is not supported by the IMAP transport".into(),
                ));
            }
        };

        let mut session = Self { stream, tag: 0 };
        let greeting = session.read_line()?;
        debug!(host, greeting = greeting.trim(), "IMAP greeting");

        let login = session.send_cmd(&format!(
            "LOGIN \"{}\" \"{}\"",
            source.username,
            source.password.expose_secret()
        ))?;
        if !ok_response(&login) {
            return Err(SourceError::AuthenticationFailed {
                host: source.host.clone(),
            });
        }

        Ok(session)
    }

    fn fetch_unseen(&mut self, folder: &str, max: usize) -> Result<Vec<RawMail>, SourceError> {
        self.select(folder)?;
        let uids = self.search_unseen()?;

        let mut mails = Vec::new();
        for uid in uids.into_iter().take(max) {
            match self.fetch_rfc822(&uid) {
                Ok(raw) => {
                    // Flag it so the next pass only sees genuinely new mail.
                    if let Err(e) = self.mark_seen(&uid) {
                        warn!(uid = %uid, error = %e, "Could not flag message as seen");
                    }
                    mails.push(RawMail { uid, raw });
                }
                Err(e) => {
                    warn!(uid = %uid, error = %e, "Failed to fetch message, skipping");
                }
            }
        }
        Ok(mails)
    }

    fn unseen_count(&mut self, folder: &str) -> Result<usize, SourceError> {
        self.select(folder)?;
        Ok(self.search_unseen()?.len())
    }

    fn select(&mut self, folder: &str) -> Result<(), SourceError> {
        let resp = self.send_cmd(&format!("SELECT \"{folder}\""))?;
        if ok_response(&resp) {
            Ok(())
        } else {
            Err(SourceError::FolderNotFound {
                folder: folder.to_string(),
            })
        }
    }

    fn search_unseen(&mut self) -> Result<Vec<String>, SourceError> {
        let resp = self.send_cmd("SEARCH UNSEEN")?;
        if !ok_response(&resp) {
            return Err(SourceError::Connection("SEARCH UNSEEN rejected".into()));
        }
        Ok(parse_search_response(&resp))
    }

    fn fetch_rfc822(&mut self, uid: &str) -> Result<Vec<u8>, SourceError> {
        let resp = self.send_cmd(&format!("FETCH {uid} RFC822"))?;
        if !ok_response(&resp) {
            return Err(SourceError::Connection(format!("FETCH {uid} rejected")));
        }
        // First line opens the literal, last line is the tagged status.
        let raw: String = resp
            .iter()
            .skip(1)
            .take(resp.len().saturating_sub(2))
            .cloned()
            .collect();
        Ok(raw.into_bytes())
    }

    fn mark_seen(&mut self, uid: &str) -> Result<(), SourceError> {
        self.send_cmd(&format!("STORE {uid} +FLAGS (\\Seen)"))?;
        Ok(())
    }

    fn logout(&mut self) -> Result<(), SourceError> {
        self.send_cmd("LOGOUT")?;
        Ok(())
    }

    fn send_cmd(&mut self, cmd: &str) -> Result<Vec<String>, SourceError> {
        self.tag += 1;
        let tag = format!("A{}", self.tag);
        let full = format!("{tag} {cmd}\r\n");
        self.stream
            .write_all(full.as_bytes())
            .and_then(|()| self.stream.flush())
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(lines)
    }

    fn read_line(&mut self) -> Result<String, SourceError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => return Err(SourceError::Connection("IMAP connection closed".into())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(SourceError::Connection(e.to_string())),
            }
        }
    }
}

/// True when the tagged status line reports OK.
fn ok_response(lines: &[String]) -> bool {
    lines.last().is_some_and(|l| l.contains("OK"))
}

/// Collect sequence ids from `* SEARCH ...` response lines.
fn parse_search_response(lines: &[String]) -> Vec<String> {
    let mut ids = Vec::new();
    for line in lines {
        if line.starts_with("* SEARCH") {
            ids.extend(line.split_whitespace().skip(2).map(str::to_string));
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn source(protocol: Protocol) -> SourceConfig {
        SourceConfig {
            name: "test".into(),
            host: "imap.example.com".into(),
            port: 993,
            protocol,
            username: "user".into(),
            password: SecretString::from("pass"),
            folder: "INBOX".into(),
            max_messages: 10,
        }
    }

    #[test]
    fn search_response_parsed() {
        let lines = vec![
            "* SEARCH 3 5 8\r\n".to_string(),
            "A2 OK SEARCH completed\r\n".to_string(),
        ];
        assert_eq!(parse_search_response(&lines), vec!["3", "5", "8"]);
    }

    #[test]
    fn empty_search_response_yields_nothing() {
        let lines = vec![
            "* SEARCH\r\n".to_string(),
            "A2 OK SEARCH completed\r\n".to_string(),
        ];
        assert!(parse_search_response(&lines).is_empty());
    }

    #[test]
    fn ok_response_checks_tagged_line() {
        let ok = vec!["* stuff\r\n".into(), "A1 OK done\r\n".into()];
        let no = vec!["A1 NO [AUTHENTICATIONFAILED]\r\n".to_string()];
        assert!(ok_response(&ok));
        assert!(!ok_response(&no));
    }

    #[tokio::test]
    async fn pop3_rejected_as_invalid_preferences() {
        let transport = ImapTransport::default();
        let err = transport.connect(&source(Protocol::Pop3)).await.err().unwrap();
        assert!(matches!(err, SourceError::InvalidPreferences(_)));
        assert_eq!(err.label(), "invalid_preferences");
    }

    #[tokio::test]
    async fn operations_on_closed_connection_are_illegal() {
        let mut connection = ImapConnection { session: None };
        let err = connection.fetch_unseen("INBOX", 10).await.unwrap_err();
        assert!(matches!(err, SourceError::IllegalState(_)));
        // Closing again stays quiet.
        assert!(connection.close().await.is_ok());
    }

    #[tokio::test]
    async fn unknown_host_classified() {
        let transport = ImapTransport::new(Duration::from_millis(200));
        let mut cfg = source(Protocol::Imaps);
        cfg.host = "no-such-host.invalid".into();
        let err = transport.connect(&cfg).await.err().unwrap();
        assert!(matches!(err, SourceError::UnknownHost { .. }));
    }
}
