//! IMAP transport and session operations
//!
//! Provides timeout-bounded wrappers around `async-imap` operations and the
//! [`MailSession`]/[`SessionFactory`] implementations built on them. All
//! connections use implicit TLS with the webpki root store.

use std::sync::Arc;
use std::time::Duration;

use async_imap::types::{Fetch, NameAttribute};
use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::TryStreamExt;
use rustls::crypto::aws_lc_rs;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::config::MailConfig;
use crate::errors::{AppError, AppResult};
use crate::session::{FolderEntry, MailSession, SessionFactory, Traced};

/// Type alias for authenticated IMAP session over TLS
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// Connect to IMAP server and authenticate
///
/// Performs full connection sequence with timeouts:
/// 1. TCP connect
/// 2. TLS handshake with webpki root certificates
/// 3. Read IMAP greeting
/// 4. LOGIN authentication
///
/// # Errors
///
/// - `Validation` if the hostname is invalid for TLS SNI
/// - `Timeout` if any connection phase times out
/// - `Connection` for TCP, TLS, greeting or LOGIN failures
pub async fn connect_authenticated(config: &MailConfig) -> AppResult<ImapSession> {
    let connect_duration = Duration::from_millis(config.connect_timeout_ms);
    let greeting_duration = Duration::from_millis(config.greeting_timeout_ms);

    let tcp = timeout(
        connect_duration,
        TcpStream::connect((config.imap_host.as_str(), config.imap_port)),
    )
    .await
    .map_err(|_| AppError::Timeout("IMAP tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Connection(format!("IMAP tcp connect failed: {e}"))))?;

    let connector = TlsConnector::from(Arc::new(tls_config()?));

    let server_name = ServerName::try_from(config.imap_host.clone())
        .map_err(|_| AppError::invalid("invalid IMAP host for TLS SNI"))?;
    let tls_stream = timeout(greeting_duration, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("IMAP TLS handshake timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|e| AppError::Connection(format!("IMAP TLS handshake failed: {e}")))
        })?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(greeting_duration, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Connection(format!("IMAP greeting failed: {e}"))))?;

    if greeting.is_none() {
        return Err(AppError::Connection(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    let pass = config.password.expose_secret();
    let session = timeout(greeting_duration, client.login(config.email.as_str(), pass))
        .await
        .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|(e, _)| AppError::Connection(format!("IMAP login rejected: {e}")))
        })?;

    Ok(session)
}

/// Client TLS settings: webpki roots over the aws-lc-rs provider
///
/// Never consults the process-default provider.
pub fn tls_config() -> AppResult<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| AppError::Connection(format!("TLS setup failed: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

/// Opens traced IMAP sessions for the configured account
pub struct ImapConnector {
    config: Arc<MailConfig>,
}

impl ImapConnector {
    pub fn new(config: Arc<MailConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for ImapConnector {
    fn host(&self) -> &str {
        &self.config.imap_host
    }

    async fn open(&self) -> AppResult<Box<dyn MailSession>> {
        let session = connect_authenticated(&self.config).await?;
        Ok(Box::new(Traced::new(ImapMailSession {
            session,
            command_timeout: Duration::from_millis(self.config.socket_timeout_ms),
        })))
    }
}

/// [`MailSession`] over a live `async-imap` session
pub struct ImapMailSession {
    session: ImapSession,
    command_timeout: Duration,
}

impl ImapMailSession {
    /// Fetch a single message with custom query
    ///
    /// Runs a `UID FETCH` for a specific UID and returns the first result.
    ///
    /// # Errors
    ///
    /// - `Protocol` if the UID does not exist or the server rejects the fetch
    /// - `Timeout` if the command or its response stream stalls
    async fn fetch_one(&mut self, uid: u32, query: &str) -> AppResult<Fetch> {
        let stream = timeout(
            self.command_timeout,
            self.session.uid_fetch(uid.to_string(), query),
        )
        .await
        .map_err(|_| AppError::Timeout("UID FETCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("uid fetch failed: {e}"))))?;
        let fetches: Vec<Fetch> = timeout(self.command_timeout, stream.try_collect())
            .await
            .map_err(|_| AppError::Timeout("UID FETCH stream timed out".to_owned()))
            .and_then(|r| {
                r.map_err(|e| AppError::Protocol(format!("uid fetch stream failed: {e}")))
            })?;

        fetches
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Protocol(format!("message uid {uid} not found")))
    }
}

#[async_trait]
impl MailSession for ImapMailSession {
    async fn noop(&mut self) -> AppResult<()> {
        timeout(self.command_timeout, self.session.noop())
            .await
            .map_err(|_| AppError::Timeout("NOOP timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Connection(format!("NOOP failed: {e}"))))
    }

    async fn select(&mut self, folder: &str) -> AppResult<()> {
        timeout(self.command_timeout, self.session.select(folder))
            .await
            .map_err(|_| AppError::Timeout(format!("SELECT timed out for folder '{folder}'")))
            .and_then(|r| {
                r.map_err(|e| AppError::Protocol(format!("cannot select folder '{folder}': {e}")))
            })?;
        Ok(())
    }

    async fn examine(&mut self, folder: &str) -> AppResult<()> {
        timeout(self.command_timeout, self.session.examine(folder))
            .await
            .map_err(|_| AppError::Timeout(format!("EXAMINE timed out for folder '{folder}'")))
            .and_then(|r| {
                r.map_err(|e| AppError::Protocol(format!("cannot examine folder '{folder}': {e}")))
            })?;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        timeout(self.command_timeout, self.session.close())
            .await
            .map_err(|_| AppError::Timeout("CLOSE timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Protocol(format!("CLOSE failed: {e}"))))
    }

    /// List all visible folders
    async fn list_folders(&mut self) -> AppResult<Vec<FolderEntry>> {
        let stream = timeout(self.command_timeout, self.session.list(None, Some("*")))
            .await
            .map_err(|_| AppError::Timeout("LIST timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Protocol(format!("LIST failed: {e}"))))?;

        let names: Vec<_> = timeout(self.command_timeout, stream.try_collect::<Vec<_>>())
            .await
            .map_err(|_| AppError::Timeout("LIST stream timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Protocol(format!("LIST stream failed: {e}"))))?;

        Ok(names
            .iter()
            .map(|name| FolderEntry {
                name: name.name().to_owned(),
                attributes: name.attributes().iter().map(attribute_label).collect(),
            })
            .collect())
    }

    async fn uid_search(&mut self, criteria: &str) -> AppResult<Vec<u32>> {
        let set = timeout(self.command_timeout, self.session.uid_search(criteria))
            .await
            .map_err(|_| AppError::Timeout("UID SEARCH timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Protocol(format!("uid search failed: {e}"))))?;
        let mut uids: Vec<u32> = set.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// Uses `BODY.PEEK` so listing never flips `\Seen`
    async fn fetch_headers(&mut self, uid: u32) -> AppResult<Vec<u8>> {
        let fetch = self
            .fetch_one(
                uid,
                "UID BODY.PEEK[HEADER.FIELDS (DATE FROM TO CC SUBJECT)]",
            )
            .await?;
        fetch
            .header()
            .or_else(|| fetch.body())
            .map(<[u8]>::to_vec)
            .ok_or_else(|| AppError::Protocol(format!("headers of message {uid} not available")))
    }

    async fn fetch_message(&mut self, uid: u32) -> AppResult<Vec<u8>> {
        let fetch = self.fetch_one(uid, "UID RFC822").await?;
        fetch
            .body()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| AppError::Protocol(format!("message {uid} has no RFC822 body")))
    }

    async fn append(
        &mut self,
        folder: &str,
        flags: Option<&str>,
        content: &[u8],
    ) -> AppResult<()> {
        timeout(
            self.command_timeout,
            self.session.append(folder, flags, None, content),
        )
        .await
        .map_err(|_| AppError::Timeout(format!("APPEND timed out for folder '{folder}'")))
        .and_then(|r| {
            r.map_err(|e| AppError::Protocol(format!("APPEND to '{folder}' failed: {e}")))
        })
    }

    async fn logout(&mut self) -> AppResult<()> {
        timeout(self.command_timeout, self.session.logout())
            .await
            .map_err(|_| AppError::Timeout("LOGOUT timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Protocol(format!("LOGOUT failed: {e}"))))
    }
}

/// Render a LIST attribute in wire form, e.g. `\Sent`
fn attribute_label(attribute: &NameAttribute<'_>) -> String {
    let label = match attribute {
        NameAttribute::NoInferiors => "\\Noinferiors",
        NameAttribute::NoSelect => "\\Noselect",
        NameAttribute::Marked => "\\Marked",
        NameAttribute::Unmarked => "\\Unmarked",
        NameAttribute::All => "\\All",
        NameAttribute::Archive => "\\Archive",
        NameAttribute::Drafts => "\\Drafts",
        NameAttribute::Flagged => "\\Flagged",
        NameAttribute::Junk => "\\Junk",
        NameAttribute::Sent => "\\Sent",
        NameAttribute::Trash => "\\Trash",
        NameAttribute::Extension(raw) => return raw.to_string(),
        _ => return format!("{attribute:?}"),
    };
    label.to_owned()
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::env::VarError;

    use async_imap::types::NameAttribute;
    use tokio::net::TcpListener;

    use super::{attribute_label, connect_authenticated, tls_config};
    use crate::config::MailConfig;
    use crate::errors::AppError;

    #[test]
    fn attribute_labels_use_wire_form() {
        assert_eq!(attribute_label(&NameAttribute::Sent), "\\Sent");
        assert_eq!(attribute_label(&NameAttribute::NoSelect), "\\Noselect");
        assert_eq!(
            attribute_label(&NameAttribute::Extension(Cow::Borrowed("\\HasNoChildren"))),
            "\\HasNoChildren"
        );
    }

    #[test]
    fn tls_config_builds_with_webpki_roots() {
        let config = tls_config().expect("tls config");
        assert!(config.alpn_protocols.is_empty());
    }

    #[tokio::test]
    async fn handshake_failure_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port().to_string();
        tokio::spawn(async move {
            // Accept and hang up before any TLS bytes are exchanged
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let vars = [
            ("EMAIL_ADDRESS", "me@example.org"),
            ("EMAIL_PASSWORD", "secret"),
            ("IMAP_SERVER", "127.0.0.1"),
            ("IMAP_PORT", port.as_str()),
            ("MAIL_CONNECT_TIMEOUT_MS", "2000"),
            ("MAIL_GREETING_TIMEOUT_MS", "2000"),
        ];
        let config = MailConfig::load_with(|key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_owned())
                .ok_or(VarError::NotPresent)
        })
        .expect("config");

        let err = connect_authenticated(&config).await.expect_err("must fail");
        assert!(matches!(err, AppError::Connection(ref msg) if msg.contains("TLS")), "{err}");
    }
}
