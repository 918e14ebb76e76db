//! Mailbox session management
//!
//! [`MailSession`] is the seam between mail operations and the IMAP
//! transport; [`SessionFactory`] opens authenticated sessions for one
//! account. [`Mailbox`] owns a single session for the lifetime of a tool
//! invocation: it guarantees a healthy session with the requested folder
//! selected before folder-scoped work, and closes and logs out at the end.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};

/// One entry of the server's folder listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderEntry {
    /// Raw folder name as the server reports it (modified UTF-7)
    pub name: String,
    /// Folder attributes, e.g. `\HasNoChildren`, `\Sent`
    pub attributes: Vec<String>,
}

impl FolderEntry {
    /// Folder name as a person reads it
    pub fn display_name(&self) -> String {
        display_name(&self.name)
    }
}

/// Decode a modified UTF-7 folder name
pub fn display_name(wire: &str) -> String {
    utf7_imap::decode_utf7_imap(wire.to_owned())
}

/// Encode a folder name as modified UTF-7 for SELECT, EXAMINE and APPEND
pub fn wire_name(folder: &str) -> String {
    utf7_imap::encode_utf7_imap(folder.to_owned())
}

/// Commands a live, authenticated mail session must support
///
/// Implemented by the IMAP transport and by test doubles. Message ids are
/// IMAP UIDs.
#[async_trait]
pub trait MailSession: Send {
    /// Liveness probe
    async fn noop(&mut self) -> AppResult<()>;
    /// Select a folder read-write
    async fn select(&mut self, folder: &str) -> AppResult<()>;
    /// Select a folder read-only
    async fn examine(&mut self, folder: &str) -> AppResult<()>;
    /// Close the currently selected folder
    async fn close(&mut self) -> AppResult<()>;
    async fn list_folders(&mut self) -> AppResult<Vec<FolderEntry>>;
    /// Search the selected folder; UIDs in ascending order
    async fn uid_search(&mut self, criteria: &str) -> AppResult<Vec<u32>>;
    /// Header block of one message, without marking it read
    async fn fetch_headers(&mut self, uid: u32) -> AppResult<Vec<u8>>;
    /// Full RFC 5322 source of one message
    async fn fetch_message(&mut self, uid: u32) -> AppResult<Vec<u8>>;
    async fn append(&mut self, folder: &str, flags: Option<&str>, content: &[u8])
    -> AppResult<()>;
    async fn logout(&mut self) -> AppResult<()>;
}

/// Opens authenticated sessions against one configured account
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Mail server host name, used for provider fingerprinting
    fn host(&self) -> &str;
    async fn open(&self) -> AppResult<Box<dyn MailSession>>;
}

/// Session decorator that logs every command with its latency and outcome
pub struct Traced<S> {
    inner: S,
}

impl<S: MailSession> Traced<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

async fn traced<T, F>(command: &'static str, argument: &str, fut: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    let started = Instant::now();
    let result = fut.await;
    let elapsed_ms = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
    match &result {
        Ok(_) => debug!(command, argument, elapsed_ms, "imap command ok"),
        Err(e) => debug!(command, argument, elapsed_ms, error = %e, "imap command failed"),
    }
    result
}

#[async_trait]
impl<S: MailSession> MailSession for Traced<S> {
    async fn noop(&mut self) -> AppResult<()> {
        traced("NOOP", "", self.inner.noop()).await
    }

    async fn select(&mut self, folder: &str) -> AppResult<()> {
        traced("SELECT", folder, self.inner.select(folder)).await
    }

    async fn examine(&mut self, folder: &str) -> AppResult<()> {
        traced("EXAMINE", folder, self.inner.examine(folder)).await
    }

    async fn close(&mut self) -> AppResult<()> {
        traced("CLOSE", "", self.inner.close()).await
    }

    async fn list_folders(&mut self) -> AppResult<Vec<FolderEntry>> {
        traced("LIST", "*", self.inner.list_folders()).await
    }

    async fn uid_search(&mut self, criteria: &str) -> AppResult<Vec<u32>> {
        traced("UID SEARCH", criteria, self.inner.uid_search(criteria)).await
    }

    async fn fetch_headers(&mut self, uid: u32) -> AppResult<Vec<u8>> {
        let argument = uid.to_string();
        traced("UID FETCH HEADER", &argument, self.inner.fetch_headers(uid)).await
    }

    async fn fetch_message(&mut self, uid: u32) -> AppResult<Vec<u8>> {
        let argument = uid.to_string();
        traced("UID FETCH RFC822", &argument, self.inner.fetch_message(uid)).await
    }

    async fn append(
        &mut self,
        folder: &str,
        flags: Option<&str>,
        content: &[u8],
    ) -> AppResult<()> {
        traced("APPEND", folder, self.inner.append(folder, flags, content)).await
    }

    async fn logout(&mut self) -> AppResult<()> {
        traced("LOGOUT", "", self.inner.logout()).await
    }
}

/// Session manager for a single tool invocation
///
/// Tracks the selected folder and can transparently replace a dead session
/// with a fresh one for the same account. Always finish with
/// [`Mailbox::release`] or [`Mailbox::shutdown`].
pub struct Mailbox {
    factory: Arc<dyn SessionFactory>,
    session: Box<dyn MailSession>,
    selected: Option<String>,
}

impl Mailbox {
    /// Open and authenticate a new session
    ///
    /// # Errors
    ///
    /// Propagates the factory's `Connection` or `Timeout` error.
    pub async fn open(factory: Arc<dyn SessionFactory>) -> AppResult<Self> {
        let session = factory.open().await?;
        Ok(Self {
            factory,
            session,
            selected: None,
        })
    }

    pub fn host(&self) -> &str {
        self.factory.host()
    }

    /// Direct access to the underlying session
    pub fn session(&mut self) -> &mut dyn MailSession {
        self.session.as_mut()
    }

    /// Make `folder` the active selection on a healthy session
    ///
    /// `folder` is the readable name (as shown by `list-folders`); it is
    /// encoded to modified UTF-7 on the wire. Probes liveness with NOOP and
    /// reconnects once if the probe fails, then selects `folder`. When that
    /// fails and `folder` is not INBOX, INBOX is selected instead. Returns
    /// the readable name of the folder actually selected. Re-selecting the
    /// current folder simply re-issues SELECT.
    ///
    /// # Errors
    ///
    /// - `Connection` if the reconnect fails
    /// - `Timeout` if SELECT hangs past the command timeout
    /// - `FolderSelection` if neither `folder` nor the fallback can be selected
    pub async fn ensure_selected(&mut self, folder: &str) -> AppResult<String> {
        if let Err(e) = self.session.noop().await {
            warn!(error = %e, "mail session is not responding, reconnecting");
            self.reconnect().await?;
        }

        self.selected = None;
        let wire = wire_name(folder);
        let first = match self.session.select(&wire).await {
            Ok(()) => {
                self.selected = Some(wire);
                return Ok(folder.to_owned());
            }
            Err(e @ AppError::Timeout(_)) => return Err(e),
            Err(e) => e,
        };

        if folder.eq_ignore_ascii_case("inbox") {
            warn!(folder, error = %first, "cannot select folder");
            return Err(AppError::FolderSelection {
                folder: folder.to_owned(),
            });
        }

        warn!(folder, error = %first, "cannot select folder, falling back to INBOX");
        match self.session.select("INBOX").await {
            Ok(()) => {
                self.selected = Some("INBOX".to_owned());
                Ok("INBOX".to_owned())
            }
            Err(e @ AppError::Timeout(_)) => Err(e),
            Err(e) => {
                warn!(error = %e, "INBOX fallback failed");
                Err(AppError::FolderSelection {
                    folder: folder.to_owned(),
                })
            }
        }
    }

    /// Replace the current session with a freshly authenticated one
    pub async fn reconnect(&mut self) -> AppResult<()> {
        let fresh = self.factory.open().await?;
        // The stale connection is dropped without LOGOUT; it is already dead.
        drop(std::mem::replace(&mut self.session, fresh));
        self.selected = None;
        info!(host = self.factory.host(), "reconnected mail session");
        Ok(())
    }

    /// Close the selected folder (if any) and log out
    ///
    /// Failures are logged and swallowed; the connection is released either way.
    pub async fn shutdown(mut self) {
        if self.selected.take().is_some()
            && let Err(e) = self.session.close().await
        {
            debug!(error = %e, "CLOSE failed during shutdown");
        }
        if let Err(e) = self.session.logout().await {
            debug!(error = %e, "LOGOUT failed during shutdown");
        }
    }

    /// [`Mailbox::shutdown`] bounded by `grace`; the connection is dropped on expiry
    pub async fn release(self, grace: Duration) {
        if tokio::time::timeout(grace, self.shutdown()).await.is_err() {
            debug!(grace_ms = grace.as_millis() as u64, "shutdown timed out, dropping connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Mailbox, display_name, wire_name};
    use crate::errors::AppError;
    use crate::testing::{FakeFactory, FakeServer};

    #[tokio::test]
    async fn selects_requested_folder() {
        let server = FakeServer::with_folders(&["INBOX", "Archive"]);
        let factory = Arc::new(FakeFactory::new(server.clone()));
        let mut mailbox = Mailbox::open(factory).await.expect("open");

        let selected = mailbox.ensure_selected("Archive").await.expect("select");
        assert_eq!(selected, "Archive");
        assert_eq!(mailbox.selected.as_deref(), Some("Archive"));
        assert!(server.log().contains(&"SELECT Archive".to_owned()));
    }

    #[tokio::test]
    async fn ensure_selected_is_idempotent() {
        let server = FakeServer::with_folders(&["INBOX", "Archive"]);
        let factory = Arc::new(FakeFactory::new(server.clone()));
        let mut mailbox = Mailbox::open(factory).await.expect("open");

        let first = mailbox.ensure_selected("Archive").await.expect("first");
        let second = mailbox.ensure_selected("Archive").await.expect("second");
        assert_eq!(first, second);
        assert_eq!(mailbox.selected.as_deref(), Some("Archive"));
        assert_eq!(server.count("SELECT Archive"), 2);
        assert_eq!(server.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn falls_back_to_inbox_when_folder_missing() {
        let server = FakeServer::with_folders(&["INBOX"]);
        let factory = Arc::new(FakeFactory::new(server.clone()));
        let mut mailbox = Mailbox::open(factory).await.expect("open");

        let selected = mailbox.ensure_selected("Nope").await.expect("fallback");
        assert_eq!(selected, "INBOX");
        assert_eq!(mailbox.selected.as_deref(), Some("INBOX"));
    }

    #[tokio::test]
    async fn fails_when_inbox_itself_cannot_be_selected() {
        let server = FakeServer::with_folders(&["Archive"]);
        let factory = Arc::new(FakeFactory::new(server.clone()));
        let mut mailbox = Mailbox::open(factory).await.expect("open");

        let err = mailbox.ensure_selected("inbox").await.expect_err("must fail");
        assert!(matches!(err, AppError::FolderSelection { ref folder } if folder == "inbox"));
        assert_eq!(server.count("SELECT INBOX"), 0);
    }

    #[tokio::test]
    async fn fails_when_folder_and_fallback_are_unselectable() {
        let server = FakeServer::with_folders(&[]);
        let factory = Arc::new(FakeFactory::new(server.clone()));
        let mut mailbox = Mailbox::open(factory).await.expect("open");

        let err = mailbox.ensure_selected("Work").await.expect_err("must fail");
        assert!(matches!(err, AppError::FolderSelection { ref folder } if folder == "Work"));
        assert_eq!(mailbox.selected.as_deref(), None);
    }

    #[tokio::test]
    async fn selects_non_ascii_folder_by_its_readable_name() {
        let server = FakeServer::with_folders(&["INBOX", "&AMk-l&AOk-ments envoy&AOk-s"]);
        let factory = Arc::new(FakeFactory::new(server.clone()));
        let mut mailbox = Mailbox::open(factory).await.expect("open");

        let selected = mailbox
            .ensure_selected("\u{c9}l\u{e9}ments envoy\u{e9}s")
            .await
            .expect("select");
        assert_eq!(selected, "\u{c9}l\u{e9}ments envoy\u{e9}s");
        assert_eq!(mailbox.selected.as_deref(), Some("&AMk-l&AOk-ments envoy&AOk-s"));
        assert_eq!(server.count("SELECT INBOX"), 0);
    }

    #[test]
    fn folder_names_round_trip_through_modified_utf7() {
        assert_eq!(wire_name("INBOX.Sent Items"), "INBOX.Sent Items");
        assert_eq!(wire_name("R&D"), "R&-D");
        assert_eq!(display_name("R&-D"), "R&D");
        let readable = "\u{c9}l\u{e9}ments envoy\u{e9}s";
        assert_eq!(display_name(&wire_name(readable)), readable);
    }

    #[tokio::test]
    async fn reconnects_when_noop_fails() {
        let server = FakeServer::with_folders(&["INBOX"]);
        server.fail_next_noop();
        let factory = Arc::new(FakeFactory::new(server.clone()));
        let mut mailbox = Mailbox::open(factory).await.expect("open");

        mailbox.ensure_selected("INBOX").await.expect("select after reconnect");
        assert_eq!(server.sessions_opened(), 2);
    }

    #[tokio::test]
    async fn shutdown_closes_and_logs_out() {
        let server = FakeServer::with_folders(&["INBOX"]);
        let factory = Arc::new(FakeFactory::new(server.clone()));
        let mut mailbox = Mailbox::open(factory).await.expect("open");
        mailbox.ensure_selected("INBOX").await.expect("select");

        mailbox.shutdown().await;
        assert_eq!(server.count("CLOSE"), 1);
        assert_eq!(server.count("LOGOUT"), 1);
    }
}
