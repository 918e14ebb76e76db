//! In-memory doubles for the mail transport seams

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use lettre::Message;

use crate::errors::{AppError, AppResult};
use crate::session::{FolderEntry, MailSession, SessionFactory};
use crate::smtp::MailSubmitter;

#[derive(Default)]
struct State {
    folders: Vec<FolderEntry>,
    messages: HashMap<String, Vec<(u32, Vec<u8>)>>,
    search_results: HashMap<String, Vec<u32>>,
    appended: Vec<(String, Vec<u8>)>,
    hung: HashSet<String>,
    log: Vec<String>,
    sessions_opened: usize,
    noop_failures: usize,
    fail_connect: bool,
    examine_blocked: bool,
    append_blocked: bool,
}

impl State {
    /// Listing name matching `folder`; INBOX is case-insensitive
    fn resolve(&self, folder: &str) -> Option<String> {
        self.folders
            .iter()
            .find(|f| {
                f.name == folder
                    || (f.name.eq_ignore_ascii_case("inbox") && folder.eq_ignore_ascii_case("inbox"))
            })
            .map(|f| f.name.clone())
    }
}

/// Scripted mail server shared by every session a [`FakeFactory`] opens
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<State>>,
}

impl FakeServer {
    pub fn with_folders(names: &[&str]) -> Self {
        let server = Self::default();
        server.state().folders = names
            .iter()
            .map(|name| FolderEntry {
                name: (*name).to_owned(),
                attributes: vec!["\\HasNoChildren".to_owned()],
            })
            .collect();
        server
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake server state")
    }

    pub fn add_message(&self, folder: &str, uid: u32, raw: &[u8]) {
        let mut state = self.state();
        let folder = state.resolve(folder).unwrap_or_else(|| folder.to_owned());
        state
            .messages
            .entry(folder)
            .or_default()
            .push((uid, raw.to_vec()));
    }

    /// Answer exactly this criteria string with `uids`; others match the whole folder
    pub fn set_search_result(&self, criteria: &str, uids: &[u32]) {
        self.state()
            .search_results
            .insert(criteria.to_owned(), uids.to_vec());
    }

    pub fn fail_next_noop(&self) {
        self.state().noop_failures += 1;
    }

    pub fn fail_connect(&self) {
        self.state().fail_connect = true;
    }

    /// Make a command (`LIST`, `SEARCH`, `SELECT`, `APPEND`, ...) never answer
    pub fn hang_on(&self, command: &str) {
        self.state().hung.insert(command.to_owned());
    }

    pub fn set_examine_allowed(&self, allowed: bool) {
        self.state().examine_blocked = !allowed;
    }

    pub fn set_append_allowed(&self, allowed: bool) {
        self.state().append_blocked = !allowed;
    }

    pub fn log(&self) -> Vec<String> {
        self.state().log.clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.state().log.iter().filter(|e| *e == entry).count()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.state()
            .log
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state().sessions_opened
    }

    /// Messages appended to `folder`
    pub fn appended(&self, folder: &str) -> Vec<Vec<u8>> {
        self.state()
            .appended
            .iter()
            .filter(|(f, _)| f == folder)
            .map(|(_, raw)| raw.clone())
            .collect()
    }

    fn record(&self, entry: String) {
        self.state().log.push(entry);
    }

    async fn maybe_hang(&self, command: &str) {
        let hung = self.state().hung.contains(command);
        if hung {
            std::future::pending::<()>().await;
        }
    }
}

pub struct FakeFactory {
    server: FakeServer,
    host: String,
}

impl FakeFactory {
    pub fn new(server: FakeServer) -> Self {
        Self::with_host(server, "imap.example.com")
    }

    pub fn with_host(server: FakeServer, host: &str) -> Self {
        Self {
            server,
            host: host.to_owned(),
        }
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    fn host(&self) -> &str {
        &self.host
    }

    async fn open(&self) -> AppResult<Box<dyn MailSession>> {
        let fail = {
            let mut state = self.server.state();
            state.sessions_opened += 1;
            state.log.push("OPEN".to_owned());
            state.fail_connect
        };
        if fail {
            return Err(AppError::Connection("connection refused".to_owned()));
        }
        Ok(Box::new(FakeSession {
            server: self.server.clone(),
            selected: None,
        }))
    }
}

pub struct FakeSession {
    server: FakeServer,
    selected: Option<String>,
}

impl FakeSession {
    fn open_folder(&mut self, command: &str, folder: &str, blocked: bool) -> AppResult<()> {
        self.server.record(format!("{command} {folder}"));
        self.selected = None;
        let resolved = self.server.state().resolve(folder);
        match resolved {
            Some(name) if !blocked => {
                self.selected = Some(name);
                Ok(())
            }
            _ => Err(AppError::Protocol(format!("NO [NONEXISTENT] {folder}"))),
        }
    }

    fn message(&self, uid: u32) -> AppResult<Vec<u8>> {
        let folder = self
            .selected
            .as_deref()
            .ok_or_else(|| AppError::Protocol("BAD no folder selected".to_owned()))?;
        self.server
            .state()
            .messages
            .get(folder)
            .and_then(|msgs| msgs.iter().find(|(u, _)| *u == uid))
            .map(|(_, raw)| raw.clone())
            .ok_or_else(|| AppError::Protocol(format!("message uid {uid} not found")))
    }
}

#[async_trait]
impl MailSession for FakeSession {
    async fn noop(&mut self) -> AppResult<()> {
        self.server.record("NOOP".to_owned());
        let mut state = self.server.state();
        if state.noop_failures > 0 {
            state.noop_failures -= 1;
            return Err(AppError::Connection("connection reset".to_owned()));
        }
        Ok(())
    }

    async fn select(&mut self, folder: &str) -> AppResult<()> {
        self.server.maybe_hang("SELECT").await;
        self.open_folder("SELECT", folder, false)
    }

    async fn examine(&mut self, folder: &str) -> AppResult<()> {
        let blocked = self.server.state().examine_blocked;
        self.open_folder("EXAMINE", folder, blocked)
    }

    async fn close(&mut self) -> AppResult<()> {
        self.server.record("CLOSE".to_owned());
        self.selected = None;
        Ok(())
    }

    async fn list_folders(&mut self) -> AppResult<Vec<FolderEntry>> {
        self.server.record("LIST".to_owned());
        self.server.maybe_hang("LIST").await;
        Ok(self.server.state().folders.clone())
    }

    async fn uid_search(&mut self, criteria: &str) -> AppResult<Vec<u32>> {
        self.server.record(format!("SEARCH {criteria}"));
        self.server.maybe_hang("SEARCH").await;
        let folder = self
            .selected
            .clone()
            .ok_or_else(|| AppError::Protocol("BAD no folder selected".to_owned()))?;
        let state = self.server.state();
        if let Some(uids) = state.search_results.get(criteria) {
            return Ok(uids.clone());
        }
        let mut uids: Vec<u32> = state
            .messages
            .get(&folder)
            .map(|msgs| msgs.iter().map(|(uid, _)| *uid).collect())
            .unwrap_or_default();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_headers(&mut self, uid: u32) -> AppResult<Vec<u8>> {
        self.server.record(format!("FETCH HEADER {uid}"));
        let raw = self.message(uid)?;
        let end = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map_or(raw.len(), |pos| pos + 4);
        Ok(raw[..end].to_vec())
    }

    async fn fetch_message(&mut self, uid: u32) -> AppResult<Vec<u8>> {
        self.server.record(format!("FETCH {uid}"));
        self.message(uid)
    }

    async fn append(
        &mut self,
        folder: &str,
        flags: Option<&str>,
        content: &[u8],
    ) -> AppResult<()> {
        self.server
            .record(format!("APPEND {folder} {}", flags.unwrap_or("-")));
        self.server.maybe_hang("APPEND").await;
        let mut state = self.server.state();
        match state.resolve(folder) {
            Some(name) if !state.append_blocked => {
                state.appended.push((name, content.to_vec()));
                Ok(())
            }
            _ => Err(AppError::Protocol(format!("NO [TRYCREATE] {folder}"))),
        }
    }

    async fn logout(&mut self) -> AppResult<()> {
        self.server.record("LOGOUT".to_owned());
        Ok(())
    }
}

/// Records submitted messages instead of talking SMTP
#[derive(Clone, Default)]
pub struct FakeSubmitter {
    sent: Arc<Mutex<Vec<Message>>>,
    failure: Option<String>,
}

impl FakeSubmitter {
    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_owned()),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().expect("fake submitter state").clone()
    }
}

#[async_trait]
impl MailSubmitter for FakeSubmitter {
    async fn submit(&self, message: Message) -> AppResult<()> {
        if let Some(reason) = &self.failure {
            return Err(AppError::Connection(format!("SMTP submission failed: {reason}")));
        }
        self.sent
            .lock()
            .expect("fake submitter state")
            .push(message);
        Ok(())
    }
}
