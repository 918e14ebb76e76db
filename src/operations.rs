//! Mail operations over a selected session
//!
//! Builds IMAP SEARCH criteria from tool arguments and runs the read-side
//! operations (list, search, fetch, count) against a [`MailSession`]. The
//! caller is responsible for selecting the folder first.

use std::fmt;

use chrono::{Duration as ChronoDuration, NaiveDate};
use tracing::{debug, warn};

use crate::decode::sanitize;
use crate::errors::{AppError, AppResult};
use crate::mime;
use crate::models::{EmailContent, EmailSummary};
use crate::session::MailSession;

/// Days covered by a search when no start date is given
pub const DEFAULT_SEARCH_DAYS: i64 = 7;
/// Longest range `count-daily-emails` accepts
pub const MAX_COUNT_DAYS: i64 = 366;

/// Inclusive calendar-day range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    /// # Errors
    ///
    /// - `Validation` if `start` is after `end`
    pub fn new(start: NaiveDate, end: NaiveDate) -> AppResult<Self> {
        if start > end {
            return Err(AppError::invalid("start_date must be <= end_date"));
        }
        Ok(Self { start, end })
    }

    /// Range from optional `YYYY-MM-DD` arguments
    ///
    /// A missing start defaults to [`DEFAULT_SEARCH_DAYS`] before `today`; a
    /// missing end defaults to `today`.
    pub fn from_args(
        start: Option<&str>,
        end: Option<&str>,
        today: NaiveDate,
    ) -> AppResult<Self> {
        let start = match start.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => parse_ymd(s)?,
            None => today - ChronoDuration::days(DEFAULT_SEARCH_DAYS),
        };
        let end = match end.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => parse_ymd(s)?,
            None => today,
        };
        Self::new(start, end)
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Number of calendar days covered, both ends included
    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Each day of the range in ascending order
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    /// Date part of a SEARCH; the upper bound is pushed one day out because
    /// `BEFORE` excludes its own day
    fn criteria(&self) -> String {
        if self.start == self.end {
            format!("ON {}", imap_date(self.start))
        } else {
            format!(
                "SINCE {} BEFORE {}",
                imap_date(self.start),
                imap_date(self.end + ChronoDuration::days(1))
            )
        }
    }
}

/// IMAP SEARCH expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria(String);

impl SearchCriteria {
    /// Messages within `range`, optionally matching `keyword` in subject or body
    ///
    /// # Errors
    ///
    /// - `Validation` if the keyword is too long or holds control characters
    pub fn new(range: &DateRange, keyword: Option<&str>) -> AppResult<Self> {
        let dates = range.criteria();
        match keyword.map(str::trim).filter(|k| !k.is_empty()) {
            Some(k) => {
                let k = escape_imap_quoted(k)?;
                Ok(Self(format!("(OR SUBJECT \"{k}\" BODY \"{k}\") {dates}")))
            }
            None => Ok(Self(dates)),
        }
    }

    /// Messages received on exactly `day`
    pub fn on(day: NaiveDate) -> Self {
        Self(format!("ON {}", imap_date(day)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SearchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Human-readable names of every folder, modified UTF-7 decoded
pub async fn list_folders(session: &mut dyn MailSession) -> AppResult<Vec<String>> {
    let entries = session.list_folders().await?;
    Ok(entries
        .into_iter()
        .map(|entry| sanitize(&entry.display_name()))
        .collect())
}

/// Header summaries of messages matching `criteria`, newest UID first
///
/// When more than `cap` messages match, only the `cap` highest UIDs are
/// fetched. UID order approximates arrival order; it is not a date sort.
/// A message that disappears between SEARCH and FETCH is skipped.
///
/// # Errors
///
/// - `Protocol` if the server rejects the search
/// - `Timeout`/`Connection` if the session fails mid-way
pub async fn search(
    session: &mut dyn MailSession,
    criteria: &SearchCriteria,
    cap: usize,
) -> AppResult<Vec<EmailSummary>> {
    let uids = session.uid_search(criteria.as_str()).await?;
    debug!(criteria = %criteria, matched = uids.len(), cap, "search complete");

    let newest = &uids[uids.len().saturating_sub(cap)..];
    let mut summaries = Vec::with_capacity(newest.len());
    for &uid in newest.iter().rev() {
        match session.fetch_headers(uid).await {
            Ok(headers) => summaries.push(mime::parse_summary(uid, &headers)),
            Err(AppError::Protocol(e)) => warn!(uid, error = %e, "skipping unfetchable message"),
            Err(e) => return Err(e),
        }
    }
    Ok(summaries)
}

/// Full decoded content of one message
pub async fn fetch(session: &mut dyn MailSession, uid: u32) -> AppResult<EmailContent> {
    let raw = session.fetch_message(uid).await?;
    mime::parse_content(&raw)
}

/// Number of messages matching `criteria`, without fetching any of them
pub async fn count(session: &mut dyn MailSession, criteria: &SearchCriteria) -> AppResult<usize> {
    Ok(session.uid_search(criteria.as_str()).await?.len())
}

/// Parse a message id as returned by `search-emails`
pub fn parse_email_id(raw: &str) -> AppResult<u32> {
    match raw.trim().parse::<u32>() {
        Ok(uid) if uid > 0 => Ok(uid),
        _ => Err(AppError::invalid(format!(
            "invalid email_id '{}', expected a positive number from search-emails",
            raw.trim()
        ))),
    }
}

/// Validate mailbox name format
pub fn validate_mailbox(mailbox: &str) -> AppResult<()> {
    if mailbox.trim().is_empty() || mailbox.len() > 256 {
        return Err(AppError::invalid("folder must be 1..256 characters"));
    }
    validate_no_controls(mailbox, "folder")
}

/// Reject IMAP control characters in user-provided values
fn validate_no_controls(value: &str, field: &str) -> AppResult<()> {
    if value.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::invalid(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}

fn validate_search_text(input: &str) -> AppResult<()> {
    if input.is_empty() || input.len() > 256 {
        return Err(AppError::invalid("keyword must be 1..256 characters"));
    }
    validate_no_controls(input, "keyword")
}

/// Escape backslashes and quotes for IMAP quoted strings
fn escape_imap_quoted(input: &str) -> AppResult<String> {
    validate_search_text(input)?;
    Ok(input.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Format date as IMAP SEARCH date (e.g., "1-Jan-2025")
fn imap_date(date: NaiveDate) -> String {
    date.format("%-d-%b-%Y").to_string()
}

/// Parse YYYY-MM-DD date string
pub fn parse_ymd(input: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").map_err(|_| {
        AppError::invalid(format!("invalid date '{input}', expected YYYY-MM-DD"))
    })
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{
        DateRange, SearchCriteria, count, escape_imap_quoted, list_folders, parse_email_id,
        search, validate_mailbox,
    };
    use crate::session::{MailSession, SessionFactory};
    use crate::testing::{FakeFactory, FakeServer};

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn message(subject: &str) -> Vec<u8> {
        format!("From: a@example.com\r\nDate: Wed, 1 Jan 2025 10:00:00 +0000\r\nSubject: {subject}\r\n\r\nbody\r\n")
            .into_bytes()
    }

    #[test]
    fn single_day_range_uses_on() {
        let range = DateRange::new(day(2025, 1, 1), day(2025, 1, 1)).expect("range");
        let criteria = SearchCriteria::new(&range, None).expect("criteria");
        assert_eq!(criteria.as_str(), "ON 1-Jan-2025");
    }

    #[test]
    fn multi_day_range_pushes_upper_bound() {
        let range = DateRange::new(day(2024, 12, 30), day(2024, 12, 31)).expect("range");
        let criteria = SearchCriteria::new(&range, None).expect("criteria");
        assert_eq!(criteria.as_str(), "SINCE 30-Dec-2024 BEFORE 1-Jan-2025");
    }

    #[test]
    fn keyword_matches_subject_or_body() {
        let range = DateRange::new(day(2025, 3, 1), day(2025, 3, 1)).expect("range");
        let criteria = SearchCriteria::new(&range, Some(" say \"hi\" ")).expect("criteria");
        assert_eq!(
            criteria.as_str(),
            "(OR SUBJECT \"say \\\"hi\\\"\" BODY \"say \\\"hi\\\"\") ON 1-Mar-2025"
        );
    }

    #[test]
    fn blank_keyword_is_ignored() {
        let range = DateRange::new(day(2025, 3, 1), day(2025, 3, 2)).expect("range");
        let criteria = SearchCriteria::new(&range, Some("   ")).expect("criteria");
        assert!(criteria.as_str().starts_with("SINCE"));
    }

    #[test]
    fn defaults_to_last_week() {
        let today = day(2025, 1, 10);
        let range = DateRange::from_args(None, None, today).expect("range");
        assert_eq!(range.start(), day(2025, 1, 3));
        assert_eq!(range.end(), today);

        let range = DateRange::from_args(Some("2025-01-09"), Some(""), today).expect("range");
        assert_eq!(range.start(), day(2025, 1, 9));
        assert_eq!(range.len_days(), 2);
    }

    #[test]
    fn rejects_inverted_and_malformed_dates() {
        let today = day(2025, 1, 10);
        let err = DateRange::from_args(Some("2025-01-05"), Some("2025-01-01"), today)
            .expect_err("must fail");
        assert!(err.to_string().contains("start_date must be <= end_date"));

        let err = DateRange::from_args(Some("01/05/2025"), None, today).expect_err("must fail");
        assert!(err.to_string().contains("expected YYYY-MM-DD"));
    }

    #[test]
    fn days_iterates_inclusive_range_in_order() {
        let range = DateRange::new(day(2025, 2, 27), day(2025, 3, 1)).expect("range");
        let days: Vec<NaiveDate> = range.days().collect();
        assert_eq!(days, vec![day(2025, 2, 27), day(2025, 2, 28), day(2025, 3, 1)]);
    }

    #[test]
    fn escape_rejects_linebreaks() {
        let err = escape_imap_quoted("a\nb").expect_err("must fail");
        assert!(err.to_string().contains("control characters"));
    }

    #[test]
    fn rejects_control_chars_in_mailbox() {
        let err = validate_mailbox("INBOX\r").expect_err("must fail");
        assert!(err.to_string().contains("control characters"));
        assert!(validate_mailbox("  ").is_err());
    }

    #[test]
    fn email_ids_must_be_positive_numbers() {
        assert_eq!(parse_email_id(" 42 ").expect("id"), 42);
        assert!(parse_email_id("0").is_err());
        assert!(parse_email_id("abc").is_err());
    }

    #[tokio::test]
    async fn search_caps_to_newest_uids() {
        let server = FakeServer::with_folders(&["INBOX"]);
        for uid in 1..=5 {
            server.add_message("INBOX", uid, &message(&format!("msg {uid}")));
        }
        let factory = FakeFactory::new(server.clone());
        let mut session = factory.open().await.expect("open");
        session.select("INBOX").await.expect("select");

        let criteria = SearchCriteria::on(day(2025, 1, 1));
        let found = search(session.as_mut(), &criteria, 3).await.expect("search");
        let ids: Vec<u32> = found.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert_eq!(found[0].subject, "msg 5");
        assert_eq!(server.count_prefix("FETCH HEADER"), 3);
    }

    #[tokio::test]
    async fn search_skips_vanished_messages() {
        let server = FakeServer::with_folders(&["INBOX"]);
        server.add_message("INBOX", 2, &message("kept"));
        server.set_search_result("ON 1-Jan-2025", &[1, 2]);
        let factory = FakeFactory::new(server.clone());
        let mut session = factory.open().await.expect("open");
        session.select("INBOX").await.expect("select");

        let found = search(session.as_mut(), &SearchCriteria::on(day(2025, 1, 1)), 10)
            .await
            .expect("search");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 2);
    }

    #[tokio::test]
    async fn count_does_not_fetch() {
        let server = FakeServer::with_folders(&["INBOX"]);
        server.set_search_result("ON 2-Jan-2025", &[7, 8, 9]);
        let factory = FakeFactory::new(server.clone());
        let mut session = factory.open().await.expect("open");
        session.select("INBOX").await.expect("select");

        let n = count(session.as_mut(), &SearchCriteria::on(day(2025, 1, 2)))
            .await
            .expect("count");
        assert_eq!(n, 3);
        assert_eq!(server.count_prefix("FETCH"), 0);
    }

    #[tokio::test]
    async fn folder_names_are_utf7_decoded() {
        let server = FakeServer::with_folders(&["INBOX", "&AMk-l&AOk-ments envoy&AOk-s"]);
        let factory = FakeFactory::new(server);
        let mut session = factory.open().await.expect("open");

        let names = list_folders(session.as_mut()).await.expect("list");
        assert_eq!(names, vec!["INBOX", "\u{c9}l\u{e9}ments envoy\u{e9}s"]);
    }
}
