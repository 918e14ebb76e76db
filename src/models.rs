//! Tool input DTOs and result types
//!
//! Inputs are annotated with `JsonSchema` so `rmcp` can advertise them as
//! tool argument schemas.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Header-only view of one message, as listed by a search
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailSummary {
    /// IMAP UID within the searched folder
    pub id: u32,
    pub from: String,
    pub date: String,
    pub subject: String,
}

/// Fully decoded message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailContent {
    pub from: String,
    pub to: String,
    pub cc: Option<String>,
    pub date: String,
    pub subject: String,
    /// Plain-text body, or the sanitized HTML body when no plain part exists
    pub content: String,
}

/// One row of a per-day count table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyCount {
    pub date: chrono::NaiveDate,
    /// `None` when counting that day timed out
    pub count: Option<usize>,
}

/// Input: search emails
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct SearchEmailsInput {
    /// Start date in YYYY-MM-DD format (defaults to 7 days ago)
    pub start_date: Option<String>,
    /// End date in YYYY-MM-DD format, inclusive (defaults to today)
    pub end_date: Option<String>,
    /// Keyword to search in email subject and body
    pub keyword: Option<String>,
    /// Folder/mailbox to search in (defaults to `inbox`)
    #[serde(default = "default_folder")]
    pub folder: String,
}

/// Message id as sent by a client, either `"12"` or `12`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum EmailId {
    Number(u64),
    Text(String),
}

impl fmt::Display for EmailId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Input: get full content of one email
///
/// Every field may be absent so a missing id becomes a readable reply.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetEmailContentInput {
    /// The ID of the email to retrieve, as returned by search-emails
    #[serde(default)]
    pub email_id: Option<EmailId>,
    /// Folder/mailbox containing the email (defaults to `inbox`)
    #[serde(default = "default_folder")]
    pub folder: String,
}

/// Input: count emails per day
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CountDailyEmailsInput {
    /// Start date in YYYY-MM-DD format (required)
    #[serde(default)]
    pub start_date: Option<String>,
    /// End date in YYYY-MM-DD format, inclusive (required)
    #[serde(default)]
    pub end_date: Option<String>,
    /// Folder/mailbox to count emails in (defaults to `inbox`)
    #[serde(default = "default_folder")]
    pub folder: String,
}

/// Input: send an email
///
/// Callers should show the details to the user and get confirmation first.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct SendEmailInput {
    /// Recipient email addresses (at least one)
    #[serde(default)]
    pub to: Vec<String>,
    /// Email subject
    #[serde(default)]
    pub subject: String,
    /// Plain-text email body
    #[serde(default)]
    pub content: String,
    /// CC recipient email addresses
    #[serde(default)]
    pub cc: Option<Vec<String>>,
}

/// Default value for `folder` fields
pub fn default_folder() -> String {
    "inbox".to_owned()
}
