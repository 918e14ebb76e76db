//! Tool dispatch
//!
//! One method per tool. Each invocation opens its own mailbox, bounds the
//! work with the operation timeout, always releases the session, and turns
//! every outcome into the plain-text reply the caller sees.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::MailConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{
    CountDailyEmailsInput, DailyCount, EmailContent, EmailSummary, GetEmailContentInput,
    SearchEmailsInput, SendEmailInput,
};
use crate::operations::{self, DateRange, MAX_COUNT_DAYS, SearchCriteria};
use crate::sent_folder::{SentCopyOutcome, SentFolderResolver, save_sent_copy};
use crate::session::{Mailbox, SessionFactory};
use crate::smtp::{self, Draft, MailSubmitter};

/// Grace period for CLOSE/LOGOUT at the end of an invocation
const RELEASE_GRACE: Duration = Duration::from_secs(5);

/// Text payload of one tool call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolReply {
    pub text: String,
    pub is_error: bool,
}

impl ToolReply {
    fn ok(text: String) -> Self {
        Self {
            text,
            is_error: false,
        }
    }

    fn failure(error: &AppError) -> Self {
        Self {
            text: error.user_message(),
            is_error: true,
        }
    }

    fn from_result(result: AppResult<String>) -> Self {
        match result {
            Ok(text) => Self::ok(text),
            Err(e) => {
                warn!(error = %e, "tool call failed");
                Self::failure(&e)
            }
        }
    }
}

/// The five mail tools over one configured account
pub struct MailTools {
    config: Arc<MailConfig>,
    factory: Arc<dyn SessionFactory>,
    submitter: Arc<dyn MailSubmitter>,
    resolver: SentFolderResolver,
}

impl MailTools {
    pub fn new(
        config: Arc<MailConfig>,
        factory: Arc<dyn SessionFactory>,
        submitter: Arc<dyn MailSubmitter>,
    ) -> Self {
        Self {
            config,
            factory,
            submitter,
            resolver: SentFolderResolver::default(),
        }
    }

    pub async fn list_folders(&self) -> ToolReply {
        ToolReply::from_result(self.list_folders_impl().await)
    }

    pub async fn search_emails(&self, input: SearchEmailsInput) -> ToolReply {
        ToolReply::from_result(self.search_emails_impl(input).await)
    }

    pub async fn get_email_content(&self, input: GetEmailContentInput) -> ToolReply {
        ToolReply::from_result(self.get_email_content_impl(input).await)
    }

    pub async fn count_daily_emails(&self, input: CountDailyEmailsInput) -> ToolReply {
        ToolReply::from_result(self.count_daily_emails_impl(input).await)
    }

    pub async fn send_email(&self, input: SendEmailInput) -> ToolReply {
        ToolReply::from_result(self.send_email_impl(input).await)
    }

    async fn open_mailbox(&self) -> AppResult<Mailbox> {
        Mailbox::open(Arc::clone(&self.factory)).await
    }

    async fn list_folders_impl(&self) -> AppResult<String> {
        let mut mailbox = self.open_mailbox().await?;
        let outcome = timeout(
            self.config.operation_timeout(),
            operations::list_folders(mailbox.session()),
        )
        .await;
        mailbox.release(RELEASE_GRACE).await;

        let folders = outcome.map_err(|_| {
            AppError::Timeout("Operation timed out while listing folders.".to_owned())
        })??;
        Ok(render_folders(&folders))
    }

    async fn search_emails_impl(&self, input: SearchEmailsInput) -> AppResult<String> {
        operations::validate_mailbox(&input.folder)?;
        let range = DateRange::from_args(
            input.start_date.as_deref(),
            input.end_date.as_deref(),
            Local::now().date_naive(),
        )?;
        let criteria = SearchCriteria::new(&range, input.keyword.as_deref())?;
        let cap = self.config.search_max_results;

        let mut mailbox = self.open_mailbox().await?;
        let outcome = timeout(self.config.operation_timeout(), async {
            let folder = mailbox.ensure_selected(&input.folder).await?;
            let emails = operations::search(mailbox.session(), &criteria, cap).await?;
            Ok::<_, AppError>((folder, emails))
        })
        .await;
        mailbox.release(RELEASE_GRACE).await;

        let (folder, emails) = outcome.map_err(|_| {
            AppError::Timeout(
                "Search operation timed out. Please try with a more specific search criteria."
                    .to_owned(),
            )
        })??;
        info!(folder = %folder, criteria = %criteria, found = emails.len(), "search-emails");
        Ok(render_search(&input.folder, &folder, &emails))
    }

    async fn get_email_content_impl(&self, input: GetEmailContentInput) -> AppResult<String> {
        let email_id = input
            .email_id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        if email_id.trim().is_empty() {
            return Err(AppError::invalid("Email ID is required."));
        }
        let uid = operations::parse_email_id(&email_id)?;
        operations::validate_mailbox(&input.folder)?;

        let mut mailbox = self.open_mailbox().await?;
        let outcome = timeout(self.config.operation_timeout(), async {
            let selected = mailbox.ensure_selected(&input.folder).await?;
            // UIDs are per folder; the same number in INBOX is another message
            if !selected.eq_ignore_ascii_case(&input.folder) {
                return Err(AppError::FolderSelection {
                    folder: input.folder.clone(),
                });
            }
            operations::fetch(mailbox.session(), uid).await
        })
        .await;
        mailbox.release(RELEASE_GRACE).await;

        let email = outcome.map_err(|_| {
            AppError::Timeout("Operation timed out while fetching email content.".to_owned())
        })??;
        Ok(render_content(&email))
    }

    async fn count_daily_emails_impl(&self, input: CountDailyEmailsInput) -> AppResult<String> {
        let start = required_date(input.start_date.as_deref(), "Start date")?;
        let end = required_date(input.end_date.as_deref(), "End date")?;
        operations::validate_mailbox(&input.folder)?;
        let range = DateRange::new(start, end)?;
        if range.len_days() > MAX_COUNT_DAYS {
            return Err(AppError::invalid(format!(
                "date range must not exceed {MAX_COUNT_DAYS} days"
            )));
        }

        info!(folder = %input.folder, start = %range.start(), end = %range.end(), "count-daily-emails");
        let mut mailbox = self.open_mailbox().await?;
        let outcome = self.count_days(&mut mailbox, &input.folder, &range).await;
        mailbox.release(RELEASE_GRACE).await;

        let (folder, rows) = outcome?;
        Ok(render_counts(&input.folder, &folder, &rows))
    }

    /// One count per day, each under its own timeout
    ///
    /// A day that times out is reported as such; the interrupted command
    /// leaves the connection unusable, so the session is replaced before the
    /// next day.
    async fn count_days(
        &self,
        mailbox: &mut Mailbox,
        folder: &str,
        range: &DateRange,
    ) -> AppResult<(String, Vec<DailyCount>)> {
        let budget = self.config.operation_timeout();
        let selected = timeout(budget, mailbox.ensure_selected(folder))
            .await
            .map_err(|_| AppError::Timeout(format!("selecting folder '{folder}' timed out")))??;

        let mut rows = Vec::new();
        for day in range.days() {
            let criteria = SearchCriteria::on(day);
            match timeout(budget, operations::count(mailbox.session(), &criteria)).await {
                Ok(Ok(count)) => rows.push(DailyCount {
                    date: day,
                    count: Some(count),
                }),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(%day, "daily count timed out");
                    rows.push(DailyCount {
                        date: day,
                        count: None,
                    });
                    timeout(budget, async {
                        mailbox.reconnect().await?;
                        mailbox.ensure_selected(&selected).await
                    })
                    .await
                    .map_err(|_| {
                        AppError::Timeout("reconnecting after a timed out count".to_owned())
                    })??;
                }
            }
        }
        Ok((selected, rows))
    }

    async fn send_email_impl(&self, input: SendEmailInput) -> AppResult<String> {
        let cc = input.cc.unwrap_or_default();
        let message = smtp::compose(
            &self.config.email,
            self.config.email_domain(),
            Draft {
                to: &input.to,
                cc: &cc,
                subject: &input.subject,
                body: &input.content,
            },
        )?;
        let raw = message.formatted();

        info!(to = ?input.to, cc = ?cc, subject = %input.subject, "sending email");
        timeout(self.config.operation_timeout(), self.submitter.submit(message))
            .await
            .map_err(|_| AppError::Timeout("Operation timed out while sending email.".to_owned()))??;

        let copy = if self.config.save_sent_copy {
            save_sent_copy(
                Arc::clone(&self.factory),
                &self.resolver,
                &raw,
                self.config.sent_save_timeout(),
            )
            .await
        } else {
            SentCopyOutcome::Skipped
        };
        Ok(render_sent(&copy))
    }
}

fn required_date(value: Option<&str>, label: &str) -> AppResult<NaiveDate> {
    match value.map(str::trim) {
        Some(day) if !day.is_empty() => operations::parse_ymd(day),
        _ => Err(AppError::invalid(format!("{label} is required (YYYY-MM-DD)."))),
    }
}

fn render_folders(folders: &[String]) -> String {
    if folders.is_empty() {
        return "No folders found in the email account.".to_owned();
    }
    let mut text = "Available email folders:\n\n".to_owned();
    for folder in folders {
        text.push_str(&format!("- {folder}\n"));
    }
    text
}

/// Note shown when the requested folder was swapped for INBOX
fn fallback_note(requested: &str, selected: &str) -> String {
    if requested.eq_ignore_ascii_case(selected) {
        String::new()
    } else {
        format!("Folder '{requested}' could not be selected; showing '{selected}' instead.\n\n")
    }
}

fn render_search(requested: &str, folder: &str, emails: &[EmailSummary]) -> String {
    let mut text = fallback_note(requested, folder);
    if emails.is_empty() {
        text.push_str(&format!("No emails found in '{folder}' matching the criteria."));
        return text;
    }
    text.push_str(&format!("Found emails in '{folder}':\n\n"));
    text.push_str("ID | From | Date | Subject\n");
    text.push_str(&"-".repeat(80));
    text.push('\n');
    for email in emails {
        text.push_str(&format!(
            "{} | {} | {} | {}\n",
            email.id, email.from, email.date, email.subject
        ));
    }
    text.push_str(&format!(
        "\nUse get-email-content with an email ID and folder='{folder}' to view the full content of a specific email."
    ));
    text
}

fn render_content(email: &EmailContent) -> String {
    let mut text = format!("From: {}\nTo: {}\n", email.from, email.to);
    if let Some(cc) = &email.cc {
        text.push_str(&format!("Cc: {cc}\n"));
    }
    text.push_str(&format!(
        "Date: {}\nSubject: {}\n\nContent:\n{}",
        email.date, email.subject, email.content
    ));
    text
}

fn render_counts(requested: &str, folder: &str, rows: &[DailyCount]) -> String {
    let mut text = fallback_note(requested, folder);
    text.push_str(&format!("Daily email counts in '{folder}':\n\n"));
    text.push_str("Date | Count\n");
    text.push_str(&"-".repeat(30));
    text.push('\n');
    for row in rows {
        let count = row
            .count
            .map_or_else(|| "Timeout".to_owned(), |n| n.to_string());
        text.push_str(&format!("{} | {count}\n", row.date.format("%Y-%m-%d")));
    }
    text
}

fn render_sent(copy: &SentCopyOutcome) -> String {
    let mut text = "Email sent successfully! The email was delivered to the SMTP server for the recipient(s).".to_owned();
    match copy {
        SentCopyOutcome::Saved { folder } => {
            text.push_str(&format!(" A copy was saved to the '{folder}' folder."));
        }
        SentCopyOutcome::Failed { reason } => {
            text.push_str(&format!(
                " A copy could not be saved to the Sent folder ({reason}); the email was still delivered."
            ));
        }
        SentCopyOutcome::Skipped => {}
    }
    text
}
