//! Configuration for the mail account and server settings
//!
//! All configuration is loaded once at startup from environment variables
//! and handed to components as an explicit [`MailConfig`] behind an `Arc`.

use std::env;
use std::env::VarError;
use std::time::Duration;

use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Mail account and server-wide configuration
///
/// Passwords are stored using `SecretString` to prevent accidental logging.
#[derive(Debug, Clone)]
pub struct MailConfig {
    /// Account address, used for IMAP/SMTP login and as `From`
    pub email: String,
    /// Password or app token
    pub password: SecretString,
    /// IMAP server hostname
    pub imap_host: String,
    /// IMAP server port (implicit TLS)
    pub imap_port: u16,
    /// SMTP server hostname
    pub smtp_host: String,
    /// SMTP server port (465 implicit TLS, otherwise STARTTLS)
    pub smtp_port: u16,
    /// TCP connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// TLS handshake, greeting and LOGIN timeout in milliseconds
    pub greeting_timeout_ms: u64,
    /// Per-command IMAP timeout in milliseconds
    pub socket_timeout_ms: u64,
    /// Budget for one primary tool operation in milliseconds
    pub operation_timeout_ms: u64,
    /// Budget for resolving the Sent folder and appending the copy
    pub sent_save_timeout_ms: u64,
    /// Maximum messages listed by a search
    pub search_max_results: usize,
    /// Whether to append a copy of sent mail to the Sent folder
    pub save_sent_copy: bool,
}

impl MailConfig {
    /// Load configuration from process environment variables
    ///
    /// # Errors
    ///
    /// Returns `Validation` if required variables are missing or any value
    /// is malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// EMAIL_ADDRESS=user@example.com
    /// EMAIL_PASSWORD=app-password
    /// IMAP_SERVER=mail.infomaniak.com
    /// SMTP_SERVER=mail.infomaniak.com
    /// SMTP_PORT=587
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        Self::load_with(|key| env::var(key))
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn load_with<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let email = required_var(&lookup, "EMAIL_ADDRESS")?;
        if !email.contains('@') {
            return Err(AppError::invalid(format!(
                "EMAIL_ADDRESS must be a full address, got '{email}'"
            )));
        }
        let password = required_var(&lookup, "EMAIL_PASSWORD")?;

        Ok(Self {
            email: email.trim().to_owned(),
            password: SecretString::new(password.into()),
            imap_host: string_var(&lookup, "IMAP_SERVER", "imap.gmail.com")?,
            imap_port: nonzero_var(&lookup, "IMAP_PORT", 993)?,
            smtp_host: string_var(&lookup, "SMTP_SERVER", "smtp.gmail.com")?,
            smtp_port: nonzero_var(&lookup, "SMTP_PORT", 587)?,
            connect_timeout_ms: nonzero_var(&lookup, "MAIL_CONNECT_TIMEOUT_MS", 30_000)?,
            greeting_timeout_ms: nonzero_var(&lookup, "MAIL_GREETING_TIMEOUT_MS", 15_000)?,
            socket_timeout_ms: nonzero_var(&lookup, "MAIL_SOCKET_TIMEOUT_MS", 60_000)?,
            operation_timeout_ms: nonzero_var(&lookup, "MAIL_OPERATION_TIMEOUT_MS", 60_000)?,
            sent_save_timeout_ms: nonzero_var(&lookup, "MAIL_SENT_SAVE_TIMEOUT_MS", 10_000)?,
            search_max_results: nonzero_var(&lookup, "MAIL_SEARCH_MAX_RESULTS", 100)?,
            save_sent_copy: parse_bool_var(&lookup, "MAIL_SAVE_SENT_COPY", true)?,
        })
    }

    /// Domain part of the account address (used for Message-ID)
    pub fn email_domain(&self) -> &str {
        self.email
            .rsplit_once('@')
            .map_or("localhost", |(_, domain)| domain)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn sent_save_timeout(&self) -> Duration {
        Duration::from_millis(self.sent_save_timeout_ms)
    }
}

/// Read a required variable, returning error if missing or empty
fn required_var<F>(lookup: &F, key: &str) -> AppResult<String>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    match lookup(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::invalid(format!(
            "missing required environment variable {key}"
        ))),
    }
}

/// Read an optional string variable, falling back to `default` when unset
fn string_var<F>(lookup: &F, key: &str, default: &str) -> AppResult<String>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    match lookup(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_owned()),
        Ok(_) | Err(VarError::NotPresent) => Ok(default.to_owned()),
        Err(VarError::NotUnicode(_)) => Err(AppError::invalid(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a numeric variable with default fallback
///
/// # Errors
///
/// Returns `Validation` if the variable is set but does not parse.
fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> AppResult<T>
where
    F: Fn(&str) -> Result<String, VarError>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Ok(v) => v.trim().parse::<T>().map_err(|_| {
            AppError::invalid(format!("invalid numeric environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::invalid(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// [`parse_var`] for counts, ports and timeouts, which must be at least 1
fn nonzero_var<F, T>(lookup: &F, key: &str, default: T) -> AppResult<T>
where
    F: Fn(&str) -> Result<String, VarError>,
    T: std::str::FromStr + Default + PartialEq,
{
    let value = parse_var(lookup, key, default)?;
    if value == T::default() {
        return Err(AppError::invalid(format!(
            "environment variable {key} must be at least 1"
        )));
    }
    Ok(value)
}

/// Parse a boolean variable with flexible values
fn parse_bool_var<F>(lookup: &F, key: &str, default: bool) -> AppResult<bool>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    match lookup(key) {
        Ok(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::invalid(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::invalid(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}
