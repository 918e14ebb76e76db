//! Application error model with user-facing guidance
//!
//! Defines a typed error hierarchy using `thiserror` for internal error
//! handling. Tool handlers never surface these as protocol faults; each
//! variant renders into a descriptive text reply carrying actionable advice.

use thiserror::Error;

/// Application error type
///
/// Covers every failure class a tool invocation may hit. The tool boundary
/// converts each variant to text via [`AppError::user_message`].
#[derive(Debug, Error)]
pub enum AppError {
    /// Cannot connect to or authenticate with a mail server
    #[error("connection failed: {0}")]
    Connection(String),
    /// Requested folder is unselectable and INBOX cannot stand in for it
    #[error("could not select folder '{folder}'")]
    FolderSelection {
        /// Folder the caller asked for
        folder: String,
    },
    /// Operation exceeded its time budget
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Missing or malformed argument or configuration value
    #[error("invalid input: {0}")]
    Validation(String),
    /// Search, fetch, append or submission rejected by the server
    #[error("server rejected request: {0}")]
    Protocol(String),
}

impl AppError {
    /// Convenience constructor for `Validation`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Actionable advice appended to every failure reply
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::Connection(_) => {
                "Please check:\n1. EMAIL_ADDRESS and EMAIL_PASSWORD are correct\n2. Your provider allows IMAP/SMTP access\n3. An app password is used if 2FA is enabled\n4. IMAP_SERVER, SMTP_SERVER and SMTP_PORT match your provider's settings"
            }
            Self::FolderSelection { .. } => {
                "Use list-folders to see the exact folder names available on this account."
            }
            Self::Timeout(_) => {
                "The mail server did not answer in time. Try again, or narrow the date range or keyword."
            }
            Self::Validation(_) => "Correct the arguments and call the tool again.",
            Self::Protocol(_) => {
                "The server refused the request. Check the message id, folder and recipient addresses, then try again."
            }
        }
    }

    /// Render the error as the text payload returned to the tool caller
    pub fn user_message(&self) -> String {
        format!("Error: {self}\n\n{}", self.guidance())
    }
}

/// Type alias for fallible return values
pub type AppResult<T> = Result<T, AppError>;
