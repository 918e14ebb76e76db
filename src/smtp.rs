//! Outgoing mail composition and submission

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox as Address;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;
use tracing::info;
use uuid::Uuid;

use crate::config::MailConfig;
use crate::errors::{AppError, AppResult};

/// Port on which SMTP speaks implicit TLS instead of STARTTLS
const IMPLICIT_TLS_PORT: u16 = 465;

/// Hands a composed message to the mail submission service
#[async_trait]
pub trait MailSubmitter: Send + Sync {
    async fn submit(&self, message: Message) -> AppResult<()>;
}

/// Authenticated SMTP submission over rustls
pub struct SmtpSubmitter {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpSubmitter {
    /// Build the transport; no connection is made until the first submit
    ///
    /// # Errors
    ///
    /// - `Validation` if the SMTP host cannot be used for TLS
    pub fn new(config: &MailConfig) -> AppResult<Self> {
        let builder = if config.smtp_port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
        }
        .map_err(|e| AppError::invalid(format!("invalid SMTP host '{}': {e}", config.smtp_host)))?;

        let transport = builder
            .port(config.smtp_port)
            .credentials(Credentials::new(
                config.email.clone(),
                config.password.expose_secret().to_owned(),
            ))
            .timeout(Some(Duration::from_millis(config.socket_timeout_ms)))
            .build();
        Ok(Self { transport })
    }
}

#[async_trait]
impl MailSubmitter for SmtpSubmitter {
    async fn submit(&self, message: Message) -> AppResult<()> {
        let response = self.transport.send(message).await.map_err(|e| {
            if e.is_permanent() {
                AppError::Protocol(format!("SMTP server rejected the message: {e}"))
            } else {
                AppError::Connection(format!("SMTP submission failed: {e}"))
            }
        })?;
        info!(code = %response.code(), "message accepted by SMTP server");
        Ok(())
    }
}

/// Fields of an outgoing plain-text message
#[derive(Debug, Clone, Copy)]
pub struct Draft<'a> {
    pub to: &'a [String],
    pub cc: &'a [String],
    pub subject: &'a str,
    pub body: &'a str,
}

/// Compose a plain-text message from `from`
///
/// Every address is parsed up front so a bad recipient never reaches the
/// network. The Message-ID is `<uuid@domain>`.
///
/// # Errors
///
/// - `Validation` if `to` is empty or any address does not parse
pub fn compose(from: &str, domain: &str, draft: Draft<'_>) -> AppResult<Message> {
    if draft.to.iter().all(|addr| addr.trim().is_empty()) {
        return Err(AppError::invalid(
            "At least one recipient email address is required.",
        ));
    }
    let sender = parse_address(from, "sender")?;

    let mut builder = Message::builder()
        .from(sender)
        .subject(draft.subject)
        .date_now()
        .message_id(Some(format!("<{}@{domain}>", Uuid::new_v4())))
        .header(ContentType::TEXT_PLAIN);
    for addr in draft.to.iter().filter(|a| !a.trim().is_empty()) {
        builder = builder.to(parse_address(addr, "recipient")?);
    }
    for addr in draft.cc.iter().filter(|a| !a.trim().is_empty()) {
        builder = builder.cc(parse_address(addr, "CC")?);
    }

    builder
        .body(draft.body.to_owned())
        .map_err(|e| AppError::invalid(format!("cannot build message: {e}")))
}

fn parse_address(raw: &str, role: &str) -> AppResult<Address> {
    raw.trim()
        .parse::<Address>()
        .map_err(|e| AppError::invalid(format!("invalid {role} address '{}': {e}", raw.trim())))
}
