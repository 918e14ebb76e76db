//! Message parsing and MIME handling
//!
//! Parses RFC 5322 messages using `mailparse` and turns them into
//! [`EmailSummary`] and [`EmailContent`]. Header values and bodies go through
//! the best-effort decoder, so parsing never fails on bad encodings.

use mailparse::{DispositionType, MailHeader, ParsedMail};

use crate::decode::{decode_bytes, decode_header_or};
use crate::errors::{AppError, AppResult};
use crate::models::{EmailContent, EmailSummary};

/// Build a summary from a header block
///
/// Unparseable header blocks yield placeholder values rather than errors.
pub fn parse_summary(id: u32, header_bytes: &[u8]) -> EmailSummary {
    let headers = mailparse::parse_headers(header_bytes)
        .map(|(headers, _)| headers)
        .unwrap_or_default();
    EmailSummary {
        id,
        from: header_text(&headers, "from", "Unknown"),
        date: header_text(&headers, "date", "Unknown"),
        subject: header_text(&headers, "subject", "No Subject"),
    }
}

/// Parse a full message into its decoded headers and preferred body
///
/// # Errors
///
/// - `Protocol` if `mailparse` cannot make sense of the message structure
pub fn parse_content(raw: &[u8]) -> AppResult<EmailContent> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Protocol(format!("failed to parse message: {e}")))?;

    let mut body_text = None;
    let mut body_html = None;
    walk_parts(&parsed, &mut body_text, &mut body_html);

    let content = body_text
        .or_else(|| body_html.map(|html| ammonia::clean(&html)))
        .unwrap_or_default();
    let cc = header_text(&parsed.headers, "cc", "");

    Ok(EmailContent {
        from: header_text(&parsed.headers, "from", "Unknown"),
        to: header_text(&parsed.headers, "to", "Unknown"),
        cc: (!cc.is_empty()).then_some(cc),
        date: header_text(&parsed.headers, "date", "Unknown"),
        subject: header_text(&parsed.headers, "subject", "No Subject"),
        content,
    })
}

/// Walk MIME part tree in document order
///
/// Keeps the first inline text/plain and the first inline text/html part.
fn walk_parts(
    part: &ParsedMail<'_>,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
) {
    if part.subparts.is_empty() {
        let disp = part.get_content_disposition();
        let is_attachment = disp.disposition == DispositionType::Attachment
            || disp.params.contains_key("filename");
        if is_attachment {
            return;
        }

        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        let slot = match ctype.as_str() {
            "text/plain" => body_text,
            "text/html" => body_html,
            _ => return,
        };
        if slot.is_none()
            && let Ok(raw) = part.get_body_raw()
        {
            *slot = Some(decode_bytes(&raw, Some(&part.ctype.charset)));
        }
        return;
    }

    for sub in &part.subparts {
        walk_parts(sub, body_text, body_html);
    }
}

/// Decoded value of the first header named `key`, or `fallback`
fn header_text(headers: &[MailHeader<'_>], key: &str, fallback: &str) -> String {
    let raw = headers
        .iter()
        .find(|h| h.get_key().eq_ignore_ascii_case(key))
        .map(MailHeader::get_value_raw);
    decode_header_or(raw, fallback)
}
