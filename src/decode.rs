//! Best-effort decoding of header and body bytes into printable text
//!
//! Handles RFC 2047 encoded words with declared charsets, tolerates unknown
//! or broken charsets by retrying as lossy UTF-8, and scrubs invisible
//! format characters that downstream serialization chokes on. Nothing in
//! here returns an error: the worst case is a string with replacement
//! characters.

use std::sync::LazyLock;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use charset::Charset;
use regex::Regex;
use tracing::debug;

/// `=?charset?encoding?text?=`
static ENCODED_WORD: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"=\?([^?\s]+)\?([BbQq])\?([^?\s]*)\?=").ok());

/// Line break followed by folding whitespace
static FOLDING: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\r?\n([ \t])").ok());

const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode a raw header value, including any RFC 2047 encoded words
///
/// Folded lines are unfolded first. Whitespace between two adjacent encoded
/// words is dropped, as RFC 2047 requires. An encoded word whose payload
/// cannot be decoded is kept verbatim.
pub fn decode_header(raw: &[u8]) -> String {
    let lossy = String::from_utf8_lossy(raw);
    let unfolded = match FOLDING.as_ref() {
        Some(re) => re.replace_all(&lossy, "$1").into_owned(),
        None => lossy.replace(['\r', '\n'], ""),
    };

    let Some(encoded_word) = ENCODED_WORD.as_ref() else {
        return sanitize(unfolded.trim());
    };

    let mut out = String::with_capacity(unfolded.len());
    let mut last_end = 0;
    let mut previous_was_word = false;
    for caps in encoded_word.captures_iter(&unfolded) {
        let Some(whole) = caps.get(0) else { continue };
        let gap = &unfolded[last_end..whole.start()];
        if !(previous_was_word && gap.chars().all(char::is_whitespace)) {
            out.push_str(gap);
        }

        match decode_encoded_word(&caps[1], &caps[2], &caps[3]) {
            Some(text) => out.push_str(&text),
            None => out.push_str(whole.as_str()),
        }
        last_end = whole.end();
        previous_was_word = true;
    }
    out.push_str(&unfolded[last_end..]);

    let cleaned = sanitize(out.trim());
    if cleaned.is_empty() && !lossy.trim().is_empty() {
        return sanitize(lossy.trim());
    }
    cleaned
}

/// Decode header text that may be missing, substituting `fallback`
pub fn decode_header_or(raw: Option<&[u8]>, fallback: &str) -> String {
    match raw.map(decode_header) {
        Some(text) if !text.is_empty() => text,
        _ => fallback.to_owned(),
    }
}

/// Decode body bytes in a declared (or unknown) charset
///
/// Unrecognized labels and charsets that report malformed input both fall
/// back to UTF-8 with replacement characters.
pub fn decode_bytes(bytes: &[u8], charset: Option<&str>) -> String {
    let text = match charset.and_then(lookup_charset) {
        Some(cs) => {
            let (decoded, malformed) = cs.decode_without_bom_handling(bytes);
            if malformed {
                debug!(charset = ?charset, "malformed input for declared charset, using UTF-8");
                String::from_utf8_lossy(bytes)
            } else {
                decoded
            }
        }
        None => String::from_utf8_lossy(bytes),
    };
    sanitize(&text)
}

/// Strip or replace invisible format characters
///
/// Removes zero-width no-break space (BOM), turns narrow no-break space into
/// a plain space and line/paragraph separators into newlines.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .filter_map(|ch| match ch {
            '\u{feff}' => None,
            '\u{202f}' => Some(' '),
            '\u{2028}' | '\u{2029}' => Some('\n'),
            other => Some(other),
        })
        .collect()
}

fn decode_encoded_word(charset: &str, encoding: &str, payload: &str) -> Option<String> {
    let bytes = if encoding.eq_ignore_ascii_case("b") {
        LENIENT_BASE64.decode(payload).ok()?
    } else {
        decode_q(payload)
    };
    Some(decode_bytes(&bytes, Some(charset)))
}

/// RFC 2047 "Q" encoding: `_` is a space, `=XX` is a hex byte
fn decode_q(payload: &str) -> Vec<u8> {
    let bytes = payload.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => out.push(b' '),
            b'=' => match bytes.get(i + 1..i + 3).and_then(|pair| hex_pair(pair[0], pair[1])) {
                Some(b) => {
                    out.push(b);
                    i += 2;
                }
                None => out.push(b'='),
            },
            other => out.push(other),
        }
        i += 1;
    }
    out
}

fn hex_pair(hi: u8, lo: u8) -> Option<u8> {
    let hi = char::from(hi).to_digit(16)?;
    let lo = char::from(lo).to_digit(16)?;
    u8::try_from(hi * 16 + lo).ok()
}

/// Resolve a charset label, ignoring an RFC 2231 language suffix
fn lookup_charset(label: &str) -> Option<Charset> {
    let label = label.split('*').next().unwrap_or(label).trim();
    if label.is_empty() {
        return None;
    }
    Charset::for_label_no_replacement(label.as_bytes())
}
