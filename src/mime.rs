//! Message codec
//!
//! Decodes provider wire-format messages (header list plus a single body or
//! a tree of MIME parts, base64url content) into [`NormalizedMessage`], and
//! encodes outgoing messages into the provider's raw transport form: an
//! RFC 822 text joined with CRLF and base64url-encoded without padding.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use chrono::DateTime;
use mailparse::{MailHeaderMap, ParsedMail};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};
use crate::models::{NO_SUBJECT, NormalizedMessage, UNKNOWN_SENDER};

static ANGLE_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(.+?)>").expect("valid angle address regex"));

/// Provider message resource (`users.messages` in the Gmail API)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    /// Provider message id
    #[serde(default)]
    pub id: String,
    /// Provider thread id
    pub thread_id: Option<String>,
    /// Label ids currently applied
    #[serde(default)]
    pub label_ids: Vec<String>,
    /// Preview text
    #[serde(default)]
    pub snippet: String,
    /// Parsed MIME tree (`format=full`)
    pub payload: Option<MessagePart>,
    /// Whole RFC 822 message, base64url (`format=raw`)
    pub raw: Option<String>,
}

/// One node of the provider's MIME tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    /// Declared MIME type (e.g. `text/plain`, `multipart/alternative`)
    #[serde(default)]
    pub mime_type: String,
    /// Headers in wire order
    #[serde(default)]
    pub headers: Vec<MessageHeader>,
    /// Inline body content, if any
    pub body: Option<PartBody>,
    /// Child parts for multipart nodes
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

/// Header name/value pair
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageHeader {
    pub name: String,
    pub value: String,
}

/// Inline body of a part
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartBody {
    /// base64url-encoded content
    pub data: Option<String>,
    /// Decoded size in bytes as reported by the provider
    #[serde(default)]
    pub size: u64,
}

/// Content type of an outgoing body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Html,
    Plain,
}

impl BodyFormat {
    fn content_type(self) -> &'static str {
        match self {
            BodyFormat::Html => "text/html; charset=utf-8",
            BodyFormat::Plain => "text/plain; charset=utf-8",
        }
    }
}

/// Normalized outgoing message
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Sender address, when the session identity is known
    pub from: Option<String>,
    /// Recipient address
    pub to: String,
    /// Subject line
    pub subject: String,
    /// Body content
    pub body: String,
    /// `Message-ID` of the message being answered
    pub in_reply_to: Option<String>,
    /// Body content type
    pub format: BodyFormat,
}

/// Decode a provider message into a [`NormalizedMessage`]
///
/// Header lookup is case-sensitive and first-match-wins. For multipart
/// payloads the first `text/plain` and first `text/html` parts (depth-first)
/// fill the two body fields; a single-part payload fills the field selected
/// by its declared type. Messages without either type get empty bodies.
///
/// # Errors
///
/// - `Internal` if the message carries neither a payload nor raw content, or
///   if raw content cannot be parsed
pub fn decode_message(message: &GmailMessage) -> AppResult<NormalizedMessage> {
    let Some(payload) = message.payload.as_ref() else {
        return match message.raw.as_deref() {
            Some(raw) => decode_raw_message(message, raw),
            None => Err(AppError::Internal(format!(
                "message '{}' has neither payload nor raw content",
                message.id
            ))),
        };
    };

    let mut plain = None;
    let mut html = None;
    if payload.parts.is_empty() {
        if let Some(text) = decode_part_body(payload) {
            if payload.mime_type == "text/html" {
                html = Some(text);
            } else {
                plain = Some(text);
            }
        }
    } else {
        walk_parts(&payload.parts, &mut plain, &mut html);
    }

    let header = |name: &str| {
        payload
            .headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.clone())
    };
    let message_id_header = payload
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("message-id"))
        .map(|h| h.value.clone());

    Ok(NormalizedMessage {
        id: message.id.clone(),
        thread_id: message.thread_id.clone(),
        subject: non_empty_or(header("Subject"), NO_SUBJECT),
        from: non_empty_or(header("From"), UNKNOWN_SENDER),
        to: header("To"),
        date: header("Date").map(|d| normalize_date(&d)),
        snippet: message.snippet.clone(),
        html_body: html,
        plain_text_body: plain,
        labels: message.label_ids.iter().cloned().collect::<BTreeSet<_>>(),
        message_id_header,
    })
}

/// Walk the MIME tree depth-first, keeping the first text and html bodies
fn walk_parts(parts: &[MessagePart], plain: &mut Option<String>, html: &mut Option<String>) {
    for part in parts {
        if !part.parts.is_empty() {
            walk_parts(&part.parts, plain, html);
            continue;
        }
        if part.mime_type == "text/plain" && plain.is_none() {
            *plain = decode_part_body(part);
        } else if part.mime_type == "text/html" && html.is_none() {
            *html = decode_part_body(part);
        }
    }
}

fn decode_part_body(part: &MessagePart) -> Option<String> {
    let data = part.body.as_ref()?.data.as_deref()?;
    match decode_base64url(data) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            tracing::warn!(mime_type = %part.mime_type, "skipping undecodable body part: {e}");
            None
        }
    }
}

/// Decode provider base64 content
///
/// Accepts the URL-safe alphabet with or without padding, then falls back to
/// the standard alphabet.
pub fn decode_base64url(data: &str) -> AppResult<Vec<u8>> {
    let trimmed = data.trim();
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| URL_SAFE.decode(trimmed))
        .or_else(|_| STANDARD.decode(trimmed))
        .map_err(|e| AppError::Internal(format!("invalid base64 body data: {e}")))
}

/// Decode a `format=raw` message with `mailparse`
fn decode_raw_message(message: &GmailMessage, raw: &str) -> AppResult<NormalizedMessage> {
    let bytes = decode_base64url(raw)?;
    let parsed = mailparse::parse_mail(&bytes)
        .map_err(|e| AppError::Internal(format!("failed to parse RFC822 message: {e}")))?;

    let mut plain = None;
    let mut html = None;
    walk_parsed(&parsed, &mut plain, &mut html);

    let headers = parsed.get_headers();
    Ok(NormalizedMessage {
        id: message.id.clone(),
        thread_id: message.thread_id.clone(),
        subject: non_empty_or(headers.get_first_value("Subject"), NO_SUBJECT),
        from: non_empty_or(headers.get_first_value("From"), UNKNOWN_SENDER),
        to: headers.get_first_value("To"),
        date: headers.get_first_value("Date").map(|d| normalize_date(&d)),
        snippet: message.snippet.clone(),
        html_body: html,
        plain_text_body: plain,
        labels: message.label_ids.iter().cloned().collect(),
        message_id_header: headers.get_first_value("Message-ID"),
    })
}

fn walk_parsed(part: &ParsedMail<'_>, plain: &mut Option<String>, html: &mut Option<String>) {
    if part.subparts.is_empty() {
        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        if ctype == "text/plain"
            && plain.is_none()
            && let Ok(text) = part.get_body()
        {
            *plain = Some(text);
        } else if ctype == "text/html"
            && html.is_none()
            && let Ok(text) = part.get_body()
        {
            *html = Some(text);
        }
        return;
    }
    for sub in &part.subparts {
        walk_parsed(sub, plain, html);
    }
}

/// Encode an outgoing message for the provider's `raw` field
///
/// Header order: From (when known), To, Subject, In-Reply-To/References
/// (when replying), Content-Type. Lines are CRLF-joined, the text is trimmed,
/// and the bytes are base64url-encoded without `=` padding.
pub fn encode_message(message: &OutgoingMessage) -> String {
    let mut lines = Vec::with_capacity(8);
    if let Some(from) = &message.from {
        lines.push(format!("From: {from}"));
    }
    lines.push(format!("To: {}", message.to));
    lines.push(format!("Subject: {}", encode_header_value(&message.subject)));
    if let Some(reference) = &message.in_reply_to {
        lines.push(format!("In-Reply-To: {reference}"));
        lines.push(format!("References: {reference}"));
    }
    lines.push(format!("Content-Type: {}", message.format.content_type()));
    lines.push(String::new());
    lines.push(message.body.clone());

    let text = lines.join("\r\n");
    URL_SAFE_NO_PAD.encode(text.trim().as_bytes())
}

/// RFC 2047 encoded-word for non-ASCII header values
fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        value.to_owned()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value.as_bytes()))
    }
}

/// Bare address from a `Name <address>` header value
///
/// Uses the first angle-bracket pair; without one the whole value is
/// returned unchanged.
pub fn extract_address(header_value: &str) -> String {
    ANGLE_ADDRESS
        .captures(header_value)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
        .unwrap_or_else(|| header_value.to_owned())
}

/// Subject for a reply; the `Re:` check is a literal, case-sensitive prefix
pub fn reply_subject(subject: &str) -> String {
    if subject.starts_with("Re:") {
        subject.to_owned()
    } else {
        format!("Re: {subject}")
    }
}

/// Subject for a forward; the `Fwd:` check is a literal, case-sensitive prefix
pub fn forward_subject(subject: &str) -> String {
    if subject.starts_with("Fwd:") {
        subject.to_owned()
    } else {
        format!("Fwd: {subject}")
    }
}

/// HTML body for a forward: comment, then a quoted block of the original
pub fn forward_body(comment: &str, original: &NormalizedMessage) -> String {
    let quoted = match original.html_body.as_deref().filter(|h| !h.is_empty()) {
        Some(html) => ammonia::clean(html),
        None => original.plain_text_body.clone().unwrap_or_default(),
    };
    format!(
        "{comment}\r\n<br><br>\r\n---------- Forwarded message ----------<br>\r\nFrom: {}<br>\r\nDate: {}<br>\r\nSubject: {}<br>\r\nTo: {}<br>\r\n<br>\r\n{quoted}",
        original.from,
        original.date.as_deref().unwrap_or(""),
        original.subject,
        original.to.as_deref().unwrap_or(""),
    )
}

/// Normalize an RFC 2822 date to RFC 3339; unparseable values pass through
pub fn normalize_date(raw: &str) -> String {
    DateTime::parse_from_rfc2822(raw.trim())
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|_| raw.to_owned())
}

fn non_empty_or(value: Option<String>, sentinel: &str) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| sentinel.to_owned())
}

/// Truncate string to maximum characters (Unicode-aware)
///
/// Preserves complete characters, never splitting multi-byte sequences.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};

    use super::{
        BodyFormat, GmailMessage, MessageHeader, MessagePart, OutgoingMessage, PartBody,
        decode_message, encode_message, extract_address, forward_subject, reply_subject,
        truncate_chars,
    };
    use crate::models::{NO_SUBJECT, UNKNOWN_SENDER};

    fn part(mime: &str, text: &str) -> MessagePart {
        MessagePart {
            mime_type: mime.to_owned(),
            headers: Vec::new(),
            body: Some(PartBody {
                data: Some(URL_SAFE_NO_PAD.encode(text.as_bytes())),
                size: text.len() as u64,
            }),
            parts: Vec::new(),
        }
    }

    fn header(name: &str, value: &str) -> MessageHeader {
        MessageHeader {
            name: name.to_owned(),
            value: value.to_owned(),
        }
    }

    #[test]
    fn truncates_unicode_by_character() {
        let out = truncate_chars("a😀b😀c", 4);
        assert_eq!(out, "a😀b😀");
    }

    #[test]
    fn multipart_populates_both_bodies_independently() {
        let message = GmailMessage {
            id: "m1".to_owned(),
            payload: Some(MessagePart {
                mime_type: "multipart/alternative".to_owned(),
                headers: vec![header("Subject", "Hi"), header("From", "a@x.com")],
                body: None,
                parts: vec![part("text/plain", "plain body"), part("text/html", "<p>html</p>")],
            }),
            ..Default::default()
        };
        let decoded = decode_message(&message).expect("decodes");
        assert_eq!(decoded.plain_text_body.as_deref(), Some("plain body"));
        assert_eq!(decoded.html_body.as_deref(), Some("<p>html</p>"));
    }

    #[test]
    fn single_html_part_populates_only_html() {
        let mut payload = part("text/html", "<b>only html</b>");
        payload.headers = vec![header("Subject", "S")];
        let message = GmailMessage {
            id: "m2".to_owned(),
            payload: Some(payload),
            ..Default::default()
        };
        let decoded = decode_message(&message).expect("decodes");
        assert_eq!(decoded.html_body.as_deref(), Some("<b>only html</b>"));
        assert!(decoded.plain_text_body.is_none());
    }

    #[test]
    fn nested_parts_and_missing_types_yield_empty_bodies_not_errors() {
        let nested = GmailMessage {
            id: "m3".to_owned(),
            payload: Some(MessagePart {
                mime_type: "multipart/mixed".to_owned(),
                headers: Vec::new(),
                body: None,
                parts: vec![
                    MessagePart {
                        mime_type: "multipart/alternative".to_owned(),
                        headers: Vec::new(),
                        body: None,
                        parts: vec![part("text/plain", "first"), part("text/plain", "second")],
                    },
                    part("application/pdf", "%PDF"),
                ],
            }),
            ..Default::default()
        };
        let decoded = decode_message(&nested).expect("decodes");
        assert_eq!(decoded.plain_text_body.as_deref(), Some("first"));

        let attachment_only = GmailMessage {
            id: "m4".to_owned(),
            payload: Some(MessagePart {
                mime_type: "multipart/mixed".to_owned(),
                headers: Vec::new(),
                body: None,
                parts: vec![part("image/png", "png")],
            }),
            ..Default::default()
        };
        let decoded = decode_message(&attachment_only).expect("decodes");
        assert!(decoded.plain_text_body.is_none());
        assert!(decoded.html_body.is_none());
    }

    #[test]
    fn missing_headers_use_sentinels_and_first_match_wins() {
        let mut payload = part("text/plain", "x");
        payload.headers = vec![
            header("subject", "lowercase is ignored"),
            header("To", "first@x.com"),
            header("To", "second@x.com"),
        ];
        let message = GmailMessage {
            id: "m5".to_owned(),
            payload: Some(payload),
            ..Default::default()
        };
        let decoded = decode_message(&message).expect("decodes");
        assert_eq!(decoded.subject, NO_SUBJECT);
        assert_eq!(decoded.from, UNKNOWN_SENDER);
        assert_eq!(decoded.to.as_deref(), Some("first@x.com"));
    }

    #[test]
    fn encoded_message_uses_url_safe_alphabet_without_padding() {
        let raw = encode_message(&OutgoingMessage {
            from: Some("me@x.com".to_owned()),
            to: "you@x.com".to_owned(),
            subject: "??>>".to_owned(),
            body: "ÿÿÿ~~~".to_owned(),
            in_reply_to: None,
            format: BodyFormat::Html,
        });
        assert!(!raw.contains('+'));
        assert!(!raw.contains('/'));
        assert!(!raw.ends_with('='));

        let text = String::from_utf8(URL_SAFE_NO_PAD.decode(&raw).expect("valid base64url"))
            .expect("utf-8");
        let lines: Vec<&str> = text.split("\r\n").collect();
        assert_eq!(lines[0], "From: me@x.com");
        assert_eq!(lines[1], "To: you@x.com");
        assert_eq!(lines[2], "Subject: ??>>");
        assert_eq!(lines[3], "Content-Type: text/html; charset=utf-8");
        assert_eq!(lines[4], "");
    }

    #[test]
    fn reply_headers_follow_subject() {
        let raw = encode_message(&OutgoingMessage {
            from: None,
            to: "bob@x.com".to_owned(),
            subject: "Re: Hi".to_owned(),
            body: "ok".to_owned(),
            in_reply_to: Some("<abc@mail.x.com>".to_owned()),
            format: BodyFormat::Plain,
        });
        let text = String::from_utf8(URL_SAFE_NO_PAD.decode(&raw).expect("valid"))
            .expect("utf-8");
        assert!(text.starts_with(
            "To: bob@x.com\r\nSubject: Re: Hi\r\nIn-Reply-To: <abc@mail.x.com>\r\nReferences: <abc@mail.x.com>\r\nContent-Type: text/plain"
        ));
    }

    #[test]
    fn encode_then_decode_round_trips_core_fields() {
        let raw = encode_message(&OutgoingMessage {
            from: Some("me@x.com".to_owned()),
            to: "you@x.com".to_owned(),
            subject: "Grüße aus Berlin".to_owned(),
            body: "Hello there".to_owned(),
            in_reply_to: None,
            format: BodyFormat::Plain,
        });
        let decoded = decode_message(&GmailMessage {
            id: "sent-1".to_owned(),
            raw: Some(raw),
            ..Default::default()
        })
        .expect("raw decodes");
        assert_eq!(decoded.to.as_deref(), Some("you@x.com"));
        assert_eq!(decoded.subject, "Grüße aus Berlin");
        assert_eq!(decoded.plain_text_body.as_deref(), Some("Hello there"));
        assert_eq!(decoded.from, "me@x.com");
    }

    #[test]
    fn decodes_padded_and_standard_base64() {
        let padded = base64::engine::general_purpose::URL_SAFE.encode("hi?");
        assert_eq!(super::decode_base64url(&padded).expect("padded"), b"hi?");
        let standard = STANDARD.encode("a+b/c");
        assert_eq!(super::decode_base64url(&standard).expect("standard"), b"a+b/c");
    }

    #[test]
    fn extracts_bare_address_from_first_angle_pair() {
        assert_eq!(extract_address("Bob Smith <bob@x.com>"), "bob@x.com");
        assert_eq!(extract_address("<a@x.com>, <b@x.com>"), "a@x.com");
        assert_eq!(extract_address("plain@x.com"), "plain@x.com");
    }

    #[test]
    fn subject_prefixes_are_literal_and_case_sensitive() {
        assert_eq!(reply_subject("Hi"), "Re: Hi");
        assert_eq!(reply_subject("Re: Hi"), "Re: Hi");
        assert_eq!(reply_subject("RE: Hi"), "Re: RE: Hi");
        assert_eq!(forward_subject("Fwd: Hi"), "Fwd: Hi");
        assert_eq!(forward_subject("fwd: Hi"), "Fwd: fwd: Hi");
    }
}
