//! Recursive MIME content extraction.
//!
//! Walks a parsed message's part tree depth-first and folds it into an
//! owned result: plain text, HTML, attachments, the content-id map used
//! for later `cid:` rewriting, and fully extracted embedded mails.
//! Traversal is pure; failures on individual parts are logged and
//! skipped, never propagated.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use mail_parser::{Address, Message as MimeMessage, MessageParser, PartType};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::{
    Attachment, Message, Sensitivity, clean_message_id, derive_topic_id, derive_topic_subject,
};

/// Emitted in place of the body of an encrypted mail.
pub const ENCRYPTED_PLACEHOLDER_TEXT: &str = "<<<This e-mail was encrypted. Text content and \
     attachments of encrypted e-mails are not published in the archive to avoid disclosure of \
     restricted or confidential information.>>>";

/// HTML rendering of the encrypted-mail placeholder.
pub const ENCRYPTED_PLACEHOLDER_HTML: &str = "<i>&lt;&lt;&lt;This e-mail was encrypted. Text \
     content and attachments of encrypted e-mails are not published in the archive to avoid \
     disclosure of restricted or confidential information.&gt;&gt;&gt;</i>";

/// Body text of a message whose structure could not be parsed at all.
pub const EXTRACTION_FAILED_MARKER: &str = "<<<Mail content could not be extracted>>>";

/// Guard against adversarial multipart nesting.
const MAX_DEPTH: usize = 10;

/// Substring present in every appended vcard, used to keep the append
/// idempotent across multi-reply chains.
const VCARD_MARKER: &str = "begin:vcard";

// ── Entry point ─────────────────────────────────────────────────────

/// Parse a raw message into a normalized [`Message`].
///
/// Total: a message that cannot be parsed still yields a `Message`
/// carrying the diagnostic marker as its body text.
pub fn parse_mail(raw: &[u8]) -> Message {
    match MessageParser::default().parse(raw) {
        Some(parsed) => build_message(&parsed, Some(raw), None),
        None => {
            warn!("Message structure could not be parsed, archiving diagnostic marker");
            let message_id = raw_header(raw, "Message-ID")
                .map(|v| clean_message_id(&v))
                .filter(|v| !v.is_empty())
                .unwrap_or_else(generated_message_id);
            let mut message = empty_message(message_id);
            message.subject = raw_header(raw, "Subject").unwrap_or_default();
            message.topic_subject = derive_topic_subject(None, &message.subject);
            message.topic_id = message.message_id.clone();
            message.body_text = EXTRACTION_FAILED_MARKER.to_string();
            message
        }
    }
}

/// Build a normalized message from a parsed MIME tree.
///
/// `raw` carries the original bytes for raw-header access; embedded
/// mails have no raw slice of their own and skip the thread headers,
/// which they never need (they are not topic-resolved).
fn build_message(parsed: &MimeMessage, raw: Option<&[u8]>, parent: Option<String>) -> Message {
    let message_id = parsed
        .message_id()
        .map(clean_message_id)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(generated_message_id);

    let subject = parsed.subject().unwrap_or_default().to_string();
    let (in_reply_to, references, thread_index, thread_topic, date) = match raw {
        Some(raw) => (
            raw_header(raw, "In-Reply-To")
                .map(|v| clean_message_id(&v))
                .unwrap_or_default(),
            raw_header(raw, "References").unwrap_or_default(),
            raw_header(raw, "Thread-Index"),
            raw_header(raw, "Thread-Topic"),
            raw_header(raw, "Date").unwrap_or_default(),
        ),
        None => Default::default(),
    };

    let mut content = ExtractedContent::default();
    walk(parsed, 0, 0, &message_id, &mut content);

    Message {
        topic_id: derive_topic_id(thread_index.as_deref(), &references, &message_id),
        topic_subject: derive_topic_subject(thread_topic.as_deref(), &subject),
        subject,
        is_first_in_topic: in_reply_to.is_empty(),
        in_reply_to,
        references,
        from: format_address(parsed.from()),
        to: format_address(parsed.to()),
        cc: format_address(parsed.cc()),
        decoded_date: decode_date(&date, parsed.date()),
        date,
        message_type: crate::classify::DEFAULT_TYPE.to_string(),
        sensitivity: if content.encrypted {
            Sensitivity::Encrypted
        } else {
            Sensitivity::Normal
        },
        body_text: content.text,
        body_html: content.html,
        attachments: content.attachments,
        inline_content_ids: content.inline_ids,
        embedded_messages: content.embedded,
        is_attached_mail: parent.is_some(),
        parent_message: parent,
        message_id,
        tags: Vec::new(),
    }
}

// ── Part-tree walk ──────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ExtractedContent {
    text: String,
    html: String,
    attachments: Vec<Attachment>,
    inline_ids: HashMap<String, String>,
    embedded: Vec<Message>,
    encrypted: bool,
}

/// Depth-first, order-preserving descent into one message's part tree.
fn walk(
    parsed: &MimeMessage,
    part_id: usize,
    depth: usize,
    parent_message_id: &str,
    out: &mut ExtractedContent,
) {
    use mail_parser::MimeHeaders;

    if depth > MAX_DEPTH {
        warn!(part_id, depth, "Part nesting exceeds limit, skipping subtree");
        return;
    }
    let Some(part) = parsed.parts.get(part_id) else {
        warn!(part_id, "Part id out of range, skipping");
        return;
    };

    let content_type = part
        .content_type()
        .map(|ct| match ct.subtype() {
            Some(sub) => format!("{}/{}", ct.ctype(), sub),
            None => ct.ctype().to_string(),
        })
        .unwrap_or_default()
        .to_lowercase();

    // Encrypted or S/MIME wrapped: never descend.
    if content_type.contains("pkcs7-mime") || content_type == "multipart/encrypted" {
        out.encrypted = true;
        if !out.text.contains(ENCRYPTED_PLACEHOLDER_TEXT) {
            push_text(&mut out.text, ENCRYPTED_PLACEHOLDER_TEXT);
            out.html.push_str(ENCRYPTED_PLACEHOLDER_HTML);
        }
        return;
    }

    let filename = part.attachment_name().map(str::to_string);
    let content_id = part.content_id().map(clean_content_id);

    match &part.body {
        PartType::Multipart(children) => {
            for &child in children {
                walk(parsed, child as usize, depth + 1, parent_message_id, out);
            }
        }
        PartType::Message(nested) => {
            debug!(part_id, "Extracting embedded mail");
            let embedded = build_message(nested, None, Some(parent_message_id.to_string()));
            // The embedded body also contributes to the outer text
            // aggregation, so a plain-text search of the parent finds it.
            push_text(&mut out.text, &embedded.body_text);
            out.embedded.push(embedded);
        }
        PartType::Text(text) => {
            if filename.is_some() {
                if content_type.contains("vcard") {
                    append_vcard(&mut out.text, text);
                }
                route_attachment(out, filename, content_type, content_id, text.as_bytes());
            } else if !content_type.ends_with("/xml") {
                push_text(&mut out.text, text);
            }
        }
        PartType::Html(html) => {
            if filename.is_some() {
                route_attachment(out, filename, content_type, content_id, html.as_bytes());
            } else {
                out.html.push_str(html);
            }
        }
        PartType::Binary(data) | PartType::InlineBinary(data) => {
            if content_type.contains("vcard") {
                append_vcard(&mut out.text, &String::from_utf8_lossy(data));
            }
            if filename.is_some() || content_id.is_some() {
                route_attachment(out, filename, content_type, content_id, data);
            } else {
                debug!(part_id, content_type = %content_type, "Skipping unnamed binary part");
            }
        }
    }
}

/// Record a binary part as an attachment and register its content id.
///
/// Unnamed parts that carry a content id still get a generated filename
/// so `cid:` references inside the HTML stay resolvable.
fn route_attachment(
    out: &mut ExtractedContent,
    filename: Option<String>,
    content_type: String,
    content_id: Option<String>,
    data: &[u8],
) {
    let filename = filename.unwrap_or_else(|| {
        let ext = match content_type.rsplit('/').next().unwrap_or("") {
            "jpeg" => "jpg",
            "png" => "png",
            "gif" => "gif",
            "pdf" => "pdf",
            _ => "bin",
        };
        format!("inline-{}.{ext}", out.attachments.len() + 1)
    });
    if let Some(cid) = &content_id {
        out.inline_ids.insert(cid.clone(), filename.clone());
    }
    out.attachments.push(Attachment {
        filename,
        content_type,
        content_id,
        data: data.to_vec(),
    });
}

/// Append a decoded vcard to the plain text, once.
fn append_vcard(text: &mut String, vcard: &str) {
    if text.to_lowercase().contains(VCARD_MARKER) {
        debug!("Vcard already present in content, skipping duplicate");
        return;
    }
    push_text(text, vcard);
}

/// Append a text fragment with a single separating space.
fn push_text(text: &mut String, fragment: &str) {
    if fragment.is_empty() {
        return;
    }
    if !text.is_empty() {
        text.push(' ');
    }
    text.push_str(fragment);
}

// ── Header helpers ──────────────────────────────────────────────────

fn generated_message_id() -> String {
    format!("gen-{}", Uuid::new_v4())
}

fn empty_message(message_id: String) -> Message {
    Message {
        topic_id: message_id.clone(),
        message_id,
        subject: String::new(),
        topic_subject: String::new(),
        in_reply_to: String::new(),
        references: String::new(),
        from: String::new(),
        to: String::new(),
        cc: String::new(),
        date: String::new(),
        decoded_date: None,
        message_type: crate::classify::DEFAULT_TYPE.to_string(),
        sensitivity: Sensitivity::Normal,
        body_text: String::new(),
        body_html: String::new(),
        attachments: Vec::new(),
        inline_content_ids: HashMap::new(),
        embedded_messages: Vec::new(),
        is_attached_mail: false,
        parent_message: None,
        is_first_in_topic: true,
        tags: Vec::new(),
    }
}

/// Scan the raw header block for a header value, unfolding continuation
/// lines. Stops at the first blank line.
fn raw_header(raw: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let mut value: Option<String> = None;
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            break;
        }
        if let Some(v) = value.as_mut() {
            if line.starts_with(' ') || line.starts_with('\t') {
                v.push(' ');
                v.push_str(line.trim());
                continue;
            }
            break;
        }
        if let Some((key, rest)) = line.split_once(':')
            && key.eq_ignore_ascii_case(name)
        {
            value = Some(rest.trim().to_string());
        }
    }
    value
}

/// Strip surrounding whitespace and angle brackets from a content id.
fn clean_content_id(cid: &str) -> String {
    cid.trim().trim_matches(['<', '>']).to_string()
}

/// Render an address header back to its display form.
fn format_address(addr: Option<&Address>) -> String {
    let Some(addr) = addr else {
        return String::new();
    };
    let render = |entries: &mut dyn Iterator<Item = (Option<&str>, Option<&str>)>| {
        entries
            .map(|(name, address)| {
                let address = address.unwrap_or_default();
                match name {
                    Some(name) if !name.is_empty() => format!("{name} <{address}>"),
                    _ => address.to_string(),
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    };
    match addr {
        Address::List(list) => render(
            &mut list
                .iter()
                .map(|a| (a.name.as_deref(), a.address.as_deref())),
        ),
        Address::Group(groups) => render(
            &mut groups
                .iter()
                .flat_map(|g| g.addresses.iter())
                .map(|a| (a.name.as_deref(), a.address.as_deref())),
        ),
    }
}

/// Decode the `Date` header: RFC 2822 via chrono first, then the
/// parser's own broken-down time as a fallback.
fn decode_date(raw: &str, parsed: Option<&mail_parser::DateTime>) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc2822(raw.trim()) {
        return Some(date.with_timezone(&Utc));
    }
    let d = parsed?;
    let naive = chrono::NaiveDate::from_ymd_opt(i32::from(d.year), u32::from(d.month), u32::from(d.day))?
        .and_hms_opt(u32::from(d.hour), u32::from(d.minute), u32::from(d.second))?;
    Some(naive.and_utc())
}
