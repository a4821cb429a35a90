//! Message model for Postbox
//!
//! A [`Message`] is one recipient-scoped copy of an email. The same struct is
//! stored twice: as the full body blob (with `body`) and as the metadata
//! record (without it).

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PostboxError, PostboxResult};

/// Separator between the instant and the id inside a timestamp sort key
pub const TIMESTAMP_SEPARATOR: char = '#';

/// Separator between recipient and sender in the composite key
pub const COMPOSITE_SEPARATOR: char = '#';

/// One recipient's copy of an email
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Internal id
    pub id: Uuid,
    /// Mailbox owner of this copy
    pub recipient: String,
    /// Sender address
    pub sender: String,
    /// `recipient#sender`
    pub recipient_sender: String,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub reply_to: Vec<String>,
    pub subject: String,
    /// Full content, only present in the body blob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Key of the body blob
    pub s3_key: String,
    #[serde(default)]
    pub attachment_keys: Vec<String>,
    /// ISO instant + `#` + id
    pub timestamp: String,
    pub created_at: String,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub archived: bool,
    /// Conversation this copy belongs to, fixed at creation
    pub thread_id: Uuid,
    /// Protocol-level Message-ID
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    /// Referenced Message-IDs, oldest first
    #[serde(default)]
    pub references: Vec<String>,
}

impl Message {
    /// Copy without the body, as stored in the metadata record
    pub fn to_metadata(&self) -> Self {
        Self {
            body: None,
            ..self.clone()
        }
    }

    /// Instant portion of the timestamp sort key
    pub fn instant(&self) -> &str {
        timestamp_instant(&self.timestamp)
    }
}

/// A message as produced by the parser or the send path, before a thread
/// and storage keys have been assigned
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub recipient: String,
    pub sender: String,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

/// Attachment content extracted from a raw message
#[derive(Debug, Clone, PartialEq)]
pub struct RawAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: Bytes,
    pub content_id: Option<String>,
}

/// Thread index entry, keyed by `(thread_id, timestamp)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadRelation {
    pub thread_id: Uuid,
    pub timestamp: String,
    pub message_id: String,
    pub recipient: String,
    pub subject: String,
}

impl From<&Message> for ThreadRelation {
    fn from(message: &Message) -> Self {
        Self {
            thread_id: message.thread_id,
            timestamp: message.timestamp.clone(),
            message_id: message.message_id.clone(),
            recipient: message.recipient.clone(),
            subject: message.subject.clone(),
        }
    }
}

/// Format an instant the way every stored timestamp is formatted
/// (`2025-04-26T16:24:59.123Z`)
pub fn iso_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Build the per-partition unique sort key
pub fn timestamp_key(at: DateTime<Utc>, id: Uuid) -> String {
    format!("{}{}{}", iso_instant(at), TIMESTAMP_SEPARATOR, id)
}

/// Portion of a timestamp sort key before the separator
pub fn timestamp_instant(timestamp: &str) -> &str {
    timestamp
        .split(TIMESTAMP_SEPARATOR)
        .next()
        .unwrap_or(timestamp)
}

/// Build the composite recipient/sender key
pub fn recipient_sender(recipient: &str, sender: &str) -> String {
    format!("{}{}{}", recipient, COMPOSITE_SEPARATOR, sender)
}

/// Map an address onto a safe storage path fragment.
///
/// Lowercases, then replaces everything outside `[a-z0-9@._-]` with `_`.
/// Persistence and authorization both go through this function.
pub fn sanitize_address(address: &str) -> String {
    address
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '@' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

/// Strip a display name: `Jane <jane@x.org>` becomes `jane@x.org`
pub fn bare_address(raw: &str) -> String {
    let raw = raw.trim();
    match (raw.rfind('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if end > start => raw[start + 1..end].trim().to_string(),
        _ => raw.to_string(),
    }
}

/// Check an address is syntactically valid
pub fn validate_address(address: &str) -> PostboxResult<()> {
    if email_address::EmailAddress::is_valid(address) {
        Ok(())
    } else {
        Err(PostboxError::validation(format!("Invalid email address: {}", address)))
    }
}

/// Storage key layout for one recipient's copy of one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    prefix: String,
    delivery_id: String,
}

impl StorageKeys {
    /// Keys under `sanitized-recipient/YYYY-MM-DD/`
    pub fn new(recipient: &str, date: DateTime<Utc>, delivery_id: &str) -> Self {
        Self {
            prefix: format!("{}/{}", sanitize_address(recipient), date.format("%Y-%m-%d")),
            delivery_id: delivery_id
                .trim()
                .trim_start_matches('<')
                .trim_end_matches('>')
                .replace('/', "_"),
        }
    }

    /// Key of the JSON body blob
    pub fn body_key(&self) -> String {
        format!("{}/{}.json", self.prefix, self.delivery_id)
    }

    /// Key of the attachment at `position` in the message
    pub fn attachment_key(&self, position: usize, filename: &str) -> String {
        format!("{}/{}/{}", self.prefix, self.delivery_id, safe_filename(position, filename))
    }
}

/// A filename usable as a single key segment
///
/// Separators become `_`; names that would not survive as a path segment
/// (empty, `.` or `..`) fall back to `attachment-<n>`, counted from 1.
pub fn safe_filename(position: usize, filename: &str) -> String {
    let name = filename.trim().replace(['/', '\\'], "_");
    match name.as_str() {
        "" | "." | ".." => format!("attachment-{}", position + 1),
        _ => name,
    }
}

/// Sanitized owner segment of a stored key, if it has one
pub fn key_owner(key: &str) -> Option<&str> {
    key.split('/').next().filter(|segment| !segment.is_empty())
}

/// Prefix under which outbound attachments wait to be sent
pub const PENDING_PREFIX: &str = "attachments/pending/";

/// Key for an uploaded-but-unsent attachment
pub fn pending_attachment_key(owner: &str, upload_id: Uuid, filename: &str) -> String {
    format!(
        "{}{}/{}/{}",
        PENDING_PREFIX,
        sanitize_address(owner),
        upload_id,
        safe_filename(0, filename)
    )
}

/// Sanitized owner segment of a pending attachment key
pub fn pending_key_owner(key: &str) -> Option<&str> {
    key.strip_prefix(PENDING_PREFIX).and_then(key_owner)
}

/// Last path segment of a key, used as a filename
pub fn key_filename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
