//! Inbound mail
//!
//! Raw messages are staged under `incoming/<receipt id>`, parsed into one
//! draft per `To` address and persisted one recipient at a time. The staged
//! copy is removed once every recipient has been stored.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{PostboxError, PostboxResult};
use crate::message::{bare_address, Message, MessageDraft, RawAttachment};
use crate::persist::{AttachmentSource, PersistRequest, RecordWriter};
use crate::storage::{BlobMeta, BlobStore};

/// Prefix under which raw inbound messages are staged
pub const INCOMING_PREFIX: &str = "incoming/";

/// Drafts and attachments extracted from one raw message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMessage {
    /// One per `To` address, in header order
    pub drafts: Vec<MessageDraft>,
    pub attachments: Vec<RawAttachment>,
}

/// Turns raw RFC 5322 bytes into drafts
pub trait MimeParser: Send + Sync {
    fn parse(&self, raw: &[u8]) -> PostboxResult<ParsedMessage>;
}

/// [`MimeParser`] built on `mailparse`
#[derive(Debug, Clone)]
pub struct MailparseParser {
    domain: String,
}

impl MailparseParser {
    /// `domain` is used when a message arrives without a Message-ID
    pub fn new(domain: impl Into<String>) -> Self {
        Self { domain: domain.into() }
    }
}

fn addresses(mail: &ParsedMail, header: &str) -> PostboxResult<Vec<String>> {
    let Some(header) = mail.headers.get_first_header(header) else {
        return Ok(Vec::new());
    };
    let mut found = Vec::new();
    for addr in mailparse::addrparse_header(header)?.iter() {
        match addr {
            MailAddr::Single(info) => found.push(bare_address(&info.addr)),
            MailAddr::Group(group) => found.extend(group.addrs.iter().map(|info| bare_address(&info.addr))),
        }
    }
    found.retain(|a| !a.is_empty());
    Ok(found)
}

fn header_value(mail: &ParsedMail, header: &str) -> Option<String> {
    mail.headers
        .get_first_value(header)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Default)]
struct Content {
    html: Option<String>,
    text: Option<String>,
    attachments: Vec<RawAttachment>,
}

fn attachment_filename(part: &ParsedMail) -> Option<String> {
    let disposition = part.get_content_disposition();
    disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .filter(|name| !name.trim().is_empty())
        .cloned()
}

fn collect(part: &ParsedMail, content: &mut Content) -> PostboxResult<()> {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect(sub, content)?;
        }
        return Ok(());
    }

    let disposition = part.get_content_disposition().disposition;
    let filename = attachment_filename(part);
    let is_attachment = match disposition {
        DispositionType::Attachment => true,
        DispositionType::Inline => filename.is_some(),
        _ => false,
    };

    if is_attachment {
        let content_id = header_value(part, "Content-ID")
            .map(|id| id.trim_start_matches('<').trim_end_matches('>').to_string());
        content.attachments.push(RawAttachment {
            filename: filename.unwrap_or_default(),
            content_type: part.ctype.mimetype.clone(),
            content: Bytes::from(part.get_body_raw()?),
            content_id,
        });
    } else if part.ctype.mimetype == "text/html" && content.html.is_none() {
        content.html = Some(part.get_body()?);
    } else if part.ctype.mimetype == "text/plain" && content.text.is_none() {
        content.text = Some(part.get_body()?);
    }
    Ok(())
}

impl MimeParser for MailparseParser {
    fn parse(&self, raw: &[u8]) -> PostboxResult<ParsedMessage> {
        let mail = mailparse::parse_mail(raw)?;

        let to = addresses(&mail, "To")?;
        let sender = addresses(&mail, "From")?.into_iter().next();
        let sender = match (to.is_empty(), sender) {
            (false, Some(sender)) => sender,
            _ => return Err(PostboxError::parse("Missing required email fields: to, from")),
        };

        let cc = addresses(&mail, "Cc")?;
        let bcc = addresses(&mail, "Bcc")?;
        let reply_to = addresses(&mail, "Reply-To")?;
        let subject = header_value(&mail, "Subject").unwrap_or_default();
        let message_id = header_value(&mail, "Message-ID")
            .unwrap_or_else(|| format!("<{}@{}>", Uuid::new_v4(), self.domain));
        let in_reply_to = header_value(&mail, "In-Reply-To");
        let references: Vec<String> = header_value(&mail, "References")
            .map(|refs| refs.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let mut content = Content::default();
        collect(&mail, &mut content)?;
        let body = content.html.or(content.text).unwrap_or_default().trim().to_string();

        let drafts = to
            .into_iter()
            .map(|recipient| MessageDraft {
                recipient,
                sender: sender.clone(),
                cc: cc.clone(),
                bcc: bcc.clone(),
                reply_to: reply_to.clone(),
                subject: subject.clone(),
                body: body.clone(),
                message_id: message_id.clone(),
                in_reply_to: in_reply_to.clone(),
                references: references.clone(),
            })
            .collect();

        Ok(ParsedMessage {
            drafts,
            attachments: content.attachments,
        })
    }
}

/// Notification that a raw message has been staged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundReceipt {
    pub receipt_id: String,
    pub received_at: DateTime<Utc>,
}

impl InboundReceipt {
    pub fn staging_key(&self) -> String {
        format!("{}{}", INCOMING_PREFIX, self.receipt_id)
    }
}

/// Inbound pipeline
#[derive(Clone)]
pub struct Ingestor {
    blobs: Arc<dyn BlobStore>,
    writer: RecordWriter,
    parser: Arc<dyn MimeParser>,
}

impl Ingestor {
    pub fn new(blobs: Arc<dyn BlobStore>, writer: RecordWriter, parser: Arc<dyn MimeParser>) -> Self {
        Self { blobs, writer, parser }
    }

    /// Stage raw bytes the way the mail receiver does
    pub async fn stage(&self, receipt: &InboundReceipt, raw: Bytes) -> PostboxResult<()> {
        self.blobs
            .put(&receipt.staging_key(), raw, BlobMeta::new("message/rfc822"))
            .await
    }

    /// Process a staged message and remove it
    pub async fn receive(&self, receipt: &InboundReceipt) -> PostboxResult<Vec<Message>> {
        let key = receipt.staging_key();
        let raw = self.blobs.get(&key).await?;
        let stored = self.process(receipt, &raw.data).await?;
        self.blobs.delete(&key).await?;
        Ok(stored)
    }

    /// Parse and persist one copy per recipient.
    ///
    /// Stops at the first recipient that fails; earlier recipients stay
    /// stored.
    pub async fn process(&self, receipt: &InboundReceipt, raw: &[u8]) -> PostboxResult<Vec<Message>> {
        let parsed = self.parser.parse(raw)?;
        tracing::info!(
            "Received {} for {} recipient(s) with {} attachment(s)",
            receipt.receipt_id,
            parsed.drafts.len(),
            parsed.attachments.len()
        );

        let attachments: Vec<AttachmentSource> = parsed
            .attachments
            .into_iter()
            .map(AttachmentSource::Upload)
            .collect();

        let mut stored = Vec::with_capacity(parsed.drafts.len());
        for draft in parsed.drafts {
            let request = PersistRequest {
                draft,
                delivery_id: receipt.receipt_id.clone(),
                received_at: receipt.received_at,
                attachments: attachments.clone(),
            };
            stored.push(self.writer.persist(&request).await?.message);
        }
        Ok(stored)
    }
}
