//! Outbound mail
//!
//! Validate, load pending attachments, transmit once, then store one sent
//! copy per `To` address. A retry after a partial failure transmits again.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{SmtpConfig, SmtpSecurity};
use crate::error::{PostboxError, PostboxResult};
use crate::message::{key_filename, pending_key_owner, sanitize_address, validate_address, MessageDraft};
use crate::persist::{AttachmentSource, PersistRequest, RecordWriter};
use crate::storage::BlobStore;

/// What a client asks to send
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub reply_to: Vec<String>,
    /// Pending upload keys
    #[serde(default)]
    pub attachment_keys: Vec<String>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub references: Vec<String>,
}

/// Attachment ready for transmission
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingAttachment {
    pub pending_key: String,
    pub filename: String,
    pub content_type: String,
    pub content: Bytes,
}

/// A fully resolved message handed to a [`Transmitter`]
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMail {
    pub from: String,
    pub envelope: OutboundEnvelope,
    pub message_id: String,
    pub attachments: Vec<OutgoingAttachment>,
}

/// Sends mail to the outside world
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transmitter: Send + Sync {
    /// Returns a provider-assigned message id when the provider issues one
    async fn transmit(&self, mail: &OutgoingMail) -> PostboxResult<Option<String>>;
}

/// Result of a successful send
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    pub message_id: String,
    pub recipients: Vec<String>,
}

/// [`Transmitter`] over an SMTP relay
pub struct SmtpTransmitter {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransmitter {
    pub fn from_config(config: &SmtpConfig) -> PostboxResult<Self> {
        let builder = match config.security {
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?,
            SmtpSecurity::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?,
            SmtpSecurity::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
        };
        let mut builder = builder.port(config.port);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        Ok(Self {
            transport: builder.build(),
        })
    }
}

/// Build the MIME message for `mail`
pub fn build_email(mail: &OutgoingMail) -> PostboxResult<lettre::Message> {
    let envelope = &mail.envelope;
    let mut builder = lettre::Message::builder()
        .from(mail.from.parse::<Mailbox>()?)
        .subject(envelope.subject.clone())
        .message_id(Some(mail.message_id.clone()));

    for to in &envelope.to {
        builder = builder.to(to.parse::<Mailbox>()?);
    }
    for cc in &envelope.cc {
        builder = builder.cc(cc.parse::<Mailbox>()?);
    }
    for bcc in &envelope.bcc {
        builder = builder.bcc(bcc.parse::<Mailbox>()?);
    }
    for reply_to in &envelope.reply_to {
        builder = builder.reply_to(reply_to.parse::<Mailbox>()?);
    }
    if let Some(in_reply_to) = &envelope.in_reply_to {
        builder = builder.in_reply_to(in_reply_to.clone());
    }
    if !envelope.references.is_empty() {
        builder = builder.references(envelope.references.join(" "));
    }

    let mut parts = MultiPart::mixed().singlepart(SinglePart::html(envelope.body.clone()));
    for attachment in &mail.attachments {
        let content_type = ContentType::parse(&attachment.content_type)
            .map_err(|_| PostboxError::validation(format!("Bad content type {}", attachment.content_type)))?;
        parts = parts.singlepart(Attachment::new(attachment.filename.clone()).body(attachment.content.to_vec(), content_type));
    }

    Ok(builder.multipart(parts)?)
}

#[async_trait]
impl Transmitter for SmtpTransmitter {
    async fn transmit(&self, mail: &OutgoingMail) -> PostboxResult<Option<String>> {
        let email = build_email(mail)?;
        let response = self.transport.send(email).await?;
        tracing::info!("Relay accepted {}: {:?}", mail.message_id, response.code());
        Ok(None)
    }
}

/// Outbound pipeline
#[derive(Clone)]
pub struct SendPipeline {
    blobs: Arc<dyn BlobStore>,
    writer: RecordWriter,
    transmitter: Arc<dyn Transmitter>,
    domain: String,
}

impl SendPipeline {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        writer: RecordWriter,
        transmitter: Arc<dyn Transmitter>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            blobs,
            writer,
            transmitter,
            domain: domain.into(),
        }
    }

    fn validate(&self, sender: &str, envelope: &OutboundEnvelope) -> PostboxResult<()> {
        if envelope.to.is_empty() || envelope.subject.trim().is_empty() || envelope.body.trim().is_empty() {
            return Err(PostboxError::validation("to (non-empty), subject and body are required"));
        }
        for address in envelope
            .to
            .iter()
            .chain(&envelope.cc)
            .chain(&envelope.bcc)
            .chain(&envelope.reply_to)
        {
            validate_address(address)?;
        }
        if !sender.to_lowercase().ends_with(&format!("@{}", self.domain.to_lowercase())) {
            return Err(PostboxError::validation(format!(
                "from address must be on the sending domain {}",
                self.domain
            )));
        }
        Ok(())
    }

    async fn load_attachments(&self, sender: &str, keys: &[String]) -> PostboxResult<Vec<OutgoingAttachment>> {
        let owner = sanitize_address(sender);
        let mut attachments = Vec::with_capacity(keys.len());
        for key in keys {
            if pending_key_owner(key) != Some(owner.as_str()) {
                return Err(PostboxError::forbidden(format!("Attachment {} is not yours", key)));
            }
            let blob = self.blobs.get(key).await?;
            attachments.push(OutgoingAttachment {
                pending_key: key.clone(),
                filename: key_filename(key).to_string(),
                content_type: blob.meta.content_type,
                content: blob.data,
            });
        }
        Ok(attachments)
    }

    /// Transmit `envelope` from `sender` and store a copy per `To` address
    pub async fn send(&self, sender: &str, envelope: OutboundEnvelope) -> PostboxResult<SendReceipt> {
        self.validate(sender, &envelope)?;
        let attachments = self.load_attachments(sender, &envelope.attachment_keys).await?;

        let generated = format!("<{}@{}>", Uuid::new_v4(), self.domain);
        let mail = OutgoingMail {
            from: sender.to_string(),
            envelope,
            message_id: generated.clone(),
            attachments,
        };
        let message_id = match self.transmitter.transmit(&mail).await {
            Ok(provider_id) => provider_id.unwrap_or(generated),
            Err(e) => {
                tracing::error!("Error sending {}: {}", mail.message_id, e);
                return Err(e);
            }
        };
        tracing::info!("Email sent successfully with message id {}", message_id);

        let sent_at = Utc::now();
        let sources: Vec<AttachmentSource> = mail
            .attachments
            .iter()
            .map(|a| AttachmentSource::Pending {
                key: a.pending_key.clone(),
                filename: a.filename.clone(),
                content_type: a.content_type.clone(),
            })
            .collect();

        let envelope = mail.envelope;
        for recipient in &envelope.to {
            let draft = MessageDraft {
                recipient: recipient.clone(),
                sender: sender.to_string(),
                cc: envelope.cc.clone(),
                bcc: envelope.bcc.clone(),
                reply_to: envelope.reply_to.clone(),
                subject: envelope.subject.clone(),
                body: envelope.body.clone(),
                message_id: message_id.clone(),
                in_reply_to: envelope.in_reply_to.clone(),
                references: envelope.references.clone(),
            };
            let request = PersistRequest {
                draft,
                delivery_id: message_id.clone(),
                received_at: sent_at,
                attachments: sources.clone(),
            };
            self.writer.persist(&request).await?;
        }

        Ok(SendReceipt {
            message_id,
            recipients: envelope.to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{classify, MailboxKind};
    use crate::query::{ListRequest, MailboxQuery};
    use crate::storage::BlobMeta;
    use crate::test_support::memory_stores;

    fn envelope(to: &[&str]) -> OutboundEnvelope {
        OutboundEnvelope {
            to: to.iter().map(|s| s.to_string()).collect(),
            subject: "Plans".to_string(),
            body: "<p>See you</p>".to_string(),
            ..OutboundEnvelope::default()
        }
    }

    fn pipeline(transmitter: MockTransmitter) -> (SendPipeline, MailboxQuery, Arc<crate::storage::MemoryBlobStore>) {
        let (records, blobs) = memory_stores();
        let writer = RecordWriter::new(records.clone(), blobs.clone());
        let send = SendPipeline::new(blobs.clone(), writer, Arc::new(transmitter), "x.org");
        (send, MailboxQuery::new(records, blobs.clone()), blobs)
    }

    #[tokio::test]
    async fn test_multi_recipient_fan_out() {
        let mut transmitter = MockTransmitter::new();
        transmitter.expect_transmit().times(1).returning(|_| Ok(None));
        let (send, query, _) = pipeline(transmitter);

        let receipt = send.send("me@x.org", envelope(&["a@y.org", "b@z.org"])).await.unwrap();
        assert!(receipt.message_id.ends_with("@x.org>"));
        assert_eq!(receipt.recipients, vec!["a@y.org".to_string(), "b@z.org".to_string()]);

        let sent = ListRequest {
            mailbox: Some(MailboxKind::Sent),
            ..ListRequest::default()
        };
        let page = query.list("me@x.org", &sent).await.unwrap();
        assert_eq!(page.count, 2);
        for message in &page.messages {
            assert_eq!(message.message_id, receipt.message_id);
            assert_eq!(classify(message, "me@x.org"), MailboxKind::Sent);
        }
        assert_ne!(page.messages[0].id, page.messages[1].id);
    }

    #[tokio::test]
    async fn test_provider_id_is_used() {
        let mut transmitter = MockTransmitter::new();
        transmitter
            .expect_transmit()
            .returning(|_| Ok(Some("0100abc-provider".to_string())));
        let (send, _, blobs) = pipeline(transmitter);

        let receipt = send.send("me@x.org", envelope(&["a@y.org"])).await.unwrap();
        assert_eq!(receipt.message_id, "0100abc-provider");
        let keys = blobs.keys().await;
        assert!(keys.iter().any(|k| k.starts_with("a@y.org/") && k.ends_with("/0100abc-provider.json")));
    }

    #[tokio::test]
    async fn test_validation_rejects_before_transmit() {
        let mut transmitter = MockTransmitter::new();
        transmitter.expect_transmit().times(0);
        let (send, _, _) = pipeline(transmitter);

        assert!(send.send("me@x.org", envelope(&[])).await.is_err());
        assert!(send.send("me@x.org", envelope(&["not an address"])).await.is_err());
        assert!(send.send("me@elsewhere.org", envelope(&["a@y.org"])).await.is_err());
    }

    #[tokio::test]
    async fn test_foreign_pending_attachment_is_forbidden() {
        let mut transmitter = MockTransmitter::new();
        transmitter.expect_transmit().times(0);
        let (send, _, _) = pipeline(transmitter);

        let mut request = envelope(&["a@y.org"]);
        request.attachment_keys = vec!["attachments/pending/other@x.org/u1/secret.pdf".to_string()];
        let err = send.send("me@x.org", request).await.unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn test_attachments_copied_per_recipient() {
        let mut transmitter = MockTransmitter::new();
        transmitter
            .expect_transmit()
            .withf(|mail: &OutgoingMail| mail.attachments.len() == 1 && mail.attachments[0].filename == "plan.txt")
            .returning(|_| Ok(None));
        let (send, _, blobs) = pipeline(transmitter);
        blobs
            .put(
                "attachments/pending/me@x.org/u1/plan.txt",
                Bytes::from_static(b"plan"),
                BlobMeta::new("text/plain"),
            )
            .await
            .unwrap();

        let mut request = envelope(&["a@y.org", "b@z.org"]);
        request.attachment_keys = vec!["attachments/pending/me@x.org/u1/plan.txt".to_string()];
        send.send("me@x.org", request).await.unwrap();

        let keys = blobs.keys().await;
        assert!(keys.iter().any(|k| k.starts_with("a@y.org/") && k.ends_with("/plan.txt")));
        assert!(keys.iter().any(|k| k.starts_with("b@z.org/") && k.ends_with("/plan.txt")));
    }

    #[tokio::test]
    async fn test_transmit_failure_stores_nothing() {
        let mut transmitter = MockTransmitter::new();
        transmitter
            .expect_transmit()
            .returning(|_| Err(PostboxError::transmit("relay down")));
        let (send, query, _) = pipeline(transmitter);

        assert!(send.send("me@x.org", envelope(&["a@y.org"])).await.is_err());
        let sent = ListRequest {
            mailbox: Some(MailboxKind::Sent),
            ..ListRequest::default()
        };
        assert_eq!(query.list("me@x.org", &sent).await.unwrap().count, 0);
    }

    #[test]
    fn test_build_email_headers() {
        let mut request = envelope(&["a@y.org"]);
        request.in_reply_to = Some("<q0@y.org>".to_string());
        request.references = vec!["<root@y.org>".to_string(), "<q0@y.org>".to_string()];
        let mail = OutgoingMail {
            from: "me@x.org".to_string(),
            envelope: request,
            message_id: "<m1@x.org>".to_string(),
            attachments: vec![OutgoingAttachment {
                pending_key: "attachments/pending/me@x.org/u/a.txt".to_string(),
                filename: "a.txt".to_string(),
                content_type: "text/plain".to_string(),
                content: Bytes::from_static(b"hello"),
            }],
        };

        let formatted = String::from_utf8(build_email(&mail).unwrap().formatted()).unwrap();
        assert!(formatted.contains("Message-ID: <m1@x.org>"));
        assert!(formatted.contains("In-Reply-To: <q0@y.org>"));
        assert!(formatted.contains("References: <root@y.org> <q0@y.org>"));
        assert!(formatted.contains("filename=\"a.txt\""));
    }
}
