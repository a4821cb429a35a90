//! Authenticated service surface
//!
//! Every call resolves the caller first and only touches storage keys under
//! mailboxes the caller owns.

use futures::future::try_join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::{AuthRequest, Authenticator, Identity};
use crate::error::{PostboxError, PostboxResult};
use crate::flags::{FlagMutator, FlagUpdateOutcome};
use crate::ingest::{Ingestor, MimeParser};
use crate::mailbox::{Flag, FlagPatch};
use crate::message::{key_filename, pending_attachment_key, sanitize_address, Message};
use crate::persist::RecordWriter;
use crate::query::{ListPage, ListRequest, MailboxQuery};
use crate::send::{OutboundEnvelope, SendPipeline, SendReceipt, Transmitter};
use crate::storage::{BlobStore, Disposition, StorageManager};

/// Lifetime of attachment view/download URLs
pub const DEFAULT_URL_TTL: Duration = Duration::from_secs(3600);

/// Lifetime of attachment upload URLs
pub const UPLOAD_URL_TTL: Duration = Duration::from_secs(15 * 60);

/// Presigned access to one stored attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentLink {
    pub key: String,
    pub filename: String,
    pub view_url: String,
    pub download_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
}

/// A message with its attachment links
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub attachments: Vec<AttachmentLink>,
}

/// Response of [`MailService::detail`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageDetail {
    pub message: MessageView,
    /// Whole conversation, oldest first; empty unless requested
    pub thread: Vec<MessageView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadView {
    pub thread_id: Uuid,
    pub messages: Vec<MessageView>,
    pub count: usize,
}

/// Where and how to upload an attachment before sending
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadTicket {
    pub upload_url: String,
    pub attachment_key: String,
    pub attachment_id: Uuid,
}

/// Mail operations on behalf of an authenticated caller
#[derive(Clone)]
pub struct MailService {
    authenticator: Arc<dyn Authenticator>,
    blobs: Arc<dyn BlobStore>,
    writer: RecordWriter,
    query: MailboxQuery,
    flags: FlagMutator,
    sender: SendPipeline,
    url_ttl: Duration,
}

impl MailService {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        storage: &StorageManager,
        transmitter: Arc<dyn Transmitter>,
        domain: impl Into<String>,
    ) -> Self {
        let records = storage.records();
        let blobs = storage.blobs();
        let writer = RecordWriter::new(records.clone(), blobs.clone());
        Self {
            authenticator,
            query: MailboxQuery::new(records.clone(), blobs.clone()),
            flags: FlagMutator::new(records, blobs.clone()),
            sender: SendPipeline::new(blobs.clone(), writer.clone(), transmitter, domain),
            writer,
            blobs,
            url_ttl: DEFAULT_URL_TTL,
        }
    }

    pub fn with_url_ttl(mut self, ttl: Duration) -> Self {
        self.url_ttl = ttl;
        self
    }

    pub fn with_page_size(mut self, limit: usize) -> Self {
        self.query = self.query.with_default_limit(limit);
        self
    }

    pub fn blobs(&self) -> Arc<dyn BlobStore> {
        self.blobs.clone()
    }

    /// Writer shared by sends and ingestion; subscribe here for new mail
    pub fn writer(&self) -> &RecordWriter {
        &self.writer
    }

    /// Inbound pipeline storing through the same writer
    pub fn ingestor(&self, parser: Arc<dyn MimeParser>) -> Ingestor {
        Ingestor::new(self.blobs.clone(), self.writer.clone(), parser)
    }

    pub async fn list(&self, auth: &AuthRequest, request: &ListRequest) -> PostboxResult<ListPage> {
        let identity = self.authenticator.authenticate(auth).await?;
        self.query.list(&identity.default_recipient, request).await
    }

    /// Full message stored at `s3_key`, optionally with its conversation
    pub async fn detail(&self, auth: &AuthRequest, s3_key: &str, include_thread: bool) -> PostboxResult<MessageDetail> {
        if s3_key.trim().is_empty() {
            return Err(PostboxError::validation("s3_key is required"));
        }
        let identity = self.authenticator.authenticate(auth).await?;
        authorize_key(&identity, s3_key)?;

        let message = self.query.load_body(s3_key).await?;
        let thread = if include_thread {
            let members = self.query.get_thread(message.thread_id, &message.recipient, false).await?;
            self.views(members).await?
        } else {
            Vec::new()
        };

        Ok(MessageDetail {
            message: self.view(message).await?,
            thread,
        })
    }

    pub async fn get_thread(&self, auth: &AuthRequest, thread_id: Uuid, include_body: bool) -> PostboxResult<ThreadView> {
        let identity = self.authenticator.authenticate(auth).await?;
        let members = self
            .query
            .get_thread(thread_id, &identity.default_recipient, include_body)
            .await?;
        let messages = self.views(members).await?;
        Ok(ThreadView {
            thread_id,
            count: messages.len(),
            messages,
        })
    }

    pub async fn send(&self, auth: &AuthRequest, envelope: OutboundEnvelope) -> PostboxResult<SendReceipt> {
        let identity = self.authenticator.authenticate(auth).await?;
        for key in &envelope.attachment_keys {
            if !identity.owns_pending_key(key) {
                tracing::warn!("{} tried to send foreign attachment {}", identity.phone_number, key);
                return Err(PostboxError::forbidden(format!("Attachment {} is not yours", key)));
            }
        }
        self.sender.send(&identity.default_recipient, envelope).await
    }

    /// Set read/archived on one of the caller's messages
    pub async fn update(&self, auth: &AuthRequest, timestamp: &str, patch: FlagPatch) -> PostboxResult<FlagUpdateOutcome> {
        let identity = self.authenticator.authenticate(auth).await?;
        self.flags.set_flags(&identity.default_recipient, timestamp, patch).await
    }

    /// Flip read or archived on one of the caller's messages
    pub async fn toggle(&self, auth: &AuthRequest, timestamp: &str, flag: Flag) -> PostboxResult<FlagUpdateOutcome> {
        let identity = self.authenticator.authenticate(auth).await?;
        self.flags.toggle(&identity.default_recipient, timestamp, flag).await
    }

    /// Presigned upload target under the caller's pending prefix
    pub async fn attachment_upload_url(
        &self,
        auth: &AuthRequest,
        filename: &str,
        content_type: &str,
    ) -> PostboxResult<UploadTicket> {
        if filename.is_empty() || filename.contains('/') || content_type.is_empty() {
            return Err(PostboxError::validation("filename and contentType are required"));
        }
        let identity = self.authenticator.authenticate(auth).await?;
        let attachment_id = Uuid::new_v4();
        let attachment_key =
            pending_attachment_key(&sanitize_address(&identity.default_recipient), attachment_id, filename);
        let upload_url = self
            .blobs
            .presign(&attachment_key, &Disposition::Upload(content_type.to_string()), UPLOAD_URL_TTL)
            .await?;
        Ok(UploadTicket {
            upload_url,
            attachment_key,
            attachment_id,
        })
    }

    async fn views(&self, messages: Vec<Message>) -> PostboxResult<Vec<MessageView>> {
        try_join_all(messages.into_iter().map(|message| self.view(message))).await
    }

    async fn view(&self, message: Message) -> PostboxResult<MessageView> {
        let attachments = try_join_all(message.attachment_keys.iter().map(|key| self.link(key))).await?;
        Ok(MessageView { message, attachments })
    }

    async fn link(&self, key: &str) -> PostboxResult<AttachmentLink> {
        let filename = key_filename(key).to_string();
        let download = Disposition::Attachment(filename.clone());
        let (view_url, download_url) = futures::try_join!(
            self.blobs.presign(key, &Disposition::Inline, self.url_ttl),
            self.blobs.presign(key, &download, self.url_ttl),
        )?;
        let content_id = match self.blobs.head(key).await {
            Ok(meta) => meta.metadata.get("content-id").cloned(),
            Err(e) => {
                tracing::warn!("Failed to read metadata of {}: {}", key, e);
                None
            }
        };
        Ok(AttachmentLink {
            key: key.to_string(),
            filename,
            view_url,
            download_url,
            content_id,
        })
    }
}

fn authorize_key(identity: &Identity, key: &str) -> PostboxResult<()> {
    if identity.owns_key(key) {
        Ok(())
    } else {
        tracing::warn!("{} denied access to {}", identity.phone_number, key);
        Err(PostboxError::forbidden("Access denied"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthCache, DirectoryAuthenticator, StaticDirectory};
    use crate::mailbox::MailboxKind;
    use crate::message::RawAttachment;
    use crate::persist::{AttachmentSource, PersistRequest};
    use crate::send::MockTransmitter;
    use crate::test_support::{draft, signer};
    use bytes::Bytes;
    use chrono::Utc;
    use std::collections::HashMap;

    fn service(transmitter: MockTransmitter) -> MailService {
        let mut entries = HashMap::new();
        entries.insert("+1".to_string(), vec!["jane".to_string()]);
        entries.insert("+2".to_string(), vec!["john".to_string()]);
        let authenticator = DirectoryAuthenticator::new(
            Arc::new(StaticDirectory::new(entries)),
            AuthCache::new(Duration::from_secs(60), 16),
            "x.org",
        );
        MailService::new(
            Arc::new(authenticator),
            &StorageManager::in_memory(signer()),
            Arc::new(transmitter),
            "x.org",
        )
    }

    async fn deliver(service: &MailService, attachments: Vec<AttachmentSource>) -> Message {
        let request = PersistRequest {
            draft: draft("you@y.org", "jane@x.org", "hello", "<a@y.org>"),
            delivery_id: "r-1".to_string(),
            received_at: Utc::now(),
            attachments,
        };
        service.writer().persist(&request).await.unwrap().message
    }

    #[tokio::test]
    async fn test_detail_with_attachment_links() {
        let service = service(MockTransmitter::new());
        let stored = deliver(
            &service,
            vec![AttachmentSource::Upload(RawAttachment {
                filename: "logo.png".to_string(),
                content_type: "image/png".to_string(),
                content: Bytes::from_static(b"png"),
                content_id: Some("<logo>".to_string()),
            })],
        )
        .await;

        let detail = service.detail(&AuthRequest::phone("+1"), &stored.s3_key, true).await.unwrap();
        assert_eq!(detail.message.message.body.as_deref(), Some("<p>hello</p>"));
        let link = &detail.message.attachments[0];
        assert_eq!(link.filename, "logo.png");
        assert_eq!(link.content_id.as_deref(), Some("<logo>"));
        assert!(link.view_url.contains("disposition=inline"));
        assert_ne!(link.view_url, link.download_url);
        assert_eq!(detail.thread.len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_key_is_forbidden() {
        let service = service(MockTransmitter::new());
        let stored = deliver(&service, Vec::new()).await;

        let err = service.detail(&AuthRequest::phone("+2"), &stored.s3_key, false).await.unwrap_err();
        assert_eq!(err.status_code(), 403);

        let missing = service
            .detail(&AuthRequest::phone("+1"), "jane@x.org/2025-01-01/gone.json", false)
            .await
            .unwrap_err();
        assert!(missing.is_not_found());

        let anonymous = service.detail(&AuthRequest::default(), &stored.s3_key, false).await.unwrap_err();
        assert_eq!(anonymous.status_code(), 401);
    }

    #[tokio::test]
    async fn test_list_thread_and_update() {
        let service = service(MockTransmitter::new());
        let stored = deliver(&service, Vec::new()).await;
        let me = AuthRequest::phone("+1");

        let page = service.list(&me, &ListRequest::default()).await.unwrap();
        assert_eq!(page.count, 1);
        assert!(service.list(&AuthRequest::phone("+2"), &ListRequest::default()).await.unwrap().messages.is_empty());

        let thread = service.get_thread(&me, stored.thread_id, true).await.unwrap();
        assert_eq!(thread.count, 1);
        assert!(thread.messages[0].message.body.is_some());

        let outcome = service.update(&me, &stored.timestamp, FlagPatch::archived(true)).await.unwrap();
        assert_eq!(outcome.mailbox(), MailboxKind::Archived);

        let outcome = service.toggle(&me, &stored.timestamp, Flag::Archived).await.unwrap();
        assert_eq!(outcome.mailbox(), MailboxKind::Inbox);
        let foreign = service.toggle(&AuthRequest::phone("+2"), &stored.timestamp, Flag::Read).await;
        assert!(foreign.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_upload_then_send() {
        let mut transmitter = MockTransmitter::new();
        transmitter.expect_transmit().times(1).returning(|_| Ok(None));
        let service = service(transmitter);
        let me = AuthRequest::phone("+1");

        let ticket = service.attachment_upload_url(&me, "notes.txt", "text/plain").await.unwrap();
        assert!(ticket.attachment_key.starts_with("attachments/pending/jane@x.org/"));
        assert!(ticket.upload_url.contains("upload"));
        service
            .blobs
            .put(&ticket.attachment_key, Bytes::from_static(b"notes"), crate::storage::BlobMeta::new("text/plain"))
            .await
            .unwrap();

        let envelope = OutboundEnvelope {
            to: vec!["you@y.org".to_string()],
            subject: "Notes".to_string(),
            body: "<p>attached</p>".to_string(),
            attachment_keys: vec![ticket.attachment_key.clone()],
            ..OutboundEnvelope::default()
        };
        let receipt = service.send(&me, envelope.clone()).await.unwrap();
        assert_eq!(receipt.recipients, vec!["you@y.org".to_string()]);

        let err = service.send(&AuthRequest::phone("+2"), envelope).await.unwrap_err();
        assert_eq!(err.status_code(), 403);
    }
}
