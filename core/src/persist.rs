//! Record writer
//!
//! Turns one draft into one stored message for one recipient. Writes go in a
//! fixed order: attachments, body blob, thread relation, metadata record.
//! The metadata record goes last because it is what makes the message
//! visible to queries; a failure before it leaves orphaned blobs and no
//! visible message.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::PostboxResult;
use crate::mailbox::MessageState;
use crate::message::{iso_instant, recipient_sender, timestamp_key, Message, MessageDraft, RawAttachment, StorageKeys, ThreadRelation};
use crate::storage::{to_item, BlobMeta, BlobStore, PutCondition, RecordStore, Table};
use crate::threading::{ThreadResolution, ThreadResolver};

/// Buffered events per subscriber before the slowest starts lagging
const EVENT_CAPACITY: usize = 256;

/// Published after a message becomes visible
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMailEvent {
    pub recipient: String,
    pub sender: String,
    pub subject: String,
    pub s3_key: String,
    pub timestamp: String,
}

impl From<&Message> for NewMailEvent {
    fn from(message: &Message) -> Self {
        Self {
            recipient: message.recipient.clone(),
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            s3_key: message.s3_key.clone(),
            timestamp: message.timestamp.clone(),
        }
    }
}

/// Where an attachment's bytes come from
#[derive(Debug, Clone, PartialEq)]
pub enum AttachmentSource {
    /// Extracted from an inbound message
    Upload(RawAttachment),
    /// Already uploaded under a pending key, copied into place
    Pending {
        key: String,
        filename: String,
        content_type: String,
    },
}

impl AttachmentSource {
    fn filename(&self) -> &str {
        match self {
            AttachmentSource::Upload(raw) => &raw.filename,
            AttachmentSource::Pending { filename, .. } => filename,
        }
    }
}

/// Everything needed to store one recipient's copy
#[derive(Debug, Clone)]
pub struct PersistRequest {
    pub draft: MessageDraft,
    /// Inbound receipt id or outbound transmit id, used in storage keys
    pub delivery_id: String,
    pub received_at: DateTime<Utc>,
    pub attachments: Vec<AttachmentSource>,
}

/// Result of a successful [`RecordWriter::persist`]
#[derive(Debug, Clone, PartialEq)]
pub struct PersistOutcome {
    pub message: Message,
    pub is_new_thread: bool,
}

/// Writes messages and announces them
#[derive(Clone)]
pub struct RecordWriter {
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    resolver: ThreadResolver,
    events: broadcast::Sender<NewMailEvent>,
}

impl RecordWriter {
    pub fn new(records: Arc<dyn RecordStore>, blobs: Arc<dyn BlobStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            resolver: ThreadResolver::new(records.clone()),
            records,
            blobs,
            events,
        }
    }

    /// Receive a [`NewMailEvent`] for every message stored from now on
    pub fn subscribe(&self) -> broadcast::Receiver<NewMailEvent> {
        self.events.subscribe()
    }

    /// Store one recipient's copy of a message
    pub async fn persist(&self, request: &PersistRequest) -> PostboxResult<PersistOutcome> {
        let draft = &request.draft;
        let resolution = self
            .resolver
            .resolve(
                &draft.message_id,
                draft.in_reply_to.as_deref(),
                &draft.references,
                &draft.recipient,
            )
            .await;

        match self.write(request, resolution).await {
            Ok(message) => {
                tracing::info!(
                    "Stored message {} for {} in thread {}",
                    message.message_id,
                    message.recipient,
                    message.thread_id
                );
                // No subscribers is not an error
                let _ = self.events.send(NewMailEvent::from(&message));
                Ok(PersistOutcome {
                    message,
                    is_new_thread: resolution.is_new_thread,
                })
            }
            Err(e) => {
                tracing::error!(
                    "Failed to store message {} for {}: {}",
                    draft.message_id,
                    draft.recipient,
                    e
                );
                Err(e)
            }
        }
    }

    async fn write(&self, request: &PersistRequest, resolution: ThreadResolution) -> PostboxResult<Message> {
        let draft = &request.draft;
        let id = Uuid::new_v4();
        let keys = StorageKeys::new(&draft.recipient, request.received_at, &request.delivery_id);

        let mut attachment_keys = Vec::with_capacity(request.attachments.len());
        for (position, attachment) in request.attachments.iter().enumerate() {
            let key = keys.attachment_key(position, attachment.filename());
            self.write_attachment(&key, attachment, draft).await?;
            attachment_keys.push(key);
        }

        let state = MessageState::initial();
        let message = Message {
            id,
            recipient: draft.recipient.clone(),
            sender: draft.sender.clone(),
            recipient_sender: recipient_sender(&draft.recipient, &draft.sender),
            cc: draft.cc.clone(),
            bcc: draft.bcc.clone(),
            reply_to: draft.reply_to.clone(),
            subject: draft.subject.clone(),
            body: Some(draft.body.clone()),
            s3_key: keys.body_key(),
            attachment_keys,
            timestamp: timestamp_key(request.received_at, id),
            created_at: iso_instant(request.received_at),
            read: state.read,
            archived: state.archived,
            thread_id: resolution.thread_id,
            message_id: draft.message_id.clone(),
            in_reply_to: draft.in_reply_to.clone(),
            references: draft.references.clone(),
        };

        let body_meta = BlobMeta::json()
            .with("message-id", &message.message_id)
            .with("recipient", &message.recipient)
            .with("sender", &message.sender)
            .with("subject", &message.subject);
        self.blobs
            .put(&message.s3_key, Bytes::from(serde_json::to_vec(&message)?), body_meta)
            .await?;

        self.records
            .put(
                Table::ThreadRelations,
                to_item(&ThreadRelation::from(&message))?,
                PutCondition::Always,
            )
            .await?;

        self.records
            .put(Table::Emails, to_item(&message.to_metadata())?, PutCondition::NotExists)
            .await?;

        Ok(message)
    }

    async fn write_attachment(&self, key: &str, attachment: &AttachmentSource, draft: &MessageDraft) -> PostboxResult<()> {
        let meta = |content_type: &str| {
            BlobMeta::new(content_type)
                .with("message-id", &draft.message_id)
                .with("recipient", &draft.recipient)
                .with("original-filename", attachment.filename())
        };

        match attachment {
            AttachmentSource::Upload(raw) => {
                let mut meta = meta(&raw.content_type);
                if let Some(content_id) = &raw.content_id {
                    meta = meta.with("content-id", content_id);
                }
                tracing::debug!("Storing attachment {}", key);
                self.blobs.put(key, raw.content.clone(), meta).await
            }
            AttachmentSource::Pending {
                key: pending,
                content_type,
                ..
            } => {
                tracing::debug!("Copying attachment {} to {}", pending, key);
                self.blobs.copy(pending, key, Some(meta(content_type))).await
            }
        }
    }
}
