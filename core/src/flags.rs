//! Read/archive state mutator
//!
//! The metadata record is authoritative. The body blob carries a copy of
//! the flags which is rewritten after every successful record update; if
//! that second write fails the caller is told, but the update stands.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{PostboxError, PostboxResult};
use crate::mailbox::{classify, Flag, FlagPatch, MailboxKind, MessageState};
use crate::message::Message;
use crate::storage::{from_item, table_key, BlobStore, FieldUpdate, RecordStore, Table, Updates};

/// What a flag update achieved
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FlagUpdateOutcome {
    /// Record and body blob agree
    Synced {
        updated: FlagPatch,
        message: Message,
        mailbox: MailboxKind,
    },
    /// Record updated, body blob left stale
    MetadataOnly {
        updated: FlagPatch,
        message: Message,
        mailbox: MailboxKind,
        error: String,
    },
}

impl FlagUpdateOutcome {
    pub fn message(&self) -> &Message {
        match self {
            FlagUpdateOutcome::Synced { message, .. } | FlagUpdateOutcome::MetadataOnly { message, .. } => message,
        }
    }

    pub fn mailbox(&self) -> MailboxKind {
        match self {
            FlagUpdateOutcome::Synced { mailbox, .. } | FlagUpdateOutcome::MetadataOnly { mailbox, .. } => *mailbox,
        }
    }

    pub fn is_synced(&self) -> bool {
        matches!(self, FlagUpdateOutcome::Synced { .. })
    }
}

fn patch_updates(patch: &FlagPatch) -> Updates {
    vec![
        ("read".to_string(), FieldUpdate::from_option(patch.read.map(Value::Bool))),
        ("archived".to_string(), FieldUpdate::from_option(patch.archived.map(Value::Bool))),
    ]
}

/// Changes `read` and `archived`
#[derive(Clone)]
pub struct FlagMutator {
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
}

impl FlagMutator {
    pub fn new(records: Arc<dyn RecordStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { records, blobs }
    }

    /// Apply `patch` to the message at `(recipient, timestamp)`
    pub async fn set_flags(&self, recipient: &str, timestamp: &str, patch: FlagPatch) -> PostboxResult<FlagUpdateOutcome> {
        if recipient.is_empty() || timestamp.is_empty() {
            return Err(PostboxError::validation("recipient and timestamp are required"));
        }
        if patch.is_empty() {
            return Err(PostboxError::validation("At least one of read or archived must be provided"));
        }

        let key = table_key(Table::Emails, recipient, timestamp);
        let item = self.records.update(Table::Emails, &key, &patch_updates(&patch)).await?;
        let message: Message = from_item(item)?;
        let mailbox = classify(&message, recipient);
        tracing::info!("Updated flags of {} for {}: {:?}", message.message_id, recipient, patch);

        match self.sync_body(&message.s3_key, &patch).await {
            Ok(()) => Ok(FlagUpdateOutcome::Synced {
                updated: patch,
                message,
                mailbox,
            }),
            Err(e) => {
                tracing::error!("Flags of {} updated but body {} is stale: {}", timestamp, message.s3_key, e);
                Ok(FlagUpdateOutcome::MetadataOnly {
                    updated: patch,
                    message,
                    mailbox,
                    error: e.to_string(),
                })
            }
        }
    }

    /// Flip one flag of the message at `(recipient, timestamp)`
    pub async fn toggle(&self, recipient: &str, timestamp: &str, flag: Flag) -> PostboxResult<FlagUpdateOutcome> {
        if recipient.is_empty() || timestamp.is_empty() {
            return Err(PostboxError::validation("recipient and timestamp are required"));
        }
        let key = table_key(Table::Emails, recipient, timestamp);
        let item = self
            .records
            .get(Table::Emails, &key)
            .await?
            .ok_or_else(|| PostboxError::not_found(format!("message {} for {}", timestamp, recipient)))?;
        let current: Message = from_item(item)?;
        let patch = FlagPatch::toggling(MessageState::of(&current), flag);
        self.set_flags(recipient, timestamp, patch).await
    }

    async fn sync_body(&self, s3_key: &str, patch: &FlagPatch) -> PostboxResult<()> {
        if s3_key.is_empty() {
            return Err(PostboxError::blob("Record has no body key"));
        }
        let blob = self.blobs.get(s3_key).await?;
        let mut body: Message = serde_json::from_slice(&blob.data)?;
        patch.apply_to(&mut body);
        self.blobs
            .put(s3_key, Bytes::from(serde_json::to_vec(&body)?), blob.meta)
            .await
    }
}
