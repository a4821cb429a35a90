//! Mailbox classification for Postbox
//!
//! Mailboxes are derived views. Only `archived` is stored; "sent" falls out
//! of comparing the sender with whoever is looking.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::PostboxError;
use crate::message::Message;

/// Mailbox a message shows up in for one viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailboxKind {
    /// Received, not archived
    Inbox,
    /// Sent by the viewer, not archived
    Sent,
    /// Archived, whoever sent it
    Archived,
}

impl MailboxKind {
    /// Equality filter on `archived` used when listing this mailbox
    pub fn archived_filter(self) -> Option<bool> {
        match self {
            MailboxKind::Inbox => Some(false),
            MailboxKind::Archived => Some(true),
            MailboxKind::Sent => None,
        }
    }
}

impl std::fmt::Display for MailboxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailboxKind::Inbox => write!(f, "inbox"),
            MailboxKind::Sent => write!(f, "sent"),
            MailboxKind::Archived => write!(f, "archived"),
        }
    }
}

impl FromStr for MailboxKind {
    type Err = PostboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inbox" => Ok(MailboxKind::Inbox),
            "sent" => Ok(MailboxKind::Sent),
            "archived" => Ok(MailboxKind::Archived),
            other => Err(PostboxError::validation(format!("Unknown mailbox: {}", other))),
        }
    }
}

/// Decide which mailbox `message` belongs to for `viewer`.
///
/// `archived` wins, then `sender == viewer` means sent, everything else is
/// inbox. Every classification decision in the crate goes through here.
pub fn classify(message: &Message, viewer: &str) -> MailboxKind {
    if message.archived {
        MailboxKind::Archived
    } else if message.sender == viewer {
        MailboxKind::Sent
    } else {
        MailboxKind::Inbox
    }
}

/// Joint read/archived state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageState {
    pub read: bool,
    pub archived: bool,
}

impl MessageState {
    /// Every message starts unread and active
    pub fn initial() -> Self {
        Self::default()
    }

    pub fn of(message: &Message) -> Self {
        Self {
            read: message.read,
            archived: message.archived,
        }
    }

    pub fn toggle_read(self) -> Self {
        Self {
            read: !self.read,
            ..self
        }
    }

    pub fn toggle_archived(self) -> Self {
        Self {
            archived: !self.archived,
            ..self
        }
    }

    pub fn toggle(self, flag: Flag) -> Self {
        match flag {
            Flag::Read => self.toggle_read(),
            Flag::Archived => self.toggle_archived(),
        }
    }

    /// Apply a patch, leaving absent fields untouched
    pub fn apply(self, patch: &FlagPatch) -> Self {
        Self {
            read: patch.read.unwrap_or(self.read),
            archived: patch.archived.unwrap_or(self.archived),
        }
    }
}

/// One of the two stored flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Read,
    Archived,
}

impl FromStr for Flag {
    type Err = PostboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "read" => Ok(Flag::Read),
            "archived" => Ok(Flag::Archived),
            other => Err(PostboxError::validation(format!("Unknown flag: {}", other))),
        }
    }
}

/// Requested changes to the read/archived flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlagPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

impl FlagPatch {
    pub fn read(read: bool) -> Self {
        Self {
            read: Some(read),
            archived: None,
        }
    }

    pub fn archived(archived: bool) -> Self {
        Self {
            read: None,
            archived: Some(archived),
        }
    }

    /// Patch that flips `flag` on a message currently in `state`
    pub fn toggling(state: MessageState, flag: Flag) -> Self {
        let next = state.toggle(flag);
        match flag {
            Flag::Read => Self::read(next.read),
            Flag::Archived => Self::archived(next.archived),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_none() && self.archived.is_none()
    }

    /// Apply to a message in place
    pub fn apply_to(&self, message: &mut Message) {
        let state = MessageState::of(message).apply(self);
        message.read = state.read;
        message.archived = state.archived;
    }
}
