//! Postbox Core Library
//!
//! This crate contains the engine of the Postbox mail backend, including:
//! - Message model and storage keys
//! - Thread resolution over Message-ID / In-Reply-To / References
//! - Mailbox classification and the record writer
//! - Mailbox listing, thread fetch and read/archive flags
//! - Inbound parsing and outbound sending
//! - Storage adapters (in-memory, SQLite, filesystem blobs)

pub mod auth;
pub mod config;
pub mod error;
pub mod flags;
pub mod ingest;
pub mod mailbox;
pub mod message;
pub mod persist;
pub mod query;
pub mod send;
pub mod service;
pub mod storage;
pub mod threading;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use auth::{AuthCache, AuthRequest, Authenticator, DirectoryAuthenticator, Identity, StaticDirectory};
pub use config::Config;
pub use error::{PostboxError, PostboxResult};
pub use flags::{FlagMutator, FlagUpdateOutcome};
pub use ingest::{InboundReceipt, Ingestor, MailparseParser, MimeParser};
pub use mailbox::{classify, Flag, FlagPatch, MailboxKind, MessageState};
pub use message::{Message, MessageDraft};
pub use persist::{NewMailEvent, RecordWriter};
pub use query::{ListPage, ListRequest, MailboxQuery};
pub use send::{OutboundEnvelope, SendPipeline, SendReceipt, SmtpTransmitter, Transmitter};
pub use service::MailService;
pub use storage::{FsBlobStore, SqliteRecordStore, StorageManager, UrlSigner};
pub use threading::{ThreadResolution, ThreadResolver};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Postbox";

/// Default configuration directory name
pub const CONFIG_DIR_NAME: &str = "postbox";

/// Default configuration filename
pub const CONFIG_FILENAME: &str = "config.toml";

/// Default database filename
pub const DB_FILENAME: &str = "postbox.db";

/// Default blob directory name
pub const BLOB_DIR_NAME: &str = "blobs";

/// Get the default configuration directory
pub fn get_config_dir() -> PostboxResult<std::path::PathBuf> {
    let config_dir = std::env::var("POSTBOX_CONFIG_DIR")
        .map(std::path::PathBuf::from)
        .or_else(|_| {
            directories::ProjectDirs::from("", "", CONFIG_DIR_NAME)
                .map(|dirs| dirs.config_dir().to_path_buf())
                .ok_or(std::env::VarError::NotPresent)
        })
        .unwrap_or_else(|_| std::path::PathBuf::from("~/.config/postbox"));

    std::fs::create_dir_all(&config_dir).map_err(|_| PostboxError::ConfigDirCreateFailed(config_dir.clone()))?;

    Ok(config_dir)
}

/// Get the default data directory
pub fn get_data_dir() -> PostboxResult<std::path::PathBuf> {
    let data_dir = std::env::var("POSTBOX_DATA_DIR")
        .map(std::path::PathBuf::from)
        .or_else(|_| {
            directories::ProjectDirs::from("", "", CONFIG_DIR_NAME)
                .map(|dirs| dirs.data_dir().to_path_buf())
                .ok_or(std::env::VarError::NotPresent)
        })
        .unwrap_or_else(|_| std::path::PathBuf::from("~/.local/share/postbox"));

    std::fs::create_dir_all(&data_dir).map_err(|_| PostboxError::DataDirCreateFailed(data_dir.clone()))?;

    Ok(data_dir)
}
