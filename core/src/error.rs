//! Error types for Postbox Core

use std::path::PathBuf;

/// Result type alias for Postbox operations
pub type PostboxResult<T> = Result<T, PostboxError>;

/// Main error type for Postbox
#[derive(Debug, thiserror::Error)]
pub enum PostboxError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to create configuration directory
    #[error("Failed to create configuration directory: {}", .0.display())]
    ConfigDirCreateFailed(PathBuf),

    /// Failed to create data directory
    #[error("Failed to create data directory: {}", .0.display())]
    DataDirCreateFailed(PathBuf),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Database migration error
    #[error("Database migration error: {0}")]
    DatabaseMigration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Message building errors
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::error::Error),

    /// SMTP transport errors
    #[error("SMTP transport error: {0}")]
    SmtpTransport(#[from] lettre::transport::smtp::Error),

    /// Address parsing errors
    #[error("Address parsing error: {0}")]
    AddressParsing(#[from] lettre::address::AddressError),

    /// MIME parsing errors
    #[error("MIME parsing error: {0}")]
    Mime(#[from] mailparse::MailParseError),

    /// URL parsing errors
    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    /// The caller presented no usable credentials
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// The caller is known but not allowed to touch the resource
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// A conditional write lost against existing state
    #[error("Condition failed: {0}")]
    ConditionFailed(String),

    /// Record store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Blob store errors
    #[error("Blob store error: {0}")]
    Blob(String),

    /// Raw message could not be turned into drafts
    #[error("Parse error: {0}")]
    Parse(String),

    /// Outbound transmission errors
    #[error("Transmit error: {0}")]
    Transmit(String),
}

impl PostboxError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new unauthenticated error
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    /// Create a new forbidden error
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new condition failed error
    pub fn condition_failed(msg: impl Into<String>) -> Self {
        Self::ConditionFailed(msg.into())
    }

    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new blob store error
    pub fn blob(msg: impl Into<String>) -> Self {
        Self::Blob(msg.into())
    }

    /// Create a new parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a new transmit error
    pub fn transmit(msg: impl Into<String>) -> Self {
        Self::Transmit(msg.into())
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is an authentication or authorization error
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::Unauthenticated(_) | Self::Forbidden(_))
    }

    /// Check if the caller caused this error and should not retry it
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::Parse(_)
                | Self::AddressParsing(_)
                | Self::Unauthenticated(_)
                | Self::Forbidden(_)
                | Self::NotFound(_)
                | Self::ConditionFailed(_)
        )
    }

    /// HTTP status code the surrounding request layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Parse(_) | Self::AddressParsing(_) => 400,
            Self::Unauthenticated(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::ConditionFailed(_) => 409,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(PostboxError::validation("bad").status_code(), 400);
        assert_eq!(PostboxError::unauthenticated("no token").status_code(), 401);
        assert_eq!(PostboxError::forbidden("not yours").status_code(), 403);
        assert_eq!(PostboxError::not_found("gone").status_code(), 404);
        assert_eq!(PostboxError::storage("down").status_code(), 500);
    }

    #[test]
    fn test_error_classes_are_distinct() {
        let forbidden = PostboxError::forbidden("x");
        assert!(forbidden.is_auth_error());
        assert!(!forbidden.is_not_found());

        let missing = PostboxError::not_found("x");
        assert!(missing.is_not_found());
        assert!(missing.is_client_error());

        assert!(!PostboxError::blob("timeout").is_client_error());
    }
}
