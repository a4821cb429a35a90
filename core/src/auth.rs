//! Caller identity
//!
//! Requests arrive with an already-verified phone number. The phone number
//! maps to one or more mailbox prefixes under the sending domain; the first
//! is the default mailbox. Lookups are cached for a bounded time.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{PostboxError, PostboxResult};
use crate::message::{key_owner, pending_key_owner, sanitize_address};

/// Verified claims accompanying a request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub phone_number: Option<String>,
}

impl AuthRequest {
    pub fn phone(phone_number: impl Into<String>) -> Self {
        Self {
            phone_number: Some(phone_number.into()),
        }
    }
}

/// Who the caller is and which mailboxes they own
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub recipients: Vec<String>,
    pub default_recipient: String,
    pub phone_number: String,
}

impl Identity {
    /// Whether a stored body or attachment key lives under one of our mailboxes
    pub fn owns_key(&self, key: &str) -> bool {
        key_owner(key).map(|owner| self.owns_sanitized(owner)).unwrap_or(false)
    }

    /// Whether a pending upload key belongs to one of our mailboxes
    pub fn owns_pending_key(&self, key: &str) -> bool {
        pending_key_owner(key).map(|owner| self.owns_sanitized(owner)).unwrap_or(false)
    }

    fn owns_sanitized(&self, owner: &str) -> bool {
        self.recipients.iter().any(|r| sanitize_address(r) == owner)
    }
}

/// Resolves request claims into an [`Identity`]
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest) -> PostboxResult<Identity>;
}

/// Phone number to mailbox prefix mapping
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Prefixes owned by `phone_number`, default first. Empty when unknown.
    async fn email_prefixes(&self, phone_number: &str) -> PostboxResult<Vec<String>>;
}

/// Directory loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: HashMap<String, Vec<String>>,
}

impl StaticDirectory {
    pub fn new(entries: HashMap<String, Vec<String>>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl IdentityDirectory for StaticDirectory {
    async fn email_prefixes(&self, phone_number: &str) -> PostboxResult<Vec<String>> {
        Ok(self.entries.get(phone_number).cloned().unwrap_or_default())
    }
}

struct CachedIdentity {
    identity: Identity,
    inserted_at: Instant,
    sequence: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CachedIdentity>,
    next_sequence: u64,
}

/// Bounded TTL cache of resolved identities
pub struct AuthCache {
    ttl: Duration,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl AuthCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn get(&self, phone_number: &str) -> Option<Identity> {
        let mut state = self.state.lock();
        let cached = state.entries.get(phone_number)?;
        if cached.inserted_at.elapsed() < self.ttl {
            return Some(cached.identity.clone());
        }
        state.entries.remove(phone_number);
        None
    }

    pub fn insert(&self, phone_number: &str, identity: Identity) {
        if self.capacity == 0 {
            return;
        }
        let mut state = self.state.lock();
        if !state.entries.contains_key(phone_number) && state.entries.len() >= self.capacity {
            let ttl = self.ttl;
            state.entries.retain(|_, cached| cached.inserted_at.elapsed() < ttl);
            if state.entries.len() >= self.capacity {
                let oldest = state
                    .entries
                    .iter()
                    .min_by_key(|(_, cached)| cached.sequence)
                    .map(|(phone, _)| phone.clone());
                if let Some(oldest) = oldest {
                    state.entries.remove(&oldest);
                }
            }
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.entries.insert(
            phone_number.to_string(),
            CachedIdentity {
                identity,
                inserted_at: Instant::now(),
                sequence,
            },
        );
    }

    pub fn invalidate(&self, phone_number: &str) {
        self.state.lock().entries.remove(phone_number);
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Authenticator backed by an [`IdentityDirectory`]
pub struct DirectoryAuthenticator {
    directory: Arc<dyn IdentityDirectory>,
    cache: AuthCache,
    domain: String,
}

impl DirectoryAuthenticator {
    pub fn new(directory: Arc<dyn IdentityDirectory>, cache: AuthCache, domain: impl Into<String>) -> Self {
        Self {
            directory,
            cache,
            domain: domain.into(),
        }
    }

    pub fn cache(&self) -> &AuthCache {
        &self.cache
    }
}

#[async_trait]
impl Authenticator for DirectoryAuthenticator {
    async fn authenticate(&self, request: &AuthRequest) -> PostboxResult<Identity> {
        let phone_number = request
            .phone_number
            .as_deref()
            .map(str::trim)
            .filter(|phone| !phone.is_empty())
            .ok_or_else(|| PostboxError::unauthenticated("No phone number in request"))?;

        if let Some(identity) = self.cache.get(phone_number) {
            return Ok(identity);
        }

        let prefixes = self.directory.email_prefixes(phone_number).await?;
        let recipients: Vec<String> = prefixes
            .iter()
            .filter(|prefix| !prefix.is_empty())
            .map(|prefix| format!("{}@{}", prefix, self.domain))
            .collect();
        let Some(default_recipient) = recipients.first().cloned() else {
            tracing::warn!("No mailbox mapped to {}", phone_number);
            return Err(PostboxError::forbidden("No email account associated with this phone number"));
        };

        tracing::debug!("Mapped {} to {}", phone_number, default_recipient);
        let identity = Identity {
            recipients,
            default_recipient,
            phone_number: phone_number.to_string(),
        };
        self.cache.insert(phone_number, identity.clone());
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(phone: &str, recipient: &str) -> Identity {
        Identity {
            recipients: vec![recipient.to_string()],
            default_recipient: recipient.to_string(),
            phone_number: phone.to_string(),
        }
    }

    #[tokio::test]
    async fn test_maps_phone_to_recipients() {
        let mut directory = MockIdentityDirectory::new();
        directory
            .expect_email_prefixes()
            .times(1)
            .returning(|_| Ok(vec!["jane".to_string(), "jane.work".to_string()]));
        let auth = DirectoryAuthenticator::new(
            Arc::new(directory),
            AuthCache::new(Duration::from_secs(60), 10),
            "example.org",
        );

        let first = auth.authenticate(&AuthRequest::phone("+15550001")).await.unwrap();
        assert_eq!(first.default_recipient, "jane@example.org");
        assert_eq!(first.recipients.len(), 2);

        // Served from cache; the mock allows only one lookup
        let second = auth.authenticate(&AuthRequest::phone("+15550001")).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_missing_phone_and_unknown_phone() {
        let mut directory = MockIdentityDirectory::new();
        directory.expect_email_prefixes().returning(|_| Ok(vec![]));
        let auth = DirectoryAuthenticator::new(
            Arc::new(directory),
            AuthCache::new(Duration::from_secs(60), 10),
            "example.org",
        );

        let missing = auth.authenticate(&AuthRequest::default()).await.unwrap_err();
        assert_eq!(missing.status_code(), 401);

        let unknown = auth.authenticate(&AuthRequest::phone("+1999")).await.unwrap_err();
        assert_eq!(unknown.status_code(), 403);
    }

    #[test]
    fn test_cache_ttl_expiry() {
        let cache = AuthCache::new(Duration::ZERO, 10);
        cache.insert("+1", identity("+1", "a@x.org"));
        assert!(cache.get("+1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_capacity_and_invalidate() {
        let cache = AuthCache::new(Duration::from_secs(60), 2);
        cache.insert("+1", identity("+1", "a@x.org"));
        cache.insert("+2", identity("+2", "b@x.org"));
        cache.insert("+3", identity("+3", "c@x.org"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("+1").is_none());
        assert!(cache.get("+3").is_some());

        cache.invalidate("+3");
        assert!(cache.get("+3").is_none());
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_key_ownership() {
        let me = identity("+1", "Jane@Example.org");
        assert!(me.owns_key("jane@example.org/2025-04-26/abc.json"));
        assert!(!me.owns_key("john@example.org/2025-04-26/abc.json"));
        assert!(!me.owns_key("/jane@example.org/x"));
        assert!(me.owns_pending_key("attachments/pending/jane@example.org/u/f.txt"));
        assert!(!me.owns_pending_key("attachments/pending/john@example.org/u/f.txt"));
    }

    #[tokio::test]
    async fn test_static_directory() {
        let mut entries = HashMap::new();
        entries.insert("+1".to_string(), vec!["jane".to_string()]);
        let directory = StaticDirectory::new(entries);
        assert_eq!(directory.email_prefixes("+1").await.unwrap(), vec!["jane".to_string()]);
        assert!(directory.email_prefixes("+2").await.unwrap().is_empty());
    }
}
