//! Presigned URL issuance
//!
//! URLs carry the key (in the path for readability, and in the query for
//! verification), the disposition and an expiry, signed with HMAC-SHA256
//! keyed by a shared secret. Fields are length-prefixed inside the MAC.
//! Whatever serves the bytes calls [`UrlSigner::verify`] before honoring
//! one.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use url::Url;

use crate::error::{PostboxError, PostboxResult};

type HmacSha256 = Hmac<Sha256>;

/// What a verified URL grants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedTarget {
    pub key: String,
    pub disposition: String,
    pub expires_at: DateTime<Utc>,
}

/// Signs and verifies blob URLs
#[derive(Debug, Clone)]
pub struct UrlSigner {
    base_url: Url,
    secret: String,
}

impl UrlSigner {
    pub fn new(base_url: &str, secret: impl Into<String>) -> PostboxResult<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(PostboxError::config("Presign secret cannot be empty"));
        }
        Ok(Self {
            base_url: Url::parse(base_url)?,
            secret,
        })
    }

    /// URL for `key` valid for `ttl` from now
    pub fn sign(&self, key: &str, disposition: &str, ttl: Duration) -> PostboxResult<String> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| PostboxError::validation("Presign TTL out of range"))?;
        self.sign_until(key, disposition, Utc::now() + ttl)
    }

    fn sign_until(&self, key: &str, disposition: &str, expires_at: DateTime<Utc>) -> PostboxResult<String> {
        let expires = expires_at.timestamp();
        let signature = hex::encode(self.mac(key, disposition, expires)?.finalize().into_bytes());
        let mut url = self.base_url.join(key)?;
        url.query_pairs_mut()
            .append_pair("key", key)
            .append_pair("disposition", disposition)
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &signature);
        Ok(url.to_string())
    }

    /// Check a URL produced by [`sign`](Self::sign) and return what it grants
    pub fn verify(&self, presigned: &str) -> PostboxResult<PresignedTarget> {
        let url = Url::parse(presigned)?;
        if url.origin() != self.base_url.origin() {
            return Err(PostboxError::forbidden("URL does not belong to this store"));
        }

        let mut key = None;
        let mut disposition = None;
        let mut expires = None;
        let mut signature = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "key" => key = Some(value.into_owned()),
                "disposition" => disposition = Some(value.into_owned()),
                "expires" => expires = value.parse::<i64>().ok(),
                "signature" => signature = Some(value.into_owned()),
                _ => {}
            }
        }

        let (key, disposition, expires, signature) = match (key, disposition, expires, signature) {
            (Some(k), Some(d), Some(e), Some(s)) => (k, d, e, s),
            _ => return Err(PostboxError::forbidden("Incomplete presigned URL")),
        };

        let signature = hex::decode(signature).map_err(|_| PostboxError::forbidden("Bad signature"))?;
        self.mac(&key, &disposition, expires)?
            .verify_slice(&signature)
            .map_err(|_| PostboxError::forbidden("Bad signature"))?;

        let expires_at = DateTime::<Utc>::from_timestamp(expires, 0)
            .ok_or_else(|| PostboxError::forbidden("Bad expiry"))?;
        if expires_at < Utc::now() {
            return Err(PostboxError::forbidden("Presigned URL expired"));
        }

        Ok(PresignedTarget {
            key,
            disposition,
            expires_at,
        })
    }

    fn mac(&self, key: &str, disposition: &str, expires: i64) -> PostboxResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| PostboxError::config("Invalid presign secret"))?;
        let expires = expires.to_be_bytes();
        let fields: [&[u8]; 3] = [key.as_bytes(), disposition.as_bytes(), &expires];
        for field in fields {
            mac.update(&(field.len() as u64).to_be_bytes());
            mac.update(field);
        }
        Ok(mac)
    }
}
