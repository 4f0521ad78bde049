//! Durable object storage gateway.
//!
//! The coordinator only ever talks to the [`StorageGateway`] capability:
//! put bytes under a key, ask whether a key exists, resolve a key to its
//! public location, and enumerate stored objects for warm start. The
//! production backend is [`FsObjectStore`]; tests inject fakes.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use url::Url;

use crate::cache::CacheKey;

mod fs;

pub use fs::FsObjectStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid object key")]
    InvalidKey,
    #[error("object write failed: {message}")]
    Write { message: String },
    #[error("object read failed: {message}")]
    Read { message: String },
}

impl StorageError {
    pub fn write(message: impl Into<String>) -> Self {
        Self::Write {
            message: message.into(),
        }
    }

    pub fn read(message: impl Into<String>) -> Self {
        Self::Read {
            message: message.into(),
        }
    }
}

/// Payload handed to the gateway on a cache fill.
#[derive(Debug, Clone)]
pub struct PutObject {
    pub origin_url: Url,
    pub name: String,
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub etag: Option<String>,
}

/// A durably stored object plus the metadata needed to serve and list it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredObject {
    pub key: String,
    pub origin_url: Url,
    pub name: String,
    pub location: Url,
    pub size: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub stored_at: OffsetDateTime,
}

#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Whether an object is already stored under `key`.
    async fn has(&self, key: &CacheKey) -> Result<bool, StorageError>;

    /// Store the object durably and return its descriptor.
    async fn put(&self, key: &CacheKey, object: PutObject) -> Result<StoredObject, StorageError>;

    /// Public URL a client is redirected to for `key`.
    fn location_of(&self, key: &CacheKey) -> Result<Url, StorageError>;

    /// Enumerate stored objects; used to rebuild the in-memory table on
    /// startup. Corrupt entries are skipped, not fatal.
    async fn list(&self) -> Result<Vec<StoredObject>, StorageError>;
}
