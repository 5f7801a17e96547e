//! In-process blob backend.
//!
//! Backs tests and single-binary deployments that have no object
//! store. Signed URLs use an HMAC-style token over a per-instance
//! secret so expiry and tamper checks behave like the real thing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use super::{BlobStore, ObjectMetadata, StorageError};

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
    stored_at: DateTime<Utc>,
}

struct MemoryBlobStoreInner {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    secret: String,
    base_url: String,
    puts: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
    signs: AtomicU64,
}

/// Blob store held entirely in process memory.
#[derive(Clone)]
pub struct MemoryBlobStore {
    inner: Arc<MemoryBlobStoreInner>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::with_base_url("memory://folio")
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MemoryBlobStoreInner {
                objects: RwLock::new(BTreeMap::new()),
                secret: uuid::Uuid::new_v4().to_string(),
                base_url: base_url.into(),
                puts: AtomicU64::new(0),
                gets: AtomicU64::new(0),
                deletes: AtomicU64::new(0),
                signs: AtomicU64::new(0),
            }),
        }
    }

    /// Number of successful writes since creation.
    pub fn put_count(&self) -> u64 {
        self.inner.puts.load(Ordering::Relaxed)
    }

    /// Number of successful reads since creation.
    pub fn get_count(&self) -> u64 {
        self.inner.gets.load(Ordering::Relaxed)
    }

    pub fn delete_count(&self) -> u64 {
        self.inner.deletes.load(Ordering::Relaxed)
    }

    pub fn sign_count(&self) -> u64 {
        self.inner.signs.load(Ordering::Relaxed)
    }

    pub async fn object_count(&self) -> usize {
        self.inner.objects.read().await.len()
    }

    fn token_for(&self, key: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.inner.secret.as_bytes());
        hasher.update(key.as_bytes());
        hasher.update(expires.to_be_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    /// Check a URL minted by this store: the token must match and the
    /// expiry instant must still be in the future.
    pub fn verify_url(&self, url: &str) -> bool {
        let Some((path, query)) = url.split_once('?') else {
            return false;
        };
        let Some(encoded_key) = path.strip_prefix(&format!("{}/", self.inner.base_url)) else {
            return false;
        };
        let Ok(key) = urlencoding::decode(encoded_key) else {
            return false;
        };

        let mut expires: Option<i64> = None;
        let mut token: Option<&str> = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", value)) => expires = value.parse().ok(),
                Some(("token", value)) => token = Some(value),
                _ => {}
            }
        }

        match (expires, token) {
            (Some(expires), Some(token)) => {
                token == self.token_for(&key, expires) && Utc::now().timestamp() < expires
            }
            _ => false,
        }
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        let mut objects = self.inner.objects.write().await;
        objects.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
                stored_at: Utc::now(),
            },
        );
        self.inner.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let objects = self.inner.objects.read().await;
        let object = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        self.inner.gets.fetch_add(1, Ordering::Relaxed);
        Ok(object.bytes.clone())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.inner.objects.read().await.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.objects.write().await.remove(key);
        self.inner.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMetadata>, StorageError> {
        let objects = self.inner.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectMetadata {
                key: key.clone(),
                size: object.bytes.len() as i64,
                last_modified: Some(object.stored_at),
                content_type: Some(object.content_type.clone()),
                etag: Some(hex::encode(Sha256::digest(&object.bytes))),
            })
            .collect())
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        if !self.inner.objects.read().await.contains_key(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }

        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let token = self.token_for(key, expires);
        self.inner.signs.fetch_add(1, Ordering::Relaxed);

        Ok(format!(
            "{}/{}?expires={}&token={}",
            self.inner.base_url,
            urlencoding::encode(key),
            expires,
            token
        ))
    }
}
