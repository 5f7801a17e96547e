//! Access gate: authorization and signed page URLs.
//!
//! Every page served to a viewer goes out as a signed, time-limited
//! URL minted here. URL lifetime and watermarking depend on the
//! viewer's role; whether the viewer may see the document at all is
//! delegated to the [`AuthorizationOracle`]. Note the two unrelated
//! lifetimes in play: a cached page stays valid for days, while a URL
//! pointing at it dies within hours.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::AccessConfig;
use crate::document::PageRecord;
use crate::storage::{BlobStore, StorageError};

/// Trust level of a viewer relative to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewerRole {
    Anonymous,
    Shared,
    Member,
    Owner,
    Admin,
}

impl ViewerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewerRole::Anonymous => "anonymous",
            ViewerRole::Shared => "shared",
            ViewerRole::Member => "member",
            ViewerRole::Owner => "owner",
            ViewerRole::Admin => "admin",
        }
    }
}

/// A viewer identity attached to page requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewer {
    pub user_id: String,
    pub role: ViewerRole,
}

impl Viewer {
    pub fn new(user_id: impl Into<String>, role: ViewerRole) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous", ViewerRole::Anonymous)
    }
}

/// Signed, time-limited URL for one page image.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
    /// Whether the client must overlay a watermark when displaying.
    pub watermark: bool,
}

impl PageUrl {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("Viewer {user_id} may not view document {document_id}")]
    Forbidden {
        document_id: String,
        user_id: String,
    },

    #[error("Stale page record for {document_id} page {page_number}")]
    StaleRecord {
        document_id: String,
        page_number: u32,
    },

    #[error("Unsignable blob key: {0:?}")]
    InvalidKey(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Answers whether a viewer may see a document. Anything that is not
/// an explicit yes is a no.
#[async_trait]
pub trait AuthorizationOracle: Send + Sync {
    async fn may_view(&self, document_id: &str, viewer: &Viewer) -> bool;
}

/// Oracle that admits everyone. For single-user deployments and tests.
pub struct AllowAll;

#[async_trait]
impl AuthorizationOracle for AllowAll {
    async fn may_view(&self, _document_id: &str, _viewer: &Viewer) -> bool {
        true
    }
}

/// Mints role-scoped signed URLs after checking authorization and
/// object existence.
#[derive(Clone)]
pub struct AccessGate {
    blob: Arc<dyn BlobStore>,
    oracle: Arc<dyn AuthorizationOracle>,
    config: AccessConfig,
}

impl AccessGate {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        oracle: Arc<dyn AuthorizationOracle>,
        config: AccessConfig,
    ) -> Self {
        Self {
            blob,
            oracle,
            config,
        }
    }

    /// Signed-URL lifetime for a role. Less-trusted roles get
    /// shorter-lived URLs.
    pub fn url_ttl(&self, role: ViewerRole) -> Duration {
        let secs = match role {
            ViewerRole::Anonymous => self.config.url_ttl_anonymous_secs,
            ViewerRole::Shared => self.config.url_ttl_shared_secs,
            ViewerRole::Member => self.config.url_ttl_member_secs,
            ViewerRole::Owner => self.config.url_ttl_owner_secs,
            ViewerRole::Admin => self.config.url_ttl_admin_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn watermark(&self, role: ViewerRole) -> bool {
        self.config.watermark_untrusted
            && matches!(role, ViewerRole::Anonymous | ViewerRole::Shared)
    }

    /// Ask the oracle; deny unless it answers yes.
    pub async fn authorize(&self, document_id: &str, viewer: &Viewer) -> Result<(), AccessError> {
        if self.oracle.may_view(document_id, viewer).await {
            return Ok(());
        }

        debug!(
            document_id,
            user_id = %viewer.user_id,
            role = viewer.role.as_str(),
            "viewer denied"
        );
        Err(AccessError::Forbidden {
            document_id: document_id.to_string(),
            user_id: viewer.user_id.clone(),
        })
    }

    /// Sign an arbitrary blob key with the role's TTL. Used for keys
    /// that have no page record, like placeholders and thumbnails.
    pub async fn sign_key(&self, key: &str, role: ViewerRole) -> Result<PageUrl, AccessError> {
        let ttl = self.url_ttl(role);
        let url = self.blob.signed_url(key, ttl).await?;

        Ok(PageUrl {
            url,
            expires_at: Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64),
            watermark: self.watermark(role),
        })
    }

    /// Turn a cached page record into a servable URL. Verifies the
    /// blob actually exists first, so a vanished object surfaces here
    /// rather than as a dead URL in the viewer.
    pub async fn resolve_page_url(
        &self,
        record: &PageRecord,
        role: ViewerRole,
    ) -> Result<PageUrl, AccessError> {
        if record.blob_key.is_empty() {
            return Err(AccessError::InvalidKey(record.blob_key.clone()));
        }
        if record.is_expired() {
            return Err(AccessError::StaleRecord {
                document_id: record.document_id.clone(),
                page_number: record.page_number,
            });
        }

        if !self.blob.exists(&record.blob_key).await? {
            return Err(AccessError::Storage(StorageError::NotFound(
                record.blob_key.clone(),
            )));
        }

        self.sign_key(&record.blob_key, role).await
    }
}
