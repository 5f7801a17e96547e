//! Recovery context and outcome types

use serde::Serialize;
use thiserror::Error;

use crate::access::{PageUrl, ViewerRole};
use crate::document::PageRecord;

use super::classifier::ErrorKind;

/// Execution surface a fault occurred on. Carried for logging and for
/// strategies that care how urgent a page is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewSurface {
    /// The page the viewer is looking at right now.
    Reader,
    /// Speculative load around the current page.
    Preload,
    Thumbnail,
    /// Conversion run, not tied to a live viewer.
    Pipeline,
    /// Direct API access.
    Api,
}

/// Everything the engine knows about one fault.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub document_id: String,
    pub page_number: u32,
    pub role: ViewerRole,
    pub surface: ViewSurface,
    /// Attempts already spent on this fault before the engine ran,
    /// e.g. by a viewer pressing retry.
    pub prior_attempts: u32,
    /// Raw fault description. Internal only; never shown to viewers.
    pub fault: String,
}

impl ErrorContext {
    pub fn new(
        document_id: impl Into<String>,
        page_number: u32,
        role: ViewerRole,
        surface: ViewSurface,
        fault: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            page_number,
            role,
            surface,
            prior_attempts: 0,
            fault: fault.into(),
        }
    }

    pub fn with_prior_attempts(mut self, prior_attempts: u32) -> Self {
        self.prior_attempts = prior_attempts;
        self
    }
}

/// One recovery path. The engine binds fault kinds to ordered lists
/// of these; see `strategies_for`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RegenerateSignedUrl,
    ProbeAlternatePath,
    ReconvertPage,
    RelaxedReencode,
    ServeCachedCopy,
    PlaceholderPage,
    RetryQuery,
    RebuildFromBlobs,
    BackupMetadata,
    AlternateBucket,
    RegenerateFromSource,
    CdnFallback,
    GenericRetry,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::RegenerateSignedUrl => "regenerate_signed_url",
            RecoveryStrategy::ProbeAlternatePath => "probe_alternate_path",
            RecoveryStrategy::ReconvertPage => "reconvert_page",
            RecoveryStrategy::RelaxedReencode => "relaxed_reencode",
            RecoveryStrategy::ServeCachedCopy => "serve_cached_copy",
            RecoveryStrategy::PlaceholderPage => "placeholder_page",
            RecoveryStrategy::RetryQuery => "retry_query",
            RecoveryStrategy::RebuildFromBlobs => "rebuild_from_blobs",
            RecoveryStrategy::BackupMetadata => "backup_metadata",
            RecoveryStrategy::AlternateBucket => "alternate_bucket",
            RecoveryStrategy::RegenerateFromSource => "regenerate_from_source",
            RecoveryStrategy::CdnFallback => "cdn_fallback",
            RecoveryStrategy::GenericRetry => "generic_retry",
        }
    }
}

/// What a successful strategy produced. Some strategies yield a fresh
/// record, some only a servable URL, some both.
#[derive(Debug, Clone, Default)]
pub struct Recovered {
    pub record: Option<PageRecord>,
    pub url: Option<PageUrl>,
}

/// Outcome of running the strategy list for one fault.
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub success: bool,
    /// The strategy that worked, when one did.
    pub strategy: Option<RecoveryStrategy>,
    /// Strategies actually tried.
    pub attempts: u32,
    pub record: Option<PageRecord>,
    pub url: Option<PageUrl>,
}

impl RecoveryResult {
    pub(crate) fn recovered(
        strategy: RecoveryStrategy,
        attempts: u32,
        outcome: Recovered,
    ) -> Self {
        Self {
            success: true,
            strategy: Some(strategy),
            attempts,
            record: outcome.record,
            url: outcome.url,
        }
    }

    pub(crate) fn failed(attempts: u32) -> Self {
        Self {
            success: false,
            strategy: None,
            attempts,
            record: None,
            url: None,
        }
    }
}

/// User-facing affordances attached to a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Affordance {
    Retry,
    Skip,
    Report,
}

/// A page-scoped failure with a sanitized message. This is the only
/// failure shape that leaves the pipeline; raw faults stay in logs.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(rename_all = "camelCase")]
#[error("page {page_number}: {message}")]
pub struct PageFailure {
    pub page_number: u32,
    pub kind: ErrorKind,
    /// Recovery attempts spent before giving up.
    pub attempts: u32,
    pub message: String,
    pub affordances: Vec<Affordance>,
}

impl PageFailure {
    /// Build the terminal failure for a fault the engine could not
    /// recover. The message comes from the kind, never from the fault.
    pub fn terminal(page_number: u32, kind: ErrorKind, attempts: u32) -> Self {
        Self {
            page_number,
            kind,
            attempts,
            message: kind.user_message().to_string(),
            affordances: kind.affordances().to_vec(),
        }
    }
}
