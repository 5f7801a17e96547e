//! Folio: PDF-to-page-image conversion and caching service.
//!
//! Documents are registered as PDF sources in a blob store; pages are
//! rendered to images on demand, cached with a freshness deadline, and
//! served to viewers as role-scoped signed URLs. Conversion is
//! single-flight per document, every fault goes through a bounded
//! recovery engine, and viewing sessions preload the pages around the
//! one being read.
//!
//! [`PageService`] is the entry point; everything else hangs off it.

pub mod access;
pub mod cache;
pub mod config;
pub mod convert;
pub mod db;
pub mod document;
pub mod error;
pub mod pipeline;
pub mod recovery;
pub mod session;
pub mod state;
pub mod storage;

pub use access::{AuthorizationOracle, PageUrl, Viewer, ViewerRole};
pub use config::Config;
pub use document::{DocumentRecord, PageRecord};
pub use error::{Result, ServiceError};
pub use pipeline::EnsuredPages;
pub use recovery::{ErrorKind, PageFailure, RecoveryResult};
pub use session::{PageState, PageView, SessionInfo};
pub use state::{MaintenanceTasks, PageService, ServiceStats};
