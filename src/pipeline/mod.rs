//! Conversion pipeline: cache-aside reads with single-flight jobs.
//!
//! [`ConversionCoordinator::ensure_pages`] is the one entry point for
//! "make this document's pages exist". A fully cached document is a
//! pure read; anything else joins or starts the document's conversion
//! job through the [`JobRegistry`], so at most one conversion per
//! document runs no matter how many callers ask at once.

mod coordinator;
mod registry;

pub use coordinator::{ConversionCoordinator, EnsuredPages};
pub use registry::{JobEntry, JobRegistry, JobTicket};
