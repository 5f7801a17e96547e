//! Fault classification and ordered recovery.
//!
//! [`classify`] collapses any [`ServiceError`](crate::error::ServiceError)
//! into an [`ErrorKind`]; [`RecoveryEngine::handle`] walks that kind's
//! strategy table until one strategy produces a servable page or the
//! attempt budget runs out. The tables live in [`strategies_for`], so
//! adding a recovery path is a data change, not a new branch.

mod classifier;
mod engine;
mod types;

pub use classifier::{classify, ErrorKind};
pub use engine::{strategies_for, RecoveryEngine};
pub use types::{
    Affordance, ErrorContext, PageFailure, Recovered, RecoveryResult, RecoveryStrategy,
    ViewSurface,
};
