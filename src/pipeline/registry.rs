//! Single-flight registry for in-flight conversion jobs.
//!
//! One entry per document id. The first caller to ask for a key gets a
//! [`JobTicket`] and must run the job; everyone else gets a watch
//! receiver onto the same outcome. Entries clean themselves up when the
//! outcome is published, and a ticket dropped without publishing (a
//! panicked job task) releases its waiters with an interrupted error
//! instead of hanging them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::error::ServiceError;

use super::coordinator::EnsuredPages;

/// Shared outcome of one conversion run. Errors travel by `Arc` so
/// every waiter can own the same fault.
pub type JobOutcome = Result<EnsuredPages, Arc<ServiceError>>;

type OutcomeReceiver = watch::Receiver<Option<JobOutcome>>;

struct RegistryInner {
    jobs: Mutex<HashMap<String, OutcomeReceiver>>,
}

/// Concurrency-safe map of in-flight jobs keyed by document id.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

/// What a caller holds after asking the registry for a key.
pub enum JobEntry {
    /// No job was in flight; this caller runs it and publishes through
    /// the ticket.
    Lead(JobTicket),
    /// A job is already running; await its outcome.
    Join(OutcomeReceiver),
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of jobs currently in flight.
    pub async fn in_flight(&self) -> usize {
        self.inner.jobs.lock().await.len()
    }

    /// Join the in-flight job for `key`, or register a new one.
    pub async fn join_or_start(&self, key: &str) -> JobEntry {
        let mut jobs = self.inner.jobs.lock().await;

        if let Some(rx) = jobs.get(key) {
            debug!(document_id = %key, "joining in-flight conversion job");
            return JobEntry::Join(rx.clone());
        }

        let (tx, rx) = watch::channel(None);
        jobs.insert(key.to_string(), rx.clone());
        debug!(document_id = %key, "registered conversion job");

        JobEntry::Lead(JobTicket {
            registry: self.clone(),
            key: key.to_string(),
            tx: Some(tx),
            rx,
        })
    }

    async fn release(&self, key: &str) {
        self.inner.jobs.lock().await.remove(key);
    }

    /// Wait on a receiver until its job publishes.
    pub async fn await_outcome(mut rx: OutcomeReceiver, key: &str) -> JobOutcome {
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without publishing.
                return Err(Arc::new(ServiceError::Interrupted(key.to_string())));
            }
        }
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive right to run the job for one key. Publish exactly once;
/// dropping the ticket unpublished releases waiters with an
/// interrupted error.
pub struct JobTicket {
    registry: JobRegistry,
    key: String,
    tx: Option<watch::Sender<Option<JobOutcome>>>,
    rx: OutcomeReceiver,
}

impl JobTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// A receiver onto this job's outcome, for the leader to await its
    /// own detached task alongside everyone who joins.
    pub fn subscribe(&self) -> OutcomeReceiver {
        self.rx.clone()
    }

    /// Deliver the outcome to every waiter and drop the registry
    /// entry, so the next request for this key starts fresh.
    pub async fn publish(mut self, outcome: JobOutcome) {
        if let Some(tx) = self.tx.take() {
            // Send cannot fail while we still hold a receiver in the
            // registry; ignore the result regardless.
            let _ = tx.send(Some(outcome));
        }
        self.registry.release(&self.key).await;
    }
}

impl Drop for JobTicket {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            warn!(document_id = %self.key, "conversion job dropped without publishing");
            let _ = tx.send(Some(Err(Arc::new(ServiceError::Interrupted(
                self.key.clone(),
            )))));

            let registry = self.registry.clone();
            let key = self.key.clone();
            tokio::spawn(async move {
                registry.release(&key).await;
            });
        }
    }
}
