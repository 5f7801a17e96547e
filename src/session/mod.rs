//! Viewing sessions: per-viewer page sequencing and preloading.
//!
//! A [`ViewingSession`] tracks which pages of a document a viewer has
//! loaded, is loading, or gave up on. The manager loads the current
//! page inline, preloads the window around it on background tasks, and
//! routes every load failure through the recovery engine before a slot
//! is parked at `failed`. Sessions expire after an idle period, like
//! any other per-viewer resource.

mod types;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use tracing::{debug, info, warn};

use crate::access::{AccessGate, Viewer};
use crate::config::SessionConfig;
use crate::error::{Result, ServiceError};
use crate::pipeline::ConversionCoordinator;
use crate::recovery::{classify, ErrorContext, PageFailure, RecoveryEngine, ViewSurface};

pub use types::{PageSlot, PageState, PageView, SessionInfo, ViewingSession};

struct SessionManagerInner {
    sessions: RwLock<HashMap<Uuid, ViewingSession>>,
    /// Background preload tasks per session, aborted on close. Kept
    /// out of the session struct so snapshots stay cheap clones.
    preloads: RwLock<HashMap<Uuid, Vec<JoinHandle<()>>>>,
    coordinator: Arc<ConversionCoordinator>,
    gate: AccessGate,
    engine: Arc<RecoveryEngine>,
    config: SessionConfig,
}

/// Manages viewing sessions over the conversion pipeline.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

impl SessionManager {
    pub fn new(
        coordinator: Arc<ConversionCoordinator>,
        gate: AccessGate,
        engine: Arc<RecoveryEngine>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SessionManagerInner {
                sessions: RwLock::new(HashMap::new()),
                preloads: RwLock::new(HashMap::new()),
                coordinator,
                gate,
                engine,
                config,
            }),
        }
    }

    pub async fn active_sessions(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Open a session on a document, load the start page inline, and
    /// kick off preloads for the surrounding window.
    pub async fn open_session(
        &self,
        document_id: &str,
        viewer: Viewer,
        start_page: u32,
    ) -> Result<SessionInfo> {
        self.inner.gate.authorize(document_id, &viewer).await?;

        // The first load pays for conversion (or hits cache); it also
        // tells us how many pages the document actually has.
        let ensured = self.inner.coordinator.ensure_pages(document_id).await?;
        let total_pages = ensured
            .pages
            .iter()
            .map(|record| record.page_number)
            .chain(ensured.failures.iter().map(|failure| failure.page_number))
            .max()
            .unwrap_or(0);

        let mut session = ViewingSession::new(document_id, viewer, start_page);
        session.total_pages = total_pages;
        let session_id = session.id;
        let current = session.current_page;

        self.inner
            .sessions
            .write()
            .await
            .insert(session_id, session);

        info!(
            session_id = %session_id,
            document_id,
            total_pages,
            start_page = current,
            "opened viewing session"
        );

        self.load_page(session_id, current, ViewSurface::Reader)
            .await;
        self.spawn_preloads(session_id, current, total_pages).await;

        self.snapshot(session_id).await
    }

    /// Move the session to `page_number`, loading it inline if needed,
    /// and re-center the preload window.
    pub async fn navigate(&self, session_id: Uuid, page_number: u32) -> Result<PageView> {
        let total_pages = {
            let mut sessions = self.inner.sessions.write().await;
            let session = sessions
                .get_mut(&session_id)
                .ok_or(ServiceError::SessionNotFound(session_id))?;

            if page_number < 1 || (session.total_pages > 0 && page_number > session.total_pages) {
                return Err(ServiceError::PageOutOfRange {
                    page: page_number,
                    total: session.total_pages,
                });
            }

            session.touch();
            session.current_page = page_number;
            session.total_pages
        };

        if self.state_of(session_id, page_number).await != Some(PageState::Loaded) {
            self.load_page(session_id, page_number, ViewSurface::Reader)
                .await;
        }
        self.spawn_preloads(session_id, page_number, total_pages)
            .await;

        self.page_view(session_id, page_number).await
    }

    /// Current state of the whole session.
    pub async fn snapshot(&self, session_id: Uuid) -> Result<SessionInfo> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .get(&session_id)
            .map(SessionInfo::from_session)
            .ok_or(ServiceError::SessionNotFound(session_id))
    }

    /// Close a session and abort its own preload tasks. Shared
    /// conversion jobs are detached and unaffected. Never errors;
    /// closing an unknown or already-closed session is a no-op.
    pub async fn close_session(&self, session_id: Uuid) -> bool {
        let removed = self.inner.sessions.write().await.remove(&session_id);

        if let Some(handles) = self.inner.preloads.write().await.remove(&session_id) {
            for handle in handles {
                handle.abort();
            }
        }

        match removed {
            Some(session) => {
                info!(
                    session_id = %session_id,
                    document_id = %session.document_id,
                    "closed viewing session"
                );
                true
            }
            None => false,
        }
    }

    /// Remove sessions idle past the configured timeout. Returns the
    /// number closed.
    pub async fn cleanup_expired(&self) -> usize {
        let timeout = self.inner.config.idle_timeout();
        let expired: Vec<Uuid> = {
            let sessions = self.inner.sessions.read().await;
            sessions
                .values()
                .filter(|session| session.is_idle(timeout))
                .map(|session| session.id)
                .collect()
        };

        for session_id in &expired {
            debug!(session_id = %session_id, "expiring idle viewing session");
            self.close_session(*session_id).await;
        }

        expired.len()
    }

    /// Spawn the periodic idle-session cleanup loop.
    pub fn start_cleanup_task(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.inner.config.cleanup_interval());
            interval.tick().await;

            loop {
                interval.tick().await;
                let closed = manager.cleanup_expired().await;
                if closed > 0 {
                    info!(closed, "expired idle viewing sessions");
                }
            }
        })
    }

    /// Drive one page through `loading` and, on failure, through the
    /// recovery detour. Safe to call for a vanished session; the
    /// result is simply dropped.
    async fn load_page(&self, session_id: Uuid, page_number: u32, surface: ViewSurface) {
        let Some((document_id, viewer)) = self.mark_loading(session_id, page_number).await else {
            return;
        };

        let outcome = self.resolve(&document_id, page_number, &viewer).await;

        match outcome {
            Ok(url) => {
                self.update_slot(session_id, page_number, |slot| {
                    slot.state = PageState::Loaded;
                    slot.url = Some(url);
                    slot.failure = None;
                })
                .await;
            }
            Err(error) => {
                let kind = classify(&error);

                // An out-of-range page is a caller mistake, not a fault
                // any strategy can repair; park the slot without
                // spending the recovery budget.
                if matches!(error, ServiceError::PageOutOfRange { .. }) {
                    let failure = PageFailure::terminal(page_number, kind, 0);
                    self.update_slot(session_id, page_number, |slot| {
                        slot.state = PageState::Failed;
                        slot.url = None;
                        slot.failure = Some(failure);
                    })
                    .await;
                    return;
                }

                warn!(
                    session_id = %session_id,
                    document_id = %document_id,
                    page_number,
                    kind = kind.as_str(),
                    error = %error,
                    "page load failed, attempting recovery"
                );

                self.update_slot(session_id, page_number, |slot| {
                    slot.state = PageState::Recovering;
                })
                .await;

                let ctx = ErrorContext::new(
                    &document_id,
                    page_number,
                    viewer.role,
                    surface,
                    error.to_string(),
                );
                let result = self.inner.engine.handle(kind, &ctx).await;

                let url = if result.success {
                    match (&result.url, &result.record) {
                        (Some(url), _) => Some(url.clone()),
                        (None, Some(record)) => self
                            .inner
                            .gate
                            .resolve_page_url(record, viewer.role)
                            .await
                            .ok(),
                        (None, None) => None,
                    }
                } else {
                    None
                };

                match url {
                    Some(url) => {
                        self.update_slot(session_id, page_number, |slot| {
                            slot.state = PageState::Loaded;
                            slot.url = Some(url);
                            slot.failure = None;
                        })
                        .await;
                    }
                    None => {
                        let failure = PageFailure::terminal(page_number, kind, result.attempts);
                        self.update_slot(session_id, page_number, |slot| {
                            slot.state = PageState::Failed;
                            slot.url = None;
                            slot.failure = Some(failure);
                        })
                        .await;
                    }
                }
            }
        }
    }

    /// Ensure the page exists, then sign it for this viewer.
    async fn resolve(
        &self,
        document_id: &str,
        page_number: u32,
        viewer: &Viewer,
    ) -> Result<crate::access::PageUrl> {
        let record = self
            .inner
            .coordinator
            .ensure_page(document_id, page_number)
            .await?;
        Ok(self
            .inner
            .gate
            .resolve_page_url(&record, viewer.role)
            .await?)
    }

    /// Queue background loads for the window around `center`, nearest
    /// pages first. Pages already loaded or in flight are skipped.
    async fn spawn_preloads(&self, session_id: Uuid, center: u32, total_pages: u32) {
        let window = self.inner.config.preload_window;
        let mut targets = Vec::new();
        for distance in 1..=window {
            if center > distance {
                targets.push(center - distance);
            }
            if center + distance <= total_pages {
                targets.push(center + distance);
            }
        }

        let mut handles = Vec::new();
        {
            let sessions = self.inner.sessions.read().await;
            let Some(session) = sessions.get(&session_id) else {
                return;
            };

            for page_number in targets {
                if session.state_of(page_number) != PageState::Unloaded {
                    continue;
                }
                let manager = self.clone();
                handles.push(tokio::spawn(async move {
                    manager
                        .load_page(session_id, page_number, ViewSurface::Preload)
                        .await;
                }));
            }
        }

        if !handles.is_empty() {
            self.inner
                .preloads
                .write()
                .await
                .entry(session_id)
                .or_default()
                .append(&mut handles);
        }
    }

    /// Mark a slot `loading` and return what the load needs. `None`
    /// when the session is gone or the page is already loaded.
    async fn mark_loading(&self, session_id: Uuid, page_number: u32) -> Option<(String, Viewer)> {
        let mut sessions = self.inner.sessions.write().await;
        let session = sessions.get_mut(&session_id)?;

        if session.state_of(page_number) == PageState::Loaded {
            return None;
        }

        session.slot_mut(page_number).state = PageState::Loading;
        Some((session.document_id.clone(), session.viewer.clone()))
    }

    async fn update_slot<F>(&self, session_id: Uuid, page_number: u32, update: F)
    where
        F: FnOnce(&mut PageSlot),
    {
        let mut sessions = self.inner.sessions.write().await;
        if let Some(session) = sessions.get_mut(&session_id) {
            update(session.slot_mut(page_number));
        }
    }

    async fn state_of(&self, session_id: Uuid, page_number: u32) -> Option<PageState> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .get(&session_id)
            .map(|session| session.state_of(page_number))
    }

    async fn page_view(&self, session_id: Uuid, page_number: u32) -> Result<PageView> {
        let sessions = self.inner.sessions.read().await;
        let session = sessions
            .get(&session_id)
            .ok_or(ServiceError::SessionNotFound(session_id))?;

        Ok(session
            .slots
            .get(&page_number)
            .map(|slot| PageView::from_slot(page_number, slot))
            .unwrap_or(PageView {
                page_number,
                state: PageState::Unloaded,
                url: None,
                failure: None,
            }))
    }

    /// Wait for every queued preload to settle. Test-only; production
    /// callers never block on preloads.
    #[cfg(test)]
    pub(crate) async fn drain_preloads(&self, session_id: Uuid) {
        let handles = self
            .inner
            .preloads
            .write()
            .await
            .remove(&session_id)
            .unwrap_or_default();
        for handle in handles {
            let _ = handle.await;
        }
    }
}
