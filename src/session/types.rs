//! Viewing session state types

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::access::{PageUrl, Viewer};
use crate::recovery::PageFailure;

/// Lifecycle of one page inside a session.
///
/// `unloaded -> loading -> {loaded | failed}`, with a recovery detour
/// `failed -> recovering -> {loaded | failed}`. A failure that survives
/// recovery is terminal for the session; the viewer gets the failure's
/// affordances instead of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PageState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Failed,
    Recovering,
}

impl PageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageState::Unloaded => "unloaded",
            PageState::Loading => "loading",
            PageState::Loaded => "loaded",
            PageState::Failed => "failed",
            PageState::Recovering => "recovering",
        }
    }
}

/// Per-page slot tracked by a session.
#[derive(Debug, Clone, Default)]
pub struct PageSlot {
    pub state: PageState,
    pub url: Option<PageUrl>,
    pub failure: Option<PageFailure>,
}

/// One viewer looking at one document.
#[derive(Debug, Clone)]
pub struct ViewingSession {
    pub id: Uuid,
    pub document_id: String,
    pub viewer: Viewer,
    /// Known once the first load has run a conversion (or hit cache).
    pub total_pages: u32,
    pub current_page: u32,
    /// Slots materialize lazily; an untracked page is `Unloaded`.
    pub slots: HashMap<u32, PageSlot>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl ViewingSession {
    pub fn new(document_id: impl Into<String>, viewer: Viewer, start_page: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            document_id: document_id.into(),
            viewer,
            total_pages: 0,
            current_page: start_page.max(1),
            slots: HashMap::new(),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        Utc::now() - self.last_activity > timeout
    }

    pub fn state_of(&self, page_number: u32) -> PageState {
        self.slots
            .get(&page_number)
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    pub fn slot_mut(&mut self, page_number: u32) -> &mut PageSlot {
        self.slots.entry(page_number).or_default()
    }
}

/// What a viewer sees for one page: the state, and either a URL or a
/// terminal failure.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageView {
    pub page_number: u32,
    pub state: PageState,
    pub url: Option<PageUrl>,
    pub failure: Option<PageFailure>,
}

impl PageView {
    pub(crate) fn from_slot(page_number: u32, slot: &PageSlot) -> Self {
        Self {
            page_number,
            state: slot.state,
            url: slot.url.clone(),
            failure: slot.failure.clone(),
        }
    }
}

/// Serializable snapshot of a whole session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub document_id: String,
    pub total_pages: u32,
    pub current_page: u32,
    /// States of every materialized slot, keyed by page number.
    pub pages: Vec<PageView>,
    pub created_at: DateTime<Utc>,
}

impl SessionInfo {
    pub(crate) fn from_session(session: &ViewingSession) -> Self {
        let mut pages: Vec<PageView> = session
            .slots
            .iter()
            .map(|(page_number, slot)| PageView::from_slot(*page_number, slot))
            .collect();
        pages.sort_by_key(|view| view.page_number);

        Self {
            session_id: session.id,
            document_id: session.document_id.clone(),
            total_pages: session.total_pages,
            current_page: session.current_page,
            pages,
            created_at: session.created_at,
        }
    }

    pub fn state_of(&self, page_number: u32) -> PageState {
        self.pages
            .iter()
            .find(|view| view.page_number == page_number)
            .map(|view| view.state)
            .unwrap_or_default()
    }
}
