//! Signals from the core back to the presentation layer.

use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::connectivity::Connectivity;
use crate::models::PendingCounts;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Human-readable progress or error text.
    Status { message: String },
    PendingCount { counts: PendingCounts },
    /// The cached snapshot was replaced by a fresh fetch.
    Refreshed { products: usize },
    /// Whether a "sync now" control should be shown.
    SyncAffordance { visible: bool },
    Connectivity { state: Connectivity },
}

/// Latest value of every signal, for surfaces that poll rather than listen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub message: String,
    pub pending: PendingCounts,
    pub online: bool,
    pub sync_visible: bool,
    pub syncing: bool,
    pub last_refresh_products: Option<usize>,
}

impl Default for StatusView {
    fn default() -> Self {
        Self {
            message: String::new(),
            pending: PendingCounts::default(),
            online: false,
            sync_visible: false,
            syncing: false,
            last_refresh_products: None,
        }
    }
}

/// Fan-out of [`SyncEvent`]s plus the folded [`StatusView`].
#[derive(Clone)]
pub struct StatusFeed {
    events: broadcast::Sender<SyncEvent>,
    view: watch::Sender<StatusView>,
}

impl Default for StatusFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusFeed {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (view, _) = watch::channel(StatusView::default());
        Self { events, view }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn view(&self) -> StatusView {
        self.view.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<StatusView> {
        self.view.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        self.view.send_modify(|view| match &event {
            SyncEvent::Status { message } => view.message.clone_from(message),
            SyncEvent::PendingCount { counts } => view.pending = *counts,
            SyncEvent::Refreshed { products } => view.last_refresh_products = Some(*products),
            SyncEvent::SyncAffordance { visible } => view.sync_visible = *visible,
            SyncEvent::Connectivity { state } => view.online = state.is_online(),
        });
        // No listeners is fine; the view still holds the value.
        let _ = self.events.send(event);
    }

    pub fn status(&self, message: impl Into<String>) {
        self.emit(SyncEvent::Status {
            message: message.into(),
        });
    }

    pub(crate) fn set_syncing(&self, syncing: bool) {
        self.view.send_modify(|view| view.syncing = syncing);
    }
}
