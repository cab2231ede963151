use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::CacheManager;
use crate::connectivity::{Connectivity, ConnectivityMonitor, ReachabilityProbe, Transition};
use crate::db::{Database, SharedDatabase, lock};
use crate::events::{StatusFeed, SyncEvent};
use crate::models::{
    ImagePayload, MAX_PHOTOS_PER_PRODUCT, NewFieldUpdate, NewPhotoOp, PendingCounts,
    PendingFieldUpdate, PendingPhotoOp, PendingPhotoSummary, Product, ProductField, ProductRef,
    validate_weight,
};
use crate::remote::RemoteStore;
use crate::sync::{SyncOrchestrator, SyncOutcome, SyncSettings};

/// A compressed capture for one product, as handed over by the camera
/// collaborator.
#[derive(Debug, Clone)]
pub struct PhotoCapture {
    pub item_code: ProductRef,
    pub image: ImagePayload,
    /// Remote id of the photo this capture replaces, if any.
    pub replaces: Option<i64>,
}

/// An added (not replacing) photo was refused because the product already
/// carries the maximum.
#[derive(Debug, Clone, Error)]
#[error("Product {item_code} already has {MAX_PHOTOS_PER_PRODUCT} photos")]
pub struct PhotoLimitReached {
    pub item_code: ProductRef,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightEdit<'a> {
    pub item_code: &'a ProductRef,
    pub weight: Option<f64>,
}

/// Cached product plus whatever is still queued for it.
#[derive(Debug, Clone, Serialize)]
pub struct ProductRow {
    #[serde(flatten)]
    pub product: Product,
    pub pending: PendingCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingListing {
    pub field_updates: Vec<PendingFieldUpdate>,
    pub photos: Vec<PendingPhotoSummary>,
}

/// One user session: the durable store, the remote, connectivity and the
/// signals going back to whatever renders them.
///
/// Writes always land in the local store first. Only afterwards, and only
/// when online, a background sync is started.
#[derive(Clone)]
pub struct FieldSyncService {
    db: SharedDatabase,
    remote: Arc<dyn RemoteStore>,
    connectivity: ConnectivityMonitor,
    cache: CacheManager,
    feed: StatusFeed,
    sync: SyncOrchestrator,
    auto_sync: bool,
}

impl FieldSyncService {
    pub fn open(
        db_path: &Path,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
        settings: SyncSettings,
    ) -> Result<Self> {
        let db = Database::open(db_path)?;
        Ok(Self::new(db, remote, connectivity, settings))
    }

    #[must_use]
    pub fn new(
        db: Database,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
        settings: SyncSettings,
    ) -> Self {
        let db = db.into_shared();
        let feed = StatusFeed::new();
        let cache = CacheManager::new(db.clone(), feed.clone());
        let sync = SyncOrchestrator::new(
            db.clone(),
            Arc::clone(&remote),
            connectivity.clone(),
            cache.clone(),
            feed.clone(),
            settings,
        );
        let service = Self {
            db,
            remote,
            connectivity,
            cache,
            feed,
            sync,
            auto_sync: true,
        };
        service.publish_initial_state();
        service
    }

    /// Stop local writes and connectivity edges from starting background
    /// runs. One-shot callers that await [`Self::sync_now`] themselves use
    /// this so the process never exits mid-run.
    #[must_use]
    pub fn without_auto_sync(mut self) -> Self {
        self.auto_sync = false;
        self
    }

    fn publish_initial_state(&self) {
        let state = self.connectivity.current();
        self.feed.emit(SyncEvent::Connectivity { state });
        let counts = self.sync.publish_pending_counts();
        self.feed.emit(SyncEvent::SyncAffordance {
            visible: state.is_online() && counts.total() > 0,
        });
    }

    pub fn feed(&self) -> &StatusFeed {
        &self.feed
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    // --- Reads ---

    /// Fresh list from the remote when online, the cached snapshot otherwise.
    /// A failed fetch falls back to the cache instead of failing the call.
    pub async fn load_products(&self) -> Result<Vec<ProductRow>> {
        if self.connectivity.is_online() {
            if let Err(e) = self.cache.fetch_and_refresh(self.remote.as_ref()).await {
                warn!(error = %e, "serving cached products");
            }
        } else {
            self.feed
                .status("You are offline. Showing saved products.");
        }
        let rows = self.products()?;
        if self.pending_counts()?.total() > 0 {
            self.sync_opportunistically();
        }
        Ok(rows)
    }

    /// Explicit refresh: unlike [`Self::load_products`] a failed or offline
    /// fetch is an error.
    pub async fn refresh_products(&self) -> Result<Vec<ProductRow>> {
        if !self.connectivity.is_online() {
            bail!("You are offline. Products cannot be refreshed.");
        }
        self.cache.fetch_and_refresh(self.remote.as_ref()).await?;
        self.products()
    }

    /// Cached products, each with the count of changes still queued for it.
    pub fn products(&self) -> Result<Vec<ProductRow>> {
        let db = lock(&self.db);
        db.read_snapshot()?
            .into_iter()
            .map(|product| {
                let pending = db.pending_for_product(&product.item_code)?;
                Ok(ProductRow { product, pending })
            })
            .collect()
    }

    pub fn pending(&self) -> Result<PendingListing> {
        let db = lock(&self.db);
        Ok(PendingListing {
            field_updates: db.list_field_updates()?,
            photos: db
                .list_photo_ops()?
                .iter()
                .map(PendingPhotoOp::summary)
                .collect(),
        })
    }

    pub fn pending_counts(&self) -> Result<PendingCounts> {
        lock(&self.db).pending_counts()
    }

    /// How many more photos `item_code` may take: cached photos and queued
    /// additions both use up a slot, replacements do not.
    pub fn photo_slots_left(&self, item_code: &ProductRef) -> Result<usize> {
        Self::slots_left_in(&lock(&self.db), item_code)
    }

    fn slots_left_in(db: &Database, item_code: &ProductRef) -> Result<usize> {
        let existing = db
            .read_snapshot()?
            .iter()
            .find(|p| &p.item_code == item_code)
            .map_or(0, |p| p.photos.len());
        let queued = usize::try_from(db.pending_photo_adds(item_code)?).unwrap_or(usize::MAX);
        Ok(MAX_PHOTOS_PER_PRODUCT.saturating_sub(existing.saturating_add(queued)))
    }

    // --- Writes ---

    /// Queue a weight change. Returns the pending id once it is on disk.
    pub fn set_weight(&self, edit: WeightEdit<'_>) -> Result<String> {
        validate_weight(edit.weight)?;
        let id = lock(&self.db).enqueue_field_update(&NewFieldUpdate {
            item_code: edit.item_code.clone(),
            field: ProductField::Weight,
            value: edit.weight,
        })?;
        debug!(%id, item_code = %edit.item_code, "weight queued");

        self.feed.status(format!(
            "Weight for product {} saved locally.",
            edit.item_code
        ));
        self.after_local_write();
        Ok(id)
    }

    /// Queue a photo capture. A capture that adds (rather than replaces) a
    /// photo is refused once the product has no slots left.
    /// Fails with [`PhotoLimitReached`] when the product is full.
    pub fn capture_photo(&self, capture: PhotoCapture) -> Result<String> {
        let item_code = capture.item_code.clone();
        let id = {
            // Check and enqueue under one lock so two captures cannot both
            // take the last slot.
            let db = lock(&self.db);
            if capture.replaces.is_none() && Self::slots_left_in(&db, &item_code)? == 0 {
                bail!(PhotoLimitReached { item_code });
            }
            db.enqueue_photo_op(&NewPhotoOp {
                item_code: capture.item_code,
                image: capture.image,
                photo_to_delete_id: capture.replaces,
            })?
        };
        debug!(%id, %item_code, "photo queued");

        self.feed
            .status(format!("Photo for product {item_code} saved locally."));
        self.after_local_write();
        Ok(id)
    }

    fn after_local_write(&self) {
        let counts = self.sync.publish_pending_counts();
        if self.connectivity.is_online() {
            self.feed.emit(SyncEvent::SyncAffordance {
                visible: counts.total() > 0,
            });
            self.sync_opportunistically();
        }
    }

    // --- Sync ---

    /// Manual trigger. Waits for the run to finish.
    pub async fn sync_now(&self) -> SyncOutcome {
        self.sync.run_sync().await
    }

    /// Start a background run when online and auto sync is on. Returns
    /// whether one was spawned; without a tokio runtime nothing is started
    /// and the queue waits.
    pub fn sync_opportunistically(&self) -> bool {
        if !self.auto_sync || !self.connectivity.is_online() {
            return false;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime, sync deferred");
            return false;
        };
        let sync = self.sync.clone();
        handle.spawn(async move {
            sync.run_sync().await;
        });
        true
    }

    pub fn is_syncing(&self) -> bool {
        self.sync.is_running()
    }

    /// React to a connectivity edge.
    pub fn handle_transition(&self, edge: Transition) {
        match edge {
            Transition::CameOnline => {
                self.feed.emit(SyncEvent::Connectivity {
                    state: Connectivity::Online,
                });
                self.feed.status("You are online.");
                self.sync_opportunistically();
            }
            Transition::WentOffline => {
                self.feed.emit(SyncEvent::Connectivity {
                    state: Connectivity::Offline,
                });
                self.feed.emit(SyncEvent::SyncAffordance { visible: false });
                self.feed
                    .status("You are offline. Photos will be saved locally.");
            }
        }
    }

    /// Poll `probe` until the task is dropped, syncing on every return to
    /// connectivity.
    pub async fn run_monitor(&self, probe: Arc<dyn ReachabilityProbe>, interval: Duration) {
        self.connectivity
            .poll(probe.as_ref(), interval, |edge| self.handle_transition(edge))
            .await;
    }
}
