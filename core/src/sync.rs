//! Reconciliation engine: replays queued local mutations against the remote
//! store, then refreshes the product cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::CacheManager;
use crate::connectivity::ConnectivityMonitor;
use crate::db::{Database, SharedDatabase, lock};
use crate::events::{StatusFeed, SyncEvent};
use crate::models::{PendingCounts, PendingKind};
use crate::remote::{RemoteError, RemoteStore, photo_blob_path};

pub const FIELD_BATCH_SIZE: usize = 10;
pub const PHOTO_BATCH_SIZE: usize = 5;
pub const FIELD_BATCH_PAUSE: Duration = Duration::from_millis(150);
pub const PHOTO_BATCH_PAUSE: Duration = Duration::from_millis(600);
pub const DEFAULT_BLOB_CONTAINER: &str = "public";

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub field_batch_size: usize,
    pub photo_batch_size: usize,
    /// Pause between two field-update batches.
    pub field_batch_pause: Duration,
    /// Pause between two photo batches; longer since each item uploads a blob.
    pub photo_batch_pause: Duration,
    /// Folder inside the bucket that new photo blobs go to.
    pub blob_container: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            field_batch_size: FIELD_BATCH_SIZE,
            photo_batch_size: PHOTO_BATCH_SIZE,
            field_batch_pause: FIELD_BATCH_PAUSE,
            photo_batch_pause: PHOTO_BATCH_PAUSE,
            blob_container: DEFAULT_BLOB_CONTAINER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
    Offline,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub applied: usize,
    pub failed: usize,
    /// Items removed by someone else between the id snapshot and processing.
    pub vanished: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub field_updates: DrainReport,
    pub photos: DrainReport,
    pub refreshed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_error: Option<String>,
    pub remaining: PendingCounts,
}

impl SyncReport {
    #[must_use]
    pub fn failed(&self) -> usize {
        self.field_updates.failed + self.photos.failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Skipped { reason: SkipReason },
    Completed(SyncReport),
}

enum ItemOutcome {
    Applied,
    Vanished,
}

/// Holds the in-progress flag for one run and clears it however the run ends.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
    feed: &'a StatusFeed,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool, feed: &'a StatusFeed) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        feed.set_syncing(true);
        Some(Self { flag, feed })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        self.feed.set_syncing(false);
    }
}

struct Inner {
    db: SharedDatabase,
    remote: Arc<dyn RemoteStore>,
    connectivity: ConnectivityMonitor,
    cache: CacheManager,
    feed: StatusFeed,
    settings: SyncSettings,
    in_progress: AtomicBool,
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    #[must_use]
    pub fn new(
        db: SharedDatabase,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
        cache: CacheManager,
        feed: StatusFeed,
        settings: SyncSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                remote,
                connectivity,
                cache,
                feed,
                settings,
                in_progress: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.in_progress.load(Ordering::Acquire)
    }

    /// One reconciliation pass. Never fails: per-item errors leave the item
    /// queued for the next run and are reported in the [`SyncReport`].
    pub async fn run_sync(&self) -> SyncOutcome {
        let inner = &self.inner;
        if !inner.connectivity.is_online() {
            debug!("offline, sync skipped");
            return SyncOutcome::Skipped {
                reason: SkipReason::Offline,
            };
        }
        let Some(_guard) = RunGuard::acquire(&inner.in_progress, &inner.feed) else {
            debug!("sync already in progress");
            return SyncOutcome::Skipped {
                reason: SkipReason::AlreadyRunning,
            };
        };

        // Items enqueued after this point wait for the next run.
        let field_ids = self.pending_ids(PendingKind::Field);
        let photo_ids = self.pending_ids(PendingKind::Photo);
        let total = field_ids.len() + photo_ids.len();

        if total == 0 {
            inner.feed.status("All changes are synced.");
        } else {
            info!(
                field_updates = field_ids.len(),
                photos = photo_ids.len(),
                "sync started"
            );
            if inner.connectivity.is_online() {
                inner
                    .feed
                    .emit(SyncEvent::SyncAffordance { visible: true });
            }
            inner.feed.status(format!("Found {total} item(s) to sync."));
        }

        let field_updates = self.drain(PendingKind::Field, &field_ids).await;
        let photos = self.drain(PendingKind::Photo, &photo_ids).await;

        let refresh = inner.cache.fetch_and_refresh(inner.remote.as_ref()).await;
        let remaining = self.publish_pending_counts();

        let report = SyncReport {
            field_updates,
            photos,
            refreshed: refresh.is_ok(),
            refresh_error: refresh.err().map(|e| format!("{e:#}")),
            remaining,
        };

        if report.failed() > 0 {
            inner.feed.status(format!(
                "Sync failed for {} item(s). Will try again later.",
                report.failed()
            ));
        } else if total > 0 {
            inner.feed.status("All pending changes have been synced!");
        }
        // Connectivity may have dropped mid-run; the control stays hidden then.
        inner.feed.emit(SyncEvent::SyncAffordance {
            visible: remaining.total() > 0 && inner.connectivity.is_online(),
        });

        info!(
            applied = report.field_updates.applied + report.photos.applied,
            failed = report.failed(),
            refreshed = report.refreshed,
            "sync finished"
        );
        SyncOutcome::Completed(report)
    }

    /// Current pending counts, pushed to the presentation layer.
    pub fn publish_pending_counts(&self) -> PendingCounts {
        let counts = self
            .with_db(Database::pending_counts)
            .unwrap_or_else(|e| {
                warn!(error = %e, "could not count pending items");
                self.inner.feed.view().pending
            });
        self.inner
            .feed
            .emit(SyncEvent::PendingCount { counts });
        counts
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let db = lock(&self.inner.db);
        f(&db)
    }

    fn pending_ids(&self, kind: PendingKind) -> Vec<String> {
        self.with_db(|db| db.list_pending_ids(kind))
            .unwrap_or_else(|e| {
                warn!(?kind, error = %e, "could not list pending items");
                Vec::new()
            })
    }

    async fn drain(&self, kind: PendingKind, ids: &[String]) -> DrainReport {
        let settings = &self.inner.settings;
        let (batch_size, pause) = match kind {
            PendingKind::Field => (settings.field_batch_size, settings.field_batch_pause),
            PendingKind::Photo => (settings.photo_batch_size, settings.photo_batch_pause),
        };

        let mut report = DrainReport::default();
        for (index, batch) in ids.chunks(batch_size.max(1)).enumerate() {
            if index > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }

            let results = join_all(batch.iter().map(|id| self.apply(kind, id))).await;
            for (id, result) in batch.iter().zip(results) {
                report.attempted += 1;
                match result {
                    Ok(ItemOutcome::Applied) => report.applied += 1,
                    Ok(ItemOutcome::Vanished) => report.vanished += 1,
                    Err(e) => {
                        report.failed += 1;
                        let error = format!("{e:#}");
                        warn!(%id, %error, "pending item failed, left queued for retry");
                    }
                }
            }
            self.publish_pending_counts();
        }
        report
    }

    async fn apply(&self, kind: PendingKind, id: &str) -> Result<ItemOutcome> {
        match kind {
            PendingKind::Field => self.apply_field_update(id).await,
            PendingKind::Photo => self.apply_photo_op(id).await,
        }
    }

    async fn apply_field_update(&self, id: &str) -> Result<ItemOutcome> {
        let Some(update) = self.with_db(|db| db.get_field_update(id))? else {
            return Ok(ItemOutcome::Vanished);
        };

        self.inner
            .remote
            .update_field(&update.item_code, update.field, update.value)
            .await
            .with_context(|| {
                format!(
                    "updating {} of {} failed",
                    update.field.as_str(),
                    update.item_code
                )
            })?;

        self.confirm(PendingKind::Field, id)?;
        debug!(%id, item_code = %update.item_code, "field update applied");
        Ok(ItemOutcome::Applied)
    }

    async fn apply_photo_op(&self, id: &str) -> Result<ItemOutcome> {
        let Some(op) = self.with_db(|db| db.get_photo_op(id))? else {
            return Ok(ItemOutcome::Vanished);
        };
        let remote = self.inner.remote.as_ref();

        if let Some(old_id) = op.photo_to_delete_id {
            self.remove_replaced_photo(old_id).await;
        }

        let path = photo_blob_path(
            &self.inner.settings.blob_container,
            &op.item_code,
            Utc::now(),
            &op.id,
        );
        let mime = op.image.mime().to_string();
        remote
            .upload_blob(&path, op.image.into_bytes(), &mime)
            .await
            .with_context(|| format!("upload of {path} failed"))?;

        let reference = remote.resolve_public_ref(&path).await?;
        if reference.trim().is_empty() {
            bail!(RemoteError::MissingReference(path));
        }

        let photo = remote
            .insert_photo_record(&op.item_code, &reference)
            .await
            .with_context(|| format!("recording photo for {} failed", op.item_code))?;

        self.confirm(PendingKind::Photo, id)?;
        info!(%id, item_code = %op.item_code, photo_id = photo.id, "photo synced");
        Ok(ItemOutcome::Applied)
    }

    /// Best-effort removal of the photo a capture replaces. Failures are
    /// logged and never block the new upload.
    async fn remove_replaced_photo(&self, photo_id: i64) {
        let remote = self.inner.remote.as_ref();
        match remote.get_photo(photo_id).await {
            Ok(Some(photo)) => match remote.blob_path_of(&photo.image_url) {
                Some(path) => {
                    if let Err(e) = remote.delete_blob(&path).await {
                        warn!(photo_id, %path, error = %e, "could not delete replaced blob");
                    }
                }
                None => warn!(photo_id, url = %photo.image_url, "replaced photo is not in this bucket"),
            },
            Ok(None) => {
                debug!(photo_id, "replaced photo already gone");
                return;
            }
            Err(e) => warn!(photo_id, error = %e, "could not look up replaced photo"),
        }

        if let Err(e) = remote.delete_photo_record(photo_id).await {
            warn!(photo_id, error = %e, "could not delete replaced photo record");
        }
    }

    fn confirm(&self, kind: PendingKind, id: &str) -> Result<()> {
        let removed = self
            .with_db(|db| db.remove_pending(kind, id))
            .with_context(|| format!("remote applied {id} but it could not be dequeued"))?;
        if !removed {
            debug!(%id, "pending item was already dequeued");
        }
        Ok(())
    }
}
