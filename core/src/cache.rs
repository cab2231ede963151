use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::db::{SharedDatabase, lock};
use crate::events::{StatusFeed, SyncEvent};
use crate::models::Product;
use crate::remote::RemoteStore;

/// Read-through copy of the remote product list.
#[derive(Clone)]
pub struct CacheManager {
    db: SharedDatabase,
    feed: StatusFeed,
}

impl CacheManager {
    #[must_use]
    pub fn new(db: SharedDatabase, feed: StatusFeed) -> Self {
        Self { db, feed }
    }

    /// Replace the snapshot with `products` as one unit.
    pub fn refresh(&self, products: &[Product]) -> Result<()> {
        lock(&self.db).replace_snapshot(products)
    }

    /// Last refreshed snapshot, empty if never populated.
    pub fn read(&self) -> Result<Vec<Product>> {
        lock(&self.db).read_snapshot()
    }

    pub fn last_refreshed_at(&self) -> Result<Option<String>> {
        lock(&self.db).last_refreshed_at()
    }

    /// Fetch everything from the remote and replace the snapshot. On a fetch
    /// failure the existing snapshot stays as it is.
    pub async fn fetch_and_refresh(&self, remote: &dyn RemoteStore) -> Result<Vec<Product>> {
        self.feed.status("Loading products...");
        let products = match remote.fetch_all().await {
            Ok(products) => products,
            Err(e) => {
                warn!(error = %e, "product fetch failed, keeping cached snapshot");
                self.feed.status(format!("Error: {e}"));
                return Err(e).context("Failed to fetch products");
            }
        };

        if let Err(e) = self.refresh(&products) {
            warn!(error = %e, "could not write product snapshot");
            self.feed.status(format!("Error: {e}"));
            return Err(e);
        }

        info!(count = products.len(), "product snapshot refreshed");
        self.feed.emit(SyncEvent::Refreshed {
            products: products.len(),
        });
        self.feed.status("Products loaded successfully.");
        Ok(products)
    }
}
