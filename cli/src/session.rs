use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use fieldsync_core::connectivity::{Connectivity, ConnectivityMonitor, ReachabilityProbe};
use fieldsync_core::models::{Photo, Product, ProductField, ProductRef};
use fieldsync_core::remote::{RemoteError, RemoteResult, RemoteStore};
use fieldsync_core::service::FieldSyncService;
use fieldsync_core::sync::SyncSettings;

use crate::config::Config;
use crate::supabase::{HttpProbe, SupabaseStore};

/// Stand-in remote when none is configured. Every call fails as a network
/// error, so captures stay queued until a remote is set up.
pub(crate) struct LocalOnly;

fn not_configured<T>() -> RemoteResult<T> {
    Err(RemoteError::transport(
        "no remote configured (set FIELDSYNC_REMOTE_URL and FIELDSYNC_ANON_KEY)",
    ))
}

#[async_trait]
impl RemoteStore for LocalOnly {
    async fn update_field(&self, _: &ProductRef, _: ProductField, _: Option<f64>) -> RemoteResult<()> {
        not_configured()
    }

    async fn upload_blob(&self, _: &str, _: Vec<u8>, _: &str) -> RemoteResult<()> {
        not_configured()
    }

    async fn resolve_public_ref(&self, _: &str) -> RemoteResult<String> {
        not_configured()
    }

    async fn insert_photo_record(&self, _: &ProductRef, _: &str) -> RemoteResult<Photo> {
        not_configured()
    }

    async fn get_photo(&self, _: i64) -> RemoteResult<Option<Photo>> {
        not_configured()
    }

    async fn delete_photo_record(&self, _: i64) -> RemoteResult<()> {
        not_configured()
    }

    async fn delete_blob(&self, _: &str) -> RemoteResult<()> {
        not_configured()
    }

    fn blob_path_of(&self, _: &str) -> Option<String> {
        None
    }

    async fn fetch_all(&self) -> RemoteResult<Vec<Product>> {
        not_configured()
    }
}

pub struct Session {
    pub service: FieldSyncService,
    /// `None` when running local-only; nothing to poll then.
    pub probe: Option<Arc<dyn ReachabilityProbe>>,
}

/// Open the local store and connect it to the configured remote, sampling
/// reachability once. `force_offline` keeps everything local.
pub async fn connect(config: &Config, force_offline: bool) -> Result<Session> {
    let settings = SyncSettings::default();

    let remote = match &config.remote {
        Some(remote) if !force_offline => remote,
        _ => {
            info!("running local-only");
            let service = FieldSyncService::open(
                &config.db_path,
                Arc::new(LocalOnly),
                ConnectivityMonitor::new(Connectivity::Offline),
                settings,
            )?;
            return Ok(Session {
                service,
                probe: None,
            });
        }
    };

    let store = SupabaseStore::new(&remote.url, &remote.anon_key)?;
    let probe: Arc<dyn ReachabilityProbe> = Arc::new(HttpProbe::new(&remote.url)?);
    let connectivity = ConnectivityMonitor::sample(probe.as_ref()).await;
    info!(url = %remote.url, online = connectivity.is_online(), "remote configured");

    let service =
        FieldSyncService::open(&config.db_path, Arc::new(store), connectivity, settings)?;
    Ok(Session {
        service,
        probe: Some(probe),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_only_fails_as_transport_error() {
        let err = LocalOnly.fetch_all().await.unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_)));
        assert!(err.to_string().contains("FIELDSYNC_REMOTE_URL"));
        assert_eq!(LocalOnly.blob_path_of("https://x/y.jpg"), None);
    }

    #[tokio::test]
    async fn test_connect_without_remote_is_offline() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            db_path: dir.path().join("fieldsync.db"),
            data_dir: dir.path().to_path_buf(),
            remote: None,
        };
        let session = connect(&config, false).await.unwrap();
        assert!(session.probe.is_none());
        assert!(!session.service.connectivity().is_online());
    }
}
