use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Photo, Product, ProductField, ProductRef};

const MAX_PATH_ITEM_CODE_LEN: usize = 48;
const OP_SUFFIX_LEN: usize = 6;

/// Errors surfaced by a [`RemoteStore`]. Messages are the remote's own,
/// passed through unchanged.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network unreachable, timeout, TLS failure
    #[error("network error: {0}")]
    Transport(String),

    /// The remote answered with an error status
    #[error("remote error ({status}): {message}")]
    Api { status: u16, message: String },

    /// No public reference could be resolved for an uploaded blob
    #[error("could not resolve a public reference for '{0}'")]
    MissingReference(String),

    /// The remote answered with something that could not be understood
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Contract over the authoritative remote store: relational records for
/// products and photo metadata, plus one blob bucket.
///
/// Implementations perform no retries. A failed call leaves the pending item
/// queued and the next sync run retries it.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn update_field(
        &self,
        item_code: &ProductRef,
        field: ProductField,
        value: Option<f64>,
    ) -> RemoteResult<()>;

    async fn upload_blob(&self, path: &str, bytes: Vec<u8>, mime: &str) -> RemoteResult<()>;

    async fn resolve_public_ref(&self, path: &str) -> RemoteResult<String>;

    async fn insert_photo_record(
        &self,
        item_code: &ProductRef,
        image_url: &str,
    ) -> RemoteResult<Photo>;

    /// `Ok(None)` when the photo no longer exists.
    async fn get_photo(&self, photo_id: i64) -> RemoteResult<Option<Photo>>;

    async fn delete_photo_record(&self, photo_id: i64) -> RemoteResult<()>;

    async fn delete_blob(&self, path: &str) -> RemoteResult<()>;

    /// Map a public reference back to its path in the bucket, if it points
    /// into this store.
    fn blob_path_of(&self, reference: &str) -> Option<String>;

    async fn fetch_all(&self) -> RemoteResult<Vec<Product>>;
}

/// Blob path for a new photo: `{container}/{item_code}_{millis}-{suffix}.jpg`.
///
/// The item code is reduced to path-safe characters and truncated; the op id
/// suffix keeps two captures of one product in the same millisecond apart.
#[must_use]
pub fn photo_blob_path(
    container: &str,
    item_code: &ProductRef,
    at: DateTime<Utc>,
    op_id: &str,
) -> String {
    let code: String = item_code
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_PATH_ITEM_CODE_LEN)
        .collect();
    let suffix: String = {
        let chars: Vec<char> = op_id.chars().filter(char::is_ascii_alphanumeric).collect();
        chars[chars.len().saturating_sub(OP_SUFFIX_LEN)..]
            .iter()
            .collect()
    };
    let container = container.trim_matches('/');
    format!("{container}/{code}_{}-{suffix}.jpg", at.timestamp_millis())
}
