use std::fmt;

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// UI policy: how many photos a product may carry. The core never enforces
/// this, the capture surfaces do.
pub const MAX_PHOTOS_PER_PRODUCT: usize = 3;

const MAX_ITEM_CODE_LEN: usize = 128;

/// Stable business key of a product (`item_code`). Every pending item and
/// remote call addresses products through this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductRef(String);

impl ProductRef {
    pub fn new(code: impl Into<String>) -> Result<Self> {
        let code = code.into();
        let code = code.trim();
        if code.is_empty() {
            bail!("Item code must not be empty");
        }
        if code.len() > MAX_ITEM_CODE_LEN {
            bail!("Item code must be at most {MAX_ITEM_CODE_LEN} characters");
        }
        if code.chars().any(char::is_control) {
            bail!("Item code must not contain control characters");
        }
        Ok(Self(code.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub item_code: ProductRef,
    pub viet_name: Option<String>,
    pub uom: Option<String>,
    pub weight: Option<f64>,
    #[serde(default)]
    pub photos: Vec<Photo>,
}

/// Photo metadata row. Immutable once created; a replacement is a delete of
/// the old row plus an insert of a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    pub id: i64,
    pub item_code: ProductRef,
    pub image_url: String,
    pub created_at: String,
}

/// Compressed image handed over by the capture collaborator.
#[derive(Clone, PartialEq, Eq)]
pub struct ImagePayload {
    bytes: Vec<u8>,
    mime: String,
}

impl ImagePayload {
    pub fn new(bytes: Vec<u8>, mime: impl Into<String>) -> Result<Self> {
        let mime = mime.into().trim().to_ascii_lowercase();
        if bytes.is_empty() {
            bail!("Image payload is empty");
        }
        if !mime.starts_with("image/") {
            bail!("Unsupported MIME type '{mime}', expected an image");
        }
        Ok(Self { bytes, mime })
    }

    /// Parse a `data:<mime>;base64,<data>` URL, the format browsers produce
    /// from a canvas capture.
    pub fn from_data_url(url: &str) -> Result<Self> {
        let rest = url
            .trim()
            .strip_prefix("data:")
            .context("Image data must be a data: URL")?;
        let (header, data) = rest
            .split_once(',')
            .context("Malformed data URL: missing ','")?;
        let mime = header
            .strip_suffix(";base64")
            .context("Only base64 data URLs are supported")?;
        let bytes = BASE64
            .decode(data.trim())
            .context("Invalid base64 in data URL")?;
        Self::new(bytes, mime)
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn mime(&self) -> &str {
        &self.mime
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePayload")
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Which product field a pending update targets. Only weight is editable today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductField {
    Weight,
}

impl ProductField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weight => "weight",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "weight" => Ok(Self::Weight),
            other => bail!("Unknown product field '{other}'"),
        }
    }
}

/// The two pending collections of the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    Photo,
    Field,
}

impl PendingKind {
    pub(crate) fn table(self) -> &'static str {
        match self {
            Self::Photo => "pending_photo_ops",
            Self::Field => "pending_field_updates",
        }
    }

    pub(crate) fn id_prefix(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Field => "field",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPhotoOp {
    pub item_code: ProductRef,
    pub image: ImagePayload,
    pub photo_to_delete_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct PendingPhotoOp {
    pub id: String,
    pub item_code: ProductRef,
    pub image: ImagePayload,
    /// Set only when this capture replaces an existing photo.
    pub photo_to_delete_id: Option<i64>,
    pub created_at: String,
}

impl PendingPhotoOp {
    #[must_use]
    pub fn summary(&self) -> PendingPhotoSummary {
        PendingPhotoSummary {
            id: self.id.clone(),
            item_code: self.item_code.clone(),
            mime: self.image.mime().to_string(),
            size_bytes: self.image.len(),
            photo_to_delete_id: self.photo_to_delete_id,
            created_at: self.created_at.clone(),
        }
    }
}

/// Listing shape for a queued photo (the image bytes stay in the store).
#[derive(Debug, Clone, Serialize)]
pub struct PendingPhotoSummary {
    pub id: String,
    pub item_code: ProductRef,
    pub mime: String,
    pub size_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_to_delete_id: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewFieldUpdate {
    pub item_code: ProductRef,
    pub field: ProductField,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingFieldUpdate {
    pub id: String,
    pub item_code: ProductRef,
    pub field: ProductField,
    pub value: Option<f64>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCounts {
    pub photos: i64,
    pub field_updates: i64,
}

impl PendingCounts {
    #[must_use]
    pub fn total(&self) -> i64 {
        self.photos + self.field_updates
    }
}

pub fn validate_weight(value: Option<f64>) -> Result<()> {
    if let Some(v) = value {
        if !v.is_finite() {
            bail!("Weight must be a finite number");
        }
        if v < 0.0 {
            bail!("Weight must not be negative");
        }
    }
    Ok(())
}
