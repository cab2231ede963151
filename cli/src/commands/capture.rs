use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::json;

use fieldsync_core::models::ImagePayload;
use fieldsync_core::service::{FieldSyncService, PhotoCapture, WeightEdit};

use super::helpers::{describe_outcome, format_weight, parse_item_code, print_json};

pub(crate) async fn cmd_weight(
    svc: &FieldSyncService,
    item_code: &str,
    value: Option<f64>,
    clear: bool,
    no_sync: bool,
    json: bool,
) -> Result<()> {
    let weight = match (value, clear) {
        (Some(_), true) => bail!("Give either a weight or --clear, not both"),
        (None, false) => bail!("Give a weight, or --clear to remove it"),
        (value, _) => value,
    };
    let item_code = parse_item_code(item_code)?;
    let id = svc.set_weight(WeightEdit {
        item_code: &item_code,
        weight,
    })?;

    let outcome = if no_sync { None } else { Some(svc.sync_now().await) };

    if json {
        return print_json(&json!({
            "id": id,
            "item_code": item_code,
            "weight": weight,
            "sync": outcome,
        }));
    }
    println!(
        "Weight {} for {item_code} saved locally ({id}).",
        format_weight(weight)
    );
    if let Some(ref outcome) = outcome {
        println!("{}", describe_outcome(outcome));
    }
    Ok(())
}

/// Read an image file, taking its MIME type from the extension.
pub(crate) fn load_image(path: &Path) -> Result<ImagePayload> {
    let mime = mime_guess::from_path(path)
        .first()
        .with_context(|| format!("Cannot tell the image type of {}", path.display()))?;
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    ImagePayload::new(bytes, mime.essence_str())
}

pub(crate) async fn cmd_photo(
    svc: &FieldSyncService,
    item_code: &str,
    file: &Path,
    replaces: Option<i64>,
    no_sync: bool,
    json: bool,
) -> Result<()> {
    let item_code = parse_item_code(item_code)?;
    let image = load_image(file)?;
    let size = image.len();
    let id = svc.capture_photo(PhotoCapture {
        item_code: item_code.clone(),
        image,
        replaces,
    })?;

    let outcome = if no_sync { None } else { Some(svc.sync_now().await) };

    if json {
        return print_json(&json!({
            "id": id,
            "item_code": item_code,
            "replaces": replaces,
            "size_bytes": size,
            "sync": outcome,
        }));
    }
    match replaces {
        Some(old) => println!("Replacement for photo {old} of {item_code} saved locally ({id})."),
        None => println!("Photo for {item_code} saved locally ({id})."),
    }
    if let Some(ref outcome) = outcome {
        println!("{}", describe_outcome(outcome));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_image_uses_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shelf.jpg");
        std::fs::write(&path, [0xFF, 0xD8, 0xFF, 0xE0]).unwrap();

        let image = load_image(&path).unwrap();
        assert_eq!(image.mime(), "image/jpeg");
        assert_eq!(image.len(), 4);
    }

    #[test]
    fn test_load_image_rejects_non_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello").unwrap();
        assert!(load_image(&path).is_err());

        let empty = dir.path().join("empty.png");
        std::fs::write(&empty, b"").unwrap();
        assert!(load_image(&empty).is_err());
    }
}
