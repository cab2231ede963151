use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use fieldsync_core::service::FieldSyncService;

use super::helpers::{format_weight, print_json};

pub(crate) fn cmd_pending(svc: &FieldSyncService, json: bool) -> Result<()> {
    let listing = svc.pending()?;
    if json {
        return print_json(&listing);
    }
    if listing.field_updates.is_empty() && listing.photos.is_empty() {
        println!("Nothing queued. All changes are synced.");
        return Ok(());
    }

    if !listing.field_updates.is_empty() {
        #[derive(Tabled)]
        struct FieldRow {
            #[tabled(rename = "ID")]
            id: String,
            #[tabled(rename = "Item code")]
            code: String,
            #[tabled(rename = "Field")]
            field: String,
            #[tabled(rename = "Value")]
            value: String,
            #[tabled(rename = "Queued at")]
            at: String,
        }

        let rows: Vec<FieldRow> = listing
            .field_updates
            .iter()
            .map(|u| FieldRow {
                id: u.id.clone(),
                code: u.item_code.to_string(),
                field: u.field.as_str().to_string(),
                value: format_weight(u.value),
                at: u.timestamp.clone(),
            })
            .collect();
        println!("Field updates ({}):", rows.len());
        println!(
            "{}",
            Table::new(&rows)
                .with(Style::rounded())
                .with(Modify::new(Columns::single(3)).with(Alignment::right()))
        );
    }

    if !listing.photos.is_empty() {
        #[derive(Tabled)]
        struct PhotoRow {
            #[tabled(rename = "ID")]
            id: String,
            #[tabled(rename = "Item code")]
            code: String,
            #[tabled(rename = "Type")]
            mime: String,
            #[tabled(rename = "Size")]
            size: String,
            #[tabled(rename = "Replaces")]
            replaces: String,
            #[tabled(rename = "Queued at")]
            at: String,
        }

        let rows: Vec<PhotoRow> = listing
            .photos
            .iter()
            .map(|p| PhotoRow {
                id: p.id.clone(),
                code: p.item_code.to_string(),
                mime: p.mime.clone(),
                size: format!("{:.1} KiB", p.size_bytes as f64 / 1024.0),
                replaces: p
                    .photo_to_delete_id
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
                at: p.created_at.clone(),
            })
            .collect();
        println!("Photos ({}):", rows.len());
        println!("{}", Table::new(&rows).with(Style::rounded()));
    }

    Ok(())
}
