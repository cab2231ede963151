use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use fieldsync_core::models::MAX_PHOTOS_PER_PRODUCT;
use fieldsync_core::service::{FieldSyncService, ProductRow};

use super::helpers::{format_weight, print_json, truncate};

pub(crate) async fn cmd_products(svc: &FieldSyncService, json: bool) -> Result<()> {
    let rows = svc.load_products().await?;
    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        eprintln!("No products cached yet. Run `fieldsync refresh` while online.");
        return Ok(());
    }
    print_product_table(&rows);
    if let Some(at) = svc.cache().last_refreshed_at()? {
        eprintln!("Last refreshed {at}");
    }
    Ok(())
}

pub(crate) async fn cmd_refresh(svc: &FieldSyncService, json: bool) -> Result<()> {
    let rows = svc.refresh_products().await?;
    if json {
        print_json(&rows)
    } else {
        println!("Loaded {} product(s).", rows.len());
        Ok(())
    }
}

fn print_product_table(rows: &[ProductRow]) {
    #[derive(Tabled)]
    struct Row {
        #[tabled(rename = "Item code")]
        code: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "UoM")]
        uom: String,
        #[tabled(rename = "Weight")]
        weight: String,
        #[tabled(rename = "Photos")]
        photos: String,
        #[tabled(rename = "Pending")]
        pending: String,
    }

    let rows: Vec<Row> = rows
        .iter()
        .map(|r| Row {
            code: r.product.item_code.to_string(),
            name: r
                .product
                .viet_name
                .as_deref()
                .map(|n| truncate(n, 40))
                .unwrap_or_default(),
            uom: r.product.uom.clone().unwrap_or_default(),
            weight: format_weight(r.product.weight),
            photos: format!("{}/{MAX_PHOTOS_PER_PRODUCT}", r.product.photos.len()),
            pending: if r.pending.total() > 0 {
                format!("{} queued", r.pending.total())
            } else {
                String::new()
            },
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..5)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}
