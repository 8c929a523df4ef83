//! Upsert engine: maps one batch of catalog objects into destination rows and
//! applies them inside the caller's transaction.
//!
//! Steps run in a fixed order: products, audit row, inventory, images,
//! category names. Nothing here begins or commits a transaction.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

use crate::error::SyncError;
use crate::model::{CatalogItem, CatalogObject, InventoryCount};
use crate::square::CatalogSource;
use crate::store::{
    CatalogStore, CategoryRow, ImageUrl, InventoryUpdate, ProductUpsert, UpsertCounts,
    RECENT_VARIATION_LIMIT,
};

/// What one applied batch changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub products: UpsertCounts,
    pub inventory_rows_updated: u64,
    pub image_rows_updated: u64,
    pub category_denorm_ran: bool,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn first_non_empty<'a>(candidates: &[Option<&'a str>]) -> Option<String> {
    candidates
        .iter()
        .copied()
        .find_map(non_empty)
        .map(str::to_string)
}

/// Keeps first-seen order; a later row with the same key replaces the earlier one.
fn dedupe_last_wins<T>(rows: Vec<T>, key: impl Fn(&T) -> &str) -> Vec<T> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<T> = Vec::with_capacity(rows.len());
    for row in rows {
        match index.get(key(&row)) {
            Some(&i) => out[i] = row,
            None => {
                index.insert(key(&row).to_string(), out.len());
                out.push(row);
            }
        }
    }
    out
}

fn item_rows(item: &CatalogItem, synced_at: DateTime<Utc>) -> Vec<ProductUpsert> {
    let Some(data) = item.item_data.as_ref() else {
        return Vec::new();
    };
    let category_id = data.category_id.as_deref();
    let reporting_id = data.reporting_category.as_ref().and_then(|c| c.id.as_deref());
    let first_listed = data.categories.first().and_then(|c| c.id.as_deref());

    let description = first_non_empty(&[
        data.description_plaintext.as_deref(),
        data.description.as_deref(),
        data.description_html.as_deref(),
    ]);
    let category = first_non_empty(&[category_id, reporting_id, first_listed]);
    let reporting_category = first_non_empty(&[reporting_id, category_id, first_listed]);
    let listed: Vec<String> = data
        .categories
        .iter()
        .filter_map(|c| non_empty(c.id.as_deref()))
        .map(str::to_string)
        .collect();
    let all_categories = if listed.is_empty() {
        reporting_category.clone().map(|c| vec![c])
    } else {
        Some(listed)
    };
    let square_image_id = first_non_empty(&[
        item.image_id.as_deref(),
        data.image_ids.first().map(String::as_str),
    ]);

    data.variations
        .iter()
        .filter_map(|v| match v {
            CatalogObject::ItemVariation(v) => Some(v),
            _ => None,
        })
        .filter_map(|variation| {
            let id = non_empty(variation.meta.id.as_deref())?;
            let vdata = variation.item_variation_data.as_ref();
            Some(ProductUpsert {
                square_variation_id: id.to_string(),
                square_item_id: item.meta.id.clone(),
                name: data.name.clone(),
                variation_name: vdata.and_then(|d| d.name.clone()),
                description: description.clone(),
                price_cents: vdata
                    .and_then(|d| d.price_money.as_ref())
                    .and_then(|m| m.amount),
                category: category.clone(),
                reporting_category: reporting_category.clone(),
                all_categories: all_categories.clone(),
                square_image_id: square_image_id.clone(),
                stock_count: 0,
                updated_at: item.meta.updated_at,
                created_at: item.meta.created_at,
                synced_at,
            })
        })
        .collect()
}

/// Product rows for every variation of every ITEM in `objects`.
pub fn product_rows(objects: &[CatalogObject], synced_at: DateTime<Utc>) -> Vec<ProductUpsert> {
    let rows = objects
        .iter()
        .filter_map(|o| match o {
            CatalogObject::Item(item) => Some(item_rows(item, synced_at)),
            _ => None,
        })
        .flatten()
        .collect();
    dedupe_last_wins(rows, |r| r.square_variation_id.as_str())
}

pub fn category_rows(objects: &[CatalogObject], synced_at: DateTime<Utc>) -> Vec<CategoryRow> {
    let rows = objects
        .iter()
        .filter_map(|o| match o {
            CatalogObject::Category(c) => Some(c),
            _ => None,
        })
        .filter_map(|c| {
            let id = non_empty(c.meta.id.as_deref())?;
            let data = c.category_data.as_ref();
            Some(CategoryRow {
                square_category_id: id.to_string(),
                name: data.and_then(|d| d.name.clone()),
                parent_square_category_id: data.and_then(|d| d.parent()).map(str::to_string),
                is_deleted: c.meta.is_deleted,
                square_created_at: c.meta.created_at,
                square_updated_at: c.meta.updated_at,
                synced_at,
            })
        })
        .collect();
    dedupe_last_wins(rows, |r| r.square_category_id.as_str())
}

/// IMAGE objects with both an id and a URL.
pub fn image_urls(related: &[CatalogObject]) -> Vec<ImageUrl> {
    let rows = related
        .iter()
        .filter_map(|o| match o {
            CatalogObject::Image(img) => {
                let id = non_empty(img.meta.id.as_deref())?;
                let url = non_empty(img.image_data.as_ref()?.url.as_deref())?;
                Some(ImageUrl {
                    image_id: id.to_string(),
                    url: url.to_string(),
                })
            }
            _ => None,
        })
        .collect();
    dedupe_last_wins(rows, |r| r.image_id.as_str())
}

/// Square reports quantities as decimal strings; fractional stock rounds down.
fn parse_quantity(raw: Option<&str>) -> i32 {
    raw.and_then(|q| q.trim().parse::<f64>().ok())
        .filter(|q| q.is_finite())
        .map(|q| q.floor().clamp(0.0, i32::MAX as f64) as i32)
        .unwrap_or(0)
}

/// Variation counts at `location_id`, clamped to zero.
pub fn inventory_updates(counts: &[InventoryCount], location_id: &str) -> Vec<InventoryUpdate> {
    let rows = counts
        .iter()
        .filter(|c| c.catalog_object_type.as_deref() == Some("ITEM_VARIATION"))
        .filter(|c| c.location_id.as_deref() == Some(location_id))
        .filter_map(|c| {
            let id = non_empty(c.catalog_object_id.as_deref())?;
            Some(InventoryUpdate {
                square_variation_id: id.to_string(),
                quantity: parse_quantity(c.quantity.as_deref()),
                updated_at: c.calculated_at,
            })
        })
        .collect();
    dedupe_last_wins(rows, |r| r.square_variation_id.as_str())
}

/// Apply one batch. The caller owns the transaction and commits on success.
#[instrument(skip_all, fields(objects = objects.len(), related = related.len()))]
pub async fn apply_batch<S, C>(
    store: &mut S,
    source: &C,
    location_id: &str,
    objects: &[CatalogObject],
    related: &[CatalogObject],
    synced_at: DateTime<Utc>,
) -> Result<BatchOutcome, SyncError>
where
    S: CatalogStore + ?Sized,
    C: CatalogSource + ?Sized,
{
    let mut outcome = BatchOutcome::default();

    let rows = product_rows(objects, synced_at);
    outcome.products = store.upsert_products(&rows).await?;
    debug!(
        inserted = outcome.products.inserted_count,
        updated = outcome.products.updated_count,
        "products upserted"
    );

    if let Err(err) = store.insert_sync_run(&outcome.products).await {
        warn!(error = %err, "sync run log insert failed; continuing");
        if err.is_transient() {
            return Err(err.into());
        }
    }

    let ids = store.recent_variation_ids(RECENT_VARIATION_LIMIT).await?;
    if !ids.is_empty() {
        let counts = source.batch_inventory_counts(&ids).await?;
        let updates = inventory_updates(&counts, location_id);
        outcome.inventory_rows_updated = store.apply_inventory(&updates).await?;
    }

    if !related.is_empty() {
        let images = image_urls(related);
        outcome.image_rows_updated = store.apply_images(&images).await?;
    }

    outcome.category_denorm_ran = denormalize_categories(store).await?;
    Ok(outcome)
}

/// Reporting-category strategy first, plain category id only if that fails.
/// Statement failures are swallowed; a lost connection is not.
async fn denormalize_categories<S>(store: &mut S) -> Result<bool, SyncError>
where
    S: CatalogStore + ?Sized,
{
    let first = match store.denormalize_by_reporting_category().await {
        Ok(_) => return Ok(true),
        Err(err) if err.is_transient() => return Err(err.into()),
        Err(err) => err,
    };
    match store.denormalize_by_category().await {
        Ok(_) => Ok(true),
        Err(err) if err.is_transient() => Err(err.into()),
        Err(err) => {
            warn!(reporting = %first, fallback = %err, "category denormalization skipped");
            Ok(false)
        }
    }
}
