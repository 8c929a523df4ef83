//! Destination row shapes exchanged between the upsert engine and stores.
//!
//! Payload structs serialize to the JSON records that the Postgres statements
//! expand with `jsonb_to_recordset`, so field names match column names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One product row to upsert, keyed by variation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductUpsert {
    pub square_variation_id: String,
    pub square_item_id: Option<String>,
    pub name: Option<String>,
    pub variation_name: Option<String>,
    pub description: Option<String>,
    pub price_cents: Option<i64>,
    pub category: Option<String>,
    pub reporting_category: Option<String>,
    pub all_categories: Option<Vec<String>>,
    pub square_image_id: Option<String>,
    pub stock_count: i32,
    pub updated_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
}

/// Product as stored in the destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProductRow {
    pub square_variation_id: String,
    pub square_item_id: Option<String>,
    pub name: Option<String>,
    pub variation_name: Option<String>,
    pub description: Option<String>,
    pub price_cents: Option<i64>,
    pub category: Option<String>,
    pub reporting_category: Option<String>,
    pub all_categories: Option<Vec<String>>,
    pub square_image_id: Option<String>,
    pub image_url: Option<String>,
    pub stock_count: i32,
    pub updated_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CategoryRow {
    pub square_category_id: String,
    pub name: Option<String>,
    pub parent_square_category_id: Option<String>,
    pub is_deleted: bool,
    pub square_created_at: Option<DateTime<Utc>>,
    pub square_updated_at: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
}

/// Stock level for one variation at the configured location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryUpdate {
    pub square_variation_id: String,
    /// Never negative.
    pub quantity: i32,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageUrl {
    pub image_id: String,
    pub url: String,
}

/// Result of one product upsert, also written to the audit table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertCounts {
    pub inserted_count: u64,
    pub updated_count: u64,
    pub total_upserted: u64,
}

impl UpsertCounts {
    pub fn add(&mut self, other: &UpsertCounts) {
        self.inserted_count += other.inserted_count;
        self.updated_count += other.updated_count;
        self.total_upserted += other.total_upserted;
    }
}
