//! Destination store: the PostgreSQL tables the catalog is mirrored into.
//!
//! This module is split into:
//! - `model`: row and payload shapes shared by every store.
//! - `postgres`: the sqlx-backed store used in production.
//! - `memory`: an in-process store with fault injection, built only for
//!   tests and the `test-util` feature.
//!
//! A store holds at most one open transaction. Every write goes through it and
//! nothing is visible to other sessions until [`CatalogStore::commit`].

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod model;
pub mod postgres;

use async_trait::async_trait;

use crate::error::StoreError;

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryStore;
pub use model::{CategoryRow, ImageUrl, InventoryUpdate, ProductRow, ProductUpsert, UpsertCounts};
pub use postgres::PgStore;

/// Upper bound on variation ids sent to the inventory refresh.
pub const RECENT_VARIATION_LIMIT: i64 = 1000;

#[async_trait]
pub trait CatalogStore: Send {
    /// Open a transaction. Fails if one is already open.
    async fn begin(&mut self) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard the open transaction, if any. Never fails: a dead connection
    /// loses the transaction anyway.
    async fn rollback(&mut self);

    /// Drop the current connection and open a fresh one.
    async fn reconnect(&mut self) -> Result<(), StoreError>;

    /// Insert or update products by variation id.
    async fn upsert_products(&mut self, rows: &[ProductUpsert]) -> Result<UpsertCounts, StoreError>;

    /// Insert or update categories by category id. Returns rows written.
    async fn upsert_categories(&mut self, rows: &[CategoryRow]) -> Result<u64, StoreError>;

    /// Append one audit row. Runs under a savepoint: failure leaves the
    /// transaction usable.
    async fn insert_sync_run(&mut self, counts: &UpsertCounts) -> Result<(), StoreError>;

    /// Variation ids ordered by most recent sync first.
    async fn recent_variation_ids(&mut self, limit: i64) -> Result<Vec<String>, StoreError>;

    /// Set stock levels on matching products. Returns rows affected.
    async fn apply_inventory(&mut self, updates: &[InventoryUpdate]) -> Result<u64, StoreError>;

    /// Set `image_url` on products whose image id matches. Returns rows affected.
    async fn apply_images(&mut self, images: &[ImageUrl]) -> Result<u64, StoreError>;

    /// Replace category ids with names, resolving `category` through
    /// `reporting_category`. Runs under a savepoint.
    async fn denormalize_by_reporting_category(&mut self) -> Result<u64, StoreError>;

    /// Replace category ids with names, resolving `category` through itself.
    /// Runs under a savepoint.
    async fn denormalize_by_category(&mut self) -> Result<u64, StoreError>;
}
