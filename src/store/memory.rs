//! In-process [`CatalogStore`] with snapshot transactions and scripted faults.
//!
//! Mirrors the PostgreSQL statements closely enough for engine and
//! orchestrator tests: coalescing upserts, clamped inventory, savepoint-style
//! best-effort statements. A transient fault also drops the "connection" so
//! every later call fails until [`CatalogStore::reconnect`].

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::io;

use super::model::{CategoryRow, ImageUrl, InventoryUpdate, ProductRow, ProductUpsert, UpsertCounts};
use super::CatalogStore;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Begin,
    Commit,
    Reconnect,
    UpsertProducts,
    UpsertCategories,
    InsertSyncRun,
    RecentVariationIds,
    ApplyInventory,
    ApplyImages,
    DenormalizeByReportingCategory,
    DenormalizeByCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Connection-level failure; the store must be reconnected afterwards.
    Transient,
    /// Statement failure, e.g. a missing table or a constraint violation.
    Persistent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub begins: u32,
    pub commits: u32,
    pub rollbacks: u32,
    pub reconnects: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Snapshot {
    products: BTreeMap<String, ProductRow>,
    categories: BTreeMap<String, CategoryRow>,
    runs: Vec<UpsertCounts>,
}

#[derive(Debug)]
struct ScriptedFault {
    op: StoreOp,
    fault: Fault,
    /// `None` fails every call.
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    committed: Snapshot,
    working: Option<Snapshot>,
    faults: Vec<ScriptedFault>,
    disconnected: bool,
    stats: StoreStats,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call to `op`.
    pub fn fail_next(&mut self, op: StoreOp, fault: Fault) {
        self.fail_times(op, fault, 1);
    }

    pub fn fail_times(&mut self, op: StoreOp, fault: Fault, times: u32) {
        self.faults.push(ScriptedFault {
            op,
            fault,
            remaining: Some(times),
        });
    }

    /// Fail every call to `op`.
    pub fn fail_always(&mut self, op: StoreOp, fault: Fault) {
        self.faults.push(ScriptedFault {
            op,
            fault,
            remaining: None,
        });
    }

    pub fn seed_product(&mut self, row: ProductRow) {
        self.committed
            .products
            .insert(row.square_variation_id.clone(), row);
    }

    pub fn seed_category(&mut self, row: CategoryRow) {
        self.committed
            .categories
            .insert(row.square_category_id.clone(), row);
    }

    pub fn product(&self, variation_id: &str) -> Option<&ProductRow> {
        self.committed.products.get(variation_id)
    }

    pub fn products(&self) -> impl Iterator<Item = &ProductRow> {
        self.committed.products.values()
    }

    pub fn category(&self, category_id: &str) -> Option<&CategoryRow> {
        self.committed.categories.get(category_id)
    }

    pub fn category_count(&self) -> usize {
        self.committed.categories.len()
    }

    /// Committed audit rows, oldest first.
    pub fn runs(&self) -> &[UpsertCounts] {
        &self.committed.runs
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    pub fn in_transaction(&self) -> bool {
        self.working.is_some()
    }

    fn check(&mut self, op: StoreOp) -> Result<(), StoreError> {
        let context = format!("{op:?}");
        if self.disconnected && op != StoreOp::Reconnect {
            return Err(transient(context, "connection closed"));
        }
        let Some(idx) = self.faults.iter().position(|f| f.op == op) else {
            return Ok(());
        };
        let fault = self.faults[idx].fault;
        match self.faults[idx].remaining {
            Some(n) if n <= 1 => {
                self.faults.remove(idx);
            }
            Some(n) => self.faults[idx].remaining = Some(n - 1),
            None => {}
        }
        match fault {
            Fault::Transient => {
                self.disconnected = true;
                self.working = None;
                Err(transient(context, "connection reset by peer"))
            }
            Fault::Persistent => Err(StoreError::Persistent {
                context,
                source: sqlx::Error::Protocol("simulated statement failure".into()),
            }),
        }
    }

    fn working(&mut self) -> Result<&mut Snapshot, StoreError> {
        self.working.as_mut().ok_or_else(|| StoreError::Persistent {
            context: "no open transaction".into(),
            source: sqlx::Error::Protocol("statement issued outside a transaction".into()),
        })
    }

    fn denormalize(&mut self, op: StoreOp, by_reporting: bool) -> Result<u64, StoreError> {
        self.check(op)?;
        let snap = self.working()?;
        let names: HashMap<String, Option<String>> = snap
            .categories
            .iter()
            .map(|(id, c)| (id.clone(), c.name.clone()))
            .collect();
        let mut touched = 0;
        for row in snap.products.values_mut() {
            let Some(all) = row.all_categories.as_ref() else {
                continue;
            };
            let lookup = if by_reporting {
                row.reporting_category.as_deref()
            } else {
                row.category.as_deref()
            };
            if let Some(name) = lookup.and_then(|id| names.get(id)).cloned().flatten() {
                row.category = Some(name);
            }
            let resolved: Vec<String> = all
                .iter()
                .filter_map(|id| names.get(id).cloned().flatten())
                .collect();
            if !resolved.is_empty() {
                row.all_categories = Some(resolved);
            }
            touched += 1;
        }
        Ok(touched)
    }
}

fn transient(context: String, message: &str) -> StoreError {
    StoreError::Transient {
        context,
        source: sqlx::Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, message.to_string())),
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn begin(&mut self) -> Result<(), StoreError> {
        self.check(StoreOp::Begin)?;
        if self.working.is_some() {
            return Err(StoreError::Persistent {
                context: "begin".into(),
                source: sqlx::Error::Protocol("transaction already open".into()),
            });
        }
        self.stats.begins += 1;
        self.working = Some(self.committed.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if let Err(err) = self.check(StoreOp::Commit) {
            self.working = None;
            return Err(err);
        }
        let snap = self.working.take().ok_or_else(|| StoreError::Persistent {
            context: "commit".into(),
            source: sqlx::Error::Protocol("no open transaction".into()),
        })?;
        self.committed = snap;
        self.stats.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) {
        if self.working.take().is_some() {
            self.stats.rollbacks += 1;
        }
    }

    async fn reconnect(&mut self) -> Result<(), StoreError> {
        self.check(StoreOp::Reconnect)?;
        self.working = None;
        self.disconnected = false;
        self.stats.reconnects += 1;
        Ok(())
    }

    async fn upsert_products(&mut self, rows: &[ProductUpsert]) -> Result<UpsertCounts, StoreError> {
        self.check(StoreOp::UpsertProducts)?;
        let snap = self.working()?;
        let mut counts = UpsertCounts::default();
        for row in rows {
            match snap.products.get_mut(&row.square_variation_id) {
                Some(existing) => {
                    existing.square_item_id = row.square_item_id.clone();
                    existing.name = row.name.clone();
                    existing.variation_name = row.variation_name.clone();
                    existing.description = row.description.clone();
                    existing.price_cents = row.price_cents;
                    if row.category.is_some() {
                        existing.category = row.category.clone();
                    }
                    if row.reporting_category.is_some() {
                        existing.reporting_category = row.reporting_category.clone();
                    }
                    if row.all_categories.is_some() {
                        existing.all_categories = row.all_categories.clone();
                    }
                    existing.square_image_id = row.square_image_id.clone();
                    existing.stock_count = row.stock_count.max(0);
                    existing.updated_at = row.updated_at;
                    existing.synced_at = Some(row.synced_at);
                    counts.updated_count += 1;
                }
                None => {
                    snap.products.insert(
                        row.square_variation_id.clone(),
                        ProductRow {
                            square_variation_id: row.square_variation_id.clone(),
                            square_item_id: row.square_item_id.clone(),
                            name: row.name.clone(),
                            variation_name: row.variation_name.clone(),
                            description: row.description.clone(),
                            price_cents: row.price_cents,
                            category: row.category.clone(),
                            reporting_category: row.reporting_category.clone(),
                            all_categories: row.all_categories.clone(),
                            square_image_id: row.square_image_id.clone(),
                            image_url: None,
                            stock_count: row.stock_count.max(0),
                            updated_at: row.updated_at,
                            created_at: row.created_at,
                            synced_at: Some(row.synced_at),
                        },
                    );
                    counts.inserted_count += 1;
                }
            }
            counts.total_upserted += 1;
        }
        Ok(counts)
    }

    async fn upsert_categories(&mut self, rows: &[CategoryRow]) -> Result<u64, StoreError> {
        self.check(StoreOp::UpsertCategories)?;
        let snap = self.working()?;
        for row in rows {
            snap.categories
                .insert(row.square_category_id.clone(), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn insert_sync_run(&mut self, counts: &UpsertCounts) -> Result<(), StoreError> {
        self.check(StoreOp::InsertSyncRun)?;
        self.working()?.runs.push(*counts);
        Ok(())
    }

    async fn recent_variation_ids(&mut self, limit: i64) -> Result<Vec<String>, StoreError> {
        self.check(StoreOp::RecentVariationIds)?;
        let snap = self.working()?;
        let mut rows: Vec<&ProductRow> = snap.products.values().collect();
        rows.sort_by(|a, b| b.synced_at.cmp(&a.synced_at));
        Ok(rows
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|r| r.square_variation_id.clone())
            .collect())
    }

    async fn apply_inventory(&mut self, updates: &[InventoryUpdate]) -> Result<u64, StoreError> {
        self.check(StoreOp::ApplyInventory)?;
        let snap = self.working()?;
        let now = Utc::now();
        let mut touched = 0;
        for update in updates {
            if let Some(row) = snap.products.get_mut(&update.square_variation_id) {
                row.stock_count = update.quantity.max(0);
                row.updated_at = update.updated_at.or(row.updated_at);
                row.synced_at = Some(now);
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn apply_images(&mut self, images: &[ImageUrl]) -> Result<u64, StoreError> {
        self.check(StoreOp::ApplyImages)?;
        let snap = self.working()?;
        let urls: HashMap<&str, &str> = images
            .iter()
            .map(|i| (i.image_id.as_str(), i.url.as_str()))
            .collect();
        let now = Utc::now();
        let mut touched = 0;
        for row in snap.products.values_mut() {
            let Some(url) = row.square_image_id.as_deref().and_then(|id| urls.get(id)) else {
                continue;
            };
            row.image_url = Some(url.to_string());
            row.synced_at = Some(now);
            touched += 1;
        }
        Ok(touched)
    }

    async fn denormalize_by_reporting_category(&mut self) -> Result<u64, StoreError> {
        self.denormalize(StoreOp::DenormalizeByReportingCategory, true)
    }

    async fn denormalize_by_category(&mut self) -> Result<u64, StoreError> {
        self.denormalize(StoreOp::DenormalizeByCategory, false)
    }
}
