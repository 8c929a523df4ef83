//! Sync orchestrator: daily reset, page loop, batch apply with retry, and
//! cursor persistence.
//!
//! The cursor is written only after the batch that reached it has committed,
//! so a crash anywhere replays at most one batch and never skips a page.

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cache::CacheRebuildReport;
use crate::engine::{self, BatchOutcome};
use crate::error::SyncError;
use crate::model::CatalogObject;
use crate::square::CatalogSource;
use crate::state::{StateStore, SyncState};
use crate::store::{CatalogStore, UpsertCounts};

/// Attempts per batch when the database connection keeps failing.
pub const MAX_STORE_ATTEMPTS: u32 = 4;

/// Sleep before replaying a batch: 0.5s, 1s, 2s.
pub fn store_retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(500u64.saturating_mul(1u64 << attempt.saturating_sub(1).min(16)))
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub max_pages: u32,
    pub batch_pages: u32,
    pub location_id: String,
}

impl SyncOptions {
    pub fn new(max_pages: u32, batch_pages: u32, location_id: impl Into<String>) -> Self {
        Self {
            max_pages: max_pages.max(1),
            batch_pages: batch_pages.max(1),
            location_id: location_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Incremental,
    SingleItem,
}

/// Totals for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub mode: Mode,
    pub daily_reset: bool,
    pub pages_fetched: u32,
    pub cursor_saved: bool,
    pub categories_processed: u64,
    pub products: UpsertCounts,
    pub inventory_rows_updated: u64,
    pub image_rows_updated: u64,
    pub category_denorm_attempted: bool,
    pub dry_run: bool,
    pub item_id: Option<String>,
}

impl SyncReport {
    fn absorb(&mut self, outcome: &BatchOutcome) {
        self.products.add(&outcome.products);
        self.inventory_rows_updated += outcome.inventory_rows_updated;
        self.image_rows_updated += outcome.image_rows_updated;
        self.category_denorm_attempted |= outcome.category_denorm_ran;
    }
}

/// The JSON document printed at the end of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub report: SyncReport,
    pub albums_cache_rebuild: Option<CacheRebuildReport>,
    pub state_path: Option<String>,
    pub square_version: String,
    pub square_location_id: String,
    pub products_table: String,
}

impl RunSummary {
    /// Pretty JSON with keys sorted.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    CategorySync,
    PageFetchLoop,
    BatchApply,
    CursorPersist,
    Done,
    Error,
}

/// State loaded for an incremental run, after the daily reset.
#[derive(Debug, Clone)]
pub struct PreparedState {
    pub state: SyncState,
    pub daily_reset: bool,
}

/// Load the state and apply the daily reset. A reset is saved at once, in its
/// own write, so it survives even if the rest of the run fails. Call this
/// before any network or database activity.
pub async fn prepare_state<T>(
    store: &T,
    today: NaiveDate,
    dry_run: bool,
) -> Result<PreparedState, SyncError>
where
    T: StateStore + ?Sized,
{
    let mut state = store.load().await?;
    let daily_reset = state.apply_daily_reset(today);
    if daily_reset {
        if !dry_run {
            store.save(&state).await?;
        }
        info!(%today, "daily reset: catalog cursor cleared");
    }
    Ok(PreparedState { state, daily_reset })
}

/// Objects gathered for one batch and where the source left off.
#[derive(Debug, Default)]
struct FetchedBatch {
    objects: Vec<CatalogObject>,
    related: Vec<CatalogObject>,
    pages: u32,
    cursor: Option<String>,
}

enum BatchRequest<'r> {
    /// Up to `pages` search pages starting at the cursor.
    Pages { start: Option<&'r str>, pages: u32 },
    Object(&'r str),
}

/// Drives one run. Without a store the run is dry: pages are fetched and
/// counted but nothing is written to the database or the state file.
pub struct Syncer<'a, C: ?Sized, S: ?Sized> {
    source: &'a C,
    store: Option<&'a mut S>,
    options: SyncOptions,
    phase: Phase,
    needs_reconnect: bool,
    report: SyncReport,
}

impl<'a, C, S> Syncer<'a, C, S>
where
    C: CatalogSource + ?Sized,
    S: CatalogStore + ?Sized,
{
    pub fn new(source: &'a C, store: Option<&'a mut S>, options: SyncOptions) -> Self {
        let report = SyncReport {
            dry_run: store.is_none(),
            ..SyncReport::default()
        };
        Self {
            source,
            store,
            options,
            phase: Phase::Idle,
            needs_reconnect: false,
            report,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Progress so far; after a failure this is what was committed.
    pub fn report(&self) -> &SyncReport {
        &self.report
    }

    fn dry_run(&self) -> bool {
        self.store.is_none()
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "sync phase");
            self.phase = phase;
        }
    }

    /// Incremental run resuming from the cursor in `prepared`.
    pub async fn run<T>(&mut self, state: &T, prepared: PreparedState) -> Result<SyncReport, SyncError>
    where
        T: StateStore + ?Sized,
    {
        self.report.daily_reset = prepared.daily_reset;
        let result = self.run_incremental(state, prepared.state).await;
        self.finish(result).await
    }

    /// Sync exactly one item by id. Never reads or writes the state store.
    pub async fn run_single_item(&mut self, item_id: &str) -> Result<SyncReport, SyncError> {
        self.report.mode = Mode::SingleItem;
        self.report.item_id = Some(item_id.to_string());
        let result = self.single_item(item_id).await;
        self.finish(result).await
    }

    async fn finish(&mut self, result: Result<(), SyncError>) -> Result<SyncReport, SyncError> {
        match result {
            Ok(()) => {
                self.enter(Phase::Done);
                info!(
                    pages = self.report.pages_fetched,
                    inserted = self.report.products.inserted_count,
                    updated = self.report.products.updated_count,
                    "sync finished"
                );
                Ok(self.report.clone())
            }
            Err(err) => {
                if let Some(store) = self.store.as_deref_mut() {
                    store.rollback().await;
                }
                self.enter(Phase::Error);
                error!(stage = err.stage(), error = %err, pages = self.report.pages_fetched, "sync failed");
                Err(err)
            }
        }
    }

    async fn run_incremental<T>(&mut self, state_store: &T, mut state: SyncState) -> Result<(), SyncError>
    where
        T: StateStore + ?Sized,
    {
        let mut cursor = state.cursor().map(str::to_string);
        info!(cursor = ?cursor, state = %state_store.describe(), "starting incremental sync");

        self.report.categories_processed = self.sync_categories().await;

        while self.report.pages_fetched < self.options.max_pages {
            let remaining = self.options.max_pages - self.report.pages_fetched;
            let request = BatchRequest::Pages {
                start: cursor.as_deref(),
                pages: remaining.min(self.options.batch_pages),
            };
            let (batch, outcome) = self.apply_with_retry(request).await?;

            self.report.pages_fetched += batch.pages;
            self.report.absorb(&outcome);
            cursor = batch.cursor;

            self.enter(Phase::CursorPersist);
            if !self.dry_run() {
                state.set_cursor(cursor.as_deref());
                state_store.save(&state).await?;
            }
            self.report.cursor_saved = cursor.is_some() && !self.dry_run();
            info!(
                pages = self.report.pages_fetched,
                batch_pages = batch.pages,
                inserted = outcome.products.inserted_count,
                updated = outcome.products.updated_count,
                more = cursor.is_some(),
                "batch committed"
            );

            if cursor.is_none() {
                break;
            }
        }
        Ok(())
    }

    async fn single_item(&mut self, item_id: &str) -> Result<(), SyncError> {
        self.report.categories_processed = self.sync_categories().await;
        let (batch, outcome) = self.apply_with_retry(BatchRequest::Object(item_id)).await?;
        if batch.objects.is_empty() {
            warn!(item_id, "item not found in catalog");
        }
        self.report.pages_fetched = batch.pages;
        self.report.absorb(&outcome);
        Ok(())
    }

    /// Fetch and apply one batch. A transient database failure rolls back,
    /// reconnects, and replays the batch from its starting point.
    async fn apply_with_retry(
        &mut self,
        request: BatchRequest<'_>,
    ) -> Result<(FetchedBatch, BatchOutcome), SyncError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.enter(Phase::PageFetchLoop);
            let batch = self.fetch(&request).await?;
            if batch.pages == 0 {
                return Ok((batch, BatchOutcome::default()));
            }

            self.enter(Phase::BatchApply);
            match self.apply_once(&batch).await {
                Ok(outcome) => return Ok((batch, outcome)),
                Err(err) if err.is_transient_store() && attempt < MAX_STORE_ATTEMPTS => {
                    let delay = store_retry_delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient database error; replaying batch"
                    );
                    if let Some(store) = self.store.as_deref_mut() {
                        store.rollback().await;
                    }
                    self.needs_reconnect = true;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fetch(&self, request: &BatchRequest<'_>) -> Result<FetchedBatch, SyncError> {
        let mut batch = FetchedBatch::default();
        match *request {
            BatchRequest::Object(id) => {
                let page = self.source.retrieve_object(id).await?;
                batch.objects = page.objects;
                batch.related = page.related_objects;
                batch.pages = 1;
            }
            BatchRequest::Pages { start, pages } => {
                let mut cursor = start.map(str::to_string);
                while batch.pages < pages {
                    let page = self.source.search_items(cursor.as_deref()).await?;
                    if page.is_terminal_empty() {
                        cursor = None;
                        break;
                    }
                    batch.pages += 1;
                    batch.objects.extend(page.objects);
                    batch.related.extend(page.related_objects);
                    cursor = page.cursor;
                    if cursor.is_none() {
                        break;
                    }
                }
                batch.cursor = cursor;
            }
        }
        debug!(
            pages = batch.pages,
            objects = batch.objects.len(),
            related = batch.related.len(),
            "fetched batch"
        );
        Ok(batch)
    }

    async fn ensure_connected(&mut self) -> Result<(), SyncError> {
        if !self.needs_reconnect {
            return Ok(());
        }
        if let Some(store) = self.store.as_deref_mut() {
            store.reconnect().await?;
        }
        self.needs_reconnect = false;
        Ok(())
    }

    async fn apply_once(&mut self, batch: &FetchedBatch) -> Result<BatchOutcome, SyncError> {
        if self.dry_run() {
            return Ok(BatchOutcome::default());
        }
        self.ensure_connected().await?;
        let source = self.source;
        let location_id = self.options.location_id.as_str();
        let Some(store) = self.store.as_deref_mut() else {
            return Ok(BatchOutcome::default());
        };
        store.begin().await?;
        let outcome = engine::apply_batch(
            store,
            source,
            location_id,
            &batch.objects,
            &batch.related,
            Utc::now(),
        )
        .await?;
        store.commit().await?;
        Ok(outcome)
    }

    /// Mirror every category, one committed transaction per page. Failures
    /// are logged and reported as zero processed.
    async fn sync_categories(&mut self) -> u64 {
        if self.dry_run() {
            return 0;
        }
        self.enter(Phase::CategorySync);
        match self.try_sync_categories().await {
            Ok(processed) => {
                info!(processed, "categories synced");
                processed
            }
            Err(err) => {
                warn!(error = %err, "category sync failed; continuing without it");
                if let Some(store) = self.store.as_deref_mut() {
                    store.rollback().await;
                }
                if err.is_transient_store() {
                    self.needs_reconnect = true;
                }
                0
            }
        }
    }

    async fn try_sync_categories(&mut self) -> Result<u64, SyncError> {
        let mut cursor: Option<String> = None;
        let mut processed = 0u64;
        loop {
            let page = self.source.list_categories(cursor.as_deref()).await?;
            let rows = engine::category_rows(&page.objects, Utc::now());
            if !rows.is_empty() {
                self.ensure_connected().await?;
                if let Some(store) = self.store.as_deref_mut() {
                    store.begin().await?;
                    store.upsert_categories(&rows).await?;
                    store.commit().await?;
                }
                processed += rows.len() as u64;
            }
            cursor = page.cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_backoff_doubles() {
        assert_eq!(store_retry_delay(1), Duration::from_millis(500));
        assert_eq!(store_retry_delay(2), Duration::from_secs(1));
        assert_eq!(store_retry_delay(3), Duration::from_secs(2));
    }

    #[test]
    fn options_clamp_to_one_page() {
        let opts = SyncOptions::new(0, 0, "LOC");
        assert_eq!(opts.max_pages, 1);
        assert_eq!(opts.batch_pages, 1);
    }

    #[test]
    fn summary_keys_are_sorted_and_flat() {
        let summary = RunSummary {
            report: SyncReport {
                pages_fetched: 2,
                ..SyncReport::default()
            },
            albums_cache_rebuild: None,
            state_path: Some("state.json".into()),
            square_version: "2025-10-16".into(),
            square_location_id: "LOC".into(),
            products_table: "products".into(),
        };
        let json = summary.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["pages_fetched"], 2);
        assert_eq!(value["mode"], "incremental");
        assert_eq!(value["products"]["total_upserted"], 0);
        assert!(value["albums_cache_rebuild"].is_null());
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
