use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgQueryResult};
use sqlx::types::Json;
use sqlx::{Connection, Postgres, Transaction};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::model::{CategoryRow, ImageUrl, InventoryUpdate, ProductRow, ProductUpsert, UpsertCounts};
use super::CatalogStore;
use crate::config::Tables;
use crate::error::StoreError;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(20);

/// SQL rendered once per run with the configured (validated) table names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statements {
    pub upsert_products: String,
    pub upsert_categories: String,
    pub insert_run: String,
    pub recent_variation_ids: String,
    pub update_inventory: String,
    pub update_images: String,
    pub denormalize_reporting: String,
    pub denormalize_category: String,
    pub select_product: String,
}

impl Statements {
    pub fn render(tables: &Tables) -> Self {
        let products = tables.products.as_str();
        let categories = tables.categories.as_str();
        let runs = tables.sync_runs.as_str();

        let upsert_products = format!(
            r#"
WITH payload AS (
  SELECT *
  FROM jsonb_to_recordset($1::jsonb) AS r(
    square_variation_id text,
    square_item_id      text,
    name                text,
    variation_name      text,
    description         text,
    price_cents         bigint,
    category            text,
    reporting_category  text,
    all_categories      text[],
    square_image_id     text,
    stock_count         integer,
    updated_at          timestamptz,
    created_at          timestamptz,
    synced_at           timestamptz
  )
),
upsert AS (
  INSERT INTO {products} (
    square_variation_id, square_item_id, name, variation_name, description,
    price_cents, category, reporting_category, all_categories, square_image_id,
    stock_count, updated_at, created_at, synced_at
  )
  SELECT
    square_variation_id, square_item_id, name, variation_name, description,
    price_cents, category, reporting_category, all_categories, square_image_id,
    GREATEST(COALESCE(stock_count, 0), 0), updated_at, created_at, synced_at
  FROM payload
  WHERE square_variation_id IS NOT NULL
  ON CONFLICT (square_variation_id) DO UPDATE
  SET
    square_item_id     = EXCLUDED.square_item_id,
    name               = EXCLUDED.name,
    variation_name     = EXCLUDED.variation_name,
    description        = EXCLUDED.description,
    price_cents        = EXCLUDED.price_cents,
    category           = COALESCE(EXCLUDED.category, {products}.category),
    reporting_category = COALESCE(EXCLUDED.reporting_category, {products}.reporting_category),
    all_categories     = COALESCE(EXCLUDED.all_categories, {products}.all_categories),
    square_image_id    = EXCLUDED.square_image_id,
    stock_count        = EXCLUDED.stock_count,
    updated_at         = EXCLUDED.updated_at,
    synced_at          = EXCLUDED.synced_at
  RETURNING (xmax = 0) AS inserted
)
SELECT
  count(*) FILTER (WHERE inserted)     AS inserted_count,
  count(*) FILTER (WHERE NOT inserted) AS updated_count,
  count(*)                             AS total_upserted
FROM upsert"#
        );

        let upsert_categories = format!(
            r#"
INSERT INTO {categories} (
  square_category_id, name, parent_square_category_id, is_deleted,
  square_created_at, square_updated_at, synced_at
)
SELECT
  square_category_id, name, parent_square_category_id, COALESCE(is_deleted, false),
  square_created_at, square_updated_at, synced_at
FROM jsonb_to_recordset($1::jsonb) AS r(
  square_category_id        text,
  name                      text,
  parent_square_category_id text,
  is_deleted                boolean,
  square_created_at         timestamptz,
  square_updated_at         timestamptz,
  synced_at                 timestamptz
)
WHERE square_category_id IS NOT NULL
ON CONFLICT (square_category_id) DO UPDATE
SET
  name                      = EXCLUDED.name,
  parent_square_category_id = EXCLUDED.parent_square_category_id,
  is_deleted                = EXCLUDED.is_deleted,
  square_created_at         = EXCLUDED.square_created_at,
  square_updated_at         = EXCLUDED.square_updated_at,
  synced_at                 = EXCLUDED.synced_at"#
        );

        let insert_run = format!(
            "INSERT INTO {runs} (inserted_count, updated_count, total_upserted) VALUES ($1, $2, $3)"
        );

        let recent_variation_ids = format!(
            r#"
SELECT square_variation_id
FROM {products}
WHERE square_variation_id IS NOT NULL
ORDER BY synced_at DESC NULLS LAST
LIMIT $1"#
        );

        let update_inventory = format!(
            r#"
UPDATE {products} p
SET
  stock_count = GREATEST(ic.quantity, 0),
  updated_at  = COALESCE(ic.updated_at, p.updated_at),
  synced_at   = now()
FROM jsonb_to_recordset($1::jsonb) AS ic(
  square_variation_id text,
  quantity            integer,
  updated_at          timestamptz
)
WHERE p.square_variation_id = ic.square_variation_id"#
        );

        let update_images = format!(
            r#"
UPDATE {products} p
SET
  image_url = im.url,
  synced_at = now()
FROM jsonb_to_recordset($1::jsonb) AS im(image_id text, url text)
WHERE p.square_image_id = im.image_id"#
        );

        let denormalize = |lookup_column: &str| {
            format!(
                r#"
UPDATE {products} p
SET
  category = COALESCE(
    (SELECT c.name FROM {categories} c WHERE c.square_category_id = p.{lookup_column} LIMIT 1),
    p.category
  ),
  all_categories = COALESCE(
    (
      SELECT array_agg(c.name) FILTER (WHERE c.name IS NOT NULL)
      FROM {categories} c
      WHERE c.square_category_id = ANY(p.all_categories)
    ),
    p.all_categories
  )
WHERE p.all_categories IS NOT NULL"#
            )
        };

        let select_product = format!(
            r#"
SELECT
  square_variation_id, square_item_id, name, variation_name, description,
  price_cents, category, reporting_category, all_categories, square_image_id,
  image_url, stock_count, updated_at, created_at, synced_at
FROM {products}
WHERE square_variation_id = $1"#
        );

        Self {
            upsert_products,
            upsert_categories,
            insert_run,
            recent_variation_ids,
            update_inventory,
            update_images,
            denormalize_reporting: denormalize("reporting_category"),
            denormalize_category: denormalize("category"),
            select_product,
        }
    }
}

/// PostgreSQL store on a single-connection pool.
pub struct PgStore {
    options: PgConnectOptions,
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
    sql: Statements,
}

impl fmt::Debug for PgStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgStore")
            .field("pool_size", &self.pool.size())
            .field("in_transaction", &self.tx.is_some())
            .finish_non_exhaustive()
    }
}

async fn open_pool(options: &PgConnectOptions) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options.clone())
        .await
        .map_err(|e| StoreError::classify("connect", e))
}

fn open_tx<'a>(
    tx: &'a mut Option<Transaction<'static, Postgres>>,
) -> Result<&'a mut Transaction<'static, Postgres>, StoreError> {
    tx.as_mut().ok_or_else(|| StoreError::Persistent {
        context: "no open transaction".into(),
        source: sqlx::Error::Protocol("statement issued outside a transaction".into()),
    })
}

/// Release the savepoint on success, roll back to it on failure.
async fn finish_savepoint(
    sp: Transaction<'_, Postgres>,
    context: &str,
    result: Result<PgQueryResult, sqlx::Error>,
) -> Result<u64, StoreError> {
    match result {
        Ok(done) => {
            sp.commit()
                .await
                .map_err(|e| StoreError::classify(context, e))?;
            Ok(done.rows_affected())
        }
        Err(err) => {
            if let Err(rb) = sp.rollback().await {
                debug!(context, error = %rb, "rollback to savepoint failed");
            }
            Err(StoreError::classify(context, err))
        }
    }
}

impl PgStore {
    pub async fn connect(options: PgConnectOptions, tables: &Tables) -> Result<Self, StoreError> {
        let pool = open_pool(&options).await?;
        Ok(Self {
            options,
            pool,
            tx: None,
            sql: Statements::render(tables),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::classify("run migrations", e.into()))
    }

    /// Read one committed product row outside any transaction.
    pub async fn fetch_product(&self, variation_id: &str) -> Result<Option<ProductRow>, StoreError> {
        sqlx::query_as::<_, ProductRow>(&self.sql.select_product)
            .bind(variation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::classify("fetch product", e))
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn begin(&mut self) -> Result<(), StoreError> {
        if self.tx.is_some() {
            return Err(StoreError::Persistent {
                context: "begin".into(),
                source: sqlx::Error::Protocol("transaction already open".into()),
            });
        }
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::classify("begin", e))?;
        self.tx = Some(tx);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or_else(|| StoreError::Persistent {
            context: "commit".into(),
            source: sqlx::Error::Protocol("no open transaction".into()),
        })?;
        tx.commit()
            .await
            .map_err(|e| StoreError::classify("commit", e))
    }

    async fn rollback(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(err) = tx.rollback().await {
                debug!(error = %err, "rollback failed; connection likely gone");
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), StoreError> {
        self.tx = None;
        self.pool.close().await;
        self.pool = open_pool(&self.options).await?;
        info!("database connection re-established");
        Ok(())
    }

    #[instrument(skip_all, fields(rows = rows.len()))]
    async fn upsert_products(&mut self, rows: &[ProductUpsert]) -> Result<UpsertCounts, StoreError> {
        if rows.is_empty() {
            return Ok(UpsertCounts::default());
        }
        let tx = open_tx(&mut self.tx)?;
        let (inserted, updated, total): (i64, i64, i64) = sqlx::query_as(&self.sql.upsert_products)
            .bind(Json(rows))
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| StoreError::classify("upsert products", e))?;
        Ok(UpsertCounts {
            inserted_count: inserted.max(0) as u64,
            updated_count: updated.max(0) as u64,
            total_upserted: total.max(0) as u64,
        })
    }

    #[instrument(skip_all, fields(rows = rows.len()))]
    async fn upsert_categories(&mut self, rows: &[CategoryRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let tx = open_tx(&mut self.tx)?;
        let done = sqlx::query(&self.sql.upsert_categories)
            .bind(Json(rows))
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::classify("upsert categories", e))?;
        Ok(done.rows_affected())
    }

    #[instrument(skip_all)]
    async fn insert_sync_run(&mut self, counts: &UpsertCounts) -> Result<(), StoreError> {
        let tx = open_tx(&mut self.tx)?;
        let mut sp = Connection::begin(&mut **tx)
            .await
            .map_err(|e| StoreError::classify("savepoint", e))?;
        let result = sqlx::query(&self.sql.insert_run)
            .bind(counts.inserted_count as i64)
            .bind(counts.updated_count as i64)
            .bind(counts.total_upserted as i64)
            .execute(&mut *sp)
            .await;
        finish_savepoint(sp, "insert sync run", result).await.map(|_| ())
    }

    #[instrument(skip_all)]
    async fn recent_variation_ids(&mut self, limit: i64) -> Result<Vec<String>, StoreError> {
        let tx = open_tx(&mut self.tx)?;
        sqlx::query_scalar::<_, String>(&self.sql.recent_variation_ids)
            .bind(limit)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| StoreError::classify("select recent variation ids", e))
    }

    #[instrument(skip_all, fields(rows = updates.len()))]
    async fn apply_inventory(&mut self, updates: &[InventoryUpdate]) -> Result<u64, StoreError> {
        if updates.is_empty() {
            return Ok(0);
        }
        let tx = open_tx(&mut self.tx)?;
        let done = sqlx::query(&self.sql.update_inventory)
            .bind(Json(updates))
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::classify("update inventory", e))?;
        Ok(done.rows_affected())
    }

    #[instrument(skip_all, fields(rows = images.len()))]
    async fn apply_images(&mut self, images: &[ImageUrl]) -> Result<u64, StoreError> {
        if images.is_empty() {
            return Ok(0);
        }
        let tx = open_tx(&mut self.tx)?;
        let done = sqlx::query(&self.sql.update_images)
            .bind(Json(images))
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::classify("update images", e))?;
        Ok(done.rows_affected())
    }

    #[instrument(skip_all)]
    async fn denormalize_by_reporting_category(&mut self) -> Result<u64, StoreError> {
        let tx = open_tx(&mut self.tx)?;
        let mut sp = Connection::begin(&mut **tx)
            .await
            .map_err(|e| StoreError::classify("savepoint", e))?;
        let result = sqlx::query(&self.sql.denormalize_reporting)
            .execute(&mut *sp)
            .await;
        finish_savepoint(sp, "denormalize categories by reporting category", result).await
    }

    #[instrument(skip_all)]
    async fn denormalize_by_category(&mut self) -> Result<u64, StoreError> {
        let tx = open_tx(&mut self.tx)?;
        let mut sp = Connection::begin(&mut **tx)
            .await
            .map_err(|e| StoreError::classify("savepoint", e))?;
        let result = sqlx::query(&self.sql.denormalize_category)
            .execute(&mut *sp)
            .await;
        finish_savepoint(sp, "denormalize categories by category id", result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Ident;

    fn tables() -> Tables {
        Tables {
            products: Ident::parse("shop_products").unwrap(),
            categories: Ident::parse("shop_categories").unwrap(),
            sync_runs: Ident::parse("shop_runs").unwrap(),
        }
    }

    #[test]
    fn statements_use_configured_tables() {
        let sql = Statements::render(&tables());
        assert!(sql.upsert_products.contains("INSERT INTO shop_products ("));
        assert!(sql
            .upsert_products
            .contains("COALESCE(EXCLUDED.category, shop_products.category)"));
        assert!(sql.upsert_categories.contains("INSERT INTO shop_categories ("));
        assert!(sql.insert_run.starts_with("INSERT INTO shop_runs "));
        assert!(sql.denormalize_reporting.contains("FROM shop_categories c"));
        for stmt in [
            &sql.upsert_products,
            &sql.upsert_categories,
            &sql.recent_variation_ids,
            &sql.update_inventory,
            &sql.update_images,
            &sql.denormalize_reporting,
            &sql.denormalize_category,
        ] {
            assert!(!stmt.contains("products}"), "unrendered placeholder in {stmt}");
            assert!(!stmt.contains("{categories"), "unrendered placeholder in {stmt}");
        }
    }

    #[test]
    fn upsert_reports_insert_versus_update() {
        let sql = Statements::render(&Tables::default());
        assert!(sql.upsert_products.contains("RETURNING (xmax = 0) AS inserted"));
        assert!(sql.upsert_products.contains("jsonb_to_recordset($1::jsonb)"));
        // created_at is only written by the INSERT branch
        let update_clause = sql.upsert_products.split("DO UPDATE").nth(1).unwrap();
        assert!(!update_clause.contains("created_at"));
    }

    #[test]
    fn denormalization_strategies_differ_only_in_lookup_column() {
        let sql = Statements::render(&Tables::default());
        assert!(sql
            .denormalize_reporting
            .contains("c.square_category_id = p.reporting_category"));
        assert!(sql
            .denormalize_category
            .contains("c.square_category_id = p.category LIMIT 1"));
        assert_eq!(
            sql.denormalize_reporting
                .replace("p.reporting_category", "p.category"),
            sql.denormalize_category
        );
    }
}
