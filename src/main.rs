use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use catalog_sync::alert::{compute_alert_code, Alert, AlertNotifier, Severity};
use catalog_sync::cache::CacheRebuilder;
use catalog_sync::config::{self, Config};
use catalog_sync::error::SyncError;
use catalog_sync::square::SquareClient;
use catalog_sync::state::{JsonStateFile, StateStore};
use catalog_sync::store::PgStore;
use catalog_sync::sync::{self, PreparedState, RunSummary, SyncOptions, Syncer};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Incrementally mirror the Square catalog into PostgreSQL"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Where the daily-reset date and catalog cursor are kept
    #[arg(long, default_value = "scripts/catalog_sync_state.json")]
    state_path: PathBuf,

    /// Fetch pages but write nothing to Postgres or the state file
    #[arg(long)]
    dry_run: bool,

    /// Catalog pages to fetch this run (minimum 1)
    #[arg(long, default_value_t = 1)]
    max_pages: u32,

    /// Pages combined into one database transaction (minimum 1)
    #[arg(long, default_value_t = 1)]
    upsert_batch_pages: u32,

    /// Sync a single ITEM by id without touching cursor state
    #[arg(long)]
    item_id: Option<String>,

    /// Rebuild the albums cache after a successful sync
    #[arg(long)]
    rebuild_albums_cache: bool,

    /// HTTP timeout in seconds (minimum 5)
    #[arg(long, default_value_t = 30)]
    timeout_s: u64,
}

impl Args {
    fn item_id(&self) -> Option<&str> {
        self.item_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

enum Plan<'a> {
    Incremental(PreparedState),
    SingleItem(&'a str),
}

async fn send_alert(notifier: Option<&AlertNotifier>, alert: Alert) {
    let Some(notifier) = notifier else {
        return;
    };
    if let Err(err) = notifier.send(&alert).await {
        warn!(error = %err, code = %alert.code, "failed to deliver alert");
    }
}

fn context(pairs: Vec<(&str, Value)>) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Subsystem label for alert codes.
fn stage_of(err: &anyhow::Error) -> &'static str {
    if let Some(sync_err) = err.downcast_ref::<SyncError>() {
        return sync_err.stage();
    }
    if err.downcast_ref::<config::ConfigError>().is_some() {
        return "sync.config";
    }
    "sync.main"
}

async fn execute(
    args: &Args,
    cfg: &Config,
    notifier: Option<&AlertNotifier>,
    pages_so_far: &mut u32,
) -> Result<RunSummary> {
    let timeout = Duration::from_secs(args.timeout_s.max(5));
    let source = SquareClient::from_config(cfg, timeout).context("building Square client")?;
    let options = SyncOptions::new(
        args.max_pages,
        args.upsert_batch_pages,
        cfg.square.location_id.clone(),
    );

    let state = JsonStateFile::new(&args.state_path);
    let plan = match args.item_id() {
        Some(item_id) => Plan::SingleItem(item_id),
        None => Plan::Incremental(
            sync::prepare_state(&state, Utc::now().date_naive(), args.dry_run).await?,
        ),
    };

    let mut store = if args.dry_run {
        info!("dry run: no database or state writes");
        None
    } else {
        let connect = cfg.postgres.connect_options().map_err(SyncError::from)?;
        let store = PgStore::connect(connect, &cfg.tables)
            .await
            .map_err(SyncError::from)?;
        Some(store)
    };

    let mut syncer = Syncer::new(&source, store.as_mut(), options);
    let result = match plan {
        Plan::SingleItem(item_id) => syncer.run_single_item(item_id).await,
        Plan::Incremental(prepared) => syncer.run(&state, prepared).await,
    };
    *pages_so_far = syncer.report().pages_fetched;
    let report = result?;

    let albums_cache_rebuild = if args.rebuild_albums_cache && !args.dry_run {
        let rebuild = CacheRebuilder::from_config(&cfg.cache_rebuild).run().await;
        if rebuild.attempted && !rebuild.ok {
            let error = serde_json::to_string(&rebuild).unwrap_or_default();
            send_alert(
                notifier,
                Alert {
                    code: "SYNC-ALBUMS-CACHE".into(),
                    title: "albums_cache rebuild failed after catalog sync".into(),
                    error,
                    context: context(vec![
                        ("stage", json!("sync.albums_cache")),
                        ("pagesFetched", json!(report.pages_fetched)),
                        ("itemId", json!(args.item_id())),
                    ]),
                    stack: None,
                    severity: Severity::Warning,
                },
            )
            .await;
        }
        Some(rebuild)
    } else {
        None
    };

    Ok(RunSummary {
        state_path: args.item_id().is_none().then(|| state.describe()),
        report,
        albums_cache_rebuild,
        square_version: cfg.square.version.clone(),
        square_location_id: cfg.square.location_id.clone(),
        products_table: cfg.tables.products.to_string(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let run_id = Uuid::new_v4();

    let cfg = match config::load(Some(&args.config)) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            let alerts = config::alerts_from_env(|name| std::env::var(name).ok());
            let notifier = AlertNotifier::from_config(&alerts).ok();
            send_alert(
                notifier.as_ref(),
                Alert {
                    code: compute_alert_code("sync.config", &err.to_string()).into(),
                    title: "Catalog sync configuration invalid".into(),
                    error: err.to_string(),
                    context: context(vec![
                        ("stage", json!("sync.config")),
                        ("runId", json!(run_id.to_string())),
                        ("configPath", json!(args.config.display().to_string())),
                    ]),
                    stack: None,
                    severity: Severity::Critical,
                },
            )
            .await;
            return Err(err).context("loading configuration");
        }
    };

    let notifier = match AlertNotifier::from_config(&cfg.alerts) {
        Ok(notifier) => Some(notifier),
        Err(err) => {
            warn!(error = %err, "alerts disabled");
            None
        }
    };

    let mut pages_so_far = 0;
    let span = info_span!("sync", %run_id);
    let outcome = execute(&args, &cfg, notifier.as_ref(), &mut pages_so_far)
        .instrument(span)
        .await;

    match outcome {
        Ok(summary) => {
            println!("{}", summary.to_json()?);
            Ok(())
        }
        Err(err) => {
            let stage = stage_of(&err);
            let message = format!("{err:#}");
            error!(stage, error = %message, "catalog sync failed");
            send_alert(
                notifier.as_ref(),
                Alert {
                    code: compute_alert_code(stage, &message).into(),
                    title: "Catalog sync failed".into(),
                    error: message,
                    context: context(vec![
                        ("stage", json!(stage)),
                        ("runId", json!(run_id.to_string())),
                        ("pagesFetchedSoFar", json!(pages_so_far)),
                        ("statePath", json!(args.state_path.display().to_string())),
                        ("squareBaseUrl", json!(cfg.square.resolved_base_url().ok().map(|u| u.to_string()))),
                        ("squareLocationId", json!(cfg.square.location_id)),
                        ("squareVersion", json!(cfg.square.version)),
                        ("productsTable", json!(cfg.tables.products.as_str())),
                        ("categoriesTable", json!(cfg.tables.categories.as_str())),
                        ("itemId", json!(args.item_id())),
                        ("dryRun", json!(args.dry_run)),
                    ]),
                    stack: Some(format!("{err:?}")),
                    severity: Severity::Critical,
                },
            )
            .await;
            Err(err)
        }
    }
}
