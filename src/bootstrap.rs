use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::{
    api::AppState,
    config::Config,
    dispatch::{ExpirationMonitor, TradeDispatcher},
    error::AppResult,
    exchange::ExchangeClient,
    ledger::{LedgerStore, MemoryLedgerStore, PgLedgerStore},
    reconcile::{Reconciler, ReconcilerOptions},
    staff::Staff,
    stats::StatsAggregator,
    store::{
        BacklogStore, ExpirationStore, MemoryBacklogStore, MemoryExpirationStore,
        MemoryMessageLog, MemoryStaffStore, MessageLog, PgBacklogStore, PgExpirationStore,
        PgMessageLog, PgStaffStore, StaffStore,
    },
};

/// Staff record that receives automated settlements, so the exact
/// ledger policy has somewhere to park its marks.
pub const AUTO_MARKER_ID: &str = "auto-marker";

struct Stores {
    staff: Arc<dyn StaffStore>,
    backlog: Arc<dyn BacklogStore>,
    expirations: Arc<dyn ExpirationStore>,
    messages: Arc<dyn MessageLog>,
    ledger: Arc<dyn LedgerStore>,
}

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let stores = match &config.database_url {
        Some(url) => {
            let pool = initialize_database(url).await?;
            info!("Postgres stores initialized");
            Stores {
                staff: Arc::new(PgStaffStore::new(pool.clone())),
                backlog: Arc::new(PgBacklogStore::new(pool.clone())),
                expirations: Arc::new(PgExpirationStore::new(pool.clone())),
                messages: Arc::new(PgMessageLog::new(pool.clone())),
                ledger: Arc::new(PgLedgerStore::new(pool)),
            }
        }
        None => {
            info!("DATABASE_URL not set, running with in-memory stores");
            Stores {
                staff: Arc::new(MemoryStaffStore::new()),
                backlog: Arc::new(MemoryBacklogStore::new()),
                expirations: Arc::new(MemoryExpirationStore::new()),
                messages: Arc::new(MemoryMessageLog::new()),
                ledger: Arc::new(MemoryLedgerStore::new()),
            }
        }
    };

    let exchange = Arc::new(ExchangeClient::new(config.exchange_base_url.clone()));

    let dispatcher = Arc::new(TradeDispatcher::new(
        stores.staff.clone(),
        stores.backlog.clone(),
        stores.expirations.clone(),
        config.cas_max_retries,
    ));

    let monitor = Arc::new(ExpirationMonitor::new(
        stores.staff.clone(),
        stores.expirations.clone(),
        dispatcher.clone(),
        Duration::from_millis(config.expiration_retry_delay_ms),
        config.cas_max_retries,
    ));

    let reconciler = Arc::new(Reconciler::new(
        stores.staff.clone(),
        stores.ledger.clone(),
        stores.messages.clone(),
        dispatcher.clone(),
        exchange.clone(),
        exchange.clone(),
        config.match_mode.strategy(),
        ReconcilerOptions {
            assignment_mode: config.assignment_mode,
            overwrite_on_remark: config.overwrite_on_remark,
            chat_fetch_attempts: config.chat_fetch_attempts,
            chat_fetch_delay: Duration::from_millis(config.chat_fetch_delay_ms),
            cas_max_retries: config.cas_max_retries,
        },
    ));

    let stats = Arc::new(StatsAggregator::new(
        stores.staff.clone(),
        Duration::from_millis(config.stats_cache_ttl_ms),
    ));

    // Automated settlements need a directory entry to mark against;
    // insert is idempotent across restarts.
    stores
        .staff
        .insert(Staff::new(
            AUTO_MARKER_ID.to_string(),
            "Auto Marker".to_string(),
            "auto-marker@localhost".to_string(),
            "Automation".to_string(),
        ))
        .await?;
    info!("Auto-marker staff record ensured");

    // Re-arm expiration batches that survived a restart; overdue ones
    // fire immediately.
    let recovered = monitor.recover().await?;
    if recovered > 0 {
        info!("Recovered {} pending expiration batches", recovered);
    }

    Ok(AppState {
        staff: stores.staff,
        messages: stores.messages,
        dispatcher,
        monitor,
        reconciler,
        stats,
        sink: exchange,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| crate::error::AppError::Internal(format!("migration failed: {}", e)))?;
    info!("Database migrations applied");

    Ok(pool)
}
