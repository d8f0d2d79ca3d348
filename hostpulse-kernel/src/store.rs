//! Metric persistence on SQLite.
//!
//! Two tables:
//! - `hosts`: one row per hostname with the descriptive platform fields
//! - `metrics`: one row per sample, disk and network kept as JSON text,
//!   `time` as Unix nanoseconds
//!
//! [`MetricStore::save`] writes both in a single transaction. The transaction
//! rolls back when dropped, so any early return leaves nothing behind.

use crate::error::StoreError;
use async_trait::async_trait;
use hostpulse_bus::{MetricMessage, MetricSink, SinkError, ValidationError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Ids assigned by a successful [`MetricStore::save`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedMetric {
    pub host_id: i64,
    pub metric_id: i64,
}

/// Pooled handle to the metric database, cheap to clone
#[derive(Clone)]
pub struct MetricStore {
    pool: SqlitePool,
}

impl MetricStore {
    /// Open (or create) the database file and bootstrap the schema
    #[instrument(skip(db_path))]
    pub async fn connect(db_path: impl AsRef<Path>, max_connections: u32) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Opening metric store at {:?}", db_path);

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::Setup(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database, mostly for tests
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // every connection to :memory: would see its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the schema if it does not exist yet. Safe to run repeatedly.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)")
            .execute(&self.pool)
            .await?;

        let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&self.pool)
            .await?;
        let current = current.unwrap_or(0);
        if current >= SCHEMA_VERSION {
            debug!("Metric schema is up to date (version {})", current);
            return Ok(());
        }

        info!("Migrating metric schema from version {} to {}", current, SCHEMA_VERSION);
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hosts (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                hostname     TEXT NOT NULL UNIQUE,
                os           TEXT NOT NULL,
                platform     TEXT NOT NULL,
                platform_ver TEXT NOT NULL,
                kernel_ver   TEXT NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                host_id INTEGER NOT NULL REFERENCES hosts(id),
                uptime  INTEGER NOT NULL,
                cpu     REAL NOT NULL,
                ram     REAL NOT NULL,
                disk    TEXT NOT NULL,
                network TEXT NOT NULL,
                time    INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_metrics_host_time ON metrics(host_id, time)")
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT OR REPLACE INTO schema_version (version) VALUES (?)")
            .bind(SCHEMA_VERSION)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Upsert the host and insert the metric in one transaction
    #[instrument(skip(self, message), fields(hostname = %message.hostname()))]
    pub async fn save(&self, message: &MetricMessage) -> Result<SavedMetric> {
        message.validate()?;

        let metric = &message.metric;
        let disk = serde_json::to_string(&metric.disk)?;
        let network = serde_json::to_string(&metric.network)?;
        let uptime = i64::try_from(metric.uptime).map_err(|_| StoreError::OutOfRange("uptime"))?;
        let time = metric
            .time
            .timestamp_nanos_opt()
            .ok_or(ValidationError::UnrepresentableTime(metric.time))?;

        let mut tx = self.pool.begin().await?;
        let host_id = upsert_host(&mut tx, message).await?;

        let metric_id = sqlx::query(
            r#"
            INSERT INTO metrics (host_id, uptime, cpu, ram, disk, network, time)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(host_id)
        .bind(uptime)
        .bind(metric.cpu)
        .bind(metric.ram)
        .bind(disk)
        .bind(network)
        .bind(time)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;
        debug!(host_id, metric_id, "metric committed");
        Ok(SavedMetric { host_id, metric_id })
    }

    /// Round-trip a trivial query
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Insert the host, or update its descriptive fields only when they changed
async fn upsert_host(tx: &mut Transaction<'_, Sqlite>, message: &MetricMessage) -> Result<i64> {
    let host = &message.host;
    let existing = sqlx::query(
        "SELECT id, os, platform, platform_ver, kernel_ver FROM hosts WHERE hostname = ?",
    )
    .bind(&host.hostname)
    .fetch_optional(&mut **tx)
    .await?;

    let Some(row) = existing else {
        let id = sqlx::query(
            r#"
            INSERT INTO hosts (hostname, os, platform, platform_ver, kernel_ver)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&host.hostname)
        .bind(&host.os)
        .bind(&host.platform)
        .bind(&host.platform_ver)
        .bind(&host.kernel_ver)
        .execute(&mut **tx)
        .await?
        .last_insert_rowid();
        info!(host_id = id, "registered new host");
        return Ok(id);
    };

    let id: i64 = row.try_get("id")?;
    let unchanged = row.try_get::<String, _>("os")? == host.os
        && row.try_get::<String, _>("platform")? == host.platform
        && row.try_get::<String, _>("platform_ver")? == host.platform_ver
        && row.try_get::<String, _>("kernel_ver")? == host.kernel_ver;

    if !unchanged {
        sqlx::query(
            "UPDATE hosts SET os = ?, platform = ?, platform_ver = ?, kernel_ver = ? WHERE id = ?",
        )
        .bind(&host.os)
        .bind(&host.platform)
        .bind(&host.platform_ver)
        .bind(&host.kernel_ver)
        .bind(id)
        .execute(&mut **tx)
        .await?;
        info!(host_id = id, "updated host platform fields");
    }
    Ok(id)
}

#[async_trait]
impl MetricSink for MetricStore {
    async fn save(&self, message: &MetricMessage) -> std::result::Result<(), SinkError> {
        MetricStore::save(self, message)
            .await
            .map(|_| ())
            .map_err(SinkError::from)
    }
}
