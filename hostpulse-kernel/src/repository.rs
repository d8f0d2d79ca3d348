//! Read side of the metric store
//!
//! Arguments are checked in [`MetricQuery::parse`] before any SQL runs.
//! Results come back as [`MetricMessage`]s, newest first.

use crate::error::QueryError;
use chrono::{DateTime, Utc};
use hostpulse_bus::{Host, Metric, MetricMessage};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::instrument;

type Result<T> = std::result::Result<T, QueryError>;

/// Page size used when the caller passes a limit of zero or less
pub const DEFAULT_LIMIT: i64 = 10;

macro_rules! metric_select {
    () => {
        r#"
    SELECT h.id AS host_id, h.hostname, h.os, h.platform, h.platform_ver, h.kernel_ver,
           m.id AS metric_id, m.uptime, m.cpu, m.ram, m.disk, m.network, m.time
    FROM metrics m
    JOIN hosts h ON h.id = m.host_id"#
    };
}

const BASE_SELECT: &str = concat!(metric_select!(), "\n    WHERE h.hostname = ");

// same tie break as the per-host listings
const LATEST_PER_HOST: &str = concat!(
    metric_select!(),
    r#"
    WHERE m.id = (
        SELECT latest.id FROM metrics latest
        WHERE latest.host_id = m.host_id
        ORDER BY latest.time DESC, latest.id DESC
        LIMIT 1
    )
    ORDER BY h.hostname"#
);

/// Validated arguments of a paged metric listing
#[derive(Debug, Clone, PartialEq)]
pub struct MetricQuery {
    pub hostname: String,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl MetricQuery {
    /// Check and normalize raw arguments.
    ///
    /// Empty time strings mean "no bound". A limit of zero or less becomes
    /// [`DEFAULT_LIMIT`], an offset of zero or less becomes 0.
    pub fn parse(
        hostname: &str,
        from_time: Option<&str>,
        to_time: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Self> {
        Ok(Self {
            hostname: require_hostname(hostname)?,
            from: parse_bound("from_time", from_time)?,
            to: parse_bound("to_time", to_time)?,
            limit: if limit <= 0 { DEFAULT_LIMIT } else { limit },
            offset: offset.max(0),
        })
    }
}

/// Blank names are refused; anything else is matched exactly as stored
fn require_hostname(hostname: &str) -> Result<String> {
    if hostname.trim().is_empty() {
        return Err(QueryError::invalid("hostname is required"));
    }
    Ok(hostname.to_string())
}

fn parse_bound(name: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| QueryError::invalid(format!("{name} is not an RFC 3339 timestamp: {e}")))?
        .with_timezone(&Utc);
    if parsed.timestamp_nanos_opt().is_none() {
        return Err(QueryError::invalid(format!("{name} is out of range")));
    }
    Ok(Some(parsed))
}

fn nanos(time: DateTime<Utc>) -> i64 {
    // bounds were range-checked in parse_bound
    time.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[derive(Clone)]
pub struct MetricsRepository {
    pool: SqlitePool,
}

impl MetricsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// One page of a host's metrics, optionally bounded in time (inclusive)
    #[instrument(skip(self))]
    pub async fn list_metrics(&self, query: &MetricQuery) -> Result<Vec<MetricMessage>> {
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Ok(Vec::new());
            }
        }

        let mut qb = QueryBuilder::<Sqlite>::new(BASE_SELECT);
        qb.push_bind(query.hostname.clone());
        if let Some(from) = query.from {
            qb.push(" AND m.time >= ").push_bind(nanos(from));
        }
        if let Some(to) = query.to {
            qb.push(" AND m.time <= ").push_bind(nanos(to));
        }
        qb.push(" ORDER BY m.time DESC, m.id DESC LIMIT ")
            .push_bind(query.limit)
            .push(" OFFSET ")
            .push_bind(query.offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_message).collect()
    }

    /// Most recent metric of a host, `None` when it has none
    #[instrument(skip(self))]
    pub async fn latest_metric(&self, hostname: &str) -> Result<Option<MetricMessage>> {
        let hostname = require_hostname(hostname)?;
        let sql = format!("{BASE_SELECT} ? ORDER BY m.time DESC, m.id DESC LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(hostname)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_message).transpose()
    }

    /// Full history of a host, newest first
    #[instrument(skip(self))]
    pub async fn metrics_by_host(&self, hostname: &str) -> Result<Vec<MetricMessage>> {
        let hostname = require_hostname(hostname)?;
        let sql = format!("{BASE_SELECT} ? ORDER BY m.time DESC, m.id DESC");
        let rows = sqlx::query(&sql)
            .bind(hostname)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_message).collect()
    }

    /// Newest metric of every host that has one, by hostname
    #[instrument(skip(self))]
    pub async fn latest_per_host(&self) -> Result<Vec<MetricMessage>> {
        let rows = sqlx::query(LATEST_PER_HOST).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_message).collect()
    }

    /// Every known host, by hostname
    #[instrument(skip(self))]
    pub async fn list_hosts(&self) -> Result<Vec<Host>> {
        let rows = sqlx::query(
            "SELECT id, hostname, os, platform, platform_ver, kernel_ver FROM hosts ORDER BY hostname",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_host).collect()
    }

    #[instrument(skip(self))]
    pub async fn host(&self, hostname: &str) -> Result<Option<Host>> {
        let hostname = require_hostname(hostname)?;
        let row = sqlx::query(
            "SELECT id, hostname, os, platform, platform_ver, kernel_ver FROM hosts WHERE hostname = ?",
        )
        .bind(hostname)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_host).transpose()
    }
}

fn row_to_host(row: &SqliteRow) -> Result<Host> {
    Ok(Host {
        id: row.try_get("id")?,
        hostname: row.try_get("hostname")?,
        os: row.try_get("os")?,
        platform: row.try_get("platform")?,
        platform_ver: row.try_get("platform_ver")?,
        kernel_ver: row.try_get("kernel_ver")?,
    })
}

fn row_to_message(row: &SqliteRow) -> Result<MetricMessage> {
    let host_id: i64 = row.try_get("host_id")?;
    let uptime: i64 = row.try_get("uptime")?;
    let disk: String = row.try_get("disk")?;
    let network: String = row.try_get("network")?;
    let time: i64 = row.try_get("time")?;

    let host = Host {
        id: host_id,
        hostname: row.try_get("hostname")?,
        os: row.try_get("os")?,
        platform: row.try_get("platform")?,
        platform_ver: row.try_get("platform_ver")?,
        kernel_ver: row.try_get("kernel_ver")?,
    };
    let metric = Metric {
        id: row.try_get("metric_id")?,
        host_id,
        uptime: u64::try_from(uptime)
            .map_err(|_| QueryError::Corrupt(format!("negative uptime {uptime}")))?,
        cpu: row.try_get("cpu")?,
        ram: row.try_get("ram")?,
        disk: serde_json::from_str(&disk)?,
        network: serde_json::from_str(&network)?,
        time: DateTime::from_timestamp_nanos(time),
    };
    Ok(MetricMessage::new(host, metric))
}
