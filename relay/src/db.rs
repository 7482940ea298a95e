use crate::devices::{Actuator, Switch};
use crate::errors::{Error, Result};
use crate::metrics::{DB_FAILURES_TOTAL, DB_POOL_RESETS_TOTAL};
use crate::model::{
    DeviceCommandRecord, FieldStats, NewReading, SensorField, TelemetryReading, TelemetryStats,
};
use crate::query::{CommandQuery, SearchQuery, SearchTarget, TelemetryQuery};
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tracing::{error, info, warn};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_BACKOFF_MS: u64 = 250;
const MAX_BACKOFF_MS: u64 = 4000;

const TELEMETRY_COLUMNS: &str = "id, device_id, temp AS temperature, humi AS humidity, light, \
     rain_mm AS rainfall, created_at AS captured_at";
const COMMAND_COLUMNS: &str = "id, device, status, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct CommandRow {
    id: i64,
    device: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<CommandRow> for DeviceCommandRecord {
    type Error = sqlx::Error;

    fn try_from(row: CommandRow) -> std::result::Result<Self, Self::Error> {
        let status = Switch::parse(&row.status).ok_or_else(|| {
            sqlx::Error::Decode(format!("unexpected status {:?} in row {}", row.status, row.id).into())
        })?;
        Ok(DeviceCommandRecord {
            id: row.id,
            device: row.device,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_records(rows: Vec<CommandRow>) -> std::result::Result<Vec<DeviceCommandRecord>, sqlx::Error> {
    rows.into_iter().map(DeviceCommandRecord::try_from).collect()
}

#[derive(Debug, sqlx::FromRow)]
struct StatsRow {
    record_count: i64,
    avg_temp: Option<f64>,
    min_temp: Option<f64>,
    max_temp: Option<f64>,
    avg_humi: Option<f64>,
    min_humi: Option<f64>,
    max_humi: Option<f64>,
    avg_light: Option<f64>,
    min_light: Option<f64>,
    max_light: Option<f64>,
    avg_rain: Option<f64>,
    min_rain: Option<f64>,
    max_rain: Option<f64>,
}

/// SQL expression for `field` in display-precision units, mirroring
/// [`SensorField::scaled`]. `numeric` rounding is half away from zero.
fn scaled_expr(field: SensorField) -> &'static str {
    match field {
        SensorField::Temperature => "ROUND((temp * 10)::numeric)::bigint",
        SensorField::Humidity => "ROUND((humi * 10)::numeric)::bigint",
        SensorField::Light => "light",
        SensorField::Rainfall => "ROUND((rain_mm * 100)::numeric)::bigint",
    }
}

fn pool_options(max_connections: u32) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
}

/// How a failed attempt is handled by [`PgStore::with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    /// Every connection is checked out; wait and try the same pool again.
    Busy,
    /// The connection or pool is broken; recreate the pool, then retry.
    Broken,
    /// Retrying cannot help.
    Fatal,
}

struct PoolSlot {
    pool: PgPool,
    generation: u64,
}

/// Postgres-backed store. Holds the pool behind a lock so a broken pool can
/// be swapped for a fresh one without restarting the process.
///
/// Every attempt holds one of `max_connections` permits for as long as it
/// uses a connection. A replaced pool keeps its checked-out connections until
/// their queries finish, so the permits are what bound the backends held
/// across the old and the new pool.
pub struct PgStore {
    database_url: String,
    max_connections: u32,
    max_attempts: u32,
    permits: Semaphore,
    slot: RwLock<PoolSlot>,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32, max_attempts: u32) -> Result<Self> {
        info!("Connecting to database...");
        let pool = pool_options(max_connections).connect(database_url).await?;

        info!("Database connection established");
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Migrations completed");

        Ok(Self::with_pool(pool, database_url, max_connections, max_attempts))
    }

    /// Builds a store whose connections are opened on first use. No
    /// migrations run.
    pub fn connect_lazy(database_url: &str, max_connections: u32, max_attempts: u32) -> Result<Self> {
        let pool = pool_options(max_connections).connect_lazy(database_url)?;
        Ok(Self::with_pool(pool, database_url, max_connections, max_attempts))
    }

    fn with_pool(pool: PgPool, database_url: &str, max_connections: u32, max_attempts: u32) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            database_url: database_url.to_string(),
            max_connections,
            max_attempts: max_attempts.max(1),
            permits: Semaphore::new(max_connections as usize),
            slot: RwLock::new(PoolSlot {
                pool,
                generation: 0,
            }),
        }
    }

    async fn pool(&self) -> (PgPool, u64) {
        let slot = self.slot.read().await;
        (slot.pool.clone(), slot.generation)
    }

    /// Number of times the pool has been recreated.
    pub async fn generation(&self) -> u64 {
        self.slot.read().await.generation
    }

    /// Replaces the pool if `seen` is still the current generation. Callers
    /// that failed on the same broken pool share one replacement. The old
    /// pool is closed in the background so in-flight queries holding its
    /// connections are not blocked on.
    async fn reset_pool(&self, seen: u64) {
        let mut slot = self.slot.write().await;
        if slot.generation != seen {
            return;
        }

        let fresh = match pool_options(self.max_connections).connect_lazy(&self.database_url) {
            Ok(pool) => pool,
            Err(e) => {
                error!("Failed to recreate database pool: {}", e);
                return;
            }
        };

        let old = std::mem::replace(&mut slot.pool, fresh);
        slot.generation += 1;
        DB_POOL_RESETS_TOTAL.inc();
        info!("Database pool recreated (generation {})", slot.generation);
        drop(slot);

        tokio::spawn(async move {
            old.close().await;
        });
    }

    /// Runs `op`, retrying transient failures with exponential backoff.
    /// A busy pool is retried as is; a broken one is recreated first.
    /// Non-transient errors are returned at once.
    async fn with_retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: Fn(PgPool) -> Fut + Send + Sync,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            attempt += 1;

            let outcome = match tokio::time::timeout(ACQUIRE_TIMEOUT, self.permits.acquire()).await
            {
                Ok(Ok(_permit)) => {
                    let (pool, generation) = self.pool().await;
                    op(pool).await.map_err(|e| (e, Some(generation)))
                }
                Ok(Err(_)) => Err((sqlx::Error::PoolClosed, None)),
                Err(_) => Err((sqlx::Error::PoolTimedOut, None)),
            };

            let (e, generation) = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} succeeded after {} attempts", what, attempt);
                    }
                    return Ok(value);
                }
                Err(failed) => failed,
            };

            let failure = classify(&e);
            if failure == Failure::Fatal || self.permits.is_closed() {
                error!("{} failed with non-transient error: {}", what, e);
                return Err(Error::Database(e));
            }

            DB_FAILURES_TOTAL.inc();

            if attempt >= self.max_attempts {
                error!(
                    "{} failed permanently after {} attempts: {}",
                    what, attempt, e
                );
                return Err(Error::StoreUnavailable {
                    attempts: attempt,
                    source: e,
                });
            }

            warn!(
                "{} failed (attempt {}/{}, {:?}), retrying in {}ms: {}",
                what, attempt, self.max_attempts, failure, backoff_ms, e
            );
            if let (Failure::Broken, Some(generation)) = (failure, generation) {
                self.reset_pool(generation).await;
            }
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_telemetry(&self, reading: &NewReading) -> Result<TelemetryReading> {
        let sql = format!(
            "INSERT INTO telemetry (device_id, temp, humi, light, rain_mm, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
            TELEMETRY_COLUMNS
        );
        let sql = sql.as_str();

        self.with_retry("telemetry insert", |pool| async move {
            sqlx::query_as::<_, TelemetryReading>(sql)
                .bind(&reading.device_id)
                .bind(reading.temperature)
                .bind(reading.humidity)
                .bind(reading.light)
                .bind(reading.rainfall)
                .bind(reading.captured_at)
                .fetch_one(&pool)
                .await
        })
        .await
    }

    async fn list_telemetry(&self, query: &TelemetryQuery) -> Result<Vec<TelemetryReading>> {
        // Sort column and direction come from a whitelist enum, never from input.
        let order = query.order.sql();
        let sql = format!(
            "SELECT {} FROM telemetry \
             WHERE ($1::text IS NULL OR device_id = $1) \
               AND ($2::timestamptz IS NULL OR created_at >= $2) \
               AND ($3::timestamptz IS NULL OR created_at <= $3) \
             ORDER BY {} {}, id {} \
             LIMIT $4",
            TELEMETRY_COLUMNS,
            query.sort.column(),
            order,
            order
        );
        let sql = sql.as_str();

        self.with_retry("telemetry list", |pool| async move {
            sqlx::query_as::<_, TelemetryReading>(sql)
                .bind(query.device_id.as_deref())
                .bind(query.since)
                .bind(query.until)
                .bind(query.limit as i64)
                .fetch_all(&pool)
                .await
        })
        .await
    }

    async fn search_telemetry(&self, query: &SearchQuery) -> Result<Vec<TelemetryReading>> {
        // $1 is the device filter; one value placeholder per compared field follows.
        let fields: Vec<SensorField> = match query.target {
            SearchTarget::Field(field) => vec![field],
            SearchTarget::Any => SensorField::ALL.to_vec(),
        };
        let condition = fields
            .iter()
            .enumerate()
            .map(|(i, field)| format!("{} = ${}", scaled_expr(*field), i + 2))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT {} FROM telemetry \
             WHERE ($1::text IS NULL OR device_id = $1) AND ({}) \
             ORDER BY id DESC \
             LIMIT ${}",
            TELEMETRY_COLUMNS,
            condition,
            fields.len() + 2
        );
        let sql = sql.as_str();
        let values: Vec<i64> = fields.iter().map(|f| f.scaled(query.value)).collect();
        let values = values.as_slice();

        self.with_retry("telemetry search", |pool| async move {
            let mut q = sqlx::query_as::<_, TelemetryReading>(sql).bind(query.device_id.as_deref());
            for value in values {
                q = q.bind(*value);
            }
            q.bind(query.limit as i64).fetch_all(&pool).await
        })
        .await
    }

    async fn latest_telemetry(&self, device_id: &str) -> Result<Option<TelemetryReading>> {
        let sql = format!(
            "SELECT {} FROM telemetry WHERE device_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT 1",
            TELEMETRY_COLUMNS
        );
        let sql = sql.as_str();

        self.with_retry("latest telemetry", |pool| async move {
            sqlx::query_as::<_, TelemetryReading>(sql)
                .bind(device_id)
                .fetch_optional(&pool)
                .await
        })
        .await
    }

    async fn telemetry_stats(
        &self,
        device_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<TelemetryStats> {
        let sql = r#"
            SELECT
                COUNT(*) AS record_count,
                AVG(temp) AS avg_temp, MIN(temp) AS min_temp, MAX(temp) AS max_temp,
                AVG(humi) AS avg_humi, MIN(humi) AS min_humi, MAX(humi) AS max_humi,
                AVG(light)::float8 AS avg_light, MIN(light)::float8 AS min_light, MAX(light)::float8 AS max_light,
                AVG(rain_mm) AS avg_rain, MIN(rain_mm) AS min_rain, MAX(rain_mm) AS max_rain
            FROM telemetry
            WHERE created_at >= $1 AND ($2::text IS NULL OR device_id = $2)
            "#;

        let row = self
            .with_retry("telemetry stats", |pool| async move {
                sqlx::query_as::<_, StatsRow>(sql)
                    .bind(since)
                    .bind(device_id)
                    .fetch_one(&pool)
                    .await
            })
            .await?;

        Ok(TelemetryStats {
            record_count: row.record_count,
            temperature: FieldStats {
                avg: row.avg_temp,
                min: row.min_temp,
                max: row.max_temp,
            },
            humidity: FieldStats {
                avg: row.avg_humi,
                min: row.min_humi,
                max: row.max_humi,
            },
            light: FieldStats {
                avg: row.avg_light,
                min: row.min_light,
                max: row.max_light,
            },
            rainfall: FieldStats {
                avg: row.avg_rain,
                min: row.min_rain,
                max: row.max_rain,
            },
        })
    }

    async fn latest_command(&self, device: Actuator) -> Result<Option<DeviceCommandRecord>> {
        let sql = format!(
            "SELECT {} FROM device_commands WHERE device = $1 \
             ORDER BY created_at DESC, id DESC LIMIT 1",
            COMMAND_COLUMNS
        );
        let sql = sql.as_str();
        let name = device.display_name();

        self.with_retry("latest command", |pool| async move {
            sqlx::query_as::<_, CommandRow>(sql)
                .bind(name)
                .fetch_optional(&pool)
                .await?
                .map(DeviceCommandRecord::try_from)
                .transpose()
        })
        .await
    }

    async fn append_command_if_changed(
        &self,
        device: Actuator,
        status: Switch,
        at: DateTime<Utc>,
    ) -> Result<Option<DeviceCommandRecord>> {
        let insert = format!(
            "INSERT INTO device_commands (device, status, created_at) \
             VALUES ($1, $2, $3) RETURNING {}",
            COMMAND_COLUMNS
        );
        let insert = insert.as_str();
        let name = device.display_name();

        // The advisory lock serializes check-then-append per device across
        // every relay process sharing the database; it is released on commit.
        self.with_retry("command append", |pool| async move {
            let mut tx = pool.begin().await?;

            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(name)
                .execute(&mut *tx)
                .await?;

            let last: Option<String> = sqlx::query_scalar(
                "SELECT status FROM device_commands WHERE device = $1 \
                 ORDER BY created_at DESC, id DESC LIMIT 1",
            )
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;

            if last.as_deref() == Some(status.as_str()) {
                tx.commit().await?;
                return Ok(None);
            }

            let row = sqlx::query_as::<_, CommandRow>(insert)
                .bind(name)
                .bind(status.as_str())
                .bind(at)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;

            DeviceCommandRecord::try_from(row).map(Some)
        })
        .await
    }

    async fn list_commands(&self, query: &CommandQuery) -> Result<Vec<DeviceCommandRecord>> {
        let order = query.order.sql();
        let sql = format!(
            "SELECT {} FROM device_commands \
             WHERE ($1::text IS NULL OR device = $1) \
               AND ($2::text IS NULL OR status = $2) \
               AND ($3::timestamptz IS NULL OR created_at >= $3) \
               AND ($4::timestamptz IS NULL OR created_at <= $4) \
             ORDER BY {} {}, id {} \
             LIMIT $5",
            COMMAND_COLUMNS,
            query.sort.column(),
            order,
            order
        );
        let sql = sql.as_str();
        let device = query.device.map(Actuator::display_name);
        let status = query.status.map(Switch::as_str);

        self.with_retry("command list", |pool| async move {
            let rows = sqlx::query_as::<_, CommandRow>(sql)
                .bind(device)
                .bind(status)
                .bind(query.since)
                .bind(query.until)
                .bind(query.limit as i64)
                .fetch_all(&pool)
                .await?;
            into_records(rows)
        })
        .await
    }

    async fn device_states(&self) -> Result<Vec<DeviceCommandRecord>> {
        let sql = format!(
            "SELECT DISTINCT ON (device) {} FROM device_commands \
             ORDER BY device, created_at DESC, id DESC",
            COMMAND_COLUMNS
        );
        let sql = sql.as_str();

        self.with_retry("device states", |pool| async move {
            let rows = sqlx::query_as::<_, CommandRow>(sql).fetch_all(&pool).await?;
            into_records(rows)
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.with_retry("ping", |pool| async move {
            sqlx::query_scalar::<_, i32>("SELECT 1")
                .fetch_one(&pool)
                .await
                .map(|_| ())
        })
        .await
    }

    /// Waits for checked-out connections to be returned, then closes the
    /// pool. Later operations fail with `PoolClosed` without retrying.
    async fn close(&self) {
        self.permits.close();
        let pool = self.slot.read().await.pool.clone();
        pool.close().await;
        info!("Database pool closed");
    }
}

fn classify(err: &sqlx::Error) -> Failure {
    match err {
        sqlx::Error::PoolTimedOut => Failure::Busy,
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed => Failure::Broken,
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            // too_many_connections, cannot_connect_now
            Some("53300") | Some("57P03") => Failure::Busy,
            // admin_shutdown, connection_exception class
            Some("57P01") => Failure::Broken,
            Some(code) if code.starts_with("08") => Failure::Broken,
            _ => Failure::Fatal,
        },
        _ => Failure::Fatal,
    }
}
