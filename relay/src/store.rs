//! Durable store contract and an in-memory implementation of it.

use crate::devices::{Actuator, Switch};
use crate::errors::{Error, Result};
use crate::model::{
    DeviceCommandRecord, FieldStats, NewReading, SensorField, TelemetryReading, TelemetryStats,
};
use crate::query::{CommandQuery, CommandSort, SearchQuery, SortOrder, TelemetryQuery, TelemetrySort};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use tokio::sync::Mutex;

#[async_trait]
pub trait Store: Send + Sync {
    /// Appends a reading and returns it with its store-assigned identity.
    async fn insert_telemetry(&self, reading: &NewReading) -> Result<TelemetryReading>;

    async fn list_telemetry(&self, query: &TelemetryQuery) -> Result<Vec<TelemetryReading>>;

    async fn search_telemetry(&self, query: &SearchQuery) -> Result<Vec<TelemetryReading>>;

    async fn latest_telemetry(&self, device_id: &str) -> Result<Option<TelemetryReading>>;

    async fn telemetry_stats(
        &self,
        device_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<TelemetryStats>;

    async fn latest_command(&self, device: Actuator) -> Result<Option<DeviceCommandRecord>>;

    /// Compare-and-append: appends a record only if `status` differs from the
    /// latest record for `device` (or none exists). Atomic with respect to
    /// concurrent calls for the same device. Returns the new record, or `None`
    /// when the observation repeated the current state.
    async fn append_command_if_changed(
        &self,
        device: Actuator,
        status: Switch,
        at: DateTime<Utc>,
    ) -> Result<Option<DeviceCommandRecord>>;

    async fn list_commands(&self, query: &CommandQuery) -> Result<Vec<DeviceCommandRecord>>;

    /// Latest record per device name.
    async fn device_states(&self) -> Result<Vec<DeviceCommandRecord>>;

    async fn ping(&self) -> Result<()>;

    /// Releases the store's connections. Operations after this fail.
    async fn close(&self);
}

fn within(ts: DateTime<Utc>, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> bool {
    since.map_or(true, |s| ts >= s) && until.map_or(true, |u| ts <= u)
}

fn directed(ordering: Ordering, order: SortOrder) -> Ordering {
    match order {
        SortOrder::Asc => ordering,
        SortOrder::Desc => ordering.reverse(),
    }
}

fn compare_readings(a: &TelemetryReading, b: &TelemetryReading, sort: TelemetrySort) -> Ordering {
    match sort {
        TelemetrySort::Id => Ordering::Equal,
        TelemetrySort::Field(field) => field.value_of(a).total_cmp(&field.value_of(b)),
        TelemetrySort::CapturedAt => a.captured_at.cmp(&b.captured_at),
    }
}

fn compare_commands(a: &DeviceCommandRecord, b: &DeviceCommandRecord, sort: CommandSort) -> Ordering {
    match sort {
        CommandSort::Id => Ordering::Equal,
        CommandSort::Device => a.device.cmp(&b.device),
        CommandSort::Status => a.status.as_str().cmp(b.status.as_str()),
        CommandSort::CreatedAt => a.created_at.cmp(&b.created_at),
    }
}

fn field_stats<'a>(
    rows: impl Iterator<Item = &'a TelemetryReading> + Clone,
    field: SensorField,
) -> FieldStats {
    let values: Vec<f64> = rows.map(|r| field.value_of(r)).collect();
    if values.is_empty() {
        return FieldStats::default();
    }
    FieldStats {
        avg: Some(values.iter().sum::<f64>() / values.len() as f64),
        min: values.iter().copied().reduce(f64::min),
        max: values.iter().copied().reduce(f64::max),
    }
}

#[derive(Default)]
struct Inner {
    telemetry: Vec<TelemetryReading>,
    commands: Vec<DeviceCommandRecord>,
    next_telemetry_id: i64,
    next_command_id: i64,
}

impl Inner {
    fn latest_command(&self, device: Actuator) -> Option<&DeviceCommandRecord> {
        self.commands
            .iter()
            .filter(|c| c.device == device.display_name())
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
    }
}

/// Process-local store. Serves tests and `--memory-store` runs; contents are
/// lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, AtomicOrdering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            return Err(Error::StoreUnavailable {
                attempts: 1,
                source: sqlx::Error::PoolClosed,
            });
        }
        Ok(())
    }

    pub async fn telemetry_count(&self) -> usize {
        self.inner.lock().await.telemetry.len()
    }

    pub async fn command_count(&self) -> usize {
        self.inner.lock().await.commands.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_telemetry(&self, reading: &NewReading) -> Result<TelemetryReading> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        inner.next_telemetry_id += 1;
        let stored = reading.clone().with_id(inner.next_telemetry_id);
        inner.telemetry.push(stored.clone());
        Ok(stored)
    }

    async fn list_telemetry(&self, query: &TelemetryQuery) -> Result<Vec<TelemetryReading>> {
        self.check()?;
        let inner = self.inner.lock().await;
        let mut rows: Vec<TelemetryReading> = inner
            .telemetry
            .iter()
            .filter(|r| query.device_id.as_deref().map_or(true, |d| r.device_id == d))
            .filter(|r| within(r.captured_at, query.since, query.until))
            .cloned()
            .collect();

        rows.sort_by(|a, b| {
            directed(
                compare_readings(a, b, query.sort).then(a.id.cmp(&b.id)),
                query.order,
            )
        });
        rows.truncate(query.limit as usize);
        Ok(rows)
    }

    async fn search_telemetry(&self, query: &SearchQuery) -> Result<Vec<TelemetryReading>> {
        self.check()?;
        let inner = self.inner.lock().await;
        let mut rows: Vec<TelemetryReading> = inner
            .telemetry
            .iter()
            .filter(|r| query.device_id.as_deref().map_or(true, |d| r.device_id == d))
            .filter(|r| query.target.matches(r, query.value))
            .cloned()
            .collect();

        rows.sort_by(|a, b| b.id.cmp(&a.id));
        rows.truncate(query.limit as usize);
        Ok(rows)
    }

    async fn latest_telemetry(&self, device_id: &str) -> Result<Option<TelemetryReading>> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .telemetry
            .iter()
            .filter(|r| r.device_id == device_id)
            .max_by(|a, b| a.captured_at.cmp(&b.captured_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn telemetry_stats(
        &self,
        device_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<TelemetryStats> {
        self.check()?;
        let inner = self.inner.lock().await;
        let rows = inner
            .telemetry
            .iter()
            .filter(|r| device_id.map_or(true, |d| r.device_id == d))
            .filter(|r| r.captured_at >= since);

        Ok(TelemetryStats {
            record_count: rows.clone().count() as i64,
            temperature: field_stats(rows.clone(), SensorField::Temperature),
            humidity: field_stats(rows.clone(), SensorField::Humidity),
            light: field_stats(rows.clone(), SensorField::Light),
            rainfall: field_stats(rows, SensorField::Rainfall),
        })
    }

    async fn latest_command(&self, device: Actuator) -> Result<Option<DeviceCommandRecord>> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner.latest_command(device).cloned())
    }

    async fn append_command_if_changed(
        &self,
        device: Actuator,
        status: Switch,
        at: DateTime<Utc>,
    ) -> Result<Option<DeviceCommandRecord>> {
        self.check()?;
        // The lock spans both the read and the append.
        let mut inner = self.inner.lock().await;
        if inner.latest_command(device).map(|c| c.status) == Some(status) {
            return Ok(None);
        }

        inner.next_command_id += 1;
        let record = DeviceCommandRecord {
            id: inner.next_command_id,
            device: device.display_name().to_string(),
            status,
            created_at: at,
            updated_at: None,
        };
        inner.commands.push(record.clone());
        Ok(Some(record))
    }

    async fn list_commands(&self, query: &CommandQuery) -> Result<Vec<DeviceCommandRecord>> {
        self.check()?;
        let inner = self.inner.lock().await;
        let mut rows: Vec<DeviceCommandRecord> = inner
            .commands
            .iter()
            .filter(|c| query.device.map_or(true, |d| c.device == d.display_name()))
            .filter(|c| query.status.map_or(true, |s| c.status == s))
            .filter(|c| within(c.created_at, query.since, query.until))
            .cloned()
            .collect();

        rows.sort_by(|a, b| {
            directed(
                compare_commands(a, b, query.sort).then(a.id.cmp(&b.id)),
                query.order,
            )
        });
        rows.truncate(query.limit as usize);
        Ok(rows)
    }

    async fn device_states(&self) -> Result<Vec<DeviceCommandRecord>> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(Actuator::ALL
            .into_iter()
            .filter_map(|a| inner.latest_command(a).cloned())
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn close(&self) {
        self.set_unavailable(true);
    }
}
