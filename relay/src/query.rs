//! Query/search service: turns raw dashboard parameters into validated,
//! bounded store queries.

use crate::devices::{Actuator, Switch};
use crate::errors::{Error, Result};
use crate::model::{DeviceCommandRecord, SensorField, TelemetryReading, TelemetryStats};
use crate::store::Store;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DEFAULT_LIMIT: u32 = 100;
pub const MAX_LIMIT: u32 = 1000;
const DEFAULT_STATS_HOURS: i64 = 24;
const MAX_STATS_HOURS: i64 = 24 * 366;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }

    fn parse(raw: Option<&str>) -> Result<Self> {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("desc") => Ok(SortOrder::Desc),
            Some("asc") => Ok(SortOrder::Asc),
            Some(other) => Err(Error::Validation(format!(
                "Invalid sortOrder '{}'. Use asc | desc",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetrySort {
    Id,
    Field(SensorField),
    CapturedAt,
}

impl TelemetrySort {
    pub fn column(self) -> &'static str {
        match self {
            TelemetrySort::Id => "id",
            TelemetrySort::Field(field) => field.column(),
            TelemetrySort::CapturedAt => "created_at",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "id" => Ok(TelemetrySort::Id),
            "time" | "created_at" | "createdAt" | "capturedAt" => Ok(TelemetrySort::CapturedAt),
            other => SensorField::parse(other)
                .map(TelemetrySort::Field)
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "Invalid sortField '{}'. Use id | temp | humi | light | rain | time",
                        other
                    ))
                }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSort {
    Id,
    Device,
    Status,
    CreatedAt,
}

impl CommandSort {
    pub fn column(self) -> &'static str {
        match self {
            CommandSort::Id => "id",
            CommandSort::Device => "device",
            CommandSort::Status => "status",
            CommandSort::CreatedAt => "created_at",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "id" => Ok(CommandSort::Id),
            "device" => Ok(CommandSort::Device),
            "status" => Ok(CommandSort::Status),
            "created_at" | "createdAt" | "time" => Ok(CommandSort::CreatedAt),
            other => Err(Error::Validation(format!(
                "Invalid sortField '{}'. Use id | device | status | created_at",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryQuery {
    pub device_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub sort: TelemetrySort,
    pub order: SortOrder,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchTarget {
    Field(SensorField),
    Any,
}

impl SearchTarget {
    /// Whether `reading` matches `value` under display-precision equality.
    pub fn matches(self, reading: &TelemetryReading, value: f64) -> bool {
        let hit = |field: SensorField| field.scaled(field.value_of(reading)) == field.scaled(value);
        match self {
            SearchTarget::Field(field) => hit(field),
            SearchTarget::Any => SensorField::ALL.into_iter().any(hit),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub target: SearchTarget,
    pub value: f64,
    pub device_id: Option<String>,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandQuery {
    pub device: Option<Actuator>,
    pub status: Option<Switch>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub sort: CommandSort,
    pub order: SortOrder,
    pub limit: u32,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryParams {
    pub device_id: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub sort_field: Option<String>,
    pub sort_order: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    pub device_id: Option<String>,
    pub field: Option<String>,
    pub value: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandParams {
    pub device: Option<String>,
    pub status: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub sort_field: Option<String>,
    pub sort_order: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsParams {
    pub device_id: Option<String>,
    pub hours: Option<String>,
}

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

/// Parses a requested row limit, always capped at [`MAX_LIMIT`].
pub fn parse_limit(raw: Option<&str>) -> Result<u32> {
    match non_empty(raw) {
        None => Ok(DEFAULT_LIMIT),
        Some(s) => {
            let n: u64 = s
                .parse()
                .map_err(|_| Error::Validation(format!("Invalid limit '{}'", s)))?;
            if n == 0 {
                return Err(Error::Validation("limit must be positive".to_string()));
            }
            Ok(n.min(MAX_LIMIT as u64) as u32)
        }
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` and `YYYY-MM-DD`; naive forms are UTC.
pub fn parse_instant(name: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    let Some(s) = non_empty(raw) else {
        return Ok(None);
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Some(naive.and_utc()));
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(Some(midnight.and_utc()));
    }

    Err(Error::Validation(format!("Invalid {} '{}'", name, s)))
}

impl TelemetryQuery {
    pub fn from_params(params: &TelemetryParams) -> Result<Self> {
        let sort = match non_empty(params.sort_field.as_deref()) {
            Some(field) => TelemetrySort::parse(field)?,
            None => TelemetrySort::Id,
        };

        Ok(Self {
            device_id: non_empty(params.device_id.as_deref()).map(str::to_string),
            since: parse_instant("since", params.since.as_deref())?,
            until: parse_instant("until", params.until.as_deref())?,
            sort,
            order: SortOrder::parse(params.sort_order.as_deref())?,
            limit: parse_limit(params.limit.as_deref())?,
        })
    }
}

impl SearchQuery {
    pub fn from_params(params: &SearchParams) -> Result<Self> {
        let target = match non_empty(params.field.as_deref()) {
            None => SearchTarget::Field(SensorField::Temperature),
            Some(f) if f.eq_ignore_ascii_case("any") || f.eq_ignore_ascii_case("all") => {
                SearchTarget::Any
            }
            Some(f) => SearchTarget::Field(SensorField::parse(f).ok_or_else(|| {
                Error::Validation(format!(
                    "Invalid field '{}'. Use temp | humi | light | rain | any",
                    f
                ))
            })?),
        };

        let raw = non_empty(params.value.as_deref())
            .ok_or_else(|| Error::Validation("value is required".to_string()))?;
        let value: f64 = raw
            .parse()
            .ok()
            .filter(|v: &f64| v.is_finite())
            .ok_or_else(|| Error::Validation(format!("Invalid value '{}'", raw)))?;

        Ok(Self {
            target,
            value,
            device_id: non_empty(params.device_id.as_deref()).map(str::to_string),
            limit: parse_limit(params.limit.as_deref())?,
        })
    }
}

impl CommandQuery {
    pub fn from_params(params: &CommandParams) -> Result<Self> {
        let device = non_empty(params.device.as_deref())
            .map(|d| {
                Actuator::resolve(d)
                    .ok_or_else(|| Error::Validation(format!("Unknown device '{}'", d)))
            })
            .transpose()?;

        let status = non_empty(params.status.as_deref())
            .map(|s| {
                Switch::parse(s)
                    .ok_or_else(|| Error::Validation(format!("Invalid status '{}'. Use ON | OFF", s)))
            })
            .transpose()?;

        let sort = match non_empty(params.sort_field.as_deref()) {
            Some(field) => CommandSort::parse(field)?,
            None => CommandSort::Id,
        };

        Ok(Self {
            device,
            status,
            since: parse_instant("since", params.since.as_deref())?,
            until: parse_instant("until", params.until.as_deref())?,
            sort,
            order: SortOrder::parse(params.sort_order.as_deref())?,
            limit: parse_limit(params.limit.as_deref())?,
        })
    }
}

/// Read side over the durable store. Never writes.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn Store>,
}

impl QueryService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn list_telemetry(&self, params: &TelemetryParams) -> Result<Vec<TelemetryReading>> {
        let query = TelemetryQuery::from_params(params)?;
        self.store.list_telemetry(&query).await
    }

    pub async fn search_telemetry(&self, params: &SearchParams) -> Result<Vec<TelemetryReading>> {
        let query = SearchQuery::from_params(params)?;
        self.store.search_telemetry(&query).await
    }

    /// Most recent reading by capture time; `None` when the device has none.
    pub async fn latest_telemetry(&self, device_id: Option<&str>) -> Result<Option<TelemetryReading>> {
        let device_id = non_empty(device_id)
            .ok_or_else(|| Error::Validation("deviceId is required".to_string()))?;
        self.store.latest_telemetry(device_id).await
    }

    pub async fn telemetry_stats(&self, params: &StatsParams) -> Result<TelemetryStats> {
        let hours = match non_empty(params.hours.as_deref()) {
            None => DEFAULT_STATS_HOURS,
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|h| (1..=MAX_STATS_HOURS).contains(h))
                .ok_or_else(|| Error::Validation(format!("Invalid hours '{}'", raw)))?,
        };
        let since = Utc::now() - Duration::hours(hours);

        self.store
            .telemetry_stats(non_empty(params.device_id.as_deref()), since)
            .await
    }

    pub async fn list_commands(&self, params: &CommandParams) -> Result<Vec<DeviceCommandRecord>> {
        let query = CommandQuery::from_params(params)?;
        self.store.list_commands(&query).await
    }

    pub async fn latest_command(&self, device: &str) -> Result<Option<DeviceCommandRecord>> {
        let actuator = Actuator::resolve(device)
            .ok_or_else(|| Error::Validation(format!("Unknown device '{}'", device)))?;
        self.store.latest_command(actuator).await
    }

    /// Current state per actuator, keyed by display name. Actuators that have
    /// never reported are absent.
    pub async fn device_states(&self) -> Result<BTreeMap<String, Switch>> {
        let latest = self.store.device_states().await?;
        Ok(latest
            .into_iter()
            .map(|record| (record.device, record.status))
            .collect())
    }

    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_limit_is_capped() {
        assert_eq!(parse_limit(None).unwrap(), DEFAULT_LIMIT);
        assert_eq!(parse_limit(Some("50")).unwrap(), 50);
        assert_eq!(parse_limit(Some("1000000")).unwrap(), MAX_LIMIT);
        assert!(parse_limit(Some("0")).is_err());
        assert!(parse_limit(Some("-5")).is_err());
        assert!(parse_limit(Some("ten")).is_err());
    }

    #[test]
    fn test_parse_instant_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        assert_eq!(
            parse_instant("since", Some("2024-05-01T08:30:00Z")).unwrap(),
            Some(expected)
        );
        assert_eq!(
            parse_instant("since", Some("2024-05-01T15:30:00+07:00")).unwrap(),
            Some(expected)
        );
        assert_eq!(
            parse_instant("since", Some("2024-05-01 08:30:00")).unwrap(),
            Some(expected)
        );
        assert_eq!(
            parse_instant("since", Some("2024-05-01")).unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_instant("since", Some("")).unwrap(), None);
        assert!(parse_instant("since", Some("yesterday")).is_err());
    }

    #[test]
    fn test_unknown_sort_field_rejected() {
        let params = TelemetryParams {
            sort_field: Some("pressure".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            TelemetryQuery::from_params(&params),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_sort_order_rejected() {
        let params = TelemetryParams {
            sort_field: Some("temp".to_string()),
            sort_order: Some("sideways".to_string()),
            ..Default::default()
        };
        assert!(TelemetryQuery::from_params(&params).is_err());
    }

    #[test]
    fn test_telemetry_query_defaults() {
        let query = TelemetryQuery::from_params(&TelemetryParams::default()).unwrap();
        assert_eq!(query.sort, TelemetrySort::Id);
        assert_eq!(query.order, SortOrder::Desc);
        assert_eq!(query.limit, DEFAULT_LIMIT);
        assert!(query.device_id.is_none());
    }

    #[test]
    fn test_telemetry_sort_aliases() {
        let params = TelemetryParams {
            sort_field: Some("time".to_string()),
            sort_order: Some("ASC".to_string()),
            ..Default::default()
        };
        let query = TelemetryQuery::from_params(&params).unwrap();
        assert_eq!(query.sort, TelemetrySort::CapturedAt);
        assert_eq!(query.order, SortOrder::Asc);
        assert_eq!(query.sort.column(), "created_at");
    }

    #[test]
    fn test_search_requires_value() {
        let params = SearchParams {
            field: Some("temp".to_string()),
            ..Default::default()
        };
        assert!(SearchQuery::from_params(&params).is_err());
    }

    #[test]
    fn test_search_rejects_unknown_field() {
        let params = SearchParams {
            field: Some("pressure".to_string()),
            value: Some("10".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            SearchQuery::from_params(&params),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_search_any() {
        let params = SearchParams {
            field: Some("any".to_string()),
            value: Some("25".to_string()),
            ..Default::default()
        };
        let query = SearchQuery::from_params(&params).unwrap();
        assert_eq!(query.target, SearchTarget::Any);
        assert_eq!(query.value, 25.0);
    }

    #[test]
    fn test_search_target_matches() {
        let reading = TelemetryReading {
            id: 1,
            device_id: "esp32-001".to_string(),
            temperature: 25.0,
            humidity: 61.3,
            light: 812,
            rainfall: 0.25,
            captured_at: Utc::now(),
        };

        assert!(SearchTarget::Field(SensorField::Temperature).matches(&reading, 25.0));
        assert!(SearchTarget::Field(SensorField::Temperature).matches(&reading, 24.97));
        assert!(!SearchTarget::Field(SensorField::Temperature).matches(&reading, 24.9));
        assert!(SearchTarget::Field(SensorField::Light).matches(&reading, 812.6));
        assert!(SearchTarget::Any.matches(&reading, 61.3));
        assert!(SearchTarget::Any.matches(&reading, 0.25));
        assert!(!SearchTarget::Any.matches(&reading, 99.0));
    }

    #[test]
    fn test_command_query_resolves_device() {
        let params = CommandParams {
            device: Some("led1".to_string()),
            status: Some("on".to_string()),
            ..Default::default()
        };
        let query = CommandQuery::from_params(&params).unwrap();
        assert_eq!(query.device, Some(Actuator::Light));
        assert_eq!(query.status, Some(Switch::On));
    }

    #[test]
    fn test_command_query_rejects_bad_status() {
        let params = CommandParams {
            status: Some("pending".to_string()),
            ..Default::default()
        };
        assert!(CommandQuery::from_params(&params).is_err());
    }
}
