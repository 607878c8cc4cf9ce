//! InfluxDB v2 HTTP client
//!
//! Writes go out as line protocol, reads are Flux queries answered with
//! CSV, deletes use the predicate API. Every series lives in one bucket:
//! - `water`: flow, pressure, level
//! - `logs`: message, tagged by level
//! - `settings`: one JSON text field per key
//! - `users` / `devices`: registry records tagged by their id

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;

use crate::config::DatabaseConfig;
use crate::model::{
    Device, Group, LogEntry, LogLevel, Measurement, SettingKey, Settings, UnknownVariant, User,
};
use crate::protocol::TimeRange;
use crate::time::{format_precise, format_timestamp, parse_timestamp};

use super::line_protocol::{self, DEVICES, LOGS, MEASUREMENT, SETTINGS, USERS};
use super::{Store, StoreError};

const EPOCH: &str = "1970-01-01T00:00:00Z";

/// Store backed by an InfluxDB v2 server
pub struct InfluxStore {
    client: Client,
    base_url: String,
    organization: String,
    bucket: String,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    dialect: Dialect,
}

#[derive(Debug, Serialize)]
struct Dialect {
    header: bool,
    annotations: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    start: String,
    stop: String,
    predicate: &'a str,
}

/// One row of a Flux result, keyed by column name
type Record = BTreeMap<String, String>;

impl InfluxStore {
    pub fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url(),
            organization: config.organization.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn write(&self, body: String) -> Result<(), StoreError> {
        if body.is_empty() {
            return Ok(());
        }

        let url = format!("{}/api/v2/write", self.base_url);
        let resp = self
            .authed_request(reqwest::Method::POST, &url)
            .query(&[
                ("org", self.organization.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        Self::handle_error_status(resp).await?;
        Ok(())
    }

    async fn query(&self, flux: &str) -> Result<Vec<Record>, StoreError> {
        tracing::trace!(query = flux, "flux query");
        let url = format!("{}/api/v2/query", self.base_url);
        let resp = self
            .authed_request(reqwest::Method::POST, &url)
            .query(&[("org", self.organization.as_str())])
            .header("Accept", "application/csv")
            .json(&QueryRequest {
                query: flux,
                kind: "flux",
                dialect: Dialect {
                    header: true,
                    annotations: Vec::new(),
                },
            })
            .send()
            .await?;

        let resp = Self::handle_error_status(resp).await?;
        let body = resp.text().await?;
        parse_csv(&body)
    }

    async fn delete(
        &self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        predicate: &str,
    ) -> Result<(), StoreError> {
        let url = format!("{}/api/v2/delete", self.base_url);
        let resp = self
            .authed_request(reqwest::Method::POST, &url)
            .query(&[
                ("org", self.organization.as_str()),
                ("bucket", self.bucket.as_str()),
            ])
            .json(&DeleteRequest {
                start: format_timestamp(&start),
                stop: format_timestamp(&stop),
                predicate,
            })
            .send()
            .await?;

        Self::handle_error_status(resp).await?;
        Ok(())
    }

    async fn delete_all(&self, predicate: &str) -> Result<(), StoreError> {
        let start = DateTime::from_timestamp(0, 0).unwrap_or_default();
        let stop = Utc::now() + chrono::Duration::days(1);
        self.delete(start, stop, predicate).await
    }

    /// `from |> range |> filter(_measurement)` for this bucket
    fn from_range(&self, measurement: &str, start: &str, stop: Option<&str>) -> String {
        let stop = stop.map(|s| format!(", stop: {s}")).unwrap_or_default();
        format!(
            "from(bucket: {bucket})\n  |> range(start: {start}{stop})\n  |> filter(fn: (r) => r._measurement == {meas})",
            bucket = flux_string(&self.bucket),
            meas = flux_string(measurement),
        )
    }

    // Private helpers

    fn authed_request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);

        if let Some(ref token) = self.token {
            req = req.header("Authorization", format!("Token {token}"));
        }

        req
    }

    async fn handle_error_status(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        match resp.status() {
            s if s.is_success() => Ok(resp),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(StoreError::AuthFailed)
            }
            s => {
                let message = resp.text().await.unwrap_or_default();
                Err(StoreError::Rejected {
                    status: s.as_u16(),
                    message,
                })
            }
        }
    }
}

/// Quote a value for use inside a Flux script
fn flux_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Quote a value for use inside a delete predicate
fn predicate_string(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\\\""))
}

/// Exclusive Flux stop for an inclusive range end
fn exclusive_stop(stop: &DateTime<Utc>) -> String {
    format_timestamp(&(*stop + chrono::Duration::seconds(1)))
}

/// Read header-prefixed CSV as returned by the query API
///
/// Each table starts with its own header row; tables are separated by
/// blank lines.
fn parse_csv(body: &str) -> Result<Vec<Record>, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut header: Option<Vec<String>> = None;
    let mut records = Vec::new();

    for row in reader.records() {
        let row = row?;
        if row.iter().all(str::is_empty) {
            header = None;
            continue;
        }

        if header.is_none() || row.get(1) == Some("result") {
            header = Some(row.iter().map(String::from).collect());
            continue;
        }

        if let Some(columns) = &header {
            let record = columns
                .iter()
                .zip(row.iter())
                .filter(|(name, _)| !name.is_empty())
                .map(|(name, value)| (name.clone(), value.to_string()))
                .collect();
            records.push(record);
        }
    }

    Ok(records)
}

fn column<'a>(record: &'a Record, name: &str) -> Result<&'a str, StoreError> {
    record
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| StoreError::InvalidResponse(format!("missing column '{name}'")))
}

fn time_column(record: &Record) -> Result<DateTime<Utc>, StoreError> {
    let raw = column(record, "_time")?;
    parse_timestamp(raw).map_err(|e| StoreError::InvalidResponse(e.to_string()))
}

/// Pivot `(_time, _field, _value)` rows into measurements
fn measurements_from_records(records: &[Record]) -> Result<Vec<Measurement>, StoreError> {
    let mut rows: BTreeMap<DateTime<Utc>, [Option<i64>; 3]> = BTreeMap::new();

    for record in records {
        let ts = time_column(record)?;
        let field = column(record, "_field")?;
        let raw = column(record, "_value")?;
        let value: i64 = raw
            .parse()
            .map_err(|_| StoreError::InvalidResponse(format!("'{raw}' is not an integer")))?;

        let slot = match field {
            "flow" => 0,
            "pressure" => 1,
            "level" => 2,
            _ => continue,
        };
        rows.entry(ts).or_default()[slot] = Some(value);
    }

    Ok(rows
        .into_iter()
        .filter_map(|(timestamp, fields)| match fields {
            [Some(flow), Some(pressure), Some(level)] => Some(Measurement {
                timestamp,
                flow,
                pressure,
                level,
            }),
            _ => None,
        })
        .collect())
}

#[async_trait]
impl Store for InfluxStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let url = format!("{}/ping", self.base_url);
        let resp = self.authed_request(reqwest::Method::GET, &url).send().await?;
        Self::handle_error_status(resp).await?;
        Ok(())
    }

    async fn insert_measurements(&self, rows: &[Measurement]) -> Result<(), StoreError> {
        self.write(line_protocol::measurements(rows)?).await
    }

    async fn query_measurements(
        &self,
        range: &TimeRange,
        window: Option<Duration>,
    ) -> Result<Vec<Measurement>, StoreError> {
        let mut flux = self.from_range(
            MEASUREMENT,
            &format_timestamp(&range.start),
            Some(&exclusive_stop(&range.stop)),
        );
        if let Some(window) = window {
            flux.push_str(&format!(
                "\n  |> aggregateWindow(every: {}s, fn: mean, createEmpty: false)",
                window.as_secs().max(1)
            ));
        }
        flux.push_str("\n  |> map(fn: (r) => ({ r with _value: int(v: r._value) }))");
        flux.push_str("\n  |> keep(columns: [\"_time\", \"_field\", \"_value\"])");

        let records = self.query(&flux).await?;
        measurements_from_records(&records)
    }

    async fn latest_measurement(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let flux = format!(
            "{}\n  |> last()\n  |> keep(columns: [\"_time\", \"_field\"])",
            self.from_range(MEASUREMENT, EPOCH, None)
        );
        let records = self.query(&flux).await?;

        let mut latest = None;
        for record in &records {
            let ts = time_column(record)?;
            latest = latest.max(Some(ts));
        }
        Ok(latest)
    }

    async fn delete_measurements(&self, range: &TimeRange) -> Result<(), StoreError> {
        let predicate = format!("_measurement={}", predicate_string(MEASUREMENT));
        self.delete(range.start, range.stop, &predicate).await
    }

    async fn insert_logs(&self, rows: &[LogEntry]) -> Result<(), StoreError> {
        self.write(line_protocol::logs(rows)?).await
    }

    async fn query_logs(&self, range: &TimeRange) -> Result<Vec<LogEntry>, StoreError> {
        let flux = format!(
            "{}\n  |> filter(fn: (r) => r._field == \"message\")\n  |> group()\n  |> sort(columns: [\"_time\"])\n  |> keep(columns: [\"_time\", \"level\", \"_value\"])",
            self.from_range(
                LOGS,
                &format_timestamp(&range.start),
                Some(&exclusive_stop(&range.stop)),
            )
        );

        let records = self.query(&flux).await?;
        records
            .iter()
            .map(|record| -> Result<LogEntry, StoreError> {
                let level: LogLevel = column(record, "level")?
                    .parse()
                    .map_err(|e: UnknownVariant| StoreError::InvalidResponse(e.to_string()))?;
                Ok(LogEntry {
                    timestamp: time_column(record)?,
                    message: column(record, "_value")?.to_string(),
                    level,
                })
            })
            .collect()
    }

    async fn delete_logs(&self, range: &TimeRange) -> Result<(), StoreError> {
        let predicate = format!("_measurement={}", predicate_string(LOGS));
        self.delete(range.start, range.stop, &predicate).await
    }

    async fn insert_settings(
        &self,
        settings: &Settings,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.write(line_protocol::settings(settings, &at)?).await
    }

    async fn query_settings(&self, since: Option<DateTime<Utc>>) -> Result<Settings, StoreError> {
        let start = since
            .map(|s| format_precise(&s))
            .unwrap_or_else(|| EPOCH.to_string());
        let flux = format!(
            "{}\n  |> last()\n  |> keep(columns: [\"_time\", \"_field\", \"_value\"])",
            self.from_range(SETTINGS, &start, None)
        );

        let records = self.query(&flux).await?;
        let mut settings = Settings::new();
        for record in &records {
            let Ok(key) = column(record, "_field")?.parse::<SettingKey>() else {
                continue;
            };
            let value: serde_json::Value = serde_json::from_str(column(record, "_value")?)?;
            settings.insert(key, value);
        }
        Ok(settings)
    }

    async fn delete_settings(&self, range: &TimeRange) -> Result<(), StoreError> {
        let predicate = format!("_measurement={}", predicate_string(SETTINGS));
        self.delete(range.start, range.stop, &predicate).await
    }

    async fn upsert_user(&self, user: &User) -> Result<(), StoreError> {
        self.write(line_protocol::user(user, &Utc::now())?).await
    }

    async fn get_user(&self, username: &str) -> Result<Option<User>, StoreError> {
        let users = self.query_users(Some(username)).await?;
        Ok(users.into_iter().next())
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        self.query_users(None).await
    }

    async fn delete_user(&self, username: &str) -> Result<(), StoreError> {
        let predicate = format!(
            "_measurement={} AND username={}",
            predicate_string(USERS),
            predicate_string(username)
        );
        self.delete_all(&predicate).await
    }

    async fn upsert_device(&self, device: &Device) -> Result<(), StoreError> {
        self.write(line_protocol::device(device, &Utc::now())?).await
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        let devices = self.query_devices(Some(device_id)).await?;
        Ok(devices.into_iter().next())
    }

    async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        self.query_devices(None).await
    }

    async fn delete_device(&self, device_id: &str) -> Result<(), StoreError> {
        let predicate = format!(
            "_measurement={} AND device_id={}",
            predicate_string(DEVICES),
            predicate_string(device_id)
        );
        self.delete_all(&predicate).await
    }
}

impl InfluxStore {
    /// Latest field values per registry id
    async fn query_registry(
        &self,
        measurement: &str,
        id_tag: &str,
        id: Option<&str>,
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>, StoreError> {
        let mut flux = self.from_range(measurement, EPOCH, None);
        if let Some(id) = id {
            flux.push_str(&format!(
                "\n  |> filter(fn: (r) => r.{id_tag} == {})",
                flux_string(id)
            ));
        }
        flux.push_str(&format!(
            "\n  |> last()\n  |> keep(columns: [\"{id_tag}\", \"_field\", \"_value\"])"
        ));

        let records = self.query(&flux).await?;
        let mut entries: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for record in &records {
            let id = column(record, id_tag)?.to_string();
            let field = column(record, "_field")?.to_string();
            let value = column(record, "_value")?.to_string();
            entries.entry(id).or_default().insert(field, value);
        }
        Ok(entries)
    }

    async fn query_users(&self, username: Option<&str>) -> Result<Vec<User>, StoreError> {
        let entries = self.query_registry(USERS, "username", username).await?;
        entries
            .into_iter()
            .filter_map(|(username, mut fields)| {
                let token = fields.remove("token")?;
                Some((username, fields.remove("group"), token))
            })
            .map(|(username, group, token)| -> Result<User, StoreError> {
                let group = group
                    .as_deref()
                    .unwrap_or("user")
                    .parse::<Group>()
                    .map_err(|e| StoreError::InvalidResponse(e.to_string()))?;
                Ok(User {
                    username,
                    group,
                    token,
                })
            })
            .collect()
    }

    async fn query_devices(&self, device_id: Option<&str>) -> Result<Vec<Device>, StoreError> {
        let entries = self.query_registry(DEVICES, "device_id", device_id).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(device_id, mut fields)| {
                Some(Device {
                    device_id,
                    token: fields.remove("token")?,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_store_creation() {
        let config = DatabaseConfig {
            host: "http://localhost/".to_string(),
            ..Default::default()
        };
        let store = InfluxStore::new(&config).unwrap();
        assert_eq!(store.base_url(), "http://localhost:8086");
    }

    #[test]
    fn test_flux_quoting() {
        assert_eq!(flux_string(r#"a"b\c"#), r#""a\"b\\c""#);
        assert_eq!(predicate_string(r#"a"b"#), r#""a\"b""#);
    }

    #[test]
    fn test_parse_csv_multiple_tables() {
        let body = ",result,table,_time,_field,_value\r\n\
            ,_result,0,2024-09-05T00:05:23Z,flow,0\r\n\
            ,_result,0,2024-09-05T00:05:24Z,flow,5\r\n\
            \r\n\
            ,result,table,_time,_field,_value\r\n\
            ,_result,1,2024-09-05T00:05:23Z,level,1402\r\n\
            ,_result,1,2024-09-05T00:05:24Z,level,1450\r\n\
            ,_result,2,2024-09-05T00:05:23Z,pressure,1379\r\n\
            ,_result,2,2024-09-05T00:05:24Z,pressure,1379\r\n";

        let records = parse_csv(body).unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(records[0]["_field"], "flow");
        assert!(!records[0].contains_key(""));

        let rows = measurements_from_records(&records).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].timestamp, Utc.with_ymd_and_hms(2024, 9, 5, 0, 5, 24).unwrap());
        assert_eq!((rows[1].flow, rows[1].pressure, rows[1].level), (5, 1379, 1450));
    }

    #[test]
    fn test_parse_csv_quoted_values() {
        let body = ",result,table,_time,level,_value\r\n\
            ,_result,0,2024-09-05T00:05:23Z,info,\"pump on, flow \"\"ok\"\"\"\r\n";
        let records = parse_csv(body).unwrap();
        assert_eq!(records[0]["_value"], "pump on, flow \"ok\"");
    }

    #[test]
    fn test_incomplete_rows_are_dropped() {
        let body = ",result,table,_time,_field,_value\r\n\
            ,_result,0,2024-09-05T00:05:23Z,flow,0\r\n";
        let records = parse_csv(body).unwrap();
        assert!(measurements_from_records(&records).unwrap().is_empty());
    }
}
