use serde::Serialize;
use std::collections::HashSet;

/// A buffered serial line as stored in the `records` table.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Record {
    pub id: i64,
    pub timestamp: i64,
    pub payload: String,
    pub serial_port: String,
    pub synced: bool,
}

/// A record before it has been assigned an id.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub timestamp: i64,
    pub payload: String,
    pub serial_port: String,
}

impl NewRecord {
    pub fn from_frame(timestamp: i64, frame: &[u8], serial_port: &str) -> Self {
        Self {
            timestamp,
            payload: format_payload(&String::from_utf8_lossy(frame)),
            serial_port: serial_port.to_string(),
        }
    }
}

/// Wire form of a record inside the batch envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordForPayload {
    #[serde(rename = "timestamp_utc_recorded")]
    pub timestamp: i64,
    pub payload: String,
    #[serde(rename = "serialPort")]
    pub serial_port: String,
}

impl From<&Record> for RecordForPayload {
    fn from(record: &Record) -> Self {
        Self {
            timestamp: record.timestamp,
            payload: record.payload.clone(),
            serial_port: record.serial_port.clone(),
        }
    }
}

/// NUL bytes become commas and line breaks are dropped.
pub fn format_payload(raw: &str) -> String {
    raw.replace('\u{0}', ",").replace("\r\n", "").replace('\n', "")
}

/// Keeps the first record seen for each timestamp, preserving order.
pub fn dedup_by_timestamp(records: &[Record]) -> Vec<RecordForPayload> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .iter()
        .filter(|record| seen.insert(record.timestamp))
        .map(RecordForPayload::from)
        .collect()
}

pub fn max_timestamp(records: &[Record]) -> Option<i64> {
    records.iter().map(|record| record.timestamp).max()
}
