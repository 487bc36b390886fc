use crate::record::RecordForPayload;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::io::Write;
use std::time::Duration;
use thiserror::Error;

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("failed to encode payload: {0}")]
    Encode(String),
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("POST to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("API at {url} answered {status} (expected 201 Created): {body}")]
    UnexpectedStatus {
        url: String,
        status: StatusCode,
        body: String,
    },
}

/// Body of a batch POST.
#[derive(Debug, Serialize)]
pub struct RequestPayload<'a> {
    #[serde(rename = "timestamp_utc_transmitted")]
    pub timestamp: i64,
    pub hostname: &'a str,
    pub data: &'a [RecordForPayload],
}

/// Body of a liveness ping.
#[derive(Debug, Serialize)]
pub struct PingPayload<'a> {
    pub hostname: &'a str,
    #[serde(rename = "timestamp_utc")]
    pub timestamp: i64,
    #[serde(rename = "timestamp_utc_recorded_last")]
    pub last_record_timestamp: i64,
    #[serde(rename = "delta_ping_last_record_seconds")]
    pub delta: i64,
}

impl<'a> PingPayload<'a> {
    pub fn new(hostname: &'a str, now: i64, last_record_timestamp: i64) -> Self {
        Self {
            hostname,
            timestamp: now,
            last_record_timestamp,
            delta: now - last_record_timestamp,
        }
    }
}

pub fn gzip_json<T: Serialize>(value: &T) -> Result<Vec<u8>, TransmitError> {
    let json = serde_json::to_vec(value).map_err(|err| TransmitError::Encode(err.to_string()))?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|err| TransmitError::Encode(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| TransmitError::Encode(err.to_string()))
}

/// Posts gzip-compressed JSON bodies and accepts nothing but 201 Created.
#[derive(Clone)]
pub struct Transmitter {
    client: Client,
}

impl Transmitter {
    pub fn new(timeout: Duration) -> Result<Self, TransmitError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TransmitError::Client)?;
        Ok(Self { client })
    }

    pub async fn post<T: Serialize>(&self, url: &str, value: &T) -> Result<(), TransmitError> {
        let body = gzip_json(value)?;
        tracing::debug!(url, bytes = body.len(), "posting gzip payload");

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(CONTENT_ENCODING, "gzip")
            .body(body)
            .send()
            .await
            .map_err(|source| TransmitError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response
                .text()
                .await
                .unwrap_or_else(|err| format!("<unreadable body: {err}>"));
            return Err(TransmitError::UnexpectedStatus {
                url: url.to_string(),
                status,
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::post;
    use axum::Router;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    pub(crate) struct Captured {
        pub(crate) content_type: Option<String>,
        pub(crate) content_encoding: Option<String>,
        pub(crate) body: serde_json::Value,
    }

    pub(crate) type Captures = Arc<Mutex<Vec<Captured>>>;

    pub(crate) fn gunzip_json(bytes: &[u8]) -> serde_json::Value {
        let mut decoder = GzDecoder::new(bytes);
        let mut raw = String::new();
        decoder.read_to_string(&mut raw).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    /// Spawns an API stub on an ephemeral port that records each request and
    /// answers with `status`.
    pub(crate) async fn spawn_api(status: u16) -> (String, Captures) {
        let captures: Captures = Arc::new(Mutex::new(Vec::new()));
        let sink = captures.clone();
        let app = Router::new().route(
            "/ingest",
            post(move |headers: HeaderMap, body: Bytes| {
                let sink = sink.clone();
                async move {
                    let header = |name: &str| {
                        headers
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string)
                    };
                    sink.lock().unwrap().push(Captured {
                        content_type: header("content-type"),
                        content_encoding: header("content-encoding"),
                        body: gunzip_json(&body),
                    });
                    (AxumStatus::from_u16(status).unwrap(), "stub says no")
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://{addr}/ingest"), captures)
    }

    fn wire(timestamp: i64, payload: &str) -> RecordForPayload {
        RecordForPayload {
            timestamp,
            payload: payload.to_string(),
            serial_port: "/dev/ttyS0".to_string(),
        }
    }

    #[test]
    fn gzip_json_round_trips_envelope() {
        let data = vec![wire(1, "a")];
        let payload = RequestPayload {
            timestamp: 99,
            hostname: "gw",
            data: &data,
        };
        let decoded = gunzip_json(&gzip_json(&payload).unwrap());
        assert_eq!(
            decoded,
            serde_json::json!({
                "timestamp_utc_transmitted": 99,
                "hostname": "gw",
                "data": [{"timestamp_utc_recorded": 1, "payload": "a", "serialPort": "/dev/ttyS0"}],
            })
        );
    }

    #[test]
    fn ping_payload_computes_delta() {
        let ping = PingPayload::new("gw", 1_000, 940);
        let json = serde_json::to_value(&ping).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "hostname": "gw",
                "timestamp_utc": 1000,
                "timestamp_utc_recorded_last": 940,
                "delta_ping_last_record_seconds": 60,
            })
        );
    }

    #[tokio::test]
    async fn post_accepts_201_and_sends_gzip_headers() {
        let (url, captures) = spawn_api(201).await;
        let transmitter = Transmitter::new(Duration::from_secs(5)).unwrap();
        let data = vec![wire(5, "x"), wire(6, "y")];
        let payload = RequestPayload {
            timestamp: 7,
            hostname: "gw",
            data: &data,
        };

        transmitter.post(&url, &payload).await.unwrap();

        let captured = captures.lock().unwrap().clone();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].content_type.as_deref(), Some(JSON_CONTENT_TYPE));
        assert_eq!(captured[0].content_encoding.as_deref(), Some("gzip"));
        assert_eq!(captured[0].body["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn post_rejects_any_other_status() {
        for status in [200u16, 400, 500] {
            let (url, _captures) = spawn_api(status).await;
            let transmitter = Transmitter::new(Duration::from_secs(5)).unwrap();
            let err = transmitter
                .post(&url, &PingPayload::new("gw", 2, 1))
                .await
                .unwrap_err();
            match err {
                TransmitError::UnexpectedStatus {
                    status: got, body, ..
                } => {
                    assert_eq!(got.as_u16(), status);
                    assert_eq!(body, "stub says no");
                }
                other => panic!("unexpected error {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn post_reports_connection_failures() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transmitter = Transmitter::new(Duration::from_secs(2)).unwrap();
        let err = transmitter
            .post(&format!("http://{addr}/ingest"), &PingPayload::new("gw", 2, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransmitError::Request { .. }));
    }
}
