use crate::sync::SyncStats;
use crate::transmit::{PingPayload, Transmitter};
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

pub struct Heartbeat {
    transmitter: Transmitter,
    url: String,
    hostname: String,
    stats: Arc<SyncStats>,
}

impl Heartbeat {
    pub fn new(
        transmitter: Transmitter,
        url: String,
        hostname: String,
        stats: Arc<SyncStats>,
    ) -> Self {
        Self {
            transmitter,
            url,
            hostname,
            stats,
        }
    }

    pub async fn ping_once(&self) -> Result<()> {
        let now = Utc::now().timestamp();
        let payload = PingPayload::new(&self.hostname, now, self.stats.last_record_timestamp());
        self.transmitter
            .post(&self.url, &payload)
            .await
            .context("failed to write ping to API")?;
        tracing::info!(delta = payload.delta, "pinged server");
        Ok(())
    }

    /// Sleeps `interval` before every ping; the first failure ends the loop.
    pub async fn run(self, interval: Duration) -> Result<()> {
        tracing::info!(url = %self.url, "starting heartbeat pinger");
        loop {
            tokio::time::sleep(interval).await;
            self.ping_once().await?;
        }
    }
}

/// Runs the pinger when a ping URL is configured; otherwise logs and returns.
pub async fn run_optional(
    transmitter: Transmitter,
    url: Option<String>,
    hostname: String,
    stats: Arc<SyncStats>,
    interval: Duration,
) -> Result<()> {
    let Some(url) = url else {
        tracing::warn!("API_URL_PING not set; heartbeat disabled until restarted with it");
        return Ok(());
    };
    Heartbeat::new(transmitter, url, hostname, stats)
        .run(interval)
        .await
}
