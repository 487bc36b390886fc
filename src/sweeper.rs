use crate::store::RecordStore;
use anyhow::Result;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Purges synced records right away and then every `interval`.
pub async fn run(store: RecordStore, interval: Duration) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        sweep(&store).await?;
    }
}

pub async fn sweep(store: &RecordStore) -> Result<u64> {
    let deleted = store.delete_synced().await?;
    tracing::info!(deleted, "deleted synced records");
    Ok(deleted)
}
