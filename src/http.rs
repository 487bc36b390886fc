use crate::store::{RecordStore, StoreCounts};
use crate::sync::{SyncSnapshot, SyncStats};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    pub store: RecordStore,
    pub stats: Arc<SyncStats>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub records: StoreCounts,
    pub sync: SyncSnapshot,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(
    State(state): State<HttpState>,
) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    let records = state
        .store
        .counts()
        .await
        .map_err(|err| (StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;
    Ok(Json(StatusResponse {
        records,
        sync: state.stats.snapshot(),
    }))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .with_state(state)
}

pub async fn serve(bind: String, state: HttpState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind status endpoint on {bind}"))?;
    tracing::info!(bind = %bind, "status endpoint listening");
    axum::serve(listener, router(state))
        .await
        .context("status endpoint stopped")
}
