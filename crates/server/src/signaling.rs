//! HTTP signaling surface
//!
//! A small JSON REST API: list, add and remove upstream streams,
//! and negotiate a subscriber session with `POST /play`. Every
//! response carries permissive CORS headers so browser pages can
//! talk to it directly.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::media::{MediaSourceManager, StreamInfo};
use crate::rtc::{DtlsContext, TransportConfig, TransportManager, WebrtcTransport};
use crate::Result;

/// Shared handles every request handler needs.
#[derive(Clone)]
pub struct AppState {
    pub sources: Arc<MediaSourceManager>,
    pub transports: Arc<TransportManager>,
    pub dtls: Arc<DtlsContext>,
    pub transport_config: Arc<TransportConfig>,
}

/// Build the signaling router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/streams", get(list_streams).post(add_stream))
        .route("/streams/:id", axum::routing::delete(remove_stream))
        .route("/play", post(play))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "signaling server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn list_streams(State(state): State<AppState>) -> Json<Vec<StreamInfo>> {
    Json(state.sources.list())
}

#[derive(Debug, Deserialize)]
struct AddStreamRequest {
    url: String,
}

async fn add_stream(
    State(state): State<AppState>,
    Json(request): Json<AddStreamRequest>,
) -> Json<Value> {
    let sources = state.sources.clone();
    // opening a source connects upstream, which blocks
    let result = tokio::task::spawn_blocking(move || sources.add(&request.url)).await;
    match result {
        Ok(Ok(id)) => Json(json!({ "error": false, "id": id })),
        Ok(Err(e)) => {
            error!("failed to add stream: {}", e);
            Json(json!({ "error": true }))
        }
        Err(e) => {
            error!("add stream task failed: {}", e);
            Json(json!({ "error": true }))
        }
    }
}

async fn remove_stream(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    state.sources.remove(&id);
    Json(json!({ "error": false }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayRequest {
    stream_id: String,
    offer: String,
}

async fn play(State(state): State<AppState>, Json(request): Json<PlayRequest>) -> Json<Value> {
    let Some(source) = state.sources.query(&request.stream_id) else {
        warn!(stream_id = %request.stream_id, "play for unknown stream");
        return Json(json!({ "error": true }));
    };

    match WebrtcTransport::start(
        request.stream_id.clone(),
        &request.offer,
        &state.dtls,
        &state.transport_config,
        state.transports.command_sender(),
    )
    .await
    {
        Ok(transport) => {
            source.register_observer(transport.id(), transport.observer());
            state.transports.add(transport.clone()).await;
            Json(json!({ "error": false, "answer": transport.answer() }))
        }
        Err(e) => {
            error!("subscriber setup failed: {}", e);
            Json(json!({ "error": true }))
        }
    }
}
