// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Read-only HTTP surface — thin handlers over [`StorageReader`] (spec
//! §4.11). Grounded in the teacher's `api.rs` router/state shape, with the
//! HLS/live-playback and camera-management routes dropped: this codebase's
//! read contract is range export, key-frame stills, segment coverage, and
//! status, not packaging into a playable container.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::collaborators::{FrameDecoder, ImageEncoder};
use crate::config::CameraConfig;
use crate::keeper::StreamKeeper;
use crate::storage::reader::StorageReader;
use crate::storage::MediaType;

/// Shared state passed to every handler.
pub struct AppState {
    pub keeper: Arc<StreamKeeper>,
    pub encoder: Arc<dyn ImageEncoder>,
    pub decoder: Option<Arc<dyn FrameDecoder>>,
}

#[derive(Deserialize)]
struct RangeParams {
    camera: String,
    #[serde(default)]
    media: Option<String>,
    start: u64,
    end: u64,
}

#[derive(Deserialize)]
struct KeyParams {
    camera: String,
    media: String,
    ts: u64,
}

#[derive(Deserialize)]
struct SegmentsParams {
    camera: String,
    start: u64,
    end: u64,
    #[serde(default = "default_gap_ns")]
    gap_ns: u64,
}

fn default_gap_ns() -> u64 {
    10_000_000_000
}

#[derive(Serialize)]
struct CameraStatus {
    id: String,
    name: String,
    recording: bool,
    bytes_per_second: f64,
}

#[derive(Serialize)]
struct StatusResponse {
    cameras: Vec<CameraStatus>,
}

fn parse_media_type(s: Option<&str>) -> Result<MediaType, (StatusCode, String)> {
    match s.unwrap_or("all") {
        "video" => Ok(MediaType::Video),
        "audio" => Ok(MediaType::Audio),
        "all" => Ok(MediaType::All),
        other => Err((StatusCode::BAD_REQUEST, format!("unknown media type '{other}'"))),
    }
}

fn map_storage_err(e: crate::error::RevereError) -> (StatusCode, String) {
    use crate::error::RevereError::*;
    let status = match e {
        NotFound(_) => StatusCode::NOT_FOUND,
        InvalidArgument(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cameras = state
        .keeper
        .list_cameras()
        .into_iter()
        .map(|cam: CameraConfig| CameraStatus {
            recording: state.keeper.is_recording(&cam.id),
            bytes_per_second: state.keeper.bytes_per_second(&cam.id).unwrap_or(0.0),
            name: cam.name,
            id: cam.id,
        })
        .collect();
    Json(StatusResponse { cameras })
}

/// Range export: `query(media, start, end)` (spec §4.11).
async fn handle_export(State(state): State<Arc<AppState>>, Query(params): Query<RangeParams>) -> impl IntoResponse {
    let media = match parse_media_type(params.media.as_deref()) {
        Ok(m) => m,
        Err(e) => return e.into_response(),
    };
    let Some(store) = state.keeper.store_for(&params.camera) else {
        return (StatusCode::NOT_FOUND, format!("camera '{}' is not recording", params.camera)).into_response();
    };
    let reader = StorageReader::new(&store);
    match reader.query(media, params.start, params.end) {
        Ok(result) => Json(result).into_response(),
        Err(e) => map_storage_err(e).into_response(),
    }
}

/// Single key-frame still: `query_key(video, ts)` then decode + encode
/// (spec §4.11). Returns 501 if no decoder collaborator is wired in —
/// decoding the video codec itself is out of scope.
async fn handle_key(State(state): State<Arc<AppState>>, Query(params): Query<KeyParams>) -> impl IntoResponse {
    let media = match parse_media_type(Some(&params.media)) {
        Ok(MediaType::All) => return (StatusCode::BAD_REQUEST, "media must be video or audio".to_string()).into_response(),
        Ok(m) => m,
        Err(e) => return e.into_response(),
    };
    let Some(store) = state.keeper.store_for(&params.camera) else {
        return (StatusCode::NOT_FOUND, format!("camera '{}' is not recording", params.camera)).into_response();
    };
    let reader = StorageReader::new(&store);
    let frame = match reader.query_key(media, params.ts) {
        Ok(f) => f,
        Err(e) => return map_storage_err(e).into_response(),
    };

    let Some(decoder) = &state.decoder else {
        return (StatusCode::NOT_IMPLEMENTED, "no frame decoder configured".to_string()).into_response();
    };
    let (pixels, width, height, format) = match decoder.decode(&frame.data) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "frame decode failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    match state.encoder.encode(&pixels, width, height, format) {
        Ok(bytes) => ([(axum::http::header::CONTENT_TYPE, "image/jpeg")], bytes).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Segment coverage: `query_segments(start, end)` (spec §4.5.3, §4.11).
async fn handle_segments(State(state): State<Arc<AppState>>, Query(params): Query<SegmentsParams>) -> impl IntoResponse {
    let Some(store) = state.keeper.store_for(&params.camera) else {
        return (StatusCode::NOT_FOUND, format!("camera '{}' is not recording", params.camera)).into_response();
    };
    let reader = StorageReader::new(&store);
    match reader.query_segments(params.start, params.end, params.gap_ns) {
        Ok(segments) => Json(segments).into_response(),
        Err(e) => map_storage_err(e).into_response(),
    }
}

#[derive(Deserialize)]
struct MotionParams {
    camera: String,
    start: u64,
    end: u64,
}

/// Motion events: the same reader machinery over the camera's parallel
/// motion-event store (spec §4.11: "a parallel store of per-motion
/// records ... out of scope beyond the reader's capability to return
/// them").
async fn handle_motion(State(state): State<Arc<AppState>>, Query(params): Query<MotionParams>) -> impl IntoResponse {
    let Some(store) = state.keeper.motion_store_for(&params.camera) else {
        return (StatusCode::NOT_FOUND, format!("no motion store for camera '{}'", params.camera)).into_response();
    };
    let reader = StorageReader::new(&store);
    match reader.query(MediaType::Video, params.start, params.end) {
        Ok(result) => Json(result).into_response(),
        Err(e) => map_storage_err(e).into_response(),
    }
}

#[derive(Deserialize)]
struct PruneParams {
    camera: String,
}

#[derive(Serialize)]
struct PruneResponse {
    blocks_freed: usize,
}

/// Manual prune driver (spec §4.10); the writer also prunes on demand
/// when it runs out of free blocks, but an operator can trigger it too.
async fn handle_prune(State(state): State<Arc<AppState>>, Path(params): Path<PruneParams>) -> impl IntoResponse {
    let Some(store) = state.keeper.store_for(&params.camera) else {
        return (StatusCode::NOT_FOUND, format!("camera '{}' is not recording", params.camera)).into_response();
    };
    let retention_age_ns = state.keeper.retention_age_ns(&params.camera).unwrap_or(14 * 24 * 3600 * 1_000_000_000);
    let now_ns = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64;
    match crate::storage::writer::prune(&store, now_ns, retention_age_ns) {
        Ok(blocks_freed) => Json(PruneResponse { blocks_freed }).into_response(),
        Err(e) => map_storage_err(e).into_response(),
    }
}

async fn handle_list_cameras(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.keeper.list_cameras())
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(handle_status))
        .route("/api/cameras", get(handle_list_cameras))
        .route("/api/export", get(handle_export))
        .route("/api/key", get(handle_key))
        .route("/api/segments", get(handle_segments))
        .route("/api/motion", get(handle_motion))
        .route("/api/cameras/{camera}/prune", axum::routing::post(handle_prune))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server. Mirrors the teacher's `start_server` shape.
pub async fn start_server(state: Arc<AppState>, port: u16) {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{port}");
    info!(port, "HTTP API listening on http://{addr}");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "Failed to bind HTTP server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "HTTP server error");
    }
}
