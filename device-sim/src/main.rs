use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use common::{endpoints, AckPayload, OtaSection, StatusPayload, UpdateManifest};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

const FIRMWARE_VERSION: &str = "1.4.0";
const REMOTE_VERSION: &str = "1.5.0";
const REMOTE_IMAGE_BYTES: u64 = 1_441_792;
const FETCH_STEP_MS: u64 = 250;
const FETCH_STEPS: u64 = 24;

#[derive(Clone)]
struct AppState {
    ota: Arc<RwLock<DeviceOta>>,
}

/// In-memory stand-in for the device's OTA engine. Bytes go nowhere;
/// only the bookkeeping the portal observes is simulated.
struct DeviceOta {
    busy: bool,
    task_active: bool,
    message: String,
    last_error: String,
    needs_reboot: bool,
    bytes_written: u64,
    bytes_total: u64,
    /// Bumped on every cancel so a stale fetch task notices and stops
    generation: u64,
    session: Option<UploadSession>,
}

struct UploadSession {
    expected: Option<ExpectedPart>,
}

struct ExpectedPart {
    path: String,
    size: u64,
    received: u64,
}

impl DeviceOta {
    fn new() -> Self {
        DeviceOta {
            busy: false,
            task_active: false,
            message: String::new(),
            last_error: String::new(),
            needs_reboot: false,
            bytes_written: 0,
            bytes_total: 0,
            generation: 0,
            session: None,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter("device_sim=debug,tower_http=debug")
        .init();

    let state = AppState {
        ota: Arc::new(RwLock::new(DeviceOta::new())),
    };

    let app = Router::new()
        .route(endpoints::STATUS, get(ota_status))
        .route(endpoints::FETCH, post(ota_fetch))
        .route(endpoints::CANCEL, post(ota_cancel))
        .route(endpoints::UPLOAD_BEGIN, post(upload_begin))
        .route(endpoints::PART_BEGIN, post(part_begin))
        .route(endpoints::PART_CHUNK, post(part_chunk))
        .route(endpoints::PART_FINISH, post(part_finish))
        .route(endpoints::UPLOAD_FINISH, post(upload_finish))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
    info!("device simulator listening on http://0.0.0.0:8080");
    axum::serve(listener, app).await.unwrap();
}

fn ack_ok() -> (StatusCode, Json<AckPayload>) {
    (StatusCode::OK, Json(AckPayload::default()))
}

fn ack_err(code: StatusCode, message: &str) -> (StatusCode, Json<AckPayload>) {
    (
        code,
        Json(AckPayload {
            error: Some(message.to_string()),
        }),
    )
}

async fn ota_status(State(state): State<AppState>) -> Json<StatusPayload> {
    let ota = state.ota.read().await;
    Json(StatusPayload {
        ota: OtaSection {
            busy: ota.busy,
            task_active: ota.task_active,
            message: ota.message.clone(),
            last_error: ota.last_error.clone(),
            needs_reboot: ota.needs_reboot,
            bytes_written: ota.bytes_written,
            bytes_total: ota.bytes_total,
        },
        current_version: Some(FIRMWARE_VERSION.to_string()),
        latest_version: Some(REMOTE_VERSION.to_string()),
        latest_error: None,
    })
}

/// Starts a simulated remote fetch: a background task walks
/// `bytesWritten` up to the image size, then stages the reboot.
async fn ota_fetch(State(state): State<AppState>) -> (StatusCode, Json<AckPayload>) {
    let generation = {
        let mut ota = state.ota.write().await;
        if ota.busy {
            return ack_err(StatusCode::CONFLICT, "OTA download already running.");
        }
        ota.busy = true;
        ota.task_active = true;
        ota.needs_reboot = false;
        ota.last_error.clear();
        ota.message = format!("Downloading {REMOTE_VERSION}…");
        ota.bytes_written = 0;
        ota.bytes_total = REMOTE_IMAGE_BYTES;
        ota.generation += 1;
        ota.generation
    };

    info!("remote fetch started ({} bytes)", REMOTE_IMAGE_BYTES);
    let ota = state.ota.clone();
    tokio::spawn(async move {
        for _ in 0..FETCH_STEPS {
            tokio::time::sleep(Duration::from_millis(FETCH_STEP_MS)).await;
            let mut ota = ota.write().await;
            if ota.generation != generation || !ota.busy {
                info!("remote fetch cancelled");
                return;
            }
            ota.bytes_written =
                (ota.bytes_written + REMOTE_IMAGE_BYTES / FETCH_STEPS).min(REMOTE_IMAGE_BYTES);
        }
        let mut ota = ota.write().await;
        if ota.generation != generation {
            return;
        }
        ota.busy = false;
        ota.task_active = false;
        ota.needs_reboot = true;
        ota.message = "Update staged; reboot to apply.".to_string();
        info!("remote fetch finished");
    });

    ack_ok()
}

async fn ota_cancel(State(state): State<AppState>) -> (StatusCode, Json<AckPayload>) {
    let mut ota = state.ota.write().await;
    if !ota.busy {
        return ack_err(StatusCode::CONFLICT, "OTA session is not active.");
    }
    info!("OTA cancelled");
    ota.busy = false;
    ota.task_active = false;
    ota.session = None;
    ota.generation += 1;
    ota.bytes_written = 0;
    ota.bytes_total = 0;
    ota.message = "Update cancelled.".to_string();
    ack_ok()
}

/// Body is the raw manifest text, exactly as bundled in the ZIP.
async fn upload_begin(
    State(state): State<AppState>,
    body: String,
) -> (StatusCode, Json<AckPayload>) {
    let mut ota = state.ota.write().await;
    if ota.busy {
        return ack_err(StatusCode::CONFLICT, "Remote OTA already running.");
    }
    if body.trim().is_empty() {
        return ack_err(StatusCode::BAD_REQUEST, "Manifest payload missing.");
    }

    let manifest: UpdateManifest = match serde_json::from_str(&body) {
        Ok(manifest) => manifest,
        Err(err) => {
            warn!("manifest rejected: {err}");
            return ack_err(StatusCode::BAD_REQUEST, "Manifest rejected.");
        }
    };
    let has_parts = manifest
        .builds
        .first()
        .map(|build| !build.parts.is_empty())
        .unwrap_or(false);
    if !has_parts {
        return ack_err(StatusCode::BAD_REQUEST, "Manifest rejected.");
    }

    info!(
        "manual upload session opened ({} bytes expected)",
        manifest.total_bytes()
    );
    ota.busy = true;
    ota.task_active = false;
    ota.needs_reboot = false;
    ota.last_error.clear();
    ota.bytes_written = 0;
    ota.bytes_total = manifest.total_bytes();
    ota.session = Some(UploadSession { expected: None });
    ota.message = "Manifest uploaded; awaiting binaries…".to_string();
    ack_ok()
}

#[derive(Deserialize)]
struct PartBeginQuery {
    path: String,
    offset: u64,
    size: u64,
}

async fn part_begin(
    State(state): State<AppState>,
    Query(query): Query<PartBeginQuery>,
) -> (StatusCode, Json<AckPayload>) {
    let mut ota = state.ota.write().await;
    let Some(session) = ota.session.as_mut() else {
        return ack_err(StatusCode::CONFLICT, "OTA session is not active.");
    };
    info!(
        "part begin: {} at offset {:#x} ({} bytes)",
        query.path, query.offset, query.size
    );
    session.expected = Some(ExpectedPart {
        path: query.path.clone(),
        size: query.size,
        received: 0,
    });
    ota.message = format!("Receiving {}…", query.path);
    ack_ok()
}

async fn part_chunk(
    State(state): State<AppState>,
    body: String,
) -> (StatusCode, Json<AckPayload>) {
    let mut ota = state.ota.write().await;
    let Some(session) = ota.session.as_mut() else {
        return ack_err(StatusCode::CONFLICT, "OTA session is not active.");
    };
    let Some(expected) = session.expected.as_mut() else {
        return ack_err(StatusCode::CONFLICT, "No part transfer in progress.");
    };

    let chunk = match STANDARD.decode(body.trim()) {
        Ok(chunk) => chunk,
        Err(err) => {
            return ack_err(
                StatusCode::BAD_REQUEST,
                &format!("Base64 decode failed: {err}"),
            );
        }
    };
    expected.received += chunk.len() as u64;
    if expected.received > expected.size {
        let path = expected.path.clone();
        warn!("part overflow on {path}");
        return ack_err(StatusCode::BAD_REQUEST, "Part overflow.");
    }
    ota.bytes_written += chunk.len() as u64;
    ack_ok()
}

#[derive(Deserialize)]
struct PartFinishQuery {
    path: String,
}

async fn part_finish(
    State(state): State<AppState>,
    Query(query): Query<PartFinishQuery>,
) -> (StatusCode, Json<AckPayload>) {
    let mut ota = state.ota.write().await;
    let Some(session) = ota.session.as_mut() else {
        return ack_err(StatusCode::CONFLICT, "OTA session is not active.");
    };
    let Some(expected) = session.expected.take() else {
        return ack_err(StatusCode::CONFLICT, "No part transfer in progress.");
    };
    if expected.path != query.path {
        return ack_err(StatusCode::BAD_REQUEST, "Unexpected part finish.");
    }
    if expected.received != expected.size {
        warn!(
            "part {} ended short: {} of {} bytes",
            expected.path, expected.received, expected.size
        );
        return ack_err(StatusCode::BAD_REQUEST, "Part size mismatch.");
    }
    info!("part finished: {}", expected.path);
    ack_ok()
}

async fn upload_finish(State(state): State<AppState>) -> (StatusCode, Json<AckPayload>) {
    let mut ota = state.ota.write().await;
    if ota.session.take().is_none() {
        return ack_err(StatusCode::CONFLICT, "OTA session is not active.");
    }
    info!("manual upload complete; staging reboot");
    ota.busy = false;
    ota.task_active = false;
    ota.needs_reboot = true;
    ota.message = "Update staged; reboot to apply.".to_string();
    ack_ok()
}
