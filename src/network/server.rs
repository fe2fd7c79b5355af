use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, DefaultBodyLimit, FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use crate::auth::{cleared_cookie, session_cookie, token_from_headers, SessionStore};
use crate::calibration::{
    snapshot::SnapshotFormat, AnnotationService, CalibrationPipeline, CalibrationPoints,
    LabelFont, LockRegistry,
};
use crate::config::Settings;
use crate::directory::{Device, DirectoryService, HttpDirectory, LoginCheck};
use crate::error::{AppError, PipelineError};
use crate::network::cors::{OpenCorsLayer, NO_CACHE};
use crate::network::relay::{StreamRelay, FLV_CONTENT_TYPE};
use crate::storage::StorageLayout;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: CalibrationPipeline,
    pub relay: StreamRelay,
    pub sessions: SessionStore,
    pub directory: DirectoryService,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn from_settings(settings: &Settings) -> Result<Self, AppError> {
        let annotation = AnnotationService::new(
            LabelFont::load(settings.label_font_path.as_deref()),
            settings.jpeg_quality,
        );
        let pipeline = CalibrationPipeline::new(
            StorageLayout::new(&settings.data_root),
            LockRegistry::new(),
            annotation,
            settings.default_sid.clone(),
        );
        let remote = HttpDirectory::new(
            settings.directory_base_url.clone(),
            settings.directory_timeout(),
        )?;
        let directory = DirectoryService::new(
            Arc::new(remote),
            settings.directory_admin_username.clone(),
            settings.directory_shared_password.clone(),
            settings.directory_cache_ttl(),
        );
        Ok(Self {
            pipeline,
            relay: StreamRelay::new(settings)?,
            sessions: SessionStore::new(settings.session_ttl()),
            directory,
            max_upload_bytes: settings.max_upload_bytes,
        })
    }
}

pub fn router(state: AppState) -> Router {
    let upload_limit = DefaultBodyLimit::max(state.max_upload_bytes);
    Router::new()
        .route("/stream/relay", get(stream_relay))
        .route("/stream/flv", get(stream_relay))
        .route("/snapshot", post(upload_snapshot).layer(upload_limit))
        .route(
            "/api/upload-snapshot",
            post(upload_snapshot).layer(upload_limit),
        )
        .route("/calibrate", get(locate_snapshot))
        .route("/calib/:sid/snapshots/:file", get(serve_snapshot))
        .route("/calibration", post(save_calibration))
        .route("/api/save-calibration", post(save_calibration))
        .route("/api/field-calibration", get(field_calibration))
        .route("/api/login", post(login))
        .route("/logout", get(logout))
        .route("/api/devices", get(list_devices))
        .layer(OpenCorsLayer)
        .with_state(state)
}

pub struct Server {
    bind_addr: String,
    state: AppState,
}

impl Server {
    pub fn new(bind_addr: impl Into<String>, state: AppState) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            state,
        }
    }

    pub async fn start(self) -> Result<(), AppError> {
        info!("Starting HTTP server on {}", self.bind_addr);
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| AppError::Bind(e, self.bind_addr.clone()))?;
        axum::serve(listener, router(self.state))
            .await
            .map_err(AppError::Serve)
    }
}

#[derive(Serialize)]
struct Failure {
    ok: bool,
    error: String,
}

fn failure(error: impl Into<String>) -> Response {
    Json(Failure {
        ok: false,
        error: error.into(),
    })
    .into_response()
}

fn pipeline_failure(operation: &str, e: PipelineError) -> Response {
    match e {
        PipelineError::Calibration(e) => {
            error!("{} rejected: {}", operation, e);
            failure(e.to_string())
        }
        PipelineError::Storage(e) => {
            error!("{} storage fault: {}", operation, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(Failure {
                    ok: false,
                    error: "internal error".into(),
                }),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct RelayQuery {
    url: String,
}

async fn stream_relay(
    State(state): State<AppState>,
    Query(query): Query<RelayQuery>,
) -> Response {
    let upstream = match state.relay.open(&query.url).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("Relay to {} refused: {}", query.url, e);
            return (StatusCode::BAD_GATEWAY, [(header::CACHE_CONTROL, NO_CACHE)])
                .into_response();
        }
    };
    let chunks = state.relay.spawn_pump(upstream);
    let body = Body::from_stream(ReceiverStream::new(chunks).map(Ok::<_, Infallible>));
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, FLV_CONTENT_TYPE),
            (header::CACHE_CONTROL, NO_CACHE),
        ],
        body,
    )
        .into_response()
}

#[derive(Deserialize)]
struct SnapshotIn {
    #[serde(rename = "imageData")]
    image_data: String,
    #[serde(default)]
    sid: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotOut {
    ok: bool,
    id: String,
    locator_path: String,
}

async fn upload_snapshot(
    State(state): State<AppState>,
    payload: Result<Json<SnapshotIn>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return failure(rejection.body_text()),
    };
    let sid = state.pipeline.sid(payload.sid.as_deref());
    match state.pipeline.upload_snapshot(&sid, &payload.image_data).await {
        Ok(uploaded) => Json(SnapshotOut {
            ok: true,
            id: uploaded.id,
            locator_path: uploaded.locator_path,
        })
        .into_response(),
        Err(e) => pipeline_failure("upload_snapshot", e),
    }
}

#[derive(Deserialize)]
struct LocateQuery {
    id: String,
    #[serde(default)]
    sid: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LocateOut {
    ok: bool,
    id: String,
    sid: String,
    locator_path: String,
}

async fn locate_snapshot(
    State(state): State<AppState>,
    Query(query): Query<LocateQuery>,
) -> Response {
    let sid = state.pipeline.sid(query.sid.as_deref());
    let layout = state.pipeline.layout();
    let Some(path) = layout.find_frame(&sid, &query.id).await else {
        return failure("snapshot not found");
    };
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        return failure("snapshot not found");
    };
    Json(LocateOut {
        ok: true,
        locator_path: layout.locator_path(&sid, file_name),
        id: query.id,
        sid: sid.to_string(),
    })
    .into_response()
}

async fn serve_snapshot(
    State(state): State<AppState>,
    Path((sid, file)): Path<(String, String)>,
) -> Response {
    let sid = state.pipeline.sid(Some(&sid));
    match state.pipeline.layout().read_frame_file(&sid, &file).await {
        Ok(Some(bytes)) => {
            let ext = file.rsplit('.').next().unwrap_or_default();
            (
                [(header::CONTENT_TYPE, SnapshotFormat::content_type(ext))],
                bytes,
            )
                .into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("Failed to serve {}: {}", file, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
struct SaveCalibrationIn {
    id: String,
    #[serde(default)]
    zoomf: String,
    #[serde(default, alias = "calibration_points")]
    points: Vec<Value>,
    #[serde(default)]
    sid: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveCalibrationOut {
    ok: bool,
    id: String,
    points_echo: CalibrationPoints,
    annotated_image_inline: String,
    zoomf: String,
}

async fn save_calibration(
    State(state): State<AppState>,
    payload: Result<Json<SaveCalibrationIn>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return failure(rejection.body_text()),
    };
    let sid = state.pipeline.sid(payload.sid.as_deref());
    let saved = state
        .pipeline
        .save_calibration(&sid, &payload.id, &payload.points, &payload.zoomf)
        .await;
    match saved {
        Ok(saved) => Json(SaveCalibrationOut {
            ok: true,
            id: saved.id,
            points_echo: saved.points,
            annotated_image_inline: saved.annotated_data_url,
            zoomf: saved.zoomf,
        })
        .into_response(),
        Err(e) => pipeline_failure("save_calibration", e),
    }
}

async fn field_calibration() -> Json<Value> {
    Json(json!({
        "field": {
            "name": "football pitch",
            "type": "eleven-a-side",
            "dimensions": {"length": 105, "width": 68, "unit": "m"}
        },
        "status": "calibrated"
    }))
}

#[derive(Deserialize)]
struct LoginIn {
    username: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginIn>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return failure(rejection.body_text()),
    };
    match state
        .directory
        .verify_login(&payload.username, &payload.password)
        .await
    {
        LoginCheck::UnknownUser => failure("unknown user"),
        LoginCheck::WrongPassword => failure("wrong password"),
        LoginCheck::Accepted => {
            let token = state.sessions.create(&payload.username).await;
            info!("User {} logged in", payload.username);
            (
                [(
                    header::SET_COOKIE,
                    session_cookie(&token, state.sessions.ttl()),
                )],
                Json(json!({"ok": true, "user": payload.username})),
            )
                .into_response()
        }
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = token_from_headers(&headers) {
        state.sessions.remove(&token).await;
    }
    (
        [(header::SET_COOKIE, cleared_cookie())],
        Json(json!({"ok": true})),
    )
        .into_response()
}

/// Username of the session behind the request's auth cookie.
pub struct CurrentUser(pub String);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let unauthorized = || {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"ok": false, "error": "unauthorized"})),
            )
                .into_response()
        };
        let token = token_from_headers(&parts.headers).ok_or_else(unauthorized)?;
        let username = state
            .sessions
            .touch(&token)
            .await
            .ok_or_else(unauthorized)?;
        Ok(CurrentUser(username))
    }
}

#[derive(Serialize)]
struct DevicesOut {
    ok: bool,
    devices: Vec<Device>,
}

async fn list_devices(
    State(state): State<AppState>,
    CurrentUser(username): CurrentUser,
) -> Response {
    let devices = state
        .directory
        .devices_for_user(&username)
        .await
        .unwrap_or_else(|e| {
            warn!("Failed to fetch devices for {}: {}", username, e);
            Vec::new()
        });
    (
        [(header::CACHE_CONTROL, NO_CACHE)],
        Json(DevicesOut { ok: true, devices }),
    )
        .into_response()
}
