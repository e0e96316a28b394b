//! HTTP surface for the browser client: `/scan`, `/save`, plus a health check
//! and a read-only ledger view.

use std::net::SocketAddr;

use axum::extract::{DefaultBodyLimit, Query, Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::validate_origin;
use crate::error::{ConfigError, ScanError};
use crate::models::{Frame, LedgerEntry, Prediction};
use crate::service::{MarkScanner, NoDetection, SaveOutcome, ScanOutcome};

pub const HEALTH_STATUS: &str = "Mark Scanner API is running";

#[derive(Clone)]
pub struct AppState {
    pub scanner: MarkScanner,
    pub default_path: String,
    pub allow_origin: HeaderValue,
}

impl AppState {
    pub fn new(
        scanner: MarkScanner,
        default_path: impl Into<String>,
        allow_origin: &str,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            scanner,
            default_path: default_path.into(),
            allow_origin: validate_origin(allow_origin)?,
        })
    }

    fn ledger_path(&self, requested: Option<String>) -> String {
        requested
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.default_path.clone())
    }
}

/// Body of `POST /scan` and `POST /save`.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameRequest {
    /// Base64 image, optionally as a `data:<mime>;base64,` URL.
    pub image_b64: String,
    #[serde(default)]
    pub excel_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerQuery {
    #[serde(default)]
    pub excel_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanResult {
    pub digit: u8,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bounds: [u32; 4],
    pub row: usize,
    pub column: usize,
}

impl From<&Prediction> for ScanResult {
    fn from(p: &Prediction) -> Self {
        Self {
            digit: p.digit,
            confidence: p.confidence,
            bounds: p.bounds.as_box(),
            row: p.position.row,
            column: p.position.column,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoDetectionBody {
    pub success: bool,
    pub message: &'static str,
    pub reason: &'static str,
}

impl From<&NoDetection> for NoDetectionBody {
    fn from(n: &NoDetection) -> Self {
        Self {
            success: false,
            message: n.message(),
            reason: n.reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScanResponse {
    Detected {
        success: bool,
        count: usize,
        results: Vec<ScanResult>,
    },
    NoDetection(NoDetectionBody),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SaveResponse {
    Saved {
        success: bool,
        marks: Vec<u8>,
        row_total: u32,
        grand_total: u64,
        sequence_id: i64,
    },
    NoDetection(NoDetectionBody),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntryBody {
    pub sequence_id: i64,
    pub recorded_at: String,
    pub marks: Vec<u8>,
    pub row_total: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerResponse {
    pub success: bool,
    pub excel_path: String,
    pub grand_total: u64,
    pub entries: Vec<LedgerEntryBody>,
}

/// Request failures that are not "no digits detected".
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    /// Marks were recognized (possibly none, for reads) but storage failed.
    Persistence { marks: Vec<u8>, message: String },
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Persistence { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ScanError> for ApiError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::Ledger(source) if !source.is_persistence() => {
                Self::BadRequest(source.to_string())
            }
            ScanError::Ledger(source) => Self::Persistence {
                marks: Vec::new(),
                message: source.to_string(),
            },
            ScanError::NotSaved { marks, source } => Self::Persistence {
                marks,
                message: source.to_string(),
            },
            ScanError::Worker(message) => Self::Internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match self {
            Self::BadRequest(message) => serde_json::json!({
                "success": false,
                "error": "invalid_request",
                "message": message,
            }),
            Self::Persistence { marks, message } => serde_json::json!({
                "success": false,
                "error": "persistence",
                "message": message,
                "marks": marks,
            }),
            // Worker details stay in the logs.
            Self::Internal(_) => serde_json::json!({
                "success": false,
                "error": "internal",
                "message": "Internal server error",
            }),
        };
        (status, Json(body)).into_response()
    }
}

/// Decode `image_b64`, tolerating a data-URL prefix: everything up to the
/// first comma is dropped.
pub fn decode_image_b64(image_b64: &str) -> Result<Frame, ApiError> {
    let (media_type, payload) = match image_b64.split_once(',') {
        Some((head, payload)) => {
            let media_type = head
                .strip_prefix("data:")
                .and_then(|rest| rest.split(';').next())
                .filter(|m| !m.is_empty())
                .map(str::to_string);
            (media_type, payload)
        }
        None => (None, image_b64),
    };

    let cleaned: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = general_purpose::STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| ApiError::BadRequest(format!("image_b64 is not valid base64: {e}")))?;

    let frame = Frame::new(bytes);
    Ok(match media_type {
        Some(media_type) => frame.with_media_type(media_type),
        None => frame,
    })
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": HEALTH_STATUS }))
}

pub async fn scan(
    State(state): State<AppState>,
    Json(request): Json<FrameRequest>,
) -> Result<Json<ScanResponse>, ApiError> {
    let frame = decode_image_b64(&request.image_b64)?;
    let response = match state.scanner.scan(frame).await? {
        ScanOutcome::Detected(recognized) => {
            let results: Vec<ScanResult> =
                recognized.predictions.iter().map(ScanResult::from).collect();
            ScanResponse::Detected {
                success: true,
                count: results.len(),
                results,
            }
        }
        ScanOutcome::NoDetection(none) => ScanResponse::NoDetection(NoDetectionBody::from(&none)),
    };
    Ok(Json(response))
}

pub async fn save(
    State(state): State<AppState>,
    Json(request): Json<FrameRequest>,
) -> Result<Json<SaveResponse>, ApiError> {
    let excel_path = state.ledger_path(request.excel_path);
    let frame = decode_image_b64(&request.image_b64)?;
    let response = match state.scanner.save(frame, &excel_path).await? {
        SaveOutcome::Saved(saved) => SaveResponse::Saved {
            success: true,
            marks: saved.row().marks.clone(),
            row_total: saved.row().total,
            grand_total: saved.grand_total,
            sequence_id: saved.entry.sequence_id,
        },
        SaveOutcome::NoDetection(none) => SaveResponse::NoDetection(NoDetectionBody::from(&none)),
    };
    Ok(Json(response))
}

pub async fn ledger(
    State(state): State<AppState>,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<LedgerResponse>, ApiError> {
    let excel_path = state.ledger_path(query.excel_path);
    let entries = state.scanner.entries(&excel_path).await?;
    // Totalled from the same snapshot as the listed entries.
    let grand_total: u64 = entries.iter().map(|e| e.row.total as u64).sum();
    let entries = entries
        .iter()
        .map(entry_body)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(LedgerResponse {
        success: true,
        excel_path,
        grand_total,
        entries,
    }))
}

fn entry_body(entry: &LedgerEntry) -> Result<LedgerEntryBody, ApiError> {
    let recorded_at = entry
        .recorded_at
        .format(&Rfc3339)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(LedgerEntryBody {
        sequence_id: entry.sequence_id,
        recorded_at,
        marks: entry.row.marks.clone(),
        row_total: entry.row.total,
    })
}

/// Attach a request id span and log the outcome of every request.
async fn request_span(request: Request, next: Next) -> Response {
    let span = info_span!(
        "request",
        id = %Uuid::new_v4(),
        method = %request.method(),
        path = %request.uri().path(),
    );
    async move {
        let response = next.run(request).await;
        let status = response.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), "Request failed");
        } else if status.is_client_error() {
            warn!(status = status.as_u16(), "Request rejected");
        } else {
            info!(status = status.as_u16(), "Request handled");
        }
        response
    }
    .instrument(span)
    .await
}

/// Answer preflights and stamp CORS headers on every response.
async fn cors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, state.allow_origin.clone());
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type"),
    );
    response
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/scan", post(scan))
        .route("/save", post(save))
        .route("/ledger", get(ledger))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .layer(middleware::from_fn(request_span))
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn serve(addr: SocketAddr, app: Router) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Mark scanner listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down");
        })
        .await
}
