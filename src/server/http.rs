//! HTTP server implementation
//!
//! Thin axum glue over the [`Ingestor`]:
//! - POST /api/slots - create an empty slot
//! - GET /api/slots - list slots in display order
//! - DELETE /api/slots/:name - delete a slot and its files
//! - POST /api/upload - multipart ingestion (`file`, `linkName`, `url`)
//! - POST /api/previews/regenerate - rebuild every image preview
//! - GET /:name - stored original
//! - GET /preview/:name - JPEG preview
//! - GET /health - liveness probe
//!
//! `/api/*` is rate limited in the `upload` namespace, media reads in the
//! `public` namespace. Authentication sits in front of this server.

use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::ingest::{
    ErrorClass, IngestError, IngestResult, Ingestor, MediaSource, RegenerateReport, UploadedFile,
};
use crate::media::transform::PREVIEW_KIND;
use crate::media::{validate, FetchError, ValidationError};
use crate::server::ratelimit::{
    rate_limit_middleware, NamespaceLimiter, RateLimiter, NAMESPACE_PUBLIC, NAMESPACE_UPLOAD,
};
use crate::store::WallpaperRecord;

/// Multipart framing allowance on top of the upload cap
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    /// Server start time (Unix timestamp)
    pub start_time: i64,
}

impl AppState {
    pub fn new(ingestor: Arc<Ingestor>) -> Self {
        Self {
            ingestor,
            start_time: chrono::Utc::now().timestamp(),
        }
    }
}

/// Build the router. `max_upload_bytes` sizes the request body limit.
pub fn create_router(state: AppState, limiter: RateLimiter, max_upload_bytes: u64) -> Router {
    let body_limit = usize::try_from(max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    let api = Router::new()
        .route(
            "/api/slots",
            get(list_slots_handler).post(create_slot_handler),
        )
        .route("/api/slots/:name", delete(delete_slot_handler))
        .route("/api/upload", post(upload_handler))
        .route("/api/previews/regenerate", post(regenerate_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            NamespaceLimiter::new(limiter.clone(), NAMESPACE_UPLOAD),
            rate_limit_middleware,
        ));

    let public = Router::new()
        .route("/:name", get(original_handler))
        .route("/preview/:name", get(preview_handler))
        .layer(middleware::from_fn_with_state(
            NamespaceLimiter::new(limiter, NAMESPACE_PUBLIC),
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .merge(api)
        .merge(public)
        .with_state(state)
}

/// Bind `addr` and serve until `cancel` fires.
pub async fn serve(
    ingestor: Arc<Ingestor>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let settings = ingestor.settings().read().clone();
    let limiter = RateLimiter::new(settings.rate_limit_config());
    let sweeper = limiter.spawn_sweeper(cancel.child_token());
    let app = create_router(
        AppState::new(ingestor),
        limiter,
        settings.ingest.max_upload_bytes(),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "http", address = %listener.local_addr()?, "HTTP server listening");

    let shutdown = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    cancel.cancel();
    let _ = sweeper.await;
    info!(target: "http", "HTTP server stopped");
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

/// Error response: `{"error":{"code","message"}}`
#[derive(Debug)]
pub enum ApiError {
    Ingest(IngestError),
    Request {
        status: StatusCode,
        code: &'static str,
        message: String,
    },
}

impl ApiError {
    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        ApiError::Request {
            status: StatusCode::BAD_REQUEST,
            code,
            message: message.into(),
        }
    }

    fn not_found(name: &str) -> Self {
        ApiError::Request {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: format!("no media for {}", name),
        }
    }

    fn multipart(err: MultipartError) -> Self {
        ApiError::Request {
            status: err.status(),
            code: "invalid_multipart",
            message: err.body_text(),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        ApiError::Ingest(err)
    }
}

/// HTTP status for an ingestion failure.
pub fn status_for(err: &IngestError) -> StatusCode {
    match err {
        IngestError::PayloadTooLarge { .. }
        | IngestError::Fetch(FetchError::ResponseTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
        IngestError::Validation(
            ValidationError::UnsupportedContentType(_) | ValidationError::UnsupportedExtension(_),
        ) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        IngestError::Fetch(
            FetchError::DnsResolution(_)
            | FetchError::HttpRequest(_)
            | FetchError::Status(_)
            | FetchError::StreamRead(_)
            | FetchError::Timeout(_),
        ) => StatusCode::BAD_GATEWAY,
        _ => match err.kind() {
            ErrorClass::ClientInput | ErrorClass::Security => StatusCode::BAD_REQUEST,
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::Conflict => StatusCode::CONFLICT,
            ErrorClass::Busy => StatusCode::TOO_MANY_REQUESTS,
            ErrorClass::Transient => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Ingest(err) => {
                let status = status_for(&err);
                // Internal failures can carry filesystem paths.
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    "internal error".to_string()
                } else {
                    err.to_string()
                };
                (status, err.code(), message)
            }
            ApiError::Request {
                status,
                code,
                message,
            } => (status, code, message),
        };
        (
            status,
            Json(json!({ "error": { "code": code, "message": message } })),
        )
            .into_response()
    }
}

// ============================================================================
// Health Check
// ============================================================================

/// GET /health - Lightweight liveness probe.
async fn health_handler(State(state): State<AppState>) -> Response {
    let uptime = chrono::Utc::now().timestamp() - state.start_time;
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptimeSeconds": uptime,
            "slots": state.ingestor.store().len(),
        })),
    )
        .into_response()
}

// ============================================================================
// Slot Management
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateSlotRequest {
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
}

/// POST /api/slots
async fn create_slot_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateSlotRequest>,
) -> Result<(StatusCode, Json<WallpaperRecord>), ApiError> {
    let record = state
        .ingestor
        .create_slot(req.name.trim(), req.category.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /api/slots
async fn list_slots_handler(State(state): State<AppState>) -> Json<Vec<WallpaperRecord>> {
    Json(state.ingestor.list_slots())
}

/// DELETE /api/slots/:name
async fn delete_slot_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.ingestor.delete_slot(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Ingestion
// ============================================================================

/// POST /api/upload - multipart fields `file`, `linkName`, optional `url`.
///
/// `url` takes an http(s) URL or a path under the external media root.
async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<IngestResult>, ApiError> {
    let mut slot: Option<String> = None;
    let mut upload: Option<UploadedFile> = None;
    let mut reference: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(ApiError::multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(ApiError::multipart)?;
                upload = Some(UploadedFile {
                    filename,
                    content_type,
                    bytes: bytes.to_vec(),
                });
            }
            "linkName" => slot = Some(field.text().await.map_err(ApiError::multipart)?),
            "url" => reference = Some(field.text().await.map_err(ApiError::multipart)?),
            _ => {}
        }
    }

    let slot = slot
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing_link_name", "linkName is required"))?;
    let source = MediaSource::select(upload, reference)?;

    // Dropped with the handler future when the client goes away.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let result = state.ingestor.ingest(&slot, source, &cancel).await?;
    Ok(Json(result))
}

/// POST /api/previews/regenerate
async fn regenerate_handler(State(state): State<AppState>) -> Json<RegenerateReport> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    Json(state.ingestor.regenerate_previews(&cancel).await)
}

// ============================================================================
// Public Media
// ============================================================================

fn media_record(state: &AppState, name: &str) -> Result<WallpaperRecord, ApiError> {
    if validate::validate_slot_name(name).is_err() {
        return Err(ApiError::not_found(name));
    }
    state
        .ingestor
        .get_slot(name)
        .filter(|r| r.has_image)
        .ok_or_else(|| ApiError::not_found(name))
}

/// GET /:name
async fn original_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let record = media_record(&state, &name)?;
    let (Some(kind), Some(path)) = (record.mime_kind, record.original_file_path) else {
        return Err(ApiError::not_found(&name));
    };
    serve_file(&name, &path, kind.mime_type()).await
}

/// GET /preview/:name
async fn preview_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let record = media_record(&state, &name)?;
    let has_preview = record.has_preview();
    let Some(path) = record.preview_file_path.filter(|_| has_preview) else {
        return Err(ApiError::not_found(&name));
    };
    serve_file(&name, &path, PREVIEW_KIND.mime_type()).await
}

async fn serve_file(name: &str, path: &FsPath, mime: &'static str) -> Result<Response, ApiError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, mime),
                (header::CACHE_CONTROL, "no-cache"),
                (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
            ],
            bytes,
        )
            .into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ApiError::not_found(name)),
        Err(e) => {
            error!(target: "http", path = %path.display(), error = %e, "Failed to read media file");
            Err(ApiError::Ingest(IngestError::Io(e.to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::media::MediaFetcher;
    use crate::server::ratelimit::RateLimitConfig;
    use crate::store::MetadataStore;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "linkwall-test-boundary";

    struct Harness {
        _dir: TempDir,
        router: Router,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.storage.data_dir = dir.path().to_path_buf();
        let store = Arc::new(MetadataStore::open(settings.layout()).unwrap());
        let ingestor = Arc::new(Ingestor::new(
            store,
            Arc::new(MediaFetcher::new()),
            Arc::new(parking_lot::RwLock::new(settings)),
        ));
        let router = create_router(
            AppState::new(ingestor),
            RateLimiter::new(RateLimitConfig::default()),
            1024 * 1024,
        );
        Harness { _dir: dir, router }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::new_rgb8(width, height)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn multipart_body(link_name: &str, file: Option<(&str, &[u8])>, url: Option<&str>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"linkName\"\r\n\r\n{link_name}\r\n"
            )
            .as_bytes(),
        );
        if let Some(url) = url {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"url\"\r\n\r\n{url}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some((filename, bytes)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn create_request(name: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/slots")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "name": name }).to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_list_slots() {
        let h = harness();

        let response = h.router.clone().oneshot(create_request("home")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["slotName"], "home");
        assert_eq!(json["hasImage"], false);

        let response = h.router.clone().oneshot(create_request("home")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "slot_exists");

        let response = h
            .router
            .clone()
            .oneshot(Request::get("/api/slots").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["category"], "desktop");
    }

    #[tokio::test]
    async fn test_reserved_slot_name_rejected() {
        let h = harness();
        let response = h.router.oneshot(create_request("api")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "reserved_slot_name");
    }

    #[tokio::test]
    async fn test_upload_then_serve() {
        let h = harness();
        h.router.clone().oneshot(create_request("home")).await.unwrap();

        let png = png_bytes(800, 600);
        let response = h
            .router
            .clone()
            .oneshot(upload_request(multipart_body(
                "home",
                Some(("photo.png", &png)),
                None,
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["slot"], "home");
        assert_eq!(json["kind"], "png");
        assert_eq!(json["publicUrl"], "/home");
        assert_eq!(json["previewUrl"], "/preview/home");

        let response = h
            .router
            .clone()
            .oneshot(Request::get("/home").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "image/png");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.as_ref(), png.as_slice());

        let response = h
            .router
            .oneshot(Request::get("/preview/home").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "image/jpeg");
    }

    #[tokio::test]
    async fn test_upload_errors() {
        let h = harness();
        h.router.clone().oneshot(create_request("home")).await.unwrap();
        let png = png_bytes(4, 4);

        // Unknown slot
        let response = h
            .router
            .clone()
            .oneshot(upload_request(multipart_body(
                "missing",
                Some(("a.png", &png)),
                None,
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // No source
        let response = h
            .router
            .clone()
            .oneshot(upload_request(multipart_body("home", None, None)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "no_source");

        // Spoofed extension
        let response = h
            .router
            .clone()
            .oneshot(upload_request(multipart_body(
                "home",
                Some(("a.jpg", &png)),
                None,
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "content_mismatch");

        // Blocked fetch target
        let response = h
            .router
            .clone()
            .oneshot(upload_request(multipart_body(
                "home",
                None,
                Some("http://127.0.0.1/a.png"),
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "blocked_url");

        // Local media root not configured
        let response = h
            .router
            .oneshot(upload_request(multipart_body("home", None, Some("a/b.png"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["error"]["code"],
            "local_media_disabled"
        );
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let h = harness();
        h.router.clone().oneshot(create_request("home")).await.unwrap();
        let big = vec![0u8; 3 * 1024 * 1024];
        let response = h
            .router
            .oneshot(upload_request(multipart_body(
                "home",
                Some(("big.png", &big)),
                None,
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_delete_slot() {
        let h = harness();
        h.router.clone().oneshot(create_request("home")).await.unwrap();
        let png = png_bytes(4, 4);
        h.router
            .clone()
            .oneshot(upload_request(multipart_body(
                "home",
                Some(("a.png", &png)),
                None,
            )))
            .await
            .unwrap();

        let response = h
            .router
            .clone()
            .oneshot(
                Request::delete("/api/slots/home")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = h
            .router
            .clone()
            .oneshot(Request::get("/home").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = h
            .router
            .oneshot(
                Request::delete("/api/slots/home")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_regenerate_endpoint() {
        let h = harness();
        h.router.clone().oneshot(create_request("home")).await.unwrap();
        h.router.clone().oneshot(create_request("empty")).await.unwrap();
        let png = png_bytes(4, 4);
        h.router
            .clone()
            .oneshot(upload_request(multipart_body(
                "home",
                Some(("a.png", &png)),
                None,
            )))
            .await
            .unwrap();

        let response = h
            .router
            .oneshot(
                Request::post("/api/previews/regenerate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["total"], 2);
        assert_eq!(json["ok"], 1);
        assert_eq!(json["skipped"], 1);
        assert_eq!(json["errors"], 0);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&IngestError::PayloadTooLarge { size: 2, max: 1 }),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            status_for(&ValidationError::UnsupportedContentType("application/pdf".into()).into()),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            status_for(&FetchError::Status(500).into()),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&ValidationError::PathTraversal("../x".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&IngestError::Io("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
