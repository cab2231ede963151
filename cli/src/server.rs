use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

use fieldsync_core::connectivity::ReachabilityProbe;
use fieldsync_core::events::StatusView;
use fieldsync_core::models::{ImagePayload, ProductRef};
use fieldsync_core::service::{
    FieldSyncService, PendingListing, PhotoCapture, PhotoLimitReached, ProductRow, WeightEdit,
};
use fieldsync_core::sync::SyncOutcome;

use crate::commands::parse_item_code;
use crate::tls::TlsConfig;

// Base64 data URLs inflate a compressed capture by a third.
const BODY_LIMIT: usize = 20 * 1024 * 1024; // 20 MB

#[derive(Clone)]
struct AppState {
    service: FieldSyncService,
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct SetWeightRequest {
    weight: Option<f64>,
}

#[derive(Deserialize)]
struct CapturePhotoRequest {
    /// `data:image/...;base64,...` as produced by a canvas capture
    image: String,
    replaces: Option<i64>,
}

#[derive(Serialize)]
struct QueuedResponse {
    id: String,
    item_code: ProductRef,
    pending: i64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            Self::Internal(err) => {
                let error = format!("{err:#}");
                error!(%error, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

fn capture_error(err: anyhow::Error) -> ApiError {
    match err.downcast_ref::<PhotoLimitReached>() {
        Some(full) => ApiError::Conflict(format!("{full}. Replace one instead.")),
        None => ApiError::Internal(err),
    }
}

fn item_code_param(raw: &str) -> Result<ProductRef, ApiError> {
    parse_item_code(raw).map_err(|e| ApiError::BadRequest(format!("{e:#}")))
}

// --- Middleware ---

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

async fn list_products(State(state): State<AppState>) -> Result<Json<Vec<ProductRow>>, ApiError> {
    Ok(Json(state.service.products()?))
}

async fn refresh_products(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProductRow>>, ApiError> {
    state
        .service
        .refresh_products()
        .await
        .map(Json)
        .map_err(|e| ApiError::Unavailable(format!("{e:#}")))
}

async fn set_weight(
    State(state): State<AppState>,
    Path(item_code): Path<String>,
    Json(req): Json<SetWeightRequest>,
) -> Result<(StatusCode, Json<QueuedResponse>), ApiError> {
    let item_code = item_code_param(&item_code)?;
    fieldsync_core::models::validate_weight(req.weight)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let id = state.service.set_weight(WeightEdit {
        item_code: &item_code,
        weight: req.weight,
    })?;
    let pending = state.service.pending_counts()?.total();
    Ok((
        StatusCode::ACCEPTED,
        Json(QueuedResponse {
            id,
            item_code,
            pending,
        }),
    ))
}

async fn capture_photo(
    State(state): State<AppState>,
    Path(item_code): Path<String>,
    Json(req): Json<CapturePhotoRequest>,
) -> Result<(StatusCode, Json<QueuedResponse>), ApiError> {
    let item_code = item_code_param(&item_code)?;
    let image = ImagePayload::from_data_url(&req.image)
        .map_err(|e| ApiError::BadRequest(format!("{e:#}")))?;

    let id = state
        .service
        .capture_photo(PhotoCapture {
            item_code: item_code.clone(),
            image,
            replaces: req.replaces,
        })
        .map_err(capture_error)?;
    let pending = state.service.pending_counts()?.total();
    Ok((
        StatusCode::ACCEPTED,
        Json(QueuedResponse {
            id,
            item_code,
            pending,
        }),
    ))
}

async fn list_pending(State(state): State<AppState>) -> Result<Json<PendingListing>, ApiError> {
    Ok(Json(state.service.pending()?))
}

async fn run_sync(State(state): State<AppState>) -> Json<SyncOutcome> {
    Json(state.service.sync_now().await)
}

async fn get_status(State(state): State<AppState>) -> Json<StatusView> {
    Json(state.service.feed().view())
}

// --- Network helpers ---

/// Detect the machine's LAN IP by opening a UDP socket towards a public address.
/// No data is sent. Returns `None` if detection fails.
fn detect_local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let addr = socket.local_addr().ok()?;
    let ip = addr.ip();
    if ip.is_loopback() {
        None
    } else {
        Some(ip.to_string())
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/products", get(list_products))
        .route("/api/products/refresh", post(refresh_products))
        .route("/api/products/{item_code}/weight", put(set_weight))
        .route("/api/products/{item_code}/photos", post(capture_photo))
        .route("/api/pending", get(list_pending))
        .route("/api/sync", post(run_sync))
        .route("/api/status", get(get_status))
        // The JSON extractor's own 2 MB cap would shadow the limit below.
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(
    service: FieldSyncService,
    probe: Option<Arc<dyn ReachabilityProbe>>,
    poll_interval: Duration,
    port: u16,
    bind: &str,
    tls: Option<TlsConfig>,
) -> anyhow::Result<()> {
    if let Some(probe) = probe {
        let monitor = service.clone();
        tokio::spawn(async move { monitor.run_monitor(probe, poll_interval).await });
        let loader = service.clone();
        tokio::spawn(async move {
            if let Err(e) = loader.load_products().await {
                let error = format!("{e:#}");
                error!(%error, "initial product load failed");
            }
        });
    } else {
        eprintln!("Warning: no remote configured. Captures are queued locally only.");
    }

    let app = build_router(AppState { service });

    let lan_ip = if bind == "0.0.0.0" { detect_local_ip() } else { None };
    if let Some(ref ip) = lan_ip {
        let scheme = if tls.is_some() { "https" } else { "http" };
        eprintln!("Reachable on your network at {scheme}://{ip}:{port}");
    }

    if let Some(tls_config) = tls {
        let hosts: Vec<String> = lan_ip.into_iter().chain([bind.to_string()]).collect();
        let fingerprint = tls_config.ensure(&hosts)?;

        let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &tls_config.cert_path,
            &tls_config.key_path,
        )
        .await
        .context("failed to load TLS certificate")?;

        let addr = format!("{bind}:{port}")
            .parse::<std::net::SocketAddr>()
            .context("invalid bind address")?;

        info!(%addr, "listening with TLS");
        eprintln!("Listening on https://{bind}:{port}");
        eprintln!("Certificate fingerprint (SHA-256):");
        eprintln!("  {fingerprint}");

        axum_server::bind_rustls(addr, rustls_config)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
        info!(bind, port, "listening");
        eprintln!("Listening on http://{bind}:{port}");
        axum::serve(listener, app).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use fieldsync_core::connectivity::{Connectivity, ConnectivityMonitor};
    use fieldsync_core::db::Database;
    use fieldsync_core::models::{MAX_PHOTOS_PER_PRODUCT, Product};
    use fieldsync_core::sync::SyncSettings;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::session::LocalOnly;

    // 0xFF 0xD8 0xFF 0xE0, the start of a JPEG
    const JPEG_DATA_URL: &str = "data:image/jpeg;base64,/9j/4A==";

    fn test_service() -> FieldSyncService {
        FieldSyncService::new(
            Database::open_in_memory().unwrap(),
            Arc::new(LocalOnly),
            ConnectivityMonitor::new(Connectivity::Offline),
            SyncSettings::default(),
        )
    }

    fn test_app(service: FieldSyncService) -> Router {
        build_router(AppState { service })
    }

    fn product(id: i64, code: &str, photos: usize) -> Product {
        Product {
            id,
            item_code: ProductRef::new(code).unwrap(),
            viet_name: Some("Nuoc mam".to_string()),
            uom: Some("chai".to_string()),
            weight: Some(0.75),
            photos: (0..photos)
                .map(|i| fieldsync_core::models::Photo {
                    id: i as i64 + 1,
                    item_code: ProductRef::new(code).unwrap(),
                    image_url: format!("https://x.test/{code}_{i}.jpg"),
                    created_at: "2024-06-15T10:00:00Z".to_string(),
                })
                .collect(),
        }
    }

    async fn send(app: Router, request: axum::http::Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn json_request(method: &str, uri: &str, body: &serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn products_served_from_cache() {
        let service = test_service();
        service.cache().refresh(&[product(1, "SKU-1", 1)]).unwrap();

        let (status, json) = send(
            test_app(service),
            axum::http::Request::get("/api/products")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["item_code"], "SKU-1");
        assert_eq!(json[0]["photos"].as_array().unwrap().len(), 1);
        assert_eq!(json[0]["pending"]["field_updates"], 0);
    }

    #[tokio::test]
    async fn weight_is_queued_while_offline() {
        let service = test_service();
        let app = test_app(service.clone());

        let (status, json) = send(
            app,
            json_request("PUT", "/api/products/SKU-1/weight", &serde_json::json!({ "weight": 12.5 })),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(json["id"].as_str().unwrap().starts_with("field_"));
        assert_eq!(json["pending"], 1);

        let listing = service.pending().unwrap();
        assert_eq!(listing.field_updates[0].value, Some(12.5));
    }

    #[tokio::test]
    async fn weight_can_be_cleared() {
        let service = test_service();
        let (status, _) = send(
            test_app(service.clone()),
            json_request("PUT", "/api/products/SKU-1/weight", &serde_json::json!({ "weight": null })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(service.pending().unwrap().field_updates[0].value, None);
    }

    #[tokio::test]
    async fn negative_weight_is_rejected() {
        let service = test_service();
        let (status, json) = send(
            test_app(service.clone()),
            json_request("PUT", "/api/products/SKU-1/weight", &serde_json::json!({ "weight": -3 })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("negative"));
        assert_eq!(service.pending_counts().unwrap().total(), 0);
    }

    #[tokio::test]
    async fn blank_item_code_is_rejected() {
        let (status, json) = send(
            test_app(test_service()),
            json_request("PUT", "/api/products/%20/weight", &serde_json::json!({ "weight": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("Invalid item code"));
    }

    #[tokio::test]
    async fn photo_is_queued_from_data_url() {
        let service = test_service();
        let (status, json) = send(
            test_app(service.clone()),
            json_request(
                "POST",
                "/api/products/SKU-1/photos",
                &serde_json::json!({ "image": JPEG_DATA_URL }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(json["id"].as_str().unwrap().starts_with("photo_"));
        let listing = service.pending().unwrap();
        assert_eq!(listing.photos[0].mime, "image/jpeg");
        assert_eq!(listing.photos[0].size_bytes, 4);
    }

    #[tokio::test]
    async fn non_image_payload_is_rejected() {
        let (status, json) = send(
            test_app(test_service()),
            json_request(
                "POST",
                "/api/products/SKU-1/photos",
                &serde_json::json!({ "image": "data:text/plain;base64,aGVsbG8=" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("expected an image"));
    }

    #[tokio::test]
    async fn full_product_only_accepts_replacements() {
        let service = test_service();
        service
            .cache()
            .refresh(&[product(1, "SKU-1", MAX_PHOTOS_PER_PRODUCT)])
            .unwrap();
        let app = test_app(service.clone());

        let (status, json) = send(
            app.clone(),
            json_request(
                "POST",
                "/api/products/SKU-1/photos",
                &serde_json::json!({ "image": JPEG_DATA_URL }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("Replace one instead"));

        let (status, _) = send(
            app,
            json_request(
                "POST",
                "/api/products/SKU-1/photos",
                &serde_json::json!({ "image": JPEG_DATA_URL, "replaces": 2 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(
            service.pending().unwrap().photos[0].photo_to_delete_id,
            Some(2)
        );
    }

    #[tokio::test]
    async fn large_capture_within_limit_is_accepted() {
        // "/9j/" decodes to FF D8 FF; about 4 MB of data URL, 3 MiB of image
        let image = format!("data:image/jpeg;base64,{}", "/9j/".repeat(1024 * 1024));
        assert!(image.len() > 4_000_000);

        let service = test_service();
        let (status, json) = send(
            test_app(service.clone()),
            json_request(
                "POST",
                "/api/products/SKU-1/photos",
                &serde_json::json!({ "image": image }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(json["id"].as_str().unwrap().starts_with("photo_"));
        assert_eq!(service.pending().unwrap().photos[0].size_bytes, 3 * 1024 * 1024);
    }

    #[test]
    fn photo_limit_maps_to_conflict() {
        let err = anyhow::Error::new(PhotoLimitReached {
            item_code: ProductRef::new("SKU-1").unwrap(),
        });
        let response = capture_error(err).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let other = capture_error(anyhow::anyhow!("disk full")).into_response();
        assert_eq!(other.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn sync_while_offline_is_skipped() {
        let (status, json) = send(
            test_app(test_service()),
            axum::http::Request::post("/api/sync")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "offline");
    }

    #[tokio::test]
    async fn refresh_while_offline_is_unavailable() {
        let (status, json) = send(
            test_app(test_service()),
            axum::http::Request::post("/api/products/refresh")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(json["error"].as_str().unwrap().contains("offline"));
    }

    #[tokio::test]
    async fn status_reflects_queue() {
        let service = test_service();
        let code = ProductRef::new("SKU-1").unwrap();
        service
            .set_weight(WeightEdit {
                item_code: &code,
                weight: Some(1.0),
            })
            .unwrap();

        let (status, json) = send(
            test_app(service),
            axum::http::Request::get("/api/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["online"], false);
        assert_eq!(json["pending"]["field_updates"], 1);
        assert_eq!(json["message"], "Weight for product SKU-1 saved locally.");
    }

    #[tokio::test]
    async fn security_headers_present() {
        let response = test_app(test_service())
            .oneshot(
                axum::http::Request::get("/api/pending")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            response.headers().get("content-security-policy").unwrap(),
            "default-src 'none'"
        );
    }

    #[tokio::test]
    async fn body_size_limit_rejects_oversized() {
        let big_body = vec![b'a'; BODY_LIMIT + 1];
        let response = test_app(test_service())
            .oneshot(
                axum::http::Request::post("/api/products/SKU-1/photos")
                    .header("content-type", "application/json")
                    .body(Body::from(big_body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn internal_error_does_not_leak_details() {
        let error = ApiError::Internal(anyhow::anyhow!("secret database path /home/user/fieldsync.db"));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Internal server error");
    }

    #[test]
    fn detect_local_ip_returns_non_loopback() {
        // May be None without network access; only check the shape when it works.
        if let Some(ip) = detect_local_ip() {
            assert!(!ip.starts_with("127."), "IP should not be loopback: {ip}");
            assert!(ip.parse::<std::net::Ipv4Addr>().is_ok(), "Not a valid IPv4: {ip}");
        }
    }
}
