use axum::{
    Json, Router,
    extract::{
        Multipart, State,
        multipart::MultipartRejection,
        rejection::JsonRejection,
    },
    routing::post,
};
use metrics::counter;
use std::sync::Arc;

use crate::error::DetectionError;
use crate::service::DetectionService;
use crate::types::{DetectByUrlRequest, DetectionResponse, HealthResponse};

pub const SCRATCH_AND_DENT_BASE: &str = "/car-scratch-and-dent";
pub const DIRTY_CLEAN_BASE: &str = "/car-dirty-clean";

pub const ALLOWED_MIME_TYPES: [&str; 4] = ["image/jpeg", "image/jpg", "image/png", "image/webp"];

const NO_IMAGE: &str = "No image file provided";
const INVALID_TYPE: &str = "Invalid file type. Only JPEG, PNG, and WebP images are allowed.";
const INVALID_URL: &str = "imageUrl must be a URL address";

#[derive(Clone)]
pub struct AppState {
    service: Arc<dyn DetectionService>,
}

impl AppState {
    pub fn new(service: Arc<dyn DetectionService>) -> Self {
        Self { service }
    }
}

/// Both feature route groups, each nested under its base path.
pub fn router(
    scratch_and_dent: Arc<dyn DetectionService>,
    dirty_clean: Arc<dyn DetectionService>,
) -> Router {
    Router::new()
        .nest(SCRATCH_AND_DENT_BASE, feature_routes(scratch_and_dent))
        .nest(DIRTY_CLEAN_BASE, feature_routes(dirty_clean))
}

pub fn feature_routes(service: Arc<dyn DetectionService>) -> Router {
    Router::new()
        .route("/upload", post(upload_handler))
        .route("/url", post(url_handler))
        .route("/health", post(health_handler))
        .with_state(AppState::new(service))
}

pub fn is_allowed_mime_type(content_type: &str) -> bool {
    // Ignore parameters such as "; charset=binary".
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    ALLOWED_MIME_TYPES.contains(&essence.as_str())
}

pub fn is_valid_image_url(candidate: &str) -> bool {
    match reqwest::Url::parse(candidate.trim()) {
        Ok(url) => {
            matches!(url.scheme(), "http" | "https")
                && url.host_str().is_some_and(|host| !host.is_empty())
        }
        Err(_) => false,
    }
}

#[tracing::instrument(skip(state, multipart), fields(feature = state.service.feature()))]
async fn upload_handler(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectionResponse>, DetectionError> {
    let feature = state.service.feature();
    counter!("detection_requests_total", "feature" => feature, "source" => "upload").increment(1);

    let result = async {
        // No multipart content type means no file field.
        let mut multipart = multipart.map_err(|rejection| {
            tracing::warn!(reason = %rejection.body_text(), "Upload is not a multipart body");
            DetectionError::Validation(NO_IMAGE.to_string())
        })?;
        let mut image = None;

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| DetectionError::Validation(format!("Invalid multipart body: {e}")))?
        {
            if field.name() != Some("image") {
                continue;
            }

            let content_type = field.content_type().unwrap_or_default().to_string();
            if !is_allowed_mime_type(&content_type) {
                tracing::warn!(content_type = %content_type, "Rejected upload with unsupported type");
                return Err(DetectionError::Validation(INVALID_TYPE.to_string()));
            }

            let data = field
                .bytes()
                .await
                .map_err(|e| DetectionError::Validation(format!("Failed to read image: {e}")))?;
            image = Some(data);
            break;
        }

        let image = image.ok_or_else(|| DetectionError::Validation(NO_IMAGE.to_string()))?;
        tracing::info!(size = image.len(), "Processing uploaded image");
        state.service.detect_from_bytes(image).await
    }
    .await;

    finish(feature, result)
}

#[tracing::instrument(skip(state, payload), fields(feature = state.service.feature()))]
async fn url_handler(
    State(state): State<AppState>,
    payload: Result<Json<DetectByUrlRequest>, JsonRejection>,
) -> Result<Json<DetectionResponse>, DetectionError> {
    let feature = state.service.feature();
    counter!("detection_requests_total", "feature" => feature, "source" => "url").increment(1);

    let result = async {
        let Json(request) = payload.map_err(|rejection| {
            DetectionError::Validation(format!("Invalid request body: {}", rejection.body_text()))
        })?;

        let image_url = request
            .image_url
            .filter(|url| is_valid_image_url(url))
            .ok_or_else(|| DetectionError::Validation(INVALID_URL.to_string()))?;

        tracing::info!(image_url = %image_url, "Processing image URL");
        state.service.detect_from_url(image_url.trim()).await
    }
    .await;

    finish(feature, result)
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::ok(state.service.health_message()))
}

fn finish(
    feature: &'static str,
    result: Result<DetectionResponse, DetectionError>,
) -> Result<Json<DetectionResponse>, DetectionError> {
    match result {
        Ok(response) => {
            tracing::info!(predictions = response.predictions.len(), "Detection completed successfully");
            Ok(Json(response))
        }
        Err(e) => {
            counter!("detection_failures_total", "feature" => feature, "kind" => e.kind()).increment(1);
            tracing::error!(error = %e, kind = e.kind(), "Detection failed");
            Err(e)
        }
    }
}
