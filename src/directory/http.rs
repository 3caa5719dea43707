use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use subtle::ConstantTimeEq;
use tracing::error;

use super::core;
use crate::model::{BookingRequest, PublishRequest};
use crate::AppError;

pub struct DirectoryState {
    pub pool: SqlitePool,
    /// Coarse shared secret gating clinic onboarding.
    pub app_secret: String,
}

/// The `/v1` directory API.
pub fn router(state: Arc<DirectoryState>) -> Router {
    Router::new()
        .route("/v1/onboard", post(onboard))
        .route("/v1/clinics", get(clinics))
        .route("/v1/book", post(book))
        .route("/v1/slots/{clinic_id}", get(slots))
        .route("/v1/slots", post(publish))
        .route("/v1/sync", get(sync))
        .route("/v1/ack", post(ack))
        .with_state(state)
}

/// `AppError` with an HTTP status. Auth bodies stay generic; unexpected
/// failures are logged in full and returned as an opaque system error.
struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.code() {
            AppError::INVALID_CREDENTIALS => StatusCode::UNAUTHORIZED,
            AppError::ACCESS_DENIED => StatusCode::FORBIDDEN,
            AppError::SLOT_NOT_FOUND => StatusCode::NOT_FOUND,
            AppError::SLOT_CONFLICT => StatusCode::CONFLICT,
            code if code.starts_with("VALIDATION/") => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(target: "fernhill", event = "directory_internal_error", error = %self.0);
            let body = AppError::new("APP/INTERNAL", "system error");
            return (status, Json(body)).into_response();
        }
        (status, Json(self.0)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> ApiResult<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ApiError(
                AppError::new(AppError::INVALID_CREDENTIALS, "Missing credentials")
                    .with_context("header", name.to_string()),
            )
        })
}

/// Resolve and verify the per-clinic credential headers.
async fn require_clinic(state: &DirectoryState, headers: &HeaderMap) -> ApiResult<String> {
    let clinic_id = header(headers, "x-clinic-id")?.to_string();
    let api_key = header(headers, "x-api-key")?;
    core::authenticate(&state.pool, &clinic_id, api_key).await?;
    Ok(clinic_id)
}

fn require_app_secret(state: &DirectoryState, headers: &HeaderMap) -> ApiResult<()> {
    let presented = header(headers, "x-app-secret")?;
    let matches: bool = presented
        .as_bytes()
        .ct_eq(state.app_secret.as_bytes())
        .into();
    if matches {
        Ok(())
    } else {
        Err(ApiError(AppError::new(
            AppError::INVALID_CREDENTIALS,
            "Invalid credentials",
        )))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnboardBody {
    name: String,
    city: String,
    #[serde(default)]
    specialty: Option<String>,
}

async fn onboard(
    State(state): State<Arc<DirectoryState>>,
    headers: HeaderMap,
    Json(body): Json<OnboardBody>,
) -> ApiResult<Json<core::OnboardResult>> {
    require_app_secret(&state, &headers)?;
    let result = core::onboard(
        &state.pool,
        &body.name,
        &body.city,
        body.specialty.as_deref(),
    )
    .await?;
    Ok(Json(result))
}

async fn clinics(
    State(state): State<Arc<DirectoryState>>,
) -> ApiResult<Json<Vec<crate::model::Clinic>>> {
    Ok(Json(core::list_clinics(&state.pool).await?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BookResponse {
    status: &'static str,
    message_id: String,
}

async fn book(
    State(state): State<Arc<DirectoryState>>,
    Json(body): Json<BookingRequest>,
) -> ApiResult<Json<BookResponse>> {
    let outcome = core::book(&state.pool, body).await?;
    Ok(Json(BookResponse {
        status: "queued",
        message_id: outcome.message_id,
    }))
}

#[derive(Deserialize)]
struct SlotsQuery {
    #[serde(default)]
    date: Option<String>,
}

async fn slots(
    State(state): State<Arc<DirectoryState>>,
    Path(clinic_id): Path<String>,
    Query(query): Query<SlotsQuery>,
) -> ApiResult<Json<Vec<crate::model::Slot>>> {
    let slots = core::query_slots(&state.pool, &clinic_id, query.date.as_deref()).await?;
    Ok(Json(slots))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    status: &'static str,
    count: u32,
}

async fn publish(
    State(state): State<Arc<DirectoryState>>,
    headers: HeaderMap,
    Json(body): Json<PublishRequest>,
) -> ApiResult<Json<PublishResponse>> {
    let clinic_id = require_clinic(&state, &headers).await?;
    let count = core::publish_availability(&state.pool, &clinic_id, body).await?;
    Ok(Json(PublishResponse {
        status: "ok",
        count,
    }))
}

async fn sync(
    State(state): State<Arc<DirectoryState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<crate::model::Message>>> {
    let clinic_id = require_clinic(&state, &headers).await?;
    let messages = core::poll_messages(&state.pool, &clinic_id).await?;
    Ok(Json(messages))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckBody {
    ids: Vec<String>,
}

#[derive(Serialize)]
struct AckResponse {
    status: &'static str,
}

async fn ack(
    State(state): State<Arc<DirectoryState>>,
    headers: HeaderMap,
    Json(body): Json<AckBody>,
) -> ApiResult<Json<AckResponse>> {
    let clinic_id = require_clinic(&state, &headers).await?;
    core::ack(&state.pool, &clinic_id, &body.ids).await?;
    Ok(Json(AckResponse { status: "ok" }))
}
