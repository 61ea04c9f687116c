//! Telehealth service routes

use axum::{
    Extension, Form, Json, Router,
    extract::{Path, Query, State, rejection::FormRejection},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::TelehealthResult,
    middleware::{AuthUser, ROLE_ADMIN, auth_middleware, client_origin},
    models::{RecordingConsent, RecordingFilter, RecordingFormat, RecordingOptions},
    sessions::EmergencyRequest,
    state::AppState,
    video::{RECORDING_STATUS_CALLBACK_PATH, RecordingStatusCallback},
};

/// Create the router for the telehealth service
pub fn create_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/telehealth/status", get(integration_status))
        .route("/telehealth/consent/:client_id", get(verify_consent))
        .route(
            "/telehealth/appointments/:appointment_id/session",
            post(create_session),
        )
        .route(
            "/telehealth/appointments/:appointment_id/join",
            post(join_session),
        )
        .route("/telehealth/sessions/:id", get(get_session))
        .route("/telehealth/sessions/:id/end", post(end_session))
        .route("/telehealth/sessions/:id/emergency", post(activate_emergency))
        .route(
            "/telehealth/sessions/:id/recordings",
            post(start_recording).get(list_session_recordings),
        )
        .route("/telehealth/recordings", get(list_recordings))
        .route(
            "/telehealth/recordings/:id",
            get(get_recording).delete(delete_recording),
        )
        .route("/telehealth/recordings/:id/stop", post(stop_recording))
        .route("/telehealth/recordings/:id/playback", get(playback_url))
        .route("/telehealth/recordings/:id/retry", post(retry_upload))
        .route("/admin/retention/run", post(run_retention))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route(RECORDING_STATUS_CALLBACK_PATH, post(recording_status_webhook))
        .merge(protected_routes)
        .with_state(state)
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "telehealth-service"
    }))
}

/// Whether the provider and storage integrations are configured
pub async fn integration_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "videoConfigured": state.video.is_configured(),
        "storageConfigured": state.storage.is_configured(),
        "bucket": state.storage.bucket(),
    }))
}

/// Provider recording status callback.
///
/// Always answers 200 so the provider does not retry; problems are logged.
pub async fn recording_status_webhook(
    State(state): State<AppState>,
    payload: Result<Form<RecordingStatusCallback>, FormRejection>,
) -> StatusCode {
    match payload {
        Ok(Form(callback)) => {
            info!(recording_sid = %callback.recording_sid, status = %callback.status, "Recording status callback received");
            // the upload task, if any, keeps running after the response
            if state.recordings.on_provider_callback(callback).await.is_some() {
                info!("Recording upload continuing in background");
            }
        }
        Err(rejection) => {
            warn!(error = %rejection, "Malformed recording status callback ignored");
        }
    }
    StatusCode::OK
}

pub async fn verify_consent(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
) -> impl IntoResponse {
    Json(state.consent.verify_client(client_id).await)
}

pub async fn create_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(appointment_id): Path<Uuid>,
) -> TelehealthResult<impl IntoResponse> {
    let session = state.sessions.create(appointment_id, user.actor()).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn join_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(appointment_id): Path<Uuid>,
) -> TelehealthResult<impl IntoResponse> {
    let joined = state
        .sessions
        .join(appointment_id, user.actor(), user.participant_role())
        .await?;
    Ok(Json(joined))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> TelehealthResult<impl IntoResponse> {
    Ok(Json(state.sessions.get(id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct EndSessionRequest {
    pub reason: Option<String>,
}

pub async fn end_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    payload: Option<Json<EndSessionRequest>>,
) -> TelehealthResult<impl IntoResponse> {
    let reason = payload.and_then(|Json(body)| body.reason);
    Ok(Json(state.sessions.end(id, user.actor(), reason).await?))
}

pub async fn activate_emergency(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(request): Json<EmergencyRequest>,
) -> TelehealthResult<impl IntoResponse> {
    let session = state
        .sessions
        .activate_emergency(id, user.actor(), request)
        .await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRecordingRequest {
    pub consent_given: bool,
    #[serde(default)]
    pub audio_only: bool,
    #[serde(default)]
    pub format: RecordingFormat,
}

pub async fn start_recording(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<StartRecordingRequest>,
) -> TelehealthResult<impl IntoResponse> {
    let consent = RecordingConsent {
        given: request.consent_given,
        ip_address: client_origin(&headers),
    };
    let options = RecordingOptions {
        audio_only: request.audio_only,
        format: request.format,
    };

    let recording = state
        .recordings
        .start(session_id, user.actor(), consent, options)
        .await?;
    Ok((StatusCode::CREATED, Json(recording)))
}

pub async fn list_session_recordings(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
) -> TelehealthResult<impl IntoResponse> {
    let page = state
        .recordings
        .list_recordings(
            &RecordingFilter::for_session(session_id),
            user.actor(),
            client_origin(&headers),
        )
        .await?;
    Ok(Json(page))
}

pub async fn list_recordings(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    Query(filter): Query<RecordingFilter>,
) -> TelehealthResult<impl IntoResponse> {
    let page = state
        .recordings
        .list_recordings(&filter, user.actor(), client_origin(&headers))
        .await?;
    Ok(Json(page))
}

pub async fn get_recording(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> TelehealthResult<impl IntoResponse> {
    let recording = state
        .recordings
        .get_recording(id, user.actor(), client_origin(&headers))
        .await?;
    Ok(Json(recording))
}

pub async fn stop_recording(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> TelehealthResult<impl IntoResponse> {
    Ok(Json(state.recordings.stop(id, user.actor()).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackQuery {
    pub expires_in: Option<u64>,
}

pub async fn playback_url(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<PlaybackQuery>,
) -> TelehealthResult<impl IntoResponse> {
    let playback = state
        .recordings
        .get_playback_url(
            id,
            user.actor(),
            query.expires_in.map(Duration::from_secs),
            client_origin(&headers),
        )
        .await?;
    Ok(Json(playback))
}

pub async fn retry_upload(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> TelehealthResult<impl IntoResponse> {
    user.require_role(ROLE_ADMIN)?;
    let recording = state
        .recordings
        .download_and_upload_recording(id, user.actor())
        .await?;
    Ok(Json(recording))
}

#[derive(Debug, Deserialize)]
pub struct DeleteRecordingRequest {
    pub reason: String,
}

pub async fn delete_recording(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(request): Json<DeleteRecordingRequest>,
) -> TelehealthResult<impl IntoResponse> {
    let recording = state
        .recordings
        .delete(id, user.actor(), &request.reason)
        .await?;
    Ok(Json(recording))
}

pub async fn run_retention(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> TelehealthResult<impl IntoResponse> {
    user.require_role(ROLE_ADMIN)?;
    info!(actor = %user.id, "Retention sweep triggered manually");
    Ok(Json(state.retention.run().await))
}
