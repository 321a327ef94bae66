use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequestParts, State},
    http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::envelope::{
    decode_candidate_body, decode_description_body, encode_description, parse_session_id,
    DescriptionEnvelope, SESSION_ID_HEADER,
};
use crate::error::SignalingError;
use crate::session::generate_session_id;
use crate::state::AppState;

/// The caller's session id, taken from `X-Session-ID`.
#[derive(Debug, Clone)]
pub struct SessionId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for SessionId
where
    S: Send + Sync,
{
    type Rejection = SignalingError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        header_session_id(&parts.headers)?
            .map(SessionId)
            .ok_or(SignalingError::MissingSessionId)
    }
}

/// `Ok(None)` when the header is absent, an error when it is present but unusable.
fn header_session_id(headers: &HeaderMap) -> Result<Option<String>, SignalingError> {
    let Some(value) = headers.get(SESSION_ID_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(parse_session_id)
        .map(|id| Some(id.to_string()))
        .ok_or(SignalingError::MissingSessionId)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/config", get(ice_config))
        .route("/offer", post(offer))
        .route("/ice-candidate", post(ice_candidate))
        .route("/stop", post(stop))
        .route("/synth-code", get(synth_code))
        .route("/status", get(session_status))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn ice_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, SignalingError> {
    let session_id = match header_session_id(&headers)? {
        Some(id) => id,
        None => {
            let id = generate_session_id();
            debug!(session = %id, "assigned session id");
            id
        }
    };
    let config = state.coordinator.ice_configuration(&session_id).await?;
    let header_value = HeaderValue::from_str(&session_id)
        .map_err(|err| SignalingError::Internal(err.to_string()))?;
    Ok((
        [(HeaderName::from_static(SESSION_ID_HEADER), header_value)],
        Json(config),
    )
        .into_response())
}

pub async fn offer(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
    body: Bytes,
) -> Result<Json<DescriptionEnvelope>, SignalingError> {
    let description = decode_description_body(&body)
        .map_err(|err| SignalingError::InvalidOffer(err.to_string()))?;
    let answer = state
        .coordinator
        .handle_offer(&session_id, description)
        .await?;
    let envelope =
        encode_description(&answer).map_err(|err| SignalingError::Internal(err.to_string()))?;
    Ok(Json(envelope))
}

pub async fn ice_candidate(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
    body: Bytes,
) -> Result<StatusCode, SignalingError> {
    let record = decode_candidate_body(&body)
        .map_err(|err| SignalingError::InvalidCandidate(err.to_string()))?;
    let disposition = state
        .coordinator
        .handle_candidate(&session_id, record)
        .await?;
    debug!(session = %session_id, ?disposition, "candidate accepted");
    Ok(StatusCode::OK)
}

pub async fn stop(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
) -> StatusCode {
    state.coordinator.stop(&session_id).await;
    StatusCode::OK
}

pub async fn synth_code(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
) -> Result<Response, SignalingError> {
    match state.synth.fetch(&session_id).await? {
        Some(code) => Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            code,
        )
            .into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

pub async fn session_status(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
) -> Result<Response, SignalingError> {
    let snapshot = state.coordinator.status(&session_id).await?;
    Ok(Json(snapshot).into_response())
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "sessions": state.coordinator.registry().len(),
    }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.render_metrics(),
    )
}
