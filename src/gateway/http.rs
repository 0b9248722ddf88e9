use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::{Body, to_bytes};
use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use super::relay::{Relay, RelayBody, RelayOutput};
use crate::error::RelayError;

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct RelayHttpState {
    relay: Arc<Relay>,
}

impl RelayHttpState {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }
}

pub fn router(state: RelayHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(handle_relay))
        .route("/v1/completions", post(handle_relay))
        .route("/v1/embeddings", post(handle_relay))
        .route("/v1/moderations", post(handle_relay))
        .route("/v1/edits", post(handle_relay))
        .route("/v1/images/edits", post(not_implemented))
        .route("/v1/images/variations", post(not_implemented))
        .route("/v1/models", get(list_models))
        .route(
            "/v1/models/:model",
            get(retrieve_model).delete(not_implemented),
        )
        .fallback(handle_fallback)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health(headers: HeaderMap) -> Response {
    with_request_id(
        Json(HealthResponse { status: "ok" }).into_response(),
        &request_id_from(&headers),
    )
}

#[derive(Debug, Serialize)]
struct RelayErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: String,
    param: Option<String>,
    code: Option<String>,
    status_code: u16,
}

#[derive(Debug, Serialize)]
struct RelayErrorResponse {
    error: RelayErrorDetail,
}

fn error_response(
    status: StatusCode,
    kind: &str,
    code: Option<&str>,
    param: Option<&str>,
    message: impl std::fmt::Display,
    request_id: &str,
) -> Response {
    let body = RelayErrorResponse {
        error: RelayErrorDetail {
            message: format!("{message} (request id: {request_id})"),
            kind: kind.to_string(),
            param: param.map(str::to_string),
            code: code.map(str::to_string),
            status_code: status.as_u16(),
        },
    };
    with_request_id((status, Json(body)).into_response(), request_id)
}

fn relay_error_response(err: &RelayError, request_id: &str) -> Response {
    error_response(
        err.status(),
        err.kind(),
        err.code(),
        None,
        err,
        request_id,
    )
}

async fn handle_relay(State(state): State<RelayHttpState>, req: Request<Body>) -> Response {
    let request_id = request_id_from(req.headers());
    let (parts, body) = req.into_parts();

    let auth = match state.relay.authenticate(authorization(&parts.headers)).await {
        Ok(auth) => auth,
        Err(err) => return relay_error_response(&err, &request_id),
    };

    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            let err = RelayError::invalid_request(format!("failed to read request body: {err}"));
            return relay_error_response(&err, &request_id);
        }
    };

    let path = parts
        .uri
        .path_and_query()
        .map(|path| path.as_str())
        .unwrap_or_else(|| parts.uri.path());
    match state
        .relay
        .relay(auth, request_id.clone(), path, body)
        .await
    {
        Ok(output) => with_request_id(into_response(output), &request_id),
        Err(err) => relay_error_response(&err, &request_id),
    }
}

fn into_response(output: RelayOutput) -> Response {
    let mut response = match output.body {
        RelayBody::Full(bytes) => Response::new(Body::from(bytes)),
        RelayBody::Stream(stream) => Response::new(Body::from_stream(stream)),
    };
    *response.status_mut() = output.status;
    *response.headers_mut() = output.headers;
    response
}

async fn list_models(State(state): State<RelayHttpState>, headers: HeaderMap) -> Response {
    let request_id = request_id_from(&headers);
    if let Err(err) = state.relay.authenticate(authorization(&headers)).await {
        return relay_error_response(&err, &request_id);
    }
    match state.relay.list_models().await {
        Ok(models) => with_request_id(Json(models).into_response(), &request_id),
        Err(err) => relay_error_response(&err, &request_id),
    }
}

async fn retrieve_model(
    State(state): State<RelayHttpState>,
    Path(model): Path<String>,
    headers: HeaderMap,
) -> Response {
    let request_id = request_id_from(&headers);
    if let Err(err) = state.relay.authenticate(authorization(&headers)).await {
        return relay_error_response(&err, &request_id);
    }
    match state.relay.retrieve_model(&model).await {
        Ok(Some(model)) => with_request_id(Json(model).into_response(), &request_id),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            Some("model_not_found"),
            Some("model"),
            format!("The model '{model}' does not exist"),
            &request_id,
        ),
        Err(err) => relay_error_response(&err, &request_id),
    }
}

async fn not_implemented(headers: HeaderMap) -> Response {
    error_response(
        StatusCode::NOT_IMPLEMENTED,
        "llm_relay_error",
        Some("api_not_implemented"),
        None,
        "API not implemented",
        &request_id_from(&headers),
    )
}

async fn handle_fallback(method: Method, uri: Uri, headers: HeaderMap) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "invalid_request_error",
        None,
        None,
        format!("Invalid URL ({method} {})", uri.path()),
        &request_id_from(&headers),
    )
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_request_id)
}

pub fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("relay-{ts_ms}-{seq}")
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
