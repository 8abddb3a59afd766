use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::logging::SharedLogger;
use crate::proxy::Gateway;
use crate::translate::anthropic_types::{CountTokensRequest, ErrorResponse, MessagesRequest};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub gateway: Arc<Gateway>,
    pub logger: SharedLogger,
    /// Cancelled on shutdown; each request works under a child token.
    pub shutdown: CancellationToken,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route("/health", get(handle_health))
        .route("/v1/models", get(handle_models))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_messages(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let req: MessagesRequest = match parse_body(&state, &body) {
        Ok(r) => r,
        Err(response) => return response,
    };

    let cancel = state.shutdown.child_token();
    if req.stream.unwrap_or(false) {
        handle_streaming(state, &req, cancel).await
    } else {
        handle_non_streaming(state, &req, cancel).await
    }
}

async fn handle_non_streaming(
    state: Arc<AppState>,
    req: &MessagesRequest,
    cancel: CancellationToken,
) -> Response {
    match state.gateway.complete(req, &cancel).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => error_response(&state, &e),
    }
}

async fn handle_streaming(
    state: Arc<AppState>,
    req: &MessagesRequest,
    cancel: CancellationToken,
) -> Response {
    let sse_stream = match state.gateway.stream(req, cancel).await {
        Ok(s) => s,
        Err(e) => return error_response(&state, &e),
    };

    let event_stream = sse_stream.map(|result| -> std::result::Result<Event, Infallible> {
        match result {
            Ok(sse_event) => Ok(Event::default()
                .event(sse_event.event)
                .data(sse_event.data)),
            Err(_) => Ok(Event::default().event("error").data("{}")),
        }
    });

    Sse::new(event_stream)
        .keep_alive(
            KeepAlive::new()
                .interval(KEEP_ALIVE_INTERVAL)
                .event(Event::default().event("ping").data(r#"{"type":"ping"}"#)),
        )
        .into_response()
}

async fn handle_count_tokens(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let req: CountTokensRequest = match parse_body(&state, &body) {
        Ok(r) => r,
        Err(response) => return response,
    };

    let cancel = state.shutdown.child_token();
    match state.gateway.count_tokens(req, &cancel).await {
        Ok(count) => Json(count).into_response(),
        Err(e) => error_response(&state, &e),
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "upstream": {
            "base_url": state.config.upstream.base_url,
            "configured": true,
            "big_model": state.config.models.big,
            "small_model": state.config.models.small,
        },
        "cache": state.gateway.cache_stats(),
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let models: Vec<serde_json::Value> = state
        .gateway
        .router()
        .listing()
        .into_iter()
        .map(|m| {
            serde_json::json!({
                "id": m.id,
                "type": "model",
                "tier": m.tier,
                "target": m.target,
            })
        })
        .collect();

    Json(serde_json::json!({ "data": models, "object": "list" }))
}

fn parse_body<T: DeserializeOwned>(state: &AppState, body: &[u8]) -> std::result::Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| {
        state
            .logger
            .error("server", format!("Failed to parse request: {}", e));
        let err = ErrorResponse::new("invalid_request_error", format!("Invalid request body: {}", e))
            .with_details(serde_json::json!({ "kind": "ValidationError" }));
        (StatusCode::BAD_REQUEST, Json(err)).into_response()
    })
}

fn error_response(state: &AppState, err: &ProxyError) -> Response {
    let (status, body) = err.to_error_response();
    if status >= 500 {
        state.logger.error("server", format!("Request failed: {}", err));
    } else {
        state.logger.warn("server", format!("Request failed: {}", err));
    }
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(body)).into_response()
}
