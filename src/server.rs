use crate::error::RelayError;
use crate::logging::SharedLogger;
use crate::providers::InboundHeaders;
use crate::relay::{Relay, RelayOutput};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub logger: SharedLogger,
}

/// Which error envelope a route speaks.
#[derive(Debug, Clone, Copy)]
enum Surface {
    OpenAi,
    Gemini,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/embeddings", post(handle_embeddings))
        .route("/:version/models/*model_action", post(handle_gemini))
        .route("/v1/models", get(handle_models))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inbound = InboundHeaders::from_axum(&headers);
    let result = state.relay.clone().chat_completions(body, inbound).await;
    respond(&state, Surface::OpenAi, result)
}

async fn handle_embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inbound = InboundHeaders::from_axum(&headers);
    let result = state.relay.clone().embeddings(body, inbound).await;
    respond(&state, Surface::OpenAi, result)
}

async fn handle_gemini(
    State(state): State<Arc<AppState>>,
    Path((version, model_action)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    tracing::debug!(version = %version, model_action = %model_action, "Gemini relay");
    let inbound = InboundHeaders::from_axum(&headers);
    let result = state.relay.clone().gemini(model_action, body, inbound).await;
    respond(&state, Surface::Gemini, result)
}

fn respond(state: &AppState, surface: Surface, result: crate::Result<RelayOutput>) -> Response {
    match result {
        Ok(RelayOutput::Json(body)) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Ok(RelayOutput::EventStream(mut rx)) => {
            let frames = async_stream::stream! {
                while let Some(frame) = rx.recv().await {
                    yield Ok::<_, Infallible>(frame);
                }
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .header("x-accel-buffering", "no")
                .body(Body::from_stream(frames))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => error_response(state, surface, &err),
    }
}

fn error_response(state: &AppState, surface: Surface, err: &RelayError) -> Response {
    if let RelayError::UpstreamTransport { detail } = err {
        state.logger.error("server", format!("upstream unreachable: {detail}"));
    } else {
        state
            .logger
            .warn("server", format!("request failed ({}): {err}", err.code()));
    }

    let status = err.status();
    match surface {
        Surface::OpenAi => (status, Json(err.to_openai_envelope())).into_response(),
        Surface::Gemini => (status, Json(err.to_gemini_envelope())).into_response(),
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let models: Vec<serde_json::Value> = state
        .relay
        .models()
        .into_iter()
        .map(|(id, owner)| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "owned_by": owner,
            })
        })
        .collect();

    Json(serde_json::json!({ "data": models, "object": "list" }))
}
