use std::{future::Future, sync::Arc};

use anyhow::Result;
use axum::{
    Router,
    body::{Body, Bytes, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Json, Response},
    routing::{any, get, post},
};
use tokio::{net::TcpListener, time::Instant};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    clients::{
        health::HealthChecker,
        proxy::{ProxyGateway, ProxyRequest},
    },
    error::PublishError,
    metrics::{ErrorKind, Metrics},
    models::{
        message::NotificationMessage,
        response::{ApiResponse, QueuedNotification},
    },
    publisher::{PublishOutcome, ReliablePublisher},
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const SEND_HANDLER: &str = "send_notification";
const PROXY_HANDLER: &str = "proxy_request";
const MAX_PROXY_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Everything the HTTP handlers need, built once at startup.
pub struct AppState {
    pub publisher: ReliablePublisher,
    pub users: ProxyGateway,
    pub templates: ProxyGateway,
    pub health_checker: HealthChecker,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/v1/notifications/send",
            post(send_notification).fallback(method_not_allowed),
        )
        .route("/api/v1/users", any(proxy_users))
        .route("/api/v1/users/{*path}", any(proxy_users))
        .route("/api/v1/templates", any(proxy_templates))
        .route("/api/v1/templates/{*path}", any(proxy_templates))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server(
    state: Arc<AppState>,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "API gateway started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("API gateway stopped");
    Ok(())
}

async fn send_notification(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (status, envelope) = match serde_json::from_slice::<NotificationMessage>(&body) {
        Ok(message) => publish(&state, &message, &request_id).await,
        Err(e) => {
            warn!(%request_id, error = %e, "Rejecting malformed send request");
            state.metrics.record_error(SEND_HANDLER, ErrorKind::BadRequest);
            (StatusCode::BAD_REQUEST, ApiResponse::error("Invalid request"))
        }
    };

    state
        .metrics
        .observe_request(SEND_HANDLER, status.as_u16(), started.elapsed());

    let mut response = (status, Json(envelope)).into_response();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn publish(
    state: &AppState,
    message: &NotificationMessage,
    request_id: &str,
) -> (StatusCode, ApiResponse<QueuedNotification>) {
    match state.publisher.publish(message, request_id).await {
        Ok(PublishOutcome::Queued { notification_id }) => (
            StatusCode::OK,
            ApiResponse::success(
                QueuedNotification {
                    notification_id: notification_id.to_string(),
                    request_id: request_id.to_string(),
                },
                "Notification queued",
            ),
        ),
        Ok(PublishOutcome::Duplicate) => {
            (StatusCode::OK, ApiResponse::ok("Duplicate request ignored"))
        }
        Err(PublishError::InvalidType(_)) => {
            state.metrics.record_error(SEND_HANDLER, ErrorKind::InvalidType);
            (
                StatusCode::BAD_REQUEST,
                ApiResponse::error("Invalid notification type"),
            )
        }
        Err(e) => {
            error!(request_id, error = %e, "Send request failed");
            state.metrics.record_error(SEND_HANDLER, ErrorKind::QueuePublish);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::error("Failed to queue notification"),
            )
        }
    }
}

async fn method_not_allowed() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(ApiResponse::<()>::error("Method not allowed")),
    )
}

async fn proxy_users(State(state): State<Arc<AppState>>, request: Request) -> Response {
    forward(&state, &state.users, request).await
}

async fn proxy_templates(State(state): State<Arc<AppState>>, request: Request) -> Response {
    forward(&state, &state.templates, request).await
}

async fn forward(state: &AppState, gateway: &ProxyGateway, request: Request) -> Response {
    let started = Instant::now();
    let (parts, body) = request.into_parts();

    let body = match to_bytes(body, MAX_PROXY_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(service = gateway.service_name(), error = %e, "Failed to read proxied body");
            state.metrics.record_error(PROXY_HANDLER, ErrorKind::BadRequest);
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::<()>::error("Invalid request")),
            )
                .into_response();
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let result = gateway
        .forward(ProxyRequest {
            method: parts.method,
            path_and_query,
            headers: parts.headers,
            body,
        })
        .await;

    let response = match result {
        Ok(downstream) => {
            let mut response = (downstream.status, Body::from(downstream.body)).into_response();
            let headers = response.headers_mut();
            headers.remove(CONTENT_TYPE);
            if let Some(value) = downstream
                .content_type
                .as_deref()
                .and_then(|ct| HeaderValue::from_str(ct).ok())
            {
                headers.insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            warn!(service = gateway.service_name(), error = %e, "Proxy request failed");
            state.metrics.record_error(PROXY_HANDLER, ErrorKind::ExternalCall);
            (
                StatusCode::BAD_GATEWAY,
                Json(ApiResponse::<()>::error("Downstream service unavailable")),
            )
                .into_response()
        }
    };

    state
        .metrics
        .observe_request(PROXY_HANDLER, response.status().as_u16(), started.elapsed());
    response
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.health_checker.check_all().await;
    (
        StatusCode::OK,
        Json(ApiResponse::success(report, "API Gateway healthy")),
    )
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
