use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use notification_gateway::{
    api::{AppState, router},
    clients::{
        circuit_breaker::CircuitBreaker,
        health::{BrokerReadiness, HealthChecker},
        memory::{InMemoryKeyValueStore, InMemoryNotificationStore},
        proxy::ProxyGateway,
    },
    config::{AckMode, ConsumerSettings},
    consumer::{DedupConsumer, ProcessOutcome},
    error::StoreError,
    metrics::Metrics,
    models::{
        circuit_breaker::CircuitBreakerConfig,
        status::{NotificationStatus, NotificationType},
    },
    store::{DedupLock, KeyValueStore, NotificationRepository},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

use crate::support::{FlakyPublisher, RecordingHandler, publisher};

struct Readiness(bool);

#[async_trait]
impl BrokerReadiness for Readiness {
    async fn is_ready(&self) -> bool {
        self.0
    }
}

struct TestApp {
    router: Router,
    cache: Arc<InMemoryKeyValueStore>,
    notifications: Arc<InMemoryNotificationStore>,
    broker: Arc<FlakyPublisher>,
}

fn app(broker: FlakyPublisher, template_service_url: Option<String>, broker_ready: bool) -> TestApp {
    let cache = Arc::new(InMemoryKeyValueStore::new());
    let notifications = Arc::new(InMemoryNotificationStore::new());
    let broker = Arc::new(broker);

    let circuit_breaker = Arc::new(CircuitBreaker::new(
        "downstream_services",
        CircuitBreakerConfig::default(),
    ));
    let users = ProxyGateway::new("user_service", None, Duration::from_secs(2), circuit_breaker.clone())
        .expect("http client builds");
    let templates = ProxyGateway::new(
        "template_service",
        template_service_url,
        Duration::from_secs(2),
        circuit_breaker.clone(),
    )
    .expect("http client builds");

    let state = Arc::new(AppState {
        publisher: publisher(cache.clone(), notifications.clone(), broker.clone()),
        users,
        templates,
        health_checker: HealthChecker::new(
            Arc::new(Readiness(broker_ready)),
            cache.clone(),
            notifications.clone(),
            vec![circuit_breaker],
        ),
        metrics: Arc::new(Metrics::new().expect("metrics register")),
    });

    TestApp {
        router: router(state),
        cache,
        notifications,
        broker,
    }
}

fn send(body: &str, request_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/v1/notifications/send")
        .header("content-type", "application/json");
    if let Some(request_id) = request_id {
        builder = builder.header("x-request-id", request_id);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Option<String>, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let request_id = response
        .headers()
        .get("x-request-id")
        .map(|value| value.to_str().unwrap().to_string());
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, request_id, body)
}

fn json_body(body: &[u8]) -> Value {
    serde_json::from_slice(body).expect("response is JSON")
}

/// Test: A send without X-Request-ID is queued under a generated id
#[tokio::test]
async fn test_send_generates_request_id() {
    let app = app(FlakyPublisher::reliable(), None, true);

    let (status, echoed, body) = call(
        &app.router,
        send(r#"{"type":"email","recipient":{"email":"a@b.com"}}"#, None),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Notification queued");

    let request_id = body["data"]["request_id"].as_str().unwrap().to_string();
    assert!(Uuid::parse_str(&request_id).is_ok());
    assert_eq!(echoed.as_deref(), Some(request_id.as_str()));

    let notification_id = Uuid::parse_str(body["data"]["notification_id"].as_str().unwrap()).unwrap();
    let row = app.notifications.get(notification_id).await.unwrap().unwrap();
    assert_eq!(row.status, NotificationStatus::Queued);
    assert_eq!(row.request_id, request_id);
}

/// Test: A repeated X-Request-ID is acknowledged but not republished
#[tokio::test]
async fn test_duplicate_request_is_ignored() {
    let app = app(FlakyPublisher::reliable(), None, true);
    let body = r#"{"type":"push","template_id":"promo","recipient":{"token":"abc"}}"#;

    let (first, _, _) = call(&app.router, send(body, Some("req-7"))).await;
    let (second, echoed, response) = call(&app.router, send(body, Some("req-7"))).await;

    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(echoed.as_deref(), Some("req-7"));

    let response = json_body(&response);
    assert_eq!(response, json!({"success": true, "message": "Duplicate request ignored"}));
    assert_eq!(app.broker.published().await.len(), 1);
}

/// Test: Unknown types are rejected with 400 and recorded as failed
#[tokio::test]
async fn test_unknown_type_is_bad_request() {
    let app = app(FlakyPublisher::reliable(), None, true);

    let (status, _, body) = call(
        &app.router,
        send(r#"{"type":"sms","recipient":{"phone":"+100"}}"#, Some("req-sms")),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body)["message"], "Invalid notification type");

    let rows = app.notifications.all().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, NotificationStatus::Failed);
    assert!(app.broker.published().await.is_empty());
}

/// Test: Malformed bodies are rejected before anything is stored
#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let app = app(FlakyPublisher::reliable(), None, true);

    let (status, _, body) = call(&app.router, send("{\"type\":", None)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body), json!({"success": false, "message": "Invalid request"}));
    assert!(app.notifications.all().await.is_empty());
    assert!(app.cache.keys().await.is_empty());
}

/// Test: Publish exhaustion surfaces as 500
#[tokio::test]
async fn test_publish_failure_is_server_error() {
    let app = app(FlakyPublisher::always_failing(), None, true);

    let (status, _, body) = call(
        &app.router,
        send(r#"{"type":"email","recipient":{"email":"a@b.com"}}"#, Some("req-500")),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(&body);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Failed to queue notification");
    assert_eq!(app.notifications.all().await[0].status, NotificationStatus::Failed);
}

/// Test: Wrong method on the send route answers 405 with the envelope
#[tokio::test]
async fn test_wrong_method_is_rejected() {
    let app = app(FlakyPublisher::reliable(), None, true);

    let request = Request::builder()
        .method("GET")
        .uri("/api/v1/notifications/send")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = call(&app.router, request).await;

    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(json_body(&body), json!({"success": false, "message": "Method not allowed"}));
}

/// Test: Health stays 200 and reports component state
#[tokio::test]
async fn test_health_is_always_ok() {
    let app = app(FlakyPublisher::reliable(), None, false);

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, _, body) = call(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "API Gateway healthy");
    assert_eq!(body["data"]["status"], "unhealthy");
    assert_eq!(body["data"]["checks"]["message_broker"]["status"], "unhealthy");
    assert_eq!(body["data"]["checks"]["cache_service"]["status"], "healthy");
    assert_eq!(
        body["data"]["checks"]["downstream_services"]["circuit_breaker"],
        "closed"
    );
}

/// Test: Metrics expose request durations and error counts
#[tokio::test]
async fn test_metrics_are_exposed() {
    let app = app(FlakyPublisher::reliable(), None, true);
    call(&app.router, send("not json", None)).await;

    let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let (status, _, body) = call(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains(
        "api_gateway_request_duration_seconds_count{code=\"400\",handler=\"send_notification\"} 1"
    ));
    assert!(text.contains(
        "api_gateway_request_errors_total{error=\"bad_request\",handler=\"send_notification\"} 1"
    ));
}

/// Test: Proxied routes pass the downstream response through
#[tokio::test]
async fn test_template_route_is_proxied() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/templates/welcome"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(r#"{"code":"welcome"}"#, "application/json"),
        )
        .mount(&server)
        .await;

    let app = app(FlakyPublisher::reliable(), Some(server.uri()), true);
    let request = Request::builder()
        .uri("/api/v1/templates/welcome?lang=en")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = call(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body), json!({"code": "welcome"}));
}

/// Test: A missing downstream answers 502
#[tokio::test]
async fn test_unavailable_downstream_is_bad_gateway() {
    let app = app(FlakyPublisher::reliable(), None, true);

    let request = Request::builder()
        .method("DELETE")
        .uri("/api/v1/users/42")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = call(&app.router, request).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(
        json_body(&body),
        json!({"success": false, "message": "Downstream service unavailable"})
    );
}

/// Test: A queued email is delivered and ends up sent
#[tokio::test]
async fn test_end_to_end_notification_is_sent() {
    let app = app(FlakyPublisher::reliable(), None, true);

    let (status, _, body) = call(
        &app.router,
        send(r#"{"type":"email","recipient":{"email":"a@b.com"}}"#, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let notification_id =
        Uuid::parse_str(json_body(&body)["data"]["notification_id"].as_str().unwrap()).unwrap();

    let consumer = DedupConsumer::new(
        DedupLock::new(app.cache.clone(), Duration::from_secs(300)),
        app.notifications.clone(),
        ConsumerSettings {
            poll_interval: Duration::from_millis(10),
            subscribe_backoff: Duration::from_millis(10),
            ack_mode: AckMode::OnReceipt,
            lock_ttl: Duration::from_secs(300),
        },
    )
    .with_handler(NotificationType::Email, Arc::new(RecordingHandler::succeeding()));

    let published = app.broker.published().await;
    assert_eq!(published.len(), 1);
    let outcome = consumer.process_delivery(&published[0].payload).await;

    assert_eq!(outcome, ProcessOutcome::Sent(notification_id));
    let row = app.notifications.get(notification_id).await.unwrap().unwrap();
    assert_eq!(row.status, NotificationStatus::Sent);
}

/// Cache double that never answers.
struct StalledCache;

#[async_trait]
impl KeyValueStore for StalledCache {
    async fn set_if_absent(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
        std::future::pending().await
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        std::future::pending().await
    }

    async fn contains(&self, _key: &str) -> Result<bool, StoreError> {
        std::future::pending().await
    }
}

/// Test: A stalled dependency is reported unhealthy instead of hanging the check
#[tokio::test]
async fn test_stalled_dependency_is_bounded() {
    let checker = HealthChecker::new(
        Arc::new(Readiness(true)),
        Arc::new(StalledCache),
        Arc::new(InMemoryNotificationStore::new()),
        Vec::new(),
    )
    .with_check_timeout(Duration::from_millis(50));

    let report = tokio::time::timeout(Duration::from_secs(1), checker.check_all())
        .await
        .expect("health check completes");

    let report = serde_json::to_value(&report).unwrap();
    assert_eq!(report["status"], "unhealthy");
    assert_eq!(report["checks"]["cache_service"]["status"], "unhealthy");
    assert_eq!(report["checks"]["database"]["status"], "healthy");
}
