//! Routes module for the notification service
//!
//! This module defines all HTTP routes and WebSocket endpoints for the notification service:
//! - Notification submission, lookup and read receipts
//! - Preference and template management
//! - Announcements and dead-letter inspection
//! - WebSocket connections for real-time notifications
//! - Health and metrics endpoints

use crate::handlers::{
    admin_handler, health_handler, metrics_handler, notifications_handler, preferences_handler,
    templates_handler, websocket_handler, AppState,
};

use axum::{
    routing::{get, post, put},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};

/// Build the main router for the notification service
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    // The WebSocket route stays outside the timeout; sessions are long-lived
    let api_router = create_api_router().layer(TimeoutLayer::new(request_timeout));

    Router::new()
        .merge(api_router)
        .merge(create_websocket_router())
        .merge(create_health_router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(CompressionLayer::new())
                .into_inner(),
        )
        .with_state(state)
}

/// Create API routes for REST endpoints
fn create_api_router() -> Router<AppState> {
    Router::new()
        // Notification endpoints
        .route(
            "/api/v1/notifications",
            post(notifications_handler::create_notification)
                .get(notifications_handler::list_notifications),
        )
        .route(
            "/api/v1/notifications/:id",
            get(notifications_handler::get_notification),
        )
        .route(
            "/api/v1/notifications/:id/read",
            post(notifications_handler::mark_read),
        )
        // Preference endpoints
        .route(
            "/api/v1/preferences/:user_id",
            get(preferences_handler::get_preferences).put(preferences_handler::update_preferences),
        )
        // Template endpoints
        .route("/api/v1/templates", put(templates_handler::upsert_template))
        // Admin endpoints
        .route("/api/v1/announcements", post(admin_handler::broadcast))
        .route("/api/v1/dead-letters", get(admin_handler::list_dead_letters))
        .route(
            "/api/v1/dead-letters/stats",
            get(admin_handler::dead_letter_stats),
        )
}

/// Create WebSocket routes
fn create_websocket_router() -> Router<AppState> {
    Router::new().route("/ws", get(websocket_handler::websocket_handler))
}

/// Create health and metrics routes
fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationConfig;
    use crate::NotificationService;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(config: NotificationConfig) -> Router {
        let service = NotificationService::new(config).unwrap();
        service.router()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_notification_round_trip() {
        let app = app(NotificationConfig::default());

        let (status, created) = send(
            app.clone(),
            post_json(
                "/api/v1/notifications",
                json!({
                    "user_id": "u1",
                    "event_type": "file.shared",
                    "channels": ["inapp"],
                    "title": "Shared",
                    "body": "a.txt was shared with you",
                    "bypass_batching": true
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "sent");

        let id = created["id"].as_str().unwrap();
        let (status, fetched) = send(app.clone(), get(&format!("/api/v1/notifications/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["channel"], "inapp");

        let (status, listed) = send(app.clone(), get("/api/v1/notifications?user_id=u1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["pagination"]["total"], 1);

        let read = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/notifications/{id}/read"))
            .body(Body::empty())
            .unwrap();
        let (status, marked) = send(app, read).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(marked["status"], "read");
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let app = app(NotificationConfig::default());
        let (status, body) = send(
            app,
            post_json(
                "/api/v1/notifications",
                json!({"user_id": "", "event_type": "file.shared", "title": "t", "body": "b"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_unknown_notification_is_not_found() {
        let app = app(NotificationConfig::default());
        let (status, _) = send(
            app,
            get("/api/v1/notifications/00000000-0000-0000-0000-000000000000"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_preferences_update() {
        let app = app(NotificationConfig::default());
        let update = Request::builder()
            .method("PUT")
            .uri("/api/v1/preferences/u7")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "email_enabled": false,
                    "sms_enabled": true,
                    "push_enabled": false,
                    "inapp_enabled": true,
                    "websocket_enabled": true,
                    "subscribed_events": ["file.shared"],
                    "quiet_hours": {"start": "22:00:00", "end": "08:00:00"}
                })
                .to_string(),
            ))
            .unwrap();
        let (status, saved) = send(app.clone(), update).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(saved["user_id"], "u7");

        let (_, fetched) = send(app, get("/api/v1/preferences/u7")).await;
        assert_eq!(fetched["sms_enabled"], true);
        assert_eq!(fetched["quiet_hours"]["start"], "22:00:00");
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let app_with_metrics = app(NotificationConfig::default());
        let (status, health) = send(app_with_metrics.clone(), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["channels"]["inapp"], true);

        let response = app_with_metrics.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut config = NotificationConfig::default();
        config.metrics.enabled = false;
        let (status, _) = send(app(config), get("/metrics")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_websocket_requires_user() {
        let app = app(NotificationConfig::default());
        let request = Request::builder()
            .uri("/ws")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app, request).await;
        assert_ne!(status, StatusCode::SWITCHING_PROTOCOLS);
    }

    #[tokio::test]
    async fn test_dead_letter_stats_start_empty() {
        let app = app(NotificationConfig::default());
        let (status, stats) = send(app, get("/api/v1/dead-letters/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["total"], 0);
    }
}
