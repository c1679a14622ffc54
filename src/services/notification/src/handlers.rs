//! Request handlers for the notification service
//!
//! This module contains all HTTP request handlers for the notification service API:
//! - Notification submission, lookup and read receipts
//! - Preference and template management
//! - Announcements and dead-letter inspection
//! - WebSocket upgrades
//! - Health and metrics handlers

use crate::error::{NotificationError, Result};
use crate::orchestrator::NotificationOrchestrator;
use crate::repository::Pagination;
use crate::templates::{NotificationTemplate, TemplateResolver};
use crate::websocket::serve_socket;
use fileshare_shared::{DispatchStatus, Metadata, NotificationRequest, UserNotificationPreferences};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Header carrying the caller's user id when the query string does not
pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared state of every route
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<NotificationOrchestrator>,
    pub templates: Arc<TemplateResolver>,
    pub metrics_enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl PageQuery {
    fn pagination(&self) -> Pagination {
        Pagination::new(self.page.unwrap_or(1), self.limit.unwrap_or(20))
    }
}

pub mod notifications_handler {
    use super::*;

    #[derive(Debug, Deserialize)]
    pub struct NotificationQuery {
        pub user_id: Option<String>,
        pub page: Option<u32>,
        pub limit: Option<u32>,
    }

    /// Submit a notification request
    pub async fn create_notification(
        State(state): State<AppState>,
        Json(request): Json<NotificationRequest>,
    ) -> Result<impl IntoResponse> {
        info!(user_id = %request.user_id, event_type = %request.event_type, "Submitting notification");

        let response = state.orchestrator.try_notify(request).await?;
        let status = match response.status {
            DispatchStatus::Sent => StatusCode::CREATED,
            DispatchStatus::Queued => StatusCode::ACCEPTED,
            DispatchStatus::Suppressed => StatusCode::OK,
            DispatchStatus::Failed => StatusCode::BAD_GATEWAY,
        };
        Ok((status, Json(response)))
    }

    /// Get a notification by ID
    pub async fn get_notification(
        State(state): State<AppState>,
        Path(id): Path<Uuid>,
    ) -> Result<impl IntoResponse> {
        Ok(Json(state.orchestrator.get_notification(id).await?))
    }

    /// List a user's notifications, newest first
    pub async fn list_notifications(
        State(state): State<AppState>,
        Query(query): Query<NotificationQuery>,
    ) -> Result<impl IntoResponse> {
        let user_id = query
            .user_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| NotificationError::validation("user_id", "query parameter is required"))?;
        let pagination = Pagination::new(query.page.unwrap_or(1), query.limit.unwrap_or(20));

        let page = state.orchestrator.list_notifications(&user_id, pagination).await?;
        info!(%user_id, returned = page.data.len(), total = page.pagination.total, "Listed notifications");
        Ok(Json(page))
    }

    /// Mark a sent notification as read
    pub async fn mark_read(
        State(state): State<AppState>,
        Path(id): Path<Uuid>,
    ) -> Result<impl IntoResponse> {
        Ok(Json(state.orchestrator.mark_read(id).await?))
    }
}

pub mod preferences_handler {
    use super::*;

    pub async fn get_preferences(
        State(state): State<AppState>,
        Path(user_id): Path<String>,
    ) -> Result<impl IntoResponse> {
        Ok(Json(state.orchestrator.get_preferences(&user_id).await?))
    }

    /// Replace a user's preferences. The path decides whose they are.
    pub async fn update_preferences(
        State(state): State<AppState>,
        Path(user_id): Path<String>,
        Json(mut preferences): Json<UserNotificationPreferences>,
    ) -> Result<impl IntoResponse> {
        preferences.user_id = user_id;
        let saved = state.orchestrator.update_preferences(preferences).await?;
        info!(user_id = %saved.user_id, "Preferences updated");
        Ok(Json(saved))
    }
}

pub mod templates_handler {
    use super::*;

    /// Create or replace the template for an event type and channel
    pub async fn upsert_template(
        State(state): State<AppState>,
        Json(template): Json<NotificationTemplate>,
    ) -> Result<impl IntoResponse> {
        let event_type = template.event_type.clone();
        let channel = template.channel;
        state.templates.upsert(template).await?;
        info!(%event_type, ?channel, "Template stored");
        Ok(StatusCode::NO_CONTENT)
    }
}

pub mod admin_handler {
    use super::*;

    #[derive(Debug, Deserialize)]
    pub struct AnnouncementRequest {
        pub title: String,
        #[serde(default)]
        pub body: String,
        #[serde(default)]
        pub metadata: Metadata,
    }

    /// Push an announcement to everyone connected
    pub async fn broadcast(
        State(state): State<AppState>,
        Json(announcement): Json<AnnouncementRequest>,
    ) -> Result<impl IntoResponse> {
        let report = state
            .orchestrator
            .broadcast(&announcement.title, &announcement.body, &announcement.metadata)?;
        Ok(Json(report))
    }

    pub async fn list_dead_letters(
        State(state): State<AppState>,
        Query(query): Query<PageQuery>,
    ) -> Result<impl IntoResponse> {
        Ok(Json(state.orchestrator.list_dead_letters(query.pagination()).await?))
    }

    pub async fn dead_letter_stats(State(state): State<AppState>) -> Result<impl IntoResponse> {
        Ok(Json(state.orchestrator.dead_letter_stats().await?))
    }
}

pub mod websocket_handler {
    use super::*;

    #[derive(Debug, Deserialize)]
    pub struct ConnectQuery {
        pub user_id: Option<String>,
    }

    /// Upgrade to a real-time session for the user named by `?user_id=` or
    /// the `X-User-Id` header
    pub async fn websocket_handler(
        ws: WebSocketUpgrade,
        State(state): State<AppState>,
        Query(query): Query<ConnectQuery>,
        headers: HeaderMap,
    ) -> Result<Response> {
        let user_id = query
            .user_id
            .or_else(|| {
                headers
                    .get(USER_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            })
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| NotificationError::validation("user_id", "user_id query parameter or X-User-Id header is required"))?;

        info!(%user_id, "WebSocket upgrade requested");
        let orchestrator = state.orchestrator.clone();
        Ok(ws.on_upgrade(move |socket| serve_socket(socket, user_id, orchestrator)))
    }
}

/// Health check handler
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.orchestrator.health();
    let status = if health.status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

/// Prometheus text exposition
pub async fn metrics_handler(State(state): State<AppState>) -> Result<Response> {
    if !state.metrics_enabled {
        return Err(NotificationError::not_found("metrics"));
    }
    match state.orchestrator.metrics().export_metrics() {
        Ok(body) => Ok((
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response()),
        Err(e) => {
            error!(error = %e, "Failed to export metrics");
            Err(e)
        }
    }
}
