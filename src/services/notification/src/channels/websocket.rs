//! WebSocket notification channel implementation for real-time notifications

use crate::channels::{Channel, ChannelInfo, DeliveryRequest};
use crate::config::WebSocketConfig;
use crate::error::{NotificationError, Result};
use crate::realtime::RealtimeHub;
use async_trait::async_trait;
use fileshare_shared::{metadata_to_json, DeliveryResult, NotificationChannel, RealtimeMessage};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Pushes notifications to the user's live connection, if any
#[derive(Clone)]
pub struct WebSocketChannel {
    config: WebSocketConfig,
    hub: Arc<RealtimeHub>,
}

impl WebSocketChannel {
    pub fn new(config: &WebSocketConfig, hub: Arc<RealtimeHub>) -> Self {
        Self {
            config: config.clone(),
            hub,
        }
    }

    fn envelope(request: &DeliveryRequest) -> RealtimeMessage {
        RealtimeMessage::notification(json!({
            "notification_id": request.notification_id_for(NotificationChannel::Websocket),
            "event_type": request.event_type,
            "title": request.title,
            "body": request.body,
            "priority": request.priority,
            "metadata": metadata_to_json(&request.metadata),
        }))
    }
}

#[async_trait]
impl Channel for WebSocketChannel {
    fn kind(&self) -> NotificationChannel {
        NotificationChannel::Websocket
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn validate(&self, request: &DeliveryRequest) -> Result<()> {
        if request.user_id.is_empty() {
            return Err(NotificationError::validation("user_id", "is required for real-time delivery"));
        }
        Ok(())
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryResult> {
        if !self.config.enabled {
            return Err(NotificationError::channel_disabled(self.name(), "disabled by configuration"));
        }

        // Offline users fail here immediately; nothing is queued for reconnects
        self.hub.send_to_user(&request.user_id, &Self::envelope(request))?;
        debug!(user_id = %request.user_id, "Pushed real-time notification");

        Ok(DeliveryResult::success(self.kind()))
    }

    fn info(&self) -> ChannelInfo {
        ChannelInfo {
            name: self.name().to_string(),
            description: "Real-time push to connected clients".to_string(),
            enabled: self.is_enabled(),
            disabled_reason: (!self.config.enabled).then(|| "disabled by configuration".to_string()),
        }
    }
}
