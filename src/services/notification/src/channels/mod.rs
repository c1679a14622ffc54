//! Notification channels module
//!
//! This module contains implementations for all notification delivery channels:
//! - Email channel (SMTP)
//! - SMS channel (Twilio)
//! - Push notification channel (FCM)
//! - In-app inbox channel
//! - WebSocket channel (real-time)
//! - Mock channel for tests and local runs

use crate::error::Result;
use async_trait::async_trait;
use fileshare_shared::{
    ContactInfo, DeadLetterPayload, DeliveryResult, Metadata, Notification, NotificationChannel,
    NotificationPriority, NotificationRequest,
};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

pub mod email;
pub mod inapp;
pub mod mock;
pub mod push;
pub mod sms;
pub mod websocket;

pub use email::EmailChannel;
pub use inapp::{InAppChannel, InboxMessage, InboxStore, InMemoryInboxStore};
pub use mock::{MockChannel, MockOutcome};
pub use push::PushChannel;
pub use sms::SmsChannel;
pub use websocket::WebSocketChannel;

/// Trait that all notification channels must implement.
///
/// `send` may be called concurrently and must not mutate the request.
/// `validate` is always called by the channel manager before `send`.
#[async_trait]
pub trait Channel: Send + Sync {
    fn kind(&self) -> NotificationChannel;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// False when the channel lacks credentials or configuration
    fn is_enabled(&self) -> bool;

    /// Check channel-specific required fields of the request
    fn validate(&self, request: &DeliveryRequest) -> Result<()>;

    /// Send a notification through this channel
    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryResult>;

    /// Get channel-specific delivery information
    fn info(&self) -> ChannelInfo {
        ChannelInfo {
            name: self.name().to_string(),
            description: String::new(),
            enabled: self.is_enabled(),
            disabled_reason: None,
        }
    }
}

/// Information about a notification channel
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub disabled_reason: Option<String>,
}

/// What a channel needs to deliver one notification: rendered content plus
/// the recipient's contact details.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub notification_id: Option<Uuid>,
    /// Per-channel record ids when one request fans out to several records
    pub notification_ids: HashMap<NotificationChannel, Uuid>,
    pub user_id: String,
    pub event_type: String,
    pub channels: Vec<NotificationChannel>,
    pub title: String,
    pub body: String,
    pub priority: NotificationPriority,
    pub metadata: Metadata,
    pub contact: ContactInfo,
}

impl DeliveryRequest {
    pub fn from_request(request: &NotificationRequest, contact: ContactInfo) -> Self {
        Self {
            notification_id: None,
            notification_ids: HashMap::new(),
            user_id: request.user_id.clone(),
            event_type: request.event_type.clone(),
            channels: request.channels.clone(),
            title: request.title.clone(),
            body: request.body.clone(),
            priority: request.priority,
            metadata: request.metadata.clone(),
            contact,
        }
    }

    /// Single-channel request for re-delivering a stored notification
    pub fn from_notification(notification: &Notification, contact: ContactInfo) -> Self {
        Self {
            notification_id: Some(notification.id),
            notification_ids: HashMap::from([(notification.channel, notification.id)]),
            user_id: notification.user_id.clone(),
            event_type: notification.event_type.clone(),
            channels: vec![notification.channel],
            title: notification.title.clone(),
            body: notification.body.clone(),
            priority: notification.priority,
            metadata: notification.metadata.clone(),
            contact,
        }
    }

    /// Rebuild a request from a dead-lettered payload
    pub fn from_payload(payload: &DeadLetterPayload, notification_id: Uuid, contact: ContactInfo) -> Self {
        Self {
            notification_id: Some(notification_id),
            notification_ids: HashMap::from([(payload.channel, notification_id)]),
            user_id: payload.user_id.clone(),
            event_type: payload.event_type.clone(),
            channels: vec![payload.channel],
            title: payload.title.clone(),
            body: payload.body.clone(),
            priority: payload.priority,
            metadata: payload.metadata.clone(),
            contact,
        }
    }

    pub fn with_channels(mut self, channels: Vec<NotificationChannel>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_notification_ids(mut self, ids: HashMap<NotificationChannel, Uuid>) -> Self {
        self.notification_ids = ids;
        self
    }

    /// Record id for the notification on `channel`
    pub fn notification_id_for(&self, channel: NotificationChannel) -> Option<Uuid> {
        self.notification_ids
            .get(&channel)
            .copied()
            .or(self.notification_id)
    }
}
