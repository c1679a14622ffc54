//! In-app channel: stores notifications in a per-user inbox read by the web app

use crate::channels::{Channel, ChannelInfo, DeliveryRequest};
use crate::config::InAppConfig;
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fileshare_shared::{DeliveryResult, Metadata, NotificationChannel, NotificationPriority};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: Uuid,
    pub notification_id: Option<Uuid>,
    pub event_type: String,
    pub title: String,
    pub body: String,
    pub priority: NotificationPriority,
    pub metadata: Metadata,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Append a message, dropping the oldest ones past `max_size`
    async fn push(&self, user_id: &str, message: InboxMessage, max_size: usize) -> Result<()>;

    /// Newest first
    async fn list(&self, user_id: &str, limit: usize) -> Result<Vec<InboxMessage>>;
}

#[derive(Default)]
pub struct InMemoryInboxStore {
    inboxes: DashMap<String, VecDeque<InboxMessage>>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn push(&self, user_id: &str, message: InboxMessage, max_size: usize) -> Result<()> {
        let mut inbox = self.inboxes.entry(user_id.to_string()).or_default();
        inbox.push_back(message);
        while inbox.len() > max_size {
            inbox.pop_front();
        }
        Ok(())
    }

    async fn list(&self, user_id: &str, limit: usize) -> Result<Vec<InboxMessage>> {
        Ok(self
            .inboxes
            .get(user_id)
            .map(|inbox| inbox.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

pub struct InAppChannel {
    config: InAppConfig,
    store: Arc<dyn InboxStore>,
}

impl InAppChannel {
    pub fn new(config: &InAppConfig, store: Arc<dyn InboxStore>) -> Self {
        Self {
            config: config.clone(),
            store,
        }
    }
}

#[async_trait]
impl Channel for InAppChannel {
    fn kind(&self) -> NotificationChannel {
        NotificationChannel::InApp
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn validate(&self, request: &DeliveryRequest) -> Result<()> {
        if request.user_id.is_empty() {
            return Err(NotificationError::validation("user_id", "is required for in-app delivery"));
        }
        Ok(())
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryResult> {
        if !self.config.enabled {
            return Err(NotificationError::channel_disabled(
                self.name(),
                "disabled by configuration",
            ));
        }

        let message = InboxMessage {
            id: Uuid::new_v4(),
            notification_id: request.notification_id_for(NotificationChannel::InApp),
            event_type: request.event_type.clone(),
            title: request.title.clone(),
            body: request.body.clone(),
            priority: request.priority,
            metadata: request.metadata.clone(),
            received_at: Utc::now(),
        };
        let message_id = message.id;

        self.store
            .push(&request.user_id, message, self.config.max_inbox_size)
            .await?;
        debug!(user_id = %request.user_id, %message_id, "Stored in-app notification");

        Ok(DeliveryResult::success(self.kind()).with_provider_message_id(message_id.to_string()))
    }

    fn info(&self) -> ChannelInfo {
        ChannelInfo {
            name: self.name().to_string(),
            description: "In-app inbox".to_string(),
            enabled: self.is_enabled(),
            disabled_reason: (!self.config.enabled).then(|| "disabled by configuration".to_string()),
        }
    }
}
