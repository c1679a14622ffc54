//! Messages pushed over real-time connections

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeMessageType {
    Notification,
    Announcement,
    ConnectionStatus,
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeMessage {
    #[serde(rename = "type")]
    pub message_type: RealtimeMessageType,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl RealtimeMessage {
    pub fn new(message_type: RealtimeMessageType, data: serde_json::Value) -> Self {
        Self {
            message_type,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn notification(data: serde_json::Value) -> Self {
        Self::new(RealtimeMessageType::Notification, data)
    }
}

/// Messages a connected client may send
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ack { notification_id: uuid::Uuid },
    Ping,
}
