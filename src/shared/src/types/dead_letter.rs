//! Notifications that exhausted their retry budget

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::notification::{
    DeliveryAttempt, Metadata, Notification, NotificationChannel, NotificationPriority,
};

/// What is needed to attempt a dead-lettered delivery again
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterPayload {
    pub user_id: String,
    pub event_type: String,
    pub channel: NotificationChannel,
    pub title: String,
    pub body: String,
    pub priority: NotificationPriority,
    #[serde(default)]
    pub metadata: Metadata,
}

impl From<&Notification> for DeadLetterPayload {
    fn from(notification: &Notification) -> Self {
        Self {
            user_id: notification.user_id.clone(),
            event_type: notification.event_type.clone(),
            channel: notification.channel,
            title: notification.title.clone(),
            body: notification.body.clone(),
            priority: notification.priority,
            metadata: notification.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

impl From<&DeliveryAttempt> for RetryAttempt {
    fn from(attempt: &DeliveryAttempt) -> Self {
        Self {
            attempted_at: attempt.attempted_at,
            success: attempt.success,
            error: attempt.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub user_id: String,
    pub event_type: String,
    pub channel: NotificationChannel,
    /// Original payload, kept opaque so older entries survive schema changes
    pub payload: serde_json::Value,
    /// Every attempt made before and after dead-lettering, oldest first
    pub retry_history: Vec<RetryAttempt>,
    /// Reprocessing attempts made by the dead-letter queue itself
    pub retry_count: u32,
    pub max_retries: u32,
    pub is_processed: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    pub fn is_exhausted(&self) -> bool {
        !self.is_processed && self.retry_count >= self.max_retries
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_processed
            && !self.is_exhausted()
            && self.next_retry_at.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub total: u64,
    pub processed: u64,
    pub pending: u64,
    pub exhausted: u64,
    pub exhausted_by_event_type: HashMap<String, u64>,
}
