//! Aggregation of repeated events inside one batching window

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::notification::{Metadata, NotificationChannel};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNotification {
    pub id: Uuid,
    pub user_id: String,
    pub event_type: String,
    pub channel: NotificationChannel,
    pub items: Vec<BatchItem>,
    pub count: usize,
    pub status: BatchStatus,
    pub window_started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Summary notification produced when the window closed
    pub notification_id: Option<Uuid>,
}

impl BatchNotification {
    pub fn open(
        user_id: impl Into<String>,
        event_type: impl Into<String>,
        channel: NotificationChannel,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            event_type: event_type.into(),
            channel,
            items: Vec::new(),
            count: 0,
            status: BatchStatus::Open,
            window_started_at: Utc::now(),
            closed_at: None,
            notification_id: None,
        }
    }

    pub fn push(&mut self, item: BatchItem) {
        self.items.push(item);
        self.count = self.items.len();
    }

    pub fn close(&mut self, at: DateTime<Utc>) {
        self.status = BatchStatus::Closed;
        self.closed_at = Some(at);
    }
}
