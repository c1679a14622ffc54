//! Per-user routing configuration

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::events::event_types;
use super::notification::NotificationChannel;

/// Daily window during which non-bypass notifications are held back.
///
/// `start > end` describes a window that crosses midnight (22:00-08:00),
/// `start < end` a same-day window. `start == end` is an empty window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Offset of the user's local time from UTC
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start,
            end,
            utc_offset_minutes: 0,
        }
    }

    pub fn with_utc_offset(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = minutes;
        self
    }

    /// Whether a local wall-clock time falls in the window. The start is
    /// inclusive, the end exclusive.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        let local = now + Duration::minutes(i64::from(self.utc_offset_minutes));
        let time = local.time();
        let time = NaiveTime::from_hms_opt(time.hour(), time.minute(), time.second()).unwrap_or(time);
        self.contains(time)
    }
}

/// Where a user can be reached
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub email: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub push_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserNotificationPreferences {
    /// Taken from the request path when omitted
    #[serde(default)]
    pub user_id: String,
    pub email_enabled: bool,
    pub sms_enabled: bool,
    pub push_enabled: bool,
    pub inapp_enabled: bool,
    pub websocket_enabled: bool,
    #[serde(default)]
    pub contact: ContactInfo,
    #[serde(default)]
    pub subscribed_events: HashSet<String>,
    pub quiet_hours: Option<QuietHours>,
    /// Ordered channel list per event type, used when a request names no channels
    #[serde(default)]
    pub channel_priority: HashMap<String, Vec<NotificationChannel>>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl UserNotificationPreferences {
    /// Preferences applied to users that never saved any: every channel but
    /// SMS, subscribed to the file lifecycle, share, quota and security events.
    pub fn defaults_for(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email_enabled: true,
            sms_enabled: false,
            push_enabled: true,
            inapp_enabled: true,
            websocket_enabled: true,
            contact: ContactInfo::default(),
            subscribed_events: event_types::DEFAULT_SUBSCRIPTIONS
                .iter()
                .map(|event| event.to_string())
                .collect(),
            quiet_hours: None,
            channel_priority: HashMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn is_channel_enabled(&self, channel: NotificationChannel) -> bool {
        match channel {
            NotificationChannel::Email => self.email_enabled,
            NotificationChannel::Sms => self.sms_enabled,
            NotificationChannel::Push => self.push_enabled,
            NotificationChannel::InApp => self.inapp_enabled,
            NotificationChannel::Websocket => self.websocket_enabled,
        }
    }

    pub fn set_channel_enabled(&mut self, channel: NotificationChannel, enabled: bool) {
        match channel {
            NotificationChannel::Email => self.email_enabled = enabled,
            NotificationChannel::Sms => self.sms_enabled = enabled,
            NotificationChannel::Push => self.push_enabled = enabled,
            NotificationChannel::InApp => self.inapp_enabled = enabled,
            NotificationChannel::Websocket => self.websocket_enabled = enabled,
        }
    }

    pub fn is_subscribed(&self, event_type: &str) -> bool {
        self.subscribed_events.contains(event_type)
    }

    pub fn enabled_channels(&self) -> Vec<NotificationChannel> {
        NotificationChannel::ALL
            .into_iter()
            .filter(|channel| self.is_channel_enabled(*channel))
            .collect()
    }
}
