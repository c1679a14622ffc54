//! Per-user routing: subscriptions, enabled channels and quiet hours

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fileshare_shared::{
    ContactInfo, NotificationChannel, NotificationRequest, UserNotificationPreferences,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<UserNotificationPreferences>>;

    async fn upsert(&self, preferences: UserNotificationPreferences) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryPreferenceStore {
    preferences: DashMap<String, UserNotificationPreferences>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn get(&self, user_id: &str) -> Result<Option<UserNotificationPreferences>> {
        Ok(self.preferences.get(user_id).map(|p| p.value().clone()))
    }

    async fn upsert(&self, preferences: UserNotificationPreferences) -> Result<()> {
        self.preferences.insert(preferences.user_id.clone(), preferences);
        Ok(())
    }
}

/// Why a request produced no delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    Unsubscribed,
    QuietHours,
    NoEnabledChannels,
}

impl fmt::Display for SuppressionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsubscribed => write!(f, "user is not subscribed to this event"),
            Self::QuietHours => write!(f, "suppressed by quiet hours"),
            Self::NoEnabledChannels => write!(f, "user disabled every requested channel"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelResolution {
    pub subscribed: bool,
    pub channel_enabled: bool,
}

impl ChannelResolution {
    pub fn deliverable(&self) -> bool {
        self.subscribed && self.channel_enabled
    }
}

/// Outcome of applying a user's preferences to one request
#[derive(Debug, Clone)]
pub struct RoutingPlan {
    /// Channels to deliver on, in request (or preference) order
    pub channels: Vec<NotificationChannel>,
    /// Requested channels the user turned off
    pub skipped: Vec<NotificationChannel>,
    pub suppressed: Option<SuppressionReason>,
    pub contact: ContactInfo,
}

impl RoutingPlan {
    pub fn is_suppressed(&self) -> bool {
        self.suppressed.is_some()
    }
}

pub struct PreferenceResolver {
    store: Arc<dyn PreferenceStore>,
}

impl PreferenceResolver {
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        Self { store }
    }

    /// Stored preferences, or the system defaults for users without a record
    pub async fn get(&self, user_id: &str) -> Result<UserNotificationPreferences> {
        Ok(self
            .store
            .get(user_id)
            .await?
            .unwrap_or_else(|| UserNotificationPreferences::defaults_for(user_id)))
    }

    pub async fn update(&self, mut preferences: UserNotificationPreferences) -> Result<UserNotificationPreferences> {
        preferences.updated_at = Utc::now();
        self.store.upsert(preferences.clone()).await?;
        Ok(preferences)
    }

    pub async fn resolve(&self, user_id: &str, event_type: &str, channel: NotificationChannel) -> Result<ChannelResolution> {
        let preferences = self.get(user_id).await?;
        Ok(ChannelResolution {
            subscribed: preferences.is_subscribed(event_type),
            channel_enabled: preferences.is_channel_enabled(channel),
        })
    }

    pub async fn contact(&self, user_id: &str) -> Result<ContactInfo> {
        Ok(self.get(user_id).await?.contact)
    }

    /// Whether quiet hours hold this request back at `now`
    pub fn is_quiet(preferences: &UserNotificationPreferences, request: &NotificationRequest, now: DateTime<Utc>) -> bool {
        if request.bypass_quiet_hours {
            return false;
        }
        preferences
            .quiet_hours
            .as_ref()
            .is_some_and(|quiet| quiet.is_active_at(now))
    }

    /// Channels a request without an explicit list goes to: the user's
    /// priority list for the event type, else every enabled channel
    pub fn preferred_channels(preferences: &UserNotificationPreferences, event_type: &str) -> Vec<NotificationChannel> {
        match preferences.channel_priority.get(event_type) {
            Some(channels) if !channels.is_empty() => channels.clone(),
            _ => preferences.enabled_channels(),
        }
    }

    pub fn route(preferences: &UserNotificationPreferences, request: &NotificationRequest, now: DateTime<Utc>) -> RoutingPlan {
        let requested = if request.channels.is_empty() {
            Self::preferred_channels(preferences, &request.event_type)
        } else {
            request.channels.clone()
        };

        let mut channels = Vec::with_capacity(requested.len());
        let mut skipped = Vec::new();
        for channel in requested {
            if channels.contains(&channel) || skipped.contains(&channel) {
                continue;
            }
            if preferences.is_channel_enabled(channel) {
                channels.push(channel);
            } else {
                skipped.push(channel);
            }
        }

        let suppressed = if !preferences.is_subscribed(&request.event_type) {
            Some(SuppressionReason::Unsubscribed)
        } else if Self::is_quiet(preferences, request, now) {
            Some(SuppressionReason::QuietHours)
        } else if channels.is_empty() {
            Some(SuppressionReason::NoEnabledChannels)
        } else {
            None
        };

        if let Some(reason) = suppressed {
            debug!(user_id = %request.user_id, event_type = %request.event_type, %reason, "Request suppressed by preferences");
        }

        RoutingPlan {
            channels,
            skipped,
            suppressed,
            contact: preferences.contact.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotificationError;
    use chrono::{NaiveTime, TimeZone};
    use fileshare_shared::{event_types, QuietHours};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    fn night_owl() -> UserNotificationPreferences {
        let mut prefs = UserNotificationPreferences::defaults_for("u1");
        prefs.quiet_hours = Some(QuietHours::new(
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
        ));
        prefs
    }

    fn request() -> NotificationRequest {
        NotificationRequest::new("u1", event_types::FILE_UPLOADED, "Uploaded", "a.txt")
            .with_channels([NotificationChannel::Email, NotificationChannel::InApp])
    }

    #[test]
    fn test_quiet_hours_wraparound() {
        let prefs = night_owl();
        assert!(PreferenceResolver::is_quiet(&prefs, &request(), at(23, 30)));
        assert!(PreferenceResolver::is_quiet(&prefs, &request(), at(3, 0)));
        assert!(!PreferenceResolver::is_quiet(&prefs, &request(), at(12, 0)));
    }

    #[test]
    fn test_bypass_quiet_hours_is_never_suppressed() {
        let prefs = night_owl();
        let urgent = request().bypass_quiet_hours();
        for hour in 0..24 {
            let plan = PreferenceResolver::route(&prefs, &urgent, at(hour, 0));
            assert!(!plan.is_suppressed(), "suppressed at {hour}:00");
        }
    }

    #[test]
    fn test_route_skips_disabled_channels() {
        let mut prefs = UserNotificationPreferences::defaults_for("u1");
        prefs.set_channel_enabled(NotificationChannel::Email, false);

        let plan = PreferenceResolver::route(&prefs, &request(), at(12, 0));
        assert_eq!(plan.channels, vec![NotificationChannel::InApp]);
        assert_eq!(plan.skipped, vec![NotificationChannel::Email]);
        assert!(!plan.is_suppressed());

        prefs.set_channel_enabled(NotificationChannel::InApp, false);
        let plan = PreferenceResolver::route(&prefs, &request(), at(12, 0));
        assert_eq!(plan.suppressed, Some(SuppressionReason::NoEnabledChannels));
    }

    #[test]
    fn test_route_unsubscribed() {
        let mut prefs = UserNotificationPreferences::defaults_for("u1");
        prefs.subscribed_events.remove(event_types::FILE_UPLOADED);
        let plan = PreferenceResolver::route(&prefs, &request(), at(12, 0));
        assert_eq!(plan.suppressed, Some(SuppressionReason::Unsubscribed));
    }

    #[test]
    fn test_empty_channel_list_uses_priority_list() {
        let mut prefs = UserNotificationPreferences::defaults_for("u1");
        prefs.channel_priority.insert(
            event_types::FILE_UPLOADED.to_string(),
            vec![NotificationChannel::Push, NotificationChannel::Email],
        );
        let request = NotificationRequest::new("u1", event_types::FILE_UPLOADED, "t", "b").bypass_batching();

        let plan = PreferenceResolver::route(&prefs, &request, at(12, 0));
        assert_eq!(plan.channels, vec![NotificationChannel::Push, NotificationChannel::Email]);

        let other = NotificationRequest::new("u1", event_types::FILE_SHARED, "t", "b").bypass_batching();
        let plan = PreferenceResolver::route(&prefs, &other, at(12, 0));
        assert_eq!(plan.channels.len(), 4);
        assert!(!plan.channels.contains(&NotificationChannel::Sms));
    }

    #[tokio::test]
    async fn test_missing_record_resolves_to_defaults() {
        let resolver = PreferenceResolver::new(Arc::new(InMemoryPreferenceStore::new()));

        let sms = resolver.resolve("nobody", event_types::QUOTA_EXCEEDED, NotificationChannel::Sms).await.unwrap();
        assert!(sms.subscribed);
        assert!(!sms.channel_enabled);

        let email = resolver.resolve("nobody", event_types::SECURITY_ALERT, NotificationChannel::Email).await.unwrap();
        assert!(email.deliverable());
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let mut store = MockPreferenceStore::new();
        store
            .expect_get()
            .returning(|_| Err(NotificationError::repository("connection refused")));

        let resolver = PreferenceResolver::new(Arc::new(store));
        let err = resolver.get("u1").await.unwrap_err();
        assert!(matches!(err, NotificationError::Repository { .. }));
    }

    #[tokio::test]
    async fn test_update_round_trips() {
        let resolver = PreferenceResolver::new(Arc::new(InMemoryPreferenceStore::new()));
        let mut prefs = UserNotificationPreferences::defaults_for("u1");
        prefs.sms_enabled = true;
        resolver.update(prefs).await.unwrap();

        assert!(resolver.get("u1").await.unwrap().sms_enabled);
    }
}
