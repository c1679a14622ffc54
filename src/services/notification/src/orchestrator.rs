//! Notification orchestrator
//!
//! Entry point for every notification intent: validates the request, applies
//! per-user rate limits and preferences, then either hands the event to the
//! batch engine or delivers it right away through the delivery pipeline.

use crate::batch::{Admission, BatchEngine};
use crate::channel_manager::ChannelManager;
use crate::config::RateLimitConfig;
use crate::dead_letter::DeadLetterManager;
use crate::delivery::{DeliveryPipeline, DispatchOutcome};
use crate::error::{NotificationError, Result};
use crate::ingest::NotificationSink;
use crate::metrics::NotificationMetrics;
use crate::preferences::PreferenceResolver;
use crate::realtime::{BroadcastReport, HubStats, RealtimeHub};
use crate::repository::{NotificationRepository, PagedResult, Pagination};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileshare_shared::{
    event_types, metadata_to_json, ContactInfo, DeadLetterEntry, DeadLetterStats, DispatchStatus, Metadata,
    Notification, NotificationChannel, NotificationRequest, NotificationResponse,
    RealtimeMessage, RealtimeMessageType, UserNotificationPreferences,
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

/// Components the orchestrator drives
#[derive(Clone)]
pub struct OrchestratorParts {
    pub preferences: Arc<PreferenceResolver>,
    pub channels: Arc<ChannelManager>,
    pub pipeline: Arc<DeliveryPipeline>,
    pub batches: Arc<BatchEngine>,
    pub notifications: Arc<dyn NotificationRepository>,
    pub dead_letters: Arc<DeadLetterManager>,
    pub hub: Arc<RealtimeHub>,
    pub metrics: Arc<NotificationMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub channels: HashMap<String, bool>,
    pub realtime: HubStats,
    pub open_batches: usize,
    pub timestamp: DateTime<Utc>,
}

/// Rate checks between sweeps of idle per-user limiter state
const LIMITER_PRUNE_INTERVAL: u64 = 1024;

pub struct NotificationOrchestrator {
    rate_limit: RateLimitConfig,
    limiter: DefaultKeyedRateLimiter<String>,
    rate_checks: AtomicU64,
    parts: OrchestratorParts,
    /// Cancelled at shutdown; aborts in-flight sends and retry sleeps
    cancel: CancellationToken,
}

impl NotificationOrchestrator {
    pub fn new(rate_limit: RateLimitConfig, parts: OrchestratorParts, cancel: CancellationToken) -> Self {
        let per_minute = NonZeroU32::new(rate_limit.per_user_per_minute).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(rate_limit.burst).unwrap_or(per_minute);
        Self {
            limiter: RateLimiter::keyed(Quota::per_minute(per_minute).allow_burst(burst)),
            rate_checks: AtomicU64::new(0),
            rate_limit,
            parts,
            cancel,
        }
    }

    /// Process one request. Never fails: errors come back as a `failed`
    /// response.
    pub async fn notify(&self, request: NotificationRequest) -> NotificationResponse {
        let started = Instant::now();
        let event_type = request.event_type.clone();
        let user_id = request.user_id.clone();

        match self.try_notify(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(%user_id, %event_type, code = e.error_code(), error = %e, "Notification request failed");
                self.parts.metrics.record_request(&event_type, DispatchStatus::Failed);
                NotificationResponse::failed(e.to_string(), elapsed_ms(started))
            }
        }
    }

    /// Like [`notify`](Self::notify), but request-level errors (validation,
    /// rate limit, storage) are returned as errors
    pub async fn try_notify(&self, request: NotificationRequest) -> Result<NotificationResponse> {
        let started = Instant::now();
        request.validate()?;
        if !request.has_valid_channels() {
            return Err(NotificationError::validation(
                "channels",
                "at least one channel is required unless batching is bypassed",
            ));
        }
        self.check_rate_limit(&request.user_id)?;

        let preferences = self.parts.preferences.get(&request.user_id).await?;
        let plan = PreferenceResolver::route(&preferences, &request, Utc::now());
        if let Some(reason) = plan.suppressed {
            let response = NotificationResponse::suppressed(reason.to_string(), elapsed_ms(started));
            self.parts.metrics.record_request(&request.event_type, response.status);
            return Ok(response);
        }
        if !plan.skipped.is_empty() {
            debug!(user_id = %request.user_id, skipped = ?plan.skipped, "Channels disabled by user preferences");
        }

        let batchable = !request.bypass_batching
            && self.parts.batches.is_enabled()
            && event_types::is_batchable(&request.event_type);

        let response = if batchable {
            self.enqueue(&request, &plan.channels, plan.contact, started).await?
        } else {
            let outcome = self
                .parts
                .pipeline
                .dispatch(&request, &plan.channels, plan.contact, &self.cancel)
                .await?;
            response_from_outcome(outcome, elapsed_ms(started))
        };

        info!(
            user_id = %request.user_id,
            event_type = %request.event_type,
            notification_id = %response.id,
            status = ?response.status,
            duration_ms = response.duration_ms,
            "Notification processed"
        );
        self.parts.metrics.record_request(&request.event_type, response.status);
        Ok(response)
    }

    /// Admit the request into one window per channel. The response reports
    /// the first admission.
    async fn enqueue(
        &self,
        request: &NotificationRequest,
        channels: &[NotificationChannel],
        contact: ContactInfo,
        started: Instant,
    ) -> Result<NotificationResponse> {
        let mut first: Option<(NotificationChannel, Admission)> = None;
        let mut last_error = None;

        for &channel in channels {
            match self.parts.batches.add(request, channel, contact.clone()).await {
                Ok(admission) => {
                    first.get_or_insert((channel, admission));
                }
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(user_id = %request.user_id, %channel, error = %e, "Channel refused batched event");
                    last_error = Some(e);
                }
            }
        }

        let duration_ms = elapsed_ms(started);
        let response = match first {
            Some((channel, Admission::Queued { batch_id, .. })) => NotificationResponse {
                id: batch_id,
                status: DispatchStatus::Queued,
                channel: Some(channel),
                sent_at: None,
                error: None,
                duration_ms,
                deliveries: Vec::new(),
            },
            Some((channel, Admission::Flushed(flushed))) => {
                let notification = flushed.notification;
                let sent = notification.sent_at.is_some();
                NotificationResponse {
                    id: notification.id,
                    status: if sent { DispatchStatus::Sent } else { DispatchStatus::Failed },
                    channel: Some(channel),
                    sent_at: notification.sent_at,
                    error: if sent { None } else { notification.last_error },
                    duration_ms,
                    deliveries: Vec::new(),
                }
            }
            None => NotificationResponse::failed(
                last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no channel accepted the event".to_string()),
                duration_ms,
            ),
        };
        Ok(response)
    }

    fn check_rate_limit(&self, user_id: &str) -> Result<()> {
        if !self.rate_limit.enabled {
            return Ok(());
        }

        let allowed = self.limiter.check_key(&user_id.to_string()).is_ok();
        if self.rate_checks.fetch_add(1, Ordering::Relaxed) % LIMITER_PRUNE_INTERVAL == LIMITER_PRUNE_INTERVAL - 1 {
            self.prune_rate_limits();
        }

        if allowed {
            Ok(())
        } else {
            Err(NotificationError::rate_limit(format!(
                "user {} exceeded {} notifications per minute",
                user_id, self.rate_limit.per_user_per_minute
            )))
        }
    }

    /// Forget users whose limiter has fully replenished. Returns how many
    /// users are still tracked.
    pub fn prune_rate_limits(&self) -> usize {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        let tracked = self.limiter.len();
        debug!(tracked, "Pruned idle rate limiter state");
        tracked
    }

    pub async fn get_notification(&self, id: Uuid) -> Result<Notification> {
        self.parts
            .notifications
            .get(id)
            .await?
            .ok_or_else(|| NotificationError::not_found(format!("notification {}", id)))
    }

    pub async fn list_notifications(&self, user_id: &str, pagination: Pagination) -> Result<PagedResult<Notification>> {
        self.parts.notifications.list_for_user(user_id, pagination).await
    }

    /// `sent -> read`. Any other current status is a conflict.
    pub async fn mark_read(&self, id: Uuid) -> Result<Notification> {
        let mut notification = self.get_notification(id).await?;
        notification.mark_read(Utc::now())?;
        self.parts.notifications.update(&notification).await?;
        debug!(notification_id = %id, "Notification marked read");
        Ok(notification)
    }

    /// Mark read on behalf of a user; other users' notifications are not found
    pub async fn mark_read_for_user(&self, user_id: &str, id: Uuid) -> Result<Notification> {
        let notification = self.get_notification(id).await?;
        if notification.user_id != user_id {
            return Err(NotificationError::not_found(format!("notification {}", id)));
        }
        self.mark_read(id).await
    }

    pub async fn get_preferences(&self, user_id: &str) -> Result<UserNotificationPreferences> {
        self.parts.preferences.get(user_id).await
    }

    pub async fn update_preferences(&self, preferences: UserNotificationPreferences) -> Result<UserNotificationPreferences> {
        if preferences.user_id.trim().is_empty() {
            return Err(NotificationError::validation("user_id", "user_id is required"));
        }
        if let Some((event_type, _)) = preferences
            .channel_priority
            .iter()
            .find(|(_, channels)| channels.is_empty())
        {
            return Err(NotificationError::validation(
                "channel_priority",
                format!("priority list for {} is empty", event_type),
            ));
        }
        self.parts.preferences.update(preferences).await
    }

    /// Push an announcement to every live real-time connection
    pub fn broadcast(&self, title: &str, body: &str, metadata: &Metadata) -> Result<BroadcastReport> {
        if title.trim().is_empty() {
            return Err(NotificationError::validation("title", "title is required"));
        }
        let message = RealtimeMessage::new(
            RealtimeMessageType::Announcement,
            json!({
                "title": title,
                "body": body,
                "metadata": metadata_to_json(metadata),
            }),
        );
        self.parts.hub.broadcast(&message)
    }

    pub async fn dead_letter_stats(&self) -> Result<DeadLetterStats> {
        self.parts.dead_letters.stats().await
    }

    pub async fn list_dead_letters(&self, pagination: Pagination) -> Result<PagedResult<DeadLetterEntry>> {
        self.parts.dead_letters.list(pagination).await
    }

    pub fn health(&self) -> HealthReport {
        let channels = self.parts.channels.health_check();
        let status = if channels.values().any(|enabled| *enabled) {
            "healthy"
        } else {
            "degraded"
        };
        HealthReport {
            status,
            channels,
            realtime: self.parts.hub.stats(),
            open_batches: self.parts.batches.open_windows(),
            timestamp: Utc::now(),
        }
    }

    pub fn hub(&self) -> &Arc<RealtimeHub> {
        &self.parts.hub
    }

    pub fn metrics(&self) -> &Arc<NotificationMetrics> {
        &self.parts.metrics
    }
}

#[async_trait]
impl NotificationSink for NotificationOrchestrator {
    /// A rate-limited event is answered, not retried, so one noisy user
    /// cannot stall the stream
    async fn submit(&self, request: NotificationRequest) -> Result<NotificationResponse> {
        let started = Instant::now();
        let event_type = request.event_type.clone();
        match self.try_notify(request).await {
            Err(e @ NotificationError::RateLimit { .. }) => {
                self.parts.metrics.record_request(&event_type, DispatchStatus::Failed);
                Ok(NotificationResponse::failed(e.to_string(), elapsed_ms(started)))
            }
            other => other,
        }
    }
}

fn response_from_outcome(outcome: DispatchOutcome, duration_ms: u64) -> NotificationResponse {
    let sent = outcome.any_sent();
    let error = if sent {
        None
    } else {
        let errors: Vec<String> = outcome
            .results
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.channel, e)))
            .collect();
        Some(if errors.is_empty() {
            "delivery failed".to_string()
        } else {
            errors.join("; ")
        })
    };

    let primary = outcome.primary();
    NotificationResponse {
        id: primary.map(|n| n.id).unwrap_or_else(Uuid::new_v4),
        status: if sent { DispatchStatus::Sent } else { DispatchStatus::Failed },
        channel: primary.map(|n| n.channel),
        sent_at: primary.and_then(|n| n.sent_at),
        error,
        duration_ms,
        deliveries: outcome.results,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MockChannel;
    use crate::config::{BatchConfig, ChannelManagerConfig, DeadLetterConfig, MetricsConfig, RetryConfig};
    use crate::preferences::InMemoryPreferenceStore;
    use crate::realtime::{ConnectionRegistry, OutboundFrame};
    use crate::repository::{InMemoryBatchRepository, InMemoryDeadLetterRepository, InMemoryNotificationRepository};
    use crate::retry::RetryPolicy;
    use crate::templates::{InMemoryTemplateStore, TemplateResolver};
    use fileshare_shared::{NotificationStatus, QuietHours};
    use pretty_assertions::assert_eq;

    struct Fixture {
        orchestrator: NotificationOrchestrator,
        notifications: Arc<InMemoryNotificationRepository>,
        email: Arc<MockChannel>,
        inapp: Arc<MockChannel>,
    }

    fn fixture(rate_limit: RateLimitConfig) -> Fixture {
        let metrics = Arc::new(NotificationMetrics::new(&MetricsConfig::default()).unwrap());
        let email = Arc::new(MockChannel::new(NotificationChannel::Email));
        let inapp = Arc::new(MockChannel::new(NotificationChannel::InApp));
        let channels = Arc::new(
            ChannelManager::new(
                ChannelManagerConfig {
                    retry_delay_ms: 1,
                    ..ChannelManagerConfig::default()
                },
                metrics.clone(),
            )
            .with_channel(email.clone())
            .with_channel(inapp.clone())
            .with_channel(Arc::new(MockChannel::disabled(NotificationChannel::Sms))),
        );
        let preferences = Arc::new(PreferenceResolver::new(Arc::new(InMemoryPreferenceStore::new())));
        let notifications = Arc::new(InMemoryNotificationRepository::new());
        let dead_letters = Arc::new(DeadLetterManager::new(
            DeadLetterConfig::default(),
            Arc::new(InMemoryDeadLetterRepository::new()),
            channels.clone(),
            preferences.clone(),
            metrics.clone(),
        ));
        let pipeline = Arc::new(DeliveryPipeline::new(
            channels.clone(),
            notifications.clone(),
            dead_letters.clone(),
            preferences.clone(),
            RetryPolicy::from_config(&RetryConfig::default()),
        ));
        let batches = Arc::new(BatchEngine::new(
            BatchConfig::default(),
            Arc::new(InMemoryBatchRepository::new()),
            Arc::new(TemplateResolver::new(Arc::new(InMemoryTemplateStore::with_defaults()))),
            channels.clone(),
            pipeline.clone(),
            metrics.clone(),
        ));
        let hub = Arc::new(RealtimeHub::new(Arc::new(ConnectionRegistry::new()), 8, metrics.clone()));

        let orchestrator = NotificationOrchestrator::new(
            rate_limit,
            OrchestratorParts {
                preferences,
                channels,
                pipeline,
                batches,
                notifications: notifications.clone(),
                dead_letters,
                hub,
                metrics,
            },
            CancellationToken::new(),
        );
        Fixture {
            orchestrator,
            notifications,
            email,
            inapp,
        }
    }

    fn default_fixture() -> Fixture {
        fixture(RateLimitConfig::default())
    }

    fn share(channels: &[NotificationChannel]) -> NotificationRequest {
        NotificationRequest::new("u1", event_types::FILE_SHARED, "Shared", "a.txt was shared with you")
            .with_channels(channels.iter().copied())
            .bypass_batching()
    }

    #[tokio::test]
    async fn test_disabled_sms_is_partial_success() {
        let fixture = default_fixture();
        let mut preferences = UserNotificationPreferences::defaults_for("u1");
        preferences.sms_enabled = true;
        fixture.orchestrator.update_preferences(preferences).await.unwrap();

        let response = fixture
            .orchestrator
            .notify(share(&[NotificationChannel::Sms, NotificationChannel::Email]))
            .await;

        assert_eq!(response.status, DispatchStatus::Sent);
        assert_eq!(response.error, None);
        assert_eq!(response.channel, Some(NotificationChannel::Email));
        let by_channel: HashMap<_, _> = response.deliveries.iter().map(|r| (r.channel, r)).collect();
        assert!(by_channel[&NotificationChannel::Email].success);
        assert!(!by_channel[&NotificationChannel::Sms].success);
        assert!(by_channel[&NotificationChannel::Sms]
            .error
            .as_deref()
            .unwrap()
            .contains("disabled"));
    }

    #[tokio::test]
    async fn test_batchable_event_is_queued() {
        let fixture = default_fixture();
        let request = NotificationRequest::new("u1", event_types::FILE_UPLOADED, "Uploaded", "a.txt")
            .with_channels([NotificationChannel::InApp]);

        let first = fixture.orchestrator.notify(request.clone()).await;
        let second = fixture.orchestrator.notify(request).await;

        assert_eq!(first.status, DispatchStatus::Queued);
        assert_eq!(first.id, second.id);
        assert_eq!(fixture.inapp.calls(), 0);
        assert_eq!(fixture.orchestrator.health().open_batches, 1);
    }

    #[tokio::test]
    async fn test_empty_channels_require_bypass() {
        let fixture = default_fixture();
        let request = NotificationRequest::new("u1", event_types::FILE_UPLOADED, "Uploaded", "a.txt");

        let err = fixture.orchestrator.try_notify(request.clone()).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let response = fixture.orchestrator.notify(request.bypass_batching()).await;
        // defaults: email, push, inapp and websocket; push and websocket are not registered
        assert_eq!(response.status, DispatchStatus::Sent);
        assert_eq!(fixture.email.calls(), 1);
        assert_eq!(fixture.inapp.calls(), 1);
    }

    #[tokio::test]
    async fn test_quiet_hours_suppress_unless_bypassed() {
        let fixture = default_fixture();
        let mut preferences = UserNotificationPreferences::defaults_for("u1");
        let now = Utc::now().time();
        preferences.quiet_hours = Some(QuietHours::new(
            now - chrono::Duration::hours(1),
            now + chrono::Duration::hours(1),
        ));
        fixture.orchestrator.update_preferences(preferences).await.unwrap();

        let quiet = fixture.orchestrator.notify(share(&[NotificationChannel::Email])).await;
        assert_eq!(quiet.status, DispatchStatus::Suppressed);
        assert_eq!(fixture.email.calls(), 0);

        let urgent = fixture
            .orchestrator
            .notify(share(&[NotificationChannel::Email]).bypass_quiet_hours())
            .await;
        assert_eq!(urgent.status, DispatchStatus::Sent);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_excess_requests() {
        let fixture = fixture(RateLimitConfig {
            enabled: true,
            per_user_per_minute: 2,
            burst: 2,
        });

        for _ in 0..2 {
            let response = fixture.orchestrator.notify(share(&[NotificationChannel::Email])).await;
            assert_eq!(response.status, DispatchStatus::Sent);
        }
        let err = fixture
            .orchestrator
            .try_notify(share(&[NotificationChannel::Email]))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "RATE_LIMIT_EXCEEDED");

        let answered = fixture
            .orchestrator
            .submit(share(&[NotificationChannel::Email]))
            .await
            .unwrap();
        assert_eq!(answered.status, DispatchStatus::Failed);

        let other_user = NotificationRequest {
            user_id: "u2".into(),
            ..share(&[NotificationChannel::Email])
        };
        assert_eq!(fixture.orchestrator.notify(other_user).await.status, DispatchStatus::Sent);
    }

    #[tokio::test]
    async fn test_recently_limited_user_is_kept_on_prune() {
        let fixture = fixture(RateLimitConfig::default());
        fixture.orchestrator.notify(share(&[NotificationChannel::Email])).await;

        // one cell at 120/min takes half a second to come back
        assert_eq!(fixture.orchestrator.prune_rate_limits(), 1);
    }

    #[tokio::test]
    async fn test_idle_rate_limit_state_is_pruned() {
        // one cell per millisecond, so every user is idle again almost at once
        let fixture = fixture(RateLimitConfig {
            enabled: true,
            per_user_per_minute: 60_000,
            burst: 1,
        });
        for i in 0..LIMITER_PRUNE_INTERVAL - 1 {
            fixture.orchestrator.check_rate_limit(&format!("user-{i}")).unwrap();
        }
        assert_eq!(fixture.orchestrator.limiter.len() as u64, LIMITER_PRUNE_INTERVAL - 1);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        fixture.orchestrator.check_rate_limit("last").unwrap();

        assert!(fixture.orchestrator.limiter.len() <= 1);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(fixture.orchestrator.prune_rate_limits(), 0);
    }

    #[tokio::test]
    async fn test_mark_read_is_one_way() {
        let fixture = default_fixture();
        let response = fixture.orchestrator.notify(share(&[NotificationChannel::Email])).await;

        let read = fixture.orchestrator.mark_read(response.id).await.unwrap();
        assert_eq!(read.status, NotificationStatus::Read);

        let err = fixture.orchestrator.mark_read(response.id).await.unwrap_err();
        assert_eq!(err.error_code(), "CONFLICT");
        assert_eq!(
            fixture.notifications.all()[0].status,
            NotificationStatus::Read
        );

        let err = fixture
            .orchestrator
            .mark_read_for_user("someone-else", response.id)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_list_notifications_is_paginated() {
        let fixture = default_fixture();
        for _ in 0..3 {
            fixture.orchestrator.notify(share(&[NotificationChannel::Email])).await;
        }

        let page = fixture
            .orchestrator
            .list_notifications("u1", Pagination::new(1, 2))
            .await
            .unwrap();
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.pagination.total, 3);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_connected_users() {
        let fixture = default_fixture();
        let mut alice = fixture.orchestrator.hub().connect("alice");
        let mut bob = fixture.orchestrator.hub().connect("bob");

        let report = fixture
            .orchestrator
            .broadcast("Maintenance", "Tonight at 22:00", &Metadata::new())
            .unwrap();
        assert_eq!(report.delivered, 2);

        for handle in [&mut alice, &mut bob] {
            match handle.receiver.recv().await {
                Some(OutboundFrame::Text(text)) => assert!(text.contains("\"announcement\"")),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_health_reports_channels() {
        let fixture = default_fixture();
        let health = fixture.orchestrator.health();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.channels.get("sms"), Some(&false));
        assert_eq!(health.channels.get("email"), Some(&true));
    }
}
