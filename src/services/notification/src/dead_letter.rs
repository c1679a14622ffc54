//! Dead-letter queue for notifications that used up their retry budget
//!
//! Entries keep the original payload and the full attempt history. They are
//! reprocessed on a slow schedule with their own `max_retries` ceiling; once
//! that is reached an entry stays put (and shows up in the statistics) until
//! an operator deals with it. Processed entries are purged after the
//! retention period. Reprocessing never touches the live notification record.

use crate::channel_manager::ChannelManager;
use crate::channels::DeliveryRequest;
use crate::config::DeadLetterConfig;
use crate::error::{NotificationError, Result};
use crate::metrics::NotificationMetrics;
use crate::preferences::PreferenceResolver;
use crate::repository::{DeadLetterRepository, PagedResult, Pagination};
use chrono::{DateTime, Utc};
use fileshare_shared::{
    DeadLetterEntry, DeadLetterPayload, DeadLetterStats, DeliveryResult, Notification, RetryAttempt,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReprocessSweep {
    pub recovered: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct DeadLetterManager {
    config: DeadLetterConfig,
    repository: Arc<dyn DeadLetterRepository>,
    channels: Arc<ChannelManager>,
    preferences: Arc<PreferenceResolver>,
    metrics: Arc<NotificationMetrics>,
}

impl DeadLetterManager {
    pub fn new(
        config: DeadLetterConfig,
        repository: Arc<dyn DeadLetterRepository>,
        channels: Arc<ChannelManager>,
        preferences: Arc<PreferenceResolver>,
        metrics: Arc<NotificationMetrics>,
    ) -> Self {
        Self {
            config,
            repository,
            channels,
            preferences,
            metrics,
        }
    }

    /// Store an exhausted notification. Enqueuing the same notification twice
    /// returns the existing entry.
    pub async fn enqueue(&self, notification: &Notification) -> Result<DeadLetterEntry> {
        if let Some(existing) = self.repository.find_by_notification(notification.id).await? {
            debug!(notification_id = %notification.id, entry_id = %existing.id, "Notification already dead-lettered");
            return Ok(existing);
        }

        let now = Utc::now();
        let entry = DeadLetterEntry {
            id: Uuid::new_v4(),
            notification_id: notification.id,
            user_id: notification.user_id.clone(),
            event_type: notification.event_type.clone(),
            channel: notification.channel,
            payload: serde_json::to_value(DeadLetterPayload::from(notification))?,
            retry_history: notification.delivery_attempts.iter().map(RetryAttempt::from).collect(),
            retry_count: 0,
            max_retries: self.config.max_retries,
            is_processed: false,
            next_retry_at: Some(now + self.retry_interval(0)),
            last_error: notification.last_error.clone(),
            created_at: now,
            updated_at: now,
            processed_at: None,
        };

        let entry = self.repository.create(entry).await?;
        self.metrics.record_dead_letter("enqueued");
        warn!(
            notification_id = %notification.id,
            entry_id = %entry.id,
            user_id = %entry.user_id,
            event_type = %entry.event_type,
            channel = %entry.channel,
            attempts = entry.retry_history.len(),
            "Notification moved to dead-letter queue"
        );
        Ok(entry)
    }

    /// Attempt every due entry once
    pub async fn reprocess_due(&self, cancel: &CancellationToken) -> Result<ReprocessSweep> {
        let now = Utc::now();
        let due = self.repository.list_due(now, self.config.batch_size).await?;

        let mut sweep = ReprocessSweep::default();
        for candidate in due {
            if cancel.is_cancelled() {
                break;
            }

            let lease_until = now + self.retry_interval(candidate.retry_count);
            let entry = match self.repository.claim(candidate.id, now, lease_until).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    sweep.skipped += 1;
                    continue;
                }
                Err(e) => {
                    sweep.errors += 1;
                    warn!(entry_id = %candidate.id, error = %e, "Failed to claim dead-letter entry");
                    continue;
                }
            };

            match self.reprocess(entry, cancel).await {
                Ok(entry) if entry.is_processed => sweep.recovered += 1,
                Ok(entry) if entry.is_exhausted() => sweep.exhausted += 1,
                Ok(_) => sweep.rescheduled += 1,
                Err(e) => {
                    sweep.errors += 1;
                    warn!(entry_id = %candidate.id, error = %e, "Dead-letter reprocessing failed");
                }
            }
        }

        Ok(sweep)
    }

    async fn reprocess(&self, mut entry: DeadLetterEntry, cancel: &CancellationToken) -> Result<DeadLetterEntry> {
        let result = match serde_json::from_value::<DeadLetterPayload>(entry.payload.clone()) {
            Ok(payload) => {
                let contact = self.preferences.contact(&payload.user_id).await?;
                let request = DeliveryRequest::from_payload(&payload, entry.notification_id, contact);
                self.channels.send_with_retry(payload.channel, &request, cancel).await
            }
            Err(e) => DeliveryResult::failure(entry.channel, format!("unreadable payload: {e}")).non_retryable(),
        };

        let now = Utc::now();
        entry.retry_count += 1;
        entry.updated_at = now;
        entry.retry_history.push(RetryAttempt {
            attempted_at: now,
            success: result.success,
            error: result.error.clone(),
        });

        if result.success {
            entry.is_processed = true;
            entry.processed_at = Some(now);
            entry.last_error = None;
            self.metrics.record_dead_letter("recovered");
            info!(entry_id = %entry.id, notification_id = %entry.notification_id, "Dead-lettered notification delivered");
        } else {
            entry.last_error = result.error;
            if entry.is_exhausted() {
                self.metrics.record_dead_letter("exhausted");
                error!(
                    entry_id = %entry.id,
                    event_type = %entry.event_type,
                    retry_count = entry.retry_count,
                    "Dead-letter entry exhausted its retries, operator action required"
                );
            } else {
                let candidate = now + self.retry_interval(entry.retry_count);
                entry.next_retry_at = Some(entry.next_retry_at.map_or(candidate, |at| at.max(candidate)));
                self.metrics.record_dead_letter("rescheduled");
                debug!(entry_id = %entry.id, next_retry_at = ?entry.next_retry_at, "Dead-letter entry rescheduled");
            }
        }

        self.repository.update(&entry).await?;
        Ok(entry)
    }

    /// Purge processed entries older than the retention period
    pub async fn cleanup(&self) -> Result<usize> {
        let hours = i64::try_from(self.config.retention_hours).unwrap_or(i64::MAX);
        let retention = chrono::Duration::hours(hours.min(i64::MAX / 3_600_000));
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = self.repository.purge_processed_before(cutoff).await?;
        if purged > 0 {
            self.metrics.record_dead_letters_purged(purged);
            info!(purged, "Purged processed dead-letter entries");
        }
        Ok(purged)
    }

    pub async fn stats(&self) -> Result<DeadLetterStats> {
        self.repository.stats().await
    }

    pub async fn list(&self, pagination: Pagination) -> Result<PagedResult<DeadLetterEntry>> {
        self.repository.list(pagination).await
    }

    pub async fn get(&self, id: Uuid) -> Result<DeadLetterEntry> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| NotificationError::not_found(format!("dead-letter entry {id}")))
    }

    /// Reprocess and clean up on their own intervals until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            poll_interval_seconds = self.config.poll_interval_seconds,
            max_retries = self.config.max_retries,
            "Dead-letter reprocessor started"
        );
        let mut poll = tokio::time::interval(Duration::from_secs(self.config.poll_interval_seconds.max(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = tokio::time::interval(Duration::from_secs(self.config.cleanup_interval_seconds.max(1)));
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => {
                    match self.reprocess_due(&cancel).await {
                        Ok(sweep) if sweep != ReprocessSweep::default() => info!(?sweep, "Dead-letter sweep finished"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Dead-letter sweep failed"),
                    }
                }
                _ = cleanup.tick() => {
                    if let Err(e) = self.cleanup().await {
                        error!(error = %e, "Dead-letter cleanup failed");
                    }
                }
            }
        }

        info!("Dead-letter reprocessor stopped");
    }

    /// Wait before dead-letter retry number `retry_count` (zero based):
    /// doubles from the base interval up to the configured maximum
    fn retry_interval(&self, retry_count: u32) -> chrono::Duration {
        let base = self.config.retry_interval_seconds;
        let max = self.config.max_retry_interval_seconds.max(base);
        let seconds = base
            .checked_mul(1u64.checked_shl(retry_count.min(32)).unwrap_or(u64::MAX))
            .map_or(max, |s| s.min(max));
        chrono::Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX).min(i64::MAX / 1_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{MockChannel, MockOutcome};
    use crate::config::{ChannelManagerConfig, MetricsConfig};
    use crate::preferences::InMemoryPreferenceStore;
    use crate::repository::InMemoryDeadLetterRepository;
    use fileshare_shared::{DeliveryAttempt, NotificationChannel, NotificationRequest};
    use pretty_assertions::assert_eq;

    struct Fixture {
        manager: DeadLetterManager,
        repository: Arc<InMemoryDeadLetterRepository>,
        email: Arc<MockChannel>,
    }

    fn fixture(max_retries: u32) -> Fixture {
        let metrics = Arc::new(NotificationMetrics::new(&MetricsConfig::default()).unwrap());
        let email = Arc::new(MockChannel::failing(NotificationChannel::Email, "smtp down"));
        let channels = ChannelManager::new(
            ChannelManagerConfig {
                retry_attempts: 0,
                ..ChannelManagerConfig::default()
            },
            metrics.clone(),
        )
        .with_channel(email.clone());
        let repository = Arc::new(InMemoryDeadLetterRepository::new());
        let manager = DeadLetterManager::new(
            DeadLetterConfig {
                max_retries,
                retry_interval_seconds: 0,
                max_retry_interval_seconds: 0,
                ..DeadLetterConfig::default()
            },
            repository.clone(),
            Arc::new(channels),
            Arc::new(PreferenceResolver::new(Arc::new(InMemoryPreferenceStore::new()))),
            metrics,
        );
        Fixture {
            manager,
            repository,
            email,
        }
    }

    fn exhausted_notification() -> Notification {
        let request = NotificationRequest::new("u1", "file.shared", "Shared", "a.txt")
            .with_channels([NotificationChannel::Email]);
        let mut notification = Notification::from_request(&request, NotificationChannel::Email);
        notification
            .record_failure(DeliveryAttempt::failed(Utc::now(), "smtp down", 5))
            .unwrap();
        notification.mark_terminal(Utc::now()).unwrap();
        notification
    }

    #[tokio::test]
    async fn test_enqueue_keeps_history_and_is_idempotent() {
        let fixture = fixture(3);
        let notification = exhausted_notification();

        let entry = fixture.manager.enqueue(&notification).await.unwrap();
        assert_eq!(entry.notification_id, notification.id);
        assert_eq!(entry.retry_history.len(), 1);
        assert_eq!(entry.max_retries, 3);
        assert_eq!(entry.last_error.as_deref(), Some("smtp down"));

        let again = fixture.manager.enqueue(&notification).await.unwrap();
        assert_eq!(again.id, entry.id);
        assert_eq!(fixture.manager.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_reprocessing_stops_at_max_retries() {
        let fixture = fixture(2);
        let entry = fixture.manager.enqueue(&exhausted_notification()).await.unwrap();
        let cancel = CancellationToken::new();

        let first = fixture.manager.reprocess_due(&cancel).await.unwrap();
        assert_eq!(first.rescheduled, 1);
        let second = fixture.manager.reprocess_due(&cancel).await.unwrap();
        assert_eq!(second.exhausted, 1);
        let third = fixture.manager.reprocess_due(&cancel).await.unwrap();
        assert_eq!(third, ReprocessSweep::default());
        assert_eq!(fixture.email.calls(), 2);

        let stored = fixture.manager.get(entry.id).await.unwrap();
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.retry_history.len(), 3);
        assert!(!stored.is_processed);

        let stats = fixture.manager.stats().await.unwrap();
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.exhausted_by_event_type.get("file.shared"), Some(&1));
    }

    #[tokio::test]
    async fn test_recovered_entry_is_processed_and_purged_later() {
        let fixture = fixture(3);
        fixture.email.set_default(MockOutcome::Succeed);
        let entry = fixture.manager.enqueue(&exhausted_notification()).await.unwrap();

        let sweep = fixture.manager.reprocess_due(&CancellationToken::new()).await.unwrap();
        assert_eq!(sweep.recovered, 1);

        let stored = fixture.manager.get(entry.id).await.unwrap();
        assert!(stored.is_processed);
        assert!(stored.processed_at.is_some());

        // Retention has not passed yet
        assert_eq!(fixture.manager.cleanup().await.unwrap(), 0);
        assert_eq!(fixture.repository.purge_processed_before(Utc::now() + chrono::Duration::seconds(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_not_due_entries_are_left_alone() {
        let fixture = fixture(3);
        let mut config = fixture.manager.config.clone();
        config.retry_interval_seconds = 3_600;
        config.max_retry_interval_seconds = 3_600;
        let manager = DeadLetterManager { config, ..fixture.manager };

        manager.enqueue(&exhausted_notification()).await.unwrap();
        let sweep = manager.reprocess_due(&CancellationToken::new()).await.unwrap();
        assert_eq!(sweep, ReprocessSweep::default());
        assert_eq!(fixture.email.calls(), 0);
    }

    #[test]
    fn test_retry_interval_doubles_up_to_max() {
        let fixture = fixture(3);
        let mut config = fixture.manager.config.clone();
        config.retry_interval_seconds = 3_600;
        config.max_retry_interval_seconds = 4 * 3_600;
        let manager = DeadLetterManager { config, ..fixture.manager };

        assert_eq!(manager.retry_interval(0), chrono::Duration::hours(1));
        assert_eq!(manager.retry_interval(1), chrono::Duration::hours(2));
        assert_eq!(manager.retry_interval(5), chrono::Duration::hours(4));
        assert_eq!(manager.retry_interval(200), chrono::Duration::hours(4));
    }
}
