//! Persisted delivery: one notification record per channel
//!
//! The pipeline creates the records, runs the fan-out, appends one delivery
//! attempt per channel and moves each record through the status state
//! machine. Retryable failures get a backoff `next_retry_at`; failures that
//! used up the budget become `failed_terminal` and are dead-lettered.
//! Non-retryable failures (validation, disabled channel, offline user) become
//! terminal right away and are never dead-lettered.

use crate::channel_manager::ChannelManager;
use crate::channels::DeliveryRequest;
use crate::dead_letter::DeadLetterManager;
use crate::error::{NotificationError, Result};
use crate::preferences::PreferenceResolver;
use crate::repository::NotificationRepository;
use crate::retry::RetryPolicy;
use chrono::Utc;
use fileshare_shared::{
    ContactInfo, DeliveryAttempt, DeliveryResult, Notification, NotificationChannel,
    NotificationRequest, NotificationStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Records and per-channel results of one dispatch
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// One record per attempted channel, in channel order
    pub notifications: Vec<Notification>,
    pub results: Vec<DeliveryResult>,
}

impl DispatchOutcome {
    pub fn any_sent(&self) -> bool {
        self.notifications
            .iter()
            .any(|n| n.status == NotificationStatus::Sent)
    }

    /// The first sent record, else the first record
    pub fn primary(&self) -> Option<&Notification> {
        self.notifications
            .iter()
            .find(|n| n.status == NotificationStatus::Sent)
            .or_else(|| self.notifications.first())
    }
}

pub struct DeliveryPipeline {
    channels: Arc<ChannelManager>,
    notifications: Arc<dyn NotificationRepository>,
    dead_letters: Arc<DeadLetterManager>,
    preferences: Arc<PreferenceResolver>,
    policy: RetryPolicy,
}

impl DeliveryPipeline {
    pub fn new(
        channels: Arc<ChannelManager>,
        notifications: Arc<dyn NotificationRepository>,
        dead_letters: Arc<DeadLetterManager>,
        preferences: Arc<PreferenceResolver>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            channels,
            notifications,
            dead_letters,
            preferences,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deliver a request on `channels`, falling back to the designated
    /// fallback channel when every one of them fails
    pub async fn dispatch(
        &self,
        request: &NotificationRequest,
        channels: &[NotificationChannel],
        contact: ContactInfo,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome> {
        self.dispatch_inner(request, channels, contact, None, true, cancel).await
    }

    /// Deliver the summary of a closed batch on its single channel. No
    /// fallback, so a batch always yields exactly one record.
    pub async fn dispatch_batch(
        &self,
        request: &NotificationRequest,
        channel: NotificationChannel,
        contact: ContactInfo,
        batch_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Notification> {
        let outcome = self
            .dispatch_inner(request, &[channel], contact, Some(batch_id), false, cancel)
            .await?;
        outcome
            .notifications
            .into_iter()
            .next()
            .ok_or_else(|| NotificationError::internal("batch dispatch produced no notification"))
    }

    async fn dispatch_inner(
        &self,
        request: &NotificationRequest,
        channels: &[NotificationChannel],
        contact: ContactInfo,
        batch_id: Option<Uuid>,
        fallback: bool,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome> {
        let mut planned = channels.to_vec();
        planned.sort();
        planned.dedup();
        if planned.is_empty() {
            return Err(NotificationError::validation("channels", "at least one channel is required"));
        }

        let mut records: HashMap<NotificationChannel, Notification> = HashMap::new();
        for channel in &planned {
            let record = self.create_record(request, *channel, batch_id, None).await?;
            records.insert(*channel, record);
        }

        // The fallback record only exists if the fallback is used, but its id
        // has to travel with the request
        let mut ids: HashMap<NotificationChannel, Uuid> =
            records.iter().map(|(channel, n)| (*channel, n.id)).collect();
        if fallback {
            if let Some(channel) = self.channels.config().fallback_channel {
                ids.entry(channel).or_insert_with(Uuid::new_v4);
            }
        }

        let delivery = DeliveryRequest::from_request(request, contact)
            .with_channels(planned.clone())
            .with_notification_ids(ids.clone());

        let sent = if fallback {
            self.channels.send_with_fallback(&delivery, cancel).await
        } else {
            self.channels.send_multi_channel(&delivery, cancel).await
        };
        let results = match sent {
            Ok(report) => report.into_results(),
            Err(NotificationError::AllChannelsFailed { results, .. }) => results,
            Err(e) => planned
                .iter()
                .map(|channel| {
                    let result = DeliveryResult::failure(*channel, e.to_string());
                    if e.is_retryable() {
                        result
                    } else {
                        result.non_retryable()
                    }
                })
                .collect(),
        };

        let mut notifications = Vec::with_capacity(results.len());
        for result in &results {
            let record = match records.remove(&result.channel) {
                Some(record) => record,
                None => {
                    let id = ids.get(&result.channel).copied();
                    self.create_record(request, result.channel, batch_id, id).await?
                }
            };
            notifications.push(self.settle(record, result).await?);
        }
        notifications.sort_by_key(|n| n.channel);

        debug!(
            user_id = %request.user_id,
            event_type = %request.event_type,
            records = notifications.len(),
            "Dispatch settled"
        );
        Ok(DispatchOutcome {
            notifications,
            results,
        })
    }

    async fn create_record(
        &self,
        request: &NotificationRequest,
        channel: NotificationChannel,
        batch_id: Option<Uuid>,
        id: Option<Uuid>,
    ) -> Result<Notification> {
        let mut notification = Notification::from_request(request, channel);
        if let Some(id) = id {
            notification.id = id;
        }
        if let Some(batch_id) = batch_id {
            notification = notification.with_batch(batch_id);
        }
        self.notifications.create(notification).await
    }

    /// Deliver a notification the retry scheduler claimed (status `pending`)
    pub async fn redeliver(&self, notification: Notification, cancel: &CancellationToken) -> Result<Notification> {
        if notification.status != NotificationStatus::Pending {
            return Err(NotificationError::conflict(format!(
                "notification {} is {}, not pending",
                notification.id, notification.status
            )));
        }

        // The claim has to be settled either way, or the record sits in
        // `pending` until its lease runs out
        let result = match self.preferences.contact(&notification.user_id).await {
            Ok(contact) => {
                let request = DeliveryRequest::from_notification(&notification, contact);
                self.channels
                    .send_with_retry(notification.channel, &request, cancel)
                    .await
            }
            Err(e) => {
                warn!(notification_id = %notification.id, error = %e, "Could not load contact for retry");
                let result = DeliveryResult::failure(notification.channel, format!("contact lookup failed: {}", e));
                if e.is_retryable() {
                    result
                } else {
                    result.non_retryable()
                }
            }
        };
        self.settle(notification, &result).await
    }

    /// Retire a `failed` notification whose budget is already used up
    pub async fn give_up(&self, mut notification: Notification) -> Result<Notification> {
        notification.mark_terminal(Utc::now())?;
        self.notifications.update(&notification).await?;
        self.dead_letter(&notification).await;
        Ok(notification)
    }

    /// Append the attempt and move the record to its next state
    async fn settle(&self, mut notification: Notification, result: &DeliveryResult) -> Result<Notification> {
        let now = Utc::now();

        if result.success {
            notification.record_success(DeliveryAttempt::succeeded(now, result.duration_ms))?;
            self.notifications.update(&notification).await?;
            return Ok(notification);
        }

        let error = result
            .error
            .clone()
            .unwrap_or_else(|| "delivery failed".to_string());
        notification.record_failure(DeliveryAttempt::failed(now, error, result.duration_ms))?;

        if !result.retryable {
            self.notifications.update(&notification).await?;
            notification.mark_terminal(now)?;
            self.notifications.update(&notification).await?;
            info!(
                notification_id = %notification.id,
                channel = %notification.channel,
                error = ?notification.last_error,
                "Delivery failed permanently"
            );
            return Ok(notification);
        }

        if self.policy.is_exhausted(notification.retry_count) {
            self.notifications.update(&notification).await?;
            notification.mark_terminal(now)?;
            self.notifications.update(&notification).await?;
            self.dead_letter(&notification).await;
            return Ok(notification);
        }

        notification.next_retry_at = Some(self.policy.next_retry_at(
            notification.next_retry_at,
            now,
            notification.retry_count,
        ));
        self.notifications.update(&notification).await?;
        debug!(
            notification_id = %notification.id,
            channel = %notification.channel,
            retry_count = notification.retry_count,
            next_retry_at = ?notification.next_retry_at,
            "Delivery failed, retry scheduled"
        );
        Ok(notification)
    }

    async fn dead_letter(&self, notification: &Notification) {
        if let Err(e) = self.dead_letters.enqueue(notification).await {
            warn!(notification_id = %notification.id, error = %e, "Failed to dead-letter notification");
        }
    }
}
