//! Notification-level retry with exponential backoff and jitter
//!
//! Failed notifications carry a `next_retry_at`. The scheduler polls for due
//! ones, claims each with a compare-and-set on its status and hands it back to
//! the delivery pipeline, which records the outcome and computes the next
//! retry time or gives up.

use crate::config::RetryConfig;
use crate::delivery::DeliveryPipeline;
use crate::error::Result;
use crate::metrics::NotificationMetrics;
use crate::repository::NotificationRepository;
use chrono::{DateTime, Utc};
use fileshare_shared::NotificationStatus;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// `delay = min(base * multiplier^attempt, max)`, optionally shortened by a
/// random fraction of itself
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Delay before retry number `attempt`, counting from zero
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Shave up to `jitter` of the delay off, so retries of a burst of
    /// failures spread out. Never exceeds the un-jittered delay.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let fraction = rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0));
        delay.mul_f64(1.0 - fraction)
    }
}

/// Retry budget for live notifications
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backoff: BackoffPolicy,
    /// Scheduled retries after the first attempt
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(config.base_delay_ms),
                max_delay: Duration::from_millis(config.max_delay_ms),
                multiplier: config.backoff_multiplier,
                jitter: config.jitter,
            },
            // Without the scheduler a failure is final
            max_retries: if config.enabled { config.max_retries } else { 0 },
        }
    }

    /// `failed_count` failed attempts used up the budget of
    /// `max_retries + 1` attempts
    pub fn is_exhausted(&self, failed_count: u32) -> bool {
        failed_count > self.max_retries
    }

    /// Next retry time after the `failed_count`-th failure. Never earlier
    /// than a previously scheduled time.
    pub fn next_retry_at(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        failed_count: u32,
    ) -> DateTime<Utc> {
        let delay = self
            .backoff
            .jittered(self.backoff.delay_for(failed_count.saturating_sub(1)));
        let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let candidate = now
            .checked_add_signed(chrono::Duration::milliseconds(millis))
            .unwrap_or(now);
        match previous {
            Some(previous) if previous > candidate => previous,
            _ => candidate,
        }
    }
}

/// Outcome counts of one scheduler sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySweep {
    pub claimed: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    /// Due notifications another worker claimed first
    pub skipped: usize,
    pub errors: usize,
}

pub struct RetryScheduler {
    config: RetryConfig,
    policy: RetryPolicy,
    notifications: Arc<dyn NotificationRepository>,
    pipeline: Arc<DeliveryPipeline>,
    metrics: Arc<NotificationMetrics>,
}

impl RetryScheduler {
    pub fn new(
        config: RetryConfig,
        notifications: Arc<dyn NotificationRepository>,
        pipeline: Arc<DeliveryPipeline>,
        metrics: Arc<NotificationMetrics>,
    ) -> Self {
        Self {
            policy: RetryPolicy::from_config(&config),
            config,
            notifications,
            pipeline,
            metrics,
        }
    }

    /// Poll for due retries until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!(poll_interval_ms = self.config.poll_interval_ms, max_retries = self.policy.max_retries, "Retry scheduler started");
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.process_due(&cancel).await {
                        Ok(sweep) if sweep.claimed > 0 || sweep.exhausted > 0 => {
                            info!(?sweep, "Retry sweep finished");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Retry sweep failed"),
                    }
                }
            }
        }

        info!("Retry scheduler stopped");
    }

    /// Retry every due notification once. Failures of single notifications
    /// are logged and counted, never returned.
    pub async fn process_due(&self, cancel: &CancellationToken) -> Result<RetrySweep> {
        let now = Utc::now();
        let lease = i64::try_from(self.config.claim_lease_ms).unwrap_or(i64::MAX);
        let lease_until = now
            .checked_add_signed(chrono::Duration::milliseconds(lease))
            .unwrap_or(now);
        let due = self
            .notifications
            .list_due_for_retry(now, self.config.batch_size)
            .await?;

        let mut sweep = RetrySweep::default();
        for candidate in due {
            if cancel.is_cancelled() {
                debug!("Retry sweep interrupted by shutdown");
                break;
            }

            if self.policy.is_exhausted(candidate.retry_count) {
                match self.pipeline.give_up(candidate).await {
                    Ok(_) => {
                        sweep.exhausted += 1;
                        self.metrics.record_retry("exhausted");
                    }
                    Err(e) => {
                        sweep.errors += 1;
                        warn!(error = %e, "Failed to retire exhausted notification");
                    }
                }
                continue;
            }

            let claimed = match self.notifications.claim_for_retry(candidate.id, now, lease_until).await {
                Ok(Some(notification)) => notification,
                Ok(None) => {
                    sweep.skipped += 1;
                    continue;
                }
                Err(e) => {
                    sweep.errors += 1;
                    warn!(notification_id = %candidate.id, error = %e, "Failed to claim notification for retry");
                    continue;
                }
            };
            sweep.claimed += 1;

            let id = claimed.id;
            match self.pipeline.redeliver(claimed, cancel).await {
                Ok(notification) => {
                    let outcome = match notification.status {
                        NotificationStatus::Sent => {
                            sweep.succeeded += 1;
                            "succeeded"
                        }
                        NotificationStatus::FailedTerminal => {
                            sweep.exhausted += 1;
                            "exhausted"
                        }
                        _ => {
                            sweep.rescheduled += 1;
                            "rescheduled"
                        }
                    };
                    self.metrics.record_retry(outcome);
                    debug!(notification_id = %id, retry_count = notification.retry_count, outcome, "Retried notification");
                }
                Err(e) => {
                    sweep.errors += 1;
                    warn!(notification_id = %id, error = %e, "Retry failed");
                }
            }
        }

        Ok(sweep)
    }
}
