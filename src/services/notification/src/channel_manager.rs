//! Multi-channel fan-out with per-channel retry and a fallback channel
//!
//! Each requested channel runs in its own task. A channel is validated before
//! it is sent to, retried with a fixed delay, and interrupted promptly when the
//! caller's token is cancelled or the overall fan-out deadline passes. Results
//! are keyed by channel; their order carries no meaning.

use crate::channels::{Channel, ChannelInfo, DeliveryRequest};
use crate::config::ChannelManagerConfig;
use crate::error::{NotificationError, Result};
use crate::metrics::NotificationMetrics;
use fileshare_shared::{DeliveryResult, NotificationChannel};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-channel outcomes of one fan-out
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryReport {
    pub results: HashMap<NotificationChannel, DeliveryResult>,
}

impl DeliveryReport {
    pub fn get(&self, channel: NotificationChannel) -> Option<&DeliveryResult> {
        self.results.get(&channel)
    }

    pub fn any_succeeded(&self) -> bool {
        self.results.values().any(|r| r.success)
    }

    pub fn succeeded(&self) -> Vec<NotificationChannel> {
        let mut channels: Vec<_> = self
            .results
            .values()
            .filter(|r| r.success)
            .map(|r| r.channel)
            .collect();
        channels.sort();
        channels
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Results sorted by channel, for stable output
    pub fn into_results(self) -> Vec<DeliveryResult> {
        let mut results: Vec<_> = self.results.into_values().collect();
        results.sort_by_key(|r| r.channel);
        results
    }

    fn from_results(results: Vec<DeliveryResult>) -> Self {
        Self {
            results: results.into_iter().map(|r| (r.channel, r)).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetrySettings {
    retry_attempts: u32,
    retry_delay: Duration,
}

pub struct ChannelManager {
    config: ChannelManagerConfig,
    channels: HashMap<NotificationChannel, Arc<dyn Channel>>,
    metrics: Arc<NotificationMetrics>,
}

impl ChannelManager {
    pub fn new(config: ChannelManagerConfig, metrics: Arc<NotificationMetrics>) -> Self {
        Self {
            config,
            channels: HashMap::new(),
            metrics,
        }
    }

    /// Register a channel, replacing any channel of the same kind
    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        let kind = channel.kind();
        info!(channel = %kind, enabled = channel.is_enabled(), "Registered notification channel");
        self.channels.insert(kind, channel);
    }

    pub fn with_channel(mut self, channel: Arc<dyn Channel>) -> Self {
        self.register(channel);
        self
    }

    pub fn get(&self, kind: NotificationChannel) -> Option<&Arc<dyn Channel>> {
        self.channels.get(&kind)
    }

    pub fn config(&self) -> &ChannelManagerConfig {
        &self.config
    }

    pub fn channel_info(&self) -> Vec<ChannelInfo> {
        let mut kinds: Vec<_> = self.channels.keys().copied().collect();
        kinds.sort();
        kinds
            .into_iter()
            .filter_map(|kind| self.channels.get(&kind).map(|c| c.info()))
            .collect()
    }

    /// Fail with one error naming every unregistered and every disabled channel
    pub fn validate_channels(&self, channels: &[NotificationChannel]) -> Result<()> {
        let mut missing = Vec::new();
        let mut disabled = Vec::new();
        for kind in channels {
            match self.channels.get(kind) {
                None => missing.push(kind.as_str()),
                Some(channel) if !channel.is_enabled() => disabled.push(kind.as_str()),
                Some(_) => {}
            }
        }

        let mut problems = Vec::new();
        if !missing.is_empty() {
            problems.push(format!("not registered: {}", missing.join(", ")));
        }
        if !disabled.is_empty() {
            problems.push(format!("disabled: {}", disabled.join(", ")));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(NotificationError::validation("channels", problems.join("; ")))
        }
    }

    /// Send on every channel of `request` concurrently. Returns one result per
    /// distinct requested channel, or `AllChannelsFailed` carrying them when
    /// none succeeded. A deadline hit mid-flight still reports every channel.
    pub async fn send_multi_channel(
        &self,
        request: &DeliveryRequest,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReport> {
        if request.channels.is_empty() {
            return Err(NotificationError::validation(
                "channels",
                "at least one channel is required",
            ));
        }

        let mut requested = request.channels.clone();
        requested.sort();
        requested.dedup();

        let deadline = Instant::now() + self.config.send_timeout();
        let settings = RetrySettings {
            retry_attempts: self.config.retry_attempts,
            retry_delay: self.config.retry_delay(),
        };
        let shared = Arc::new(request.clone());

        let mut results = Vec::with_capacity(requested.len());
        let mut tasks = JoinSet::new();
        for kind in &requested {
            match self.channels.get(kind) {
                Some(channel) => {
                    let channel = channel.clone();
                    let request = shared.clone();
                    let cancel = cancel.clone();
                    tasks.spawn(async move {
                        deliver(channel.as_ref(), &request, settings, &cancel, Some(deadline)).await
                    });
                }
                None => results.push(not_registered(*kind)),
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "Channel delivery task did not complete"),
            }
        }

        // A task that panicked leaves its channel without a result
        for kind in &requested {
            if !results.iter().any(|r| r.channel == *kind) {
                results.push(
                    DeliveryResult::failure(*kind, "delivery task did not complete").non_retryable(),
                );
            }
        }

        for result in &results {
            self.metrics.record_delivery(result);
        }

        let report = DeliveryReport::from_results(results);
        if report.any_succeeded() {
            debug!(
                user_id = %request.user_id,
                succeeded = ?report.succeeded(),
                total = report.len(),
                "Multi-channel send completed"
            );
            Ok(report)
        } else {
            warn!(user_id = %request.user_id, event_type = %request.event_type, "Every requested channel failed");
            Err(NotificationError::all_channels_failed(report.into_results()))
        }
    }

    /// Fan out, then try the designated fallback channel once when every
    /// primary channel failed. The fallback result is added to the report.
    pub async fn send_with_fallback(
        &self,
        request: &DeliveryRequest,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReport> {
        let primary = self.send_multi_channel(request, cancel).await;

        let mut results = match primary {
            Err(NotificationError::AllChannelsFailed { results, .. }) => results,
            other => return other,
        };

        let fallback = match self.config.fallback_channel {
            Some(fallback) if self.config.fallback_enabled => fallback,
            _ => return Err(NotificationError::all_channels_failed(results)),
        };

        if results.iter().any(|r| r.channel == fallback) {
            debug!(channel = %fallback, "Fallback channel already failed as a primary channel");
            return Err(NotificationError::all_channels_failed(results));
        }

        info!(user_id = %request.user_id, channel = %fallback, "All primary channels failed, trying fallback");
        let settings = RetrySettings {
            retry_attempts: self.config.fallback_retry_attempts,
            retry_delay: self.config.retry_delay(),
        };
        let fallback_request = request.clone().with_channels(vec![fallback]);
        let result = match self.channels.get(&fallback) {
            Some(channel) => deliver(channel.as_ref(), &fallback_request, settings, cancel, None).await,
            None => not_registered(fallback),
        };
        self.metrics.record_delivery(&result);

        let recovered = result.success;
        results.push(result);
        if recovered {
            Ok(DeliveryReport::from_results(results))
        } else {
            Err(NotificationError::all_channels_failed(results))
        }
    }

    /// Send on one channel with the configured channel-level retries.
    /// Never fails; the outcome is described by the returned result.
    pub async fn send_with_retry(
        &self,
        kind: NotificationChannel,
        request: &DeliveryRequest,
        cancel: &CancellationToken,
    ) -> DeliveryResult {
        let settings = RetrySettings {
            retry_attempts: self.config.retry_attempts,
            retry_delay: self.config.retry_delay(),
        };
        let result = match self.channels.get(&kind) {
            Some(channel) => deliver(channel.as_ref(), request, settings, cancel, None).await,
            None => not_registered(kind),
        };
        self.metrics.record_delivery(&result);
        result
    }

    /// Health of every registered channel
    pub fn health_check(&self) -> HashMap<String, bool> {
        self.channels
            .iter()
            .map(|(kind, channel)| (kind.to_string(), channel.is_enabled()))
            .collect()
    }
}

fn not_registered(kind: NotificationChannel) -> DeliveryResult {
    let mut result =
        DeliveryResult::failure(kind, NotificationError::channel_not_found(kind.as_str()).to_string())
            .non_retryable();
    result.attempts = 0;
    result
}

/// Resolves once the caller cancels or the deadline passes
async fn interrupted(cancel: &CancellationToken, deadline: Option<Instant>) -> NotificationError {
    match deadline {
        Some(deadline) => tokio::select! {
            _ = cancel.cancelled() => NotificationError::cancelled("channel delivery"),
            _ = tokio::time::sleep_until(deadline) => NotificationError::timeout("multi-channel send"),
        },
        None => {
            cancel.cancelled().await;
            NotificationError::cancelled("channel delivery")
        }
    }
}

async fn deliver(
    channel: &dyn Channel,
    request: &DeliveryRequest,
    settings: RetrySettings,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> DeliveryResult {
    let kind = channel.kind();
    let started = Instant::now();

    let rejected = if !channel.is_enabled() {
        let reason = channel
            .info()
            .disabled_reason
            .unwrap_or_else(|| "missing credentials or configuration".to_string());
        Some(NotificationError::channel_disabled(channel.name(), reason))
    } else {
        channel.validate(request).err()
    };
    if let Some(e) = rejected {
        debug!(channel = %kind, error = %e, "Channel rejected request before sending");
        let mut result = DeliveryResult::failure(kind, e.to_string()).non_retryable();
        result.attempts = 0;
        return result;
    }

    let mut errors = Vec::new();
    let mut attempts = 0;
    let mut retryable = true;

    for attempt in 0..=settings.retry_attempts {
        if attempt > 0 {
            let stop = tokio::select! {
                e = interrupted(cancel, deadline) => Some(e),
                _ = tokio::time::sleep(settings.retry_delay) => None,
            };
            if let Some(e) = stop {
                errors.push(e.to_string());
                break;
            }
        }

        attempts += 1;
        let outcome = tokio::select! {
            biased;
            e = interrupted(cancel, deadline) => {
                errors.push(format!("attempt {attempts}: {e}"));
                break;
            }
            outcome = channel.send(request) => outcome,
        };

        match outcome {
            Ok(mut result) if result.success => {
                result.attempts = attempts;
                result.duration_ms = elapsed_ms(started);
                if attempts > 1 {
                    info!(channel = %kind, attempts, "Delivered after channel retries");
                }
                return result;
            }
            Ok(result) => {
                let reason = result
                    .error
                    .unwrap_or_else(|| "provider reported failure".to_string());
                errors.push(format!("attempt {attempts}: {reason}"));
                if !result.retryable {
                    retryable = false;
                    break;
                }
            }
            Err(e) => {
                errors.push(format!("attempt {attempts}: {e}"));
                if !e.is_retryable() {
                    retryable = false;
                    break;
                }
            }
        }
        debug!(channel = %kind, attempt = attempts, "Channel attempt failed");
    }

    let mut result = DeliveryResult::failure(kind, errors.join("; "));
    result.attempts = attempts;
    result.duration_ms = elapsed_ms(started);
    result.retryable = retryable;
    result
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{MockChannel, MockOutcome};
    use crate::config::MetricsConfig;
    use fileshare_shared::{ContactInfo, NotificationRequest};
    use pretty_assertions::assert_eq;

    fn config() -> ChannelManagerConfig {
        ChannelManagerConfig {
            send_timeout_ms: 10_000,
            retry_attempts: 2,
            retry_delay_ms: 100,
            fallback_enabled: false,
            fallback_channel: None,
            fallback_retry_attempts: 0,
        }
    }

    fn manager(config: ChannelManagerConfig, channels: Vec<Arc<MockChannel>>) -> ChannelManager {
        let metrics = Arc::new(NotificationMetrics::new(&MetricsConfig::default()).unwrap());
        let mut manager = ChannelManager::new(config, metrics);
        for channel in channels {
            manager.register(channel);
        }
        manager
    }

    fn request(channels: &[NotificationChannel]) -> DeliveryRequest {
        let request = NotificationRequest::new("u1", "file.uploaded", "Uploaded", "a.txt")
            .with_channels(channels.iter().copied());
        DeliveryRequest::from_request(&request, ContactInfo::default())
    }

    #[tokio::test]
    async fn test_disabled_sms_with_working_email_is_partial_success() {
        let email = Arc::new(MockChannel::new(NotificationChannel::Email));
        let sms = Arc::new(MockChannel::disabled(NotificationChannel::Sms));
        let manager = manager(config(), vec![email.clone(), sms.clone()]);

        let report = manager
            .send_multi_channel(
                &request(&[NotificationChannel::Sms, NotificationChannel::Email]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.len(), 2);
        assert!(report.get(NotificationChannel::Email).unwrap().success);
        let sms_result = report.get(NotificationChannel::Sms).unwrap();
        assert!(!sms_result.success);
        assert!(!sms_result.retryable);
        assert!(sms_result.error.as_deref().unwrap().contains("disabled"));
        assert_eq!(email.calls(), 1);
        assert_eq!(sms.calls(), 0);
    }

    #[tokio::test]
    async fn test_one_result_per_channel_when_everything_fails() {
        let manager = manager(
            config(),
            vec![
                Arc::new(MockChannel::failing(NotificationChannel::Email, "smtp down")),
                Arc::new(MockChannel::failing(NotificationChannel::Push, "fcm down")),
            ],
        );

        let err = manager
            .send_multi_channel(
                &request(&[
                    NotificationChannel::Email,
                    NotificationChannel::Push,
                    NotificationChannel::InApp,
                    NotificationChannel::Email,
                ]),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            NotificationError::AllChannelsFailed { results, .. } => {
                let channels: Vec<_> = results.iter().map(|r| r.channel).collect();
                assert_eq!(
                    channels,
                    vec![
                        NotificationChannel::Email,
                        NotificationChannel::Push,
                        NotificationChannel::InApp
                    ]
                );
                assert_eq!(results[0].attempts, 3);
                assert_eq!(results[2].attempts, 0);
                assert!(results[2].error.as_deref().unwrap().contains("not registered"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_channel_list_is_rejected() {
        let manager = manager(config(), vec![]);
        let err = manager
            .send_multi_channel(&request(&[]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::Validation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_third_attempt() {
        let email = Arc::new(MockChannel::new(NotificationChannel::Email).with_script([
            MockOutcome::Fail("timeout".into()),
            MockOutcome::Reject("mailbox busy".into()),
            MockOutcome::Succeed,
        ]));
        let manager = manager(config(), vec![email.clone()]);

        let started = Instant::now();
        let result = manager
            .send_with_retry(
                NotificationChannel::Email,
                &request(&[NotificationChannel::Email]),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(email.calls(), 3);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_aggregates_errors() {
        let email = Arc::new(MockChannel::failing(NotificationChannel::Email, "smtp down"));
        let manager = manager(config(), vec![email.clone()]);

        let result = manager
            .send_with_retry(
                NotificationChannel::Email,
                &request(&[NotificationChannel::Email]),
                &CancellationToken::new(),
            )
            .await;

        assert!(!result.success);
        assert!(result.retryable);
        assert_eq!(result.attempts, 3);
        let error = result.error.unwrap();
        assert!(error.contains("attempt 1"));
        assert!(error.contains("attempt 3"));
    }

    #[tokio::test]
    async fn test_permanent_error_stops_retrying() {
        let email = Arc::new(
            MockChannel::new(NotificationChannel::Email)
                .with_default(MockOutcome::FailPermanently("bad address".into())),
        );
        let manager = manager(config(), vec![email.clone()]);

        let result = manager
            .send_with_retry(
                NotificationChannel::Email,
                &request(&[NotificationChannel::Email]),
                &CancellationToken::new(),
            )
            .await;

        assert!(!result.success);
        assert!(!result.retryable);
        assert_eq!(email.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_retry_sleep() {
        let mut config = config();
        config.retry_delay_ms = 60_000;
        let email = Arc::new(MockChannel::failing(NotificationChannel::Email, "smtp down"));
        let manager = manager(config, vec![email.clone()]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = manager
            .send_with_retry(NotificationChannel::Email, &request(&[NotificationChannel::Email]), &cancel)
            .await;

        assert!(!result.success);
        assert_eq!(email.calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(60));
        assert!(result.error.unwrap().contains("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_partial_results() {
        let mut config = config();
        config.send_timeout_ms = 1_000;
        let manager = manager(
            config,
            vec![
                Arc::new(MockChannel::new(NotificationChannel::Email)),
                Arc::new(
                    MockChannel::new(NotificationChannel::Push).with_latency(Duration::from_secs(30)),
                ),
            ],
        );

        let report = manager
            .send_multi_channel(
                &request(&[NotificationChannel::Email, NotificationChannel::Push]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.get(NotificationChannel::Email).unwrap().success);
        let push = report.get(NotificationChannel::Push).unwrap();
        assert!(!push.success);
        assert!(push.retryable);
        assert!(push.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_fallback_after_all_primaries_fail() {
        let mut config = config();
        config.retry_attempts = 0;
        config.fallback_enabled = true;
        config.fallback_channel = Some(NotificationChannel::InApp);
        let inapp = Arc::new(MockChannel::new(NotificationChannel::InApp));
        let manager = manager(
            config,
            vec![
                Arc::new(MockChannel::failing(NotificationChannel::Email, "smtp down")),
                inapp.clone(),
            ],
        );

        let report = manager
            .send_with_fallback(&request(&[NotificationChannel::Email]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.len(), 2);
        assert!(!report.get(NotificationChannel::Email).unwrap().success);
        assert!(report.get(NotificationChannel::InApp).unwrap().success);
        assert_eq!(inapp.calls(), 1);
    }

    #[tokio::test]
    async fn test_fallback_not_used_on_partial_success() {
        let mut config = config();
        config.fallback_enabled = true;
        config.fallback_channel = Some(NotificationChannel::InApp);
        let inapp = Arc::new(MockChannel::new(NotificationChannel::InApp));
        let manager = manager(
            config,
            vec![
                Arc::new(MockChannel::new(NotificationChannel::Email)),
                Arc::new(MockChannel::disabled(NotificationChannel::Sms)),
                inapp.clone(),
            ],
        );

        let report = manager
            .send_with_fallback(
                &request(&[NotificationChannel::Email, NotificationChannel::Sms]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.len(), 2);
        assert_eq!(inapp.calls(), 0);
    }

    #[test]
    fn test_validate_channels_names_every_problem() {
        let manager = manager(
            config(),
            vec![
                Arc::new(MockChannel::new(NotificationChannel::Email)),
                Arc::new(MockChannel::disabled(NotificationChannel::Sms)),
                Arc::new(MockChannel::disabled(NotificationChannel::Push)),
            ],
        );

        assert!(manager.validate_channels(&[NotificationChannel::Email]).is_ok());

        let err = manager
            .validate_channels(&[
                NotificationChannel::Email,
                NotificationChannel::Sms,
                NotificationChannel::Push,
                NotificationChannel::Websocket,
            ])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: channels: not registered: websocket; disabled: sms, push"
        );
    }
}
