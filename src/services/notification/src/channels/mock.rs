//! Scripted channel used by tests and local runs without provider credentials

use crate::channels::{Channel, ChannelInfo, DeliveryRequest};
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use fileshare_shared::{DeliveryResult, NotificationChannel};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// What one `send` call on a [`MockChannel`] does
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Succeed,
    /// Report `success: false` without an error
    Reject(String),
    /// Return a retryable provider error
    Fail(String),
    /// Return an error that is never retried
    FailPermanently(String),
}

pub struct MockChannel {
    kind: NotificationChannel,
    enabled: AtomicBool,
    script: Mutex<VecDeque<MockOutcome>>,
    fallback: Mutex<MockOutcome>,
    latency: Option<Duration>,
    calls: AtomicU32,
    sent: Mutex<Vec<DeliveryRequest>>,
}

impl MockChannel {
    /// A channel that succeeds on every call
    pub fn new(kind: NotificationChannel) -> Self {
        Self {
            kind,
            enabled: AtomicBool::new(true),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(MockOutcome::Succeed),
            latency: None,
            calls: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// A channel that fails every call with a retryable error
    pub fn failing(kind: NotificationChannel, error: impl Into<String>) -> Self {
        Self::new(kind).with_default(MockOutcome::Fail(error.into()))
    }

    pub fn disabled(kind: NotificationChannel) -> Self {
        let channel = Self::new(kind);
        channel.enabled.store(false, Ordering::SeqCst);
        channel
    }

    /// Outcomes consumed one per call before falling back to the default
    pub fn with_script(self, outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        self.script.lock().extend(outcomes);
        self
    }

    pub fn with_default(self, outcome: MockOutcome) -> Self {
        *self.fallback.lock() = outcome;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn set_default(&self, outcome: MockOutcome) {
        *self.fallback.lock() = outcome;
    }

    /// Number of `send` calls, including failed ones
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests that were delivered successfully
    pub fn sent(&self) -> Vec<DeliveryRequest> {
        self.sent.lock().clone()
    }

    fn next_outcome(&self) -> MockOutcome {
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.lock().clone())
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn kind(&self) -> NotificationChannel {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn validate(&self, request: &DeliveryRequest) -> Result<()> {
        if request.user_id.is_empty() {
            return Err(NotificationError::validation("user_id", "is required"));
        }
        Ok(())
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryResult> {
        if !self.is_enabled() {
            return Err(NotificationError::channel_disabled(self.name(), "mock disabled"));
        }

        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match self.next_outcome() {
            MockOutcome::Succeed => {
                self.sent.lock().push(request.clone());
                Ok(DeliveryResult::success(self.kind))
            }
            MockOutcome::Reject(reason) => Ok(DeliveryResult::failure(self.kind, reason)),
            MockOutcome::Fail(message) => Err(NotificationError::external_service(self.name(), message)),
            MockOutcome::FailPermanently(message) => Err(NotificationError::validation(self.name(), message)),
        }
    }

    fn info(&self) -> ChannelInfo {
        ChannelInfo {
            name: self.name().to_string(),
            description: "Scripted mock channel".to_string(),
            enabled: self.is_enabled(),
            disabled_reason: None,
        }
    }
}
