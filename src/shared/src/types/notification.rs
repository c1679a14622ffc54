//! Notification requests, persisted notification records and their lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;
use validator::Validate;

// =============================================================================
// Metadata
// =============================================================================

/// Scalar value stored in a notification's metadata map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Open string-keyed map of scalar values
pub type Metadata = HashMap<String, MetadataValue>;

impl MetadataValue {
    /// Convert a JSON value into a metadata scalar. Arrays and objects are kept
    /// as their JSON text, `null` is dropped.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Integer(i)),
                None => n.as_f64().map(Self::Float),
            },
            serde_json::Value::String(s) => Some(Self::Text(s.clone())),
            other => Some(Self::Text(other.to_string())),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::from(*b),
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Text(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u64> for MetadataValue {
    fn from(value: u64) -> Self {
        i64::try_from(value)
            .map(Self::Integer)
            .unwrap_or(Self::Float(value as f64))
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Render metadata as a JSON object, e.g. for template contexts
pub fn metadata_to_json(metadata: &Metadata) -> serde_json::Value {
    serde_json::Value::Object(
        metadata
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect(),
    )
}

// =============================================================================
// Channels and priority
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Sms,
    Push,
    #[serde(rename = "inapp")]
    InApp,
    Websocket,
}

impl NotificationChannel {
    pub const ALL: [NotificationChannel; 5] = [
        NotificationChannel::Email,
        NotificationChannel::Sms,
        NotificationChannel::Push,
        NotificationChannel::InApp,
        NotificationChannel::Websocket,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Push => "push",
            Self::InApp => "inapp",
            Self::Websocket => "websocket",
        }
    }
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown notification channel: {0}")]
pub struct UnknownChannel(pub String);

impl FromStr for NotificationChannel {
    type Err = UnknownChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            "push" => Ok(Self::Push),
            "inapp" | "in_app" => Ok(Self::InApp),
            "websocket" | "ws" => Ok(Self::Websocket),
            other => Err(UnknownChannel(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

// =============================================================================
// Requests
// =============================================================================

/// Intent to notify one user about one event
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NotificationRequest {
    #[validate(length(min = 1, message = "user_id is required"))]
    pub user_id: String,
    #[validate(length(min = 1, message = "event_type is required"))]
    pub event_type: String,
    #[serde(default)]
    pub channels: Vec<NotificationChannel>,
    #[validate(length(min = 1, message = "title is required"))]
    pub title: String,
    #[validate(length(min = 1, message = "body is required"))]
    pub body: String,
    #[serde(default)]
    pub priority: NotificationPriority,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub bypass_batching: bool,
    #[serde(default)]
    pub bypass_quiet_hours: bool,
}

impl NotificationRequest {
    pub fn new(
        user_id: impl Into<String>,
        event_type: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            event_type: event_type.into(),
            channels: Vec::new(),
            title: title.into(),
            body: body.into(),
            priority: NotificationPriority::Normal,
            metadata: Metadata::new(),
            bypass_batching: false,
            bypass_quiet_hours: false,
        }
    }

    pub fn with_channels(mut self, channels: impl IntoIterator<Item = NotificationChannel>) -> Self {
        self.channels = channels.into_iter().collect();
        self
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn bypass_batching(mut self) -> Self {
        self.bypass_batching = true;
        self
    }

    pub fn bypass_quiet_hours(mut self) -> Self {
        self.bypass_quiet_hours = true;
        self
    }

    /// An empty channel list is only acceptable when batching is bypassed; the
    /// channels are then resolved from the user's preferences.
    pub fn has_valid_channels(&self) -> bool {
        !self.channels.is_empty() || self.bypass_batching
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
    FailedTerminal,
    Read,
}

impl NotificationStatus {
    pub fn can_transition_to(self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Sent) | (Pending, Failed) | (Failed, Pending) | (Failed, FailedTerminal) | (Sent, Read)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Read | Self::FailedTerminal)
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
            Self::FailedTerminal => write!(f, "failed_terminal"),
            Self::Read => write!(f, "read"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid status transition from {from} to {to}")]
    Invalid {
        from: NotificationStatus,
        to: NotificationStatus,
    },

    #[error("a {expected} delivery attempt is required to enter {to}")]
    AttemptMismatch {
        expected: &'static str,
        to: NotificationStatus,
    },
}

/// One try on one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl DeliveryAttempt {
    pub fn succeeded(attempted_at: DateTime<Utc>, duration_ms: u64) -> Self {
        Self {
            attempted_at,
            success: true,
            error: None,
            duration_ms,
        }
    }

    pub fn failed(attempted_at: DateTime<Utc>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            attempted_at,
            success: false,
            error: Some(error.into()),
            duration_ms,
        }
    }
}

/// Persisted record of one notification on one channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: String,
    pub event_type: String,
    pub channel: NotificationChannel,
    pub title: String,
    pub body: String,
    pub priority: NotificationPriority,
    pub status: NotificationStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivery_attempts: Vec<DeliveryAttempt>,
    #[serde(default)]
    pub metadata: Metadata,
    pub batch_id: Option<Uuid>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Create a pending notification for one channel of a request
    pub fn from_request(request: &NotificationRequest, channel: NotificationChannel) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: request.user_id.clone(),
            event_type: request.event_type.clone(),
            channel,
            title: request.title.clone(),
            body: request.body.clone(),
            priority: request.priority,
            status: NotificationStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            delivery_attempts: Vec::new(),
            metadata: request.metadata.clone(),
            batch_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
            read_at: None,
        }
    }

    pub fn with_batch(mut self, batch_id: Uuid) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    fn transition(&mut self, next: NotificationStatus, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }

    /// `pending -> sent`, appending the successful attempt
    pub fn record_success(&mut self, attempt: DeliveryAttempt) -> Result<(), TransitionError> {
        if !attempt.success {
            return Err(TransitionError::AttemptMismatch {
                expected: "successful",
                to: NotificationStatus::Sent,
            });
        }
        let at = attempt.attempted_at;
        self.transition(NotificationStatus::Sent, at)?;
        self.sent_at = Some(at);
        self.next_retry_at = None;
        self.last_error = None;
        self.delivery_attempts.push(attempt);
        Ok(())
    }

    /// `pending -> failed`, appending the failed attempt and counting it
    pub fn record_failure(&mut self, attempt: DeliveryAttempt) -> Result<(), TransitionError> {
        if attempt.success {
            return Err(TransitionError::AttemptMismatch {
                expected: "failed",
                to: NotificationStatus::Failed,
            });
        }
        self.transition(NotificationStatus::Failed, attempt.attempted_at)?;
        self.retry_count += 1;
        self.last_error = attempt.error.clone();
        self.delivery_attempts.push(attempt);
        Ok(())
    }

    /// `failed -> pending`, taken when a retry claims the record
    pub fn requeue(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(NotificationStatus::Pending, at)
    }

    /// `failed -> failed_terminal`
    pub fn mark_terminal(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(NotificationStatus::FailedTerminal, at)?;
        self.next_retry_at = None;
        Ok(())
    }

    /// `sent -> read`
    pub fn mark_read(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(NotificationStatus::Read, at)?;
        self.read_at = Some(at);
        Ok(())
    }
}

// =============================================================================
// Delivery results and responses
// =============================================================================

/// Outcome of sending one request on one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub channel: NotificationChannel,
    pub success: bool,
    pub error: Option<String>,
    /// Number of channel-level tries behind this result
    pub attempts: u32,
    pub duration_ms: u64,
    pub delivered_at: Option<DateTime<Utc>>,
    pub provider_message_id: Option<String>,
    /// Whether a later notification-level retry may succeed
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

fn default_retryable() -> bool {
    true
}

impl DeliveryResult {
    pub fn success(channel: NotificationChannel) -> Self {
        Self {
            channel,
            success: true,
            error: None,
            attempts: 1,
            duration_ms: 0,
            delivered_at: Some(Utc::now()),
            provider_message_id: None,
            retryable: true,
        }
    }

    pub fn failure(channel: NotificationChannel, error: impl Into<String>) -> Self {
        Self {
            channel,
            success: false,
            error: Some(error.into()),
            attempts: 1,
            duration_ms: 0,
            delivered_at: None,
            provider_message_id: None,
            retryable: true,
        }
    }

    pub fn with_provider_message_id(mut self, id: impl Into<String>) -> Self {
        self.provider_message_id = Some(id.into());
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }
}

/// How a `notify` call was disposed of
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Sent,
    Failed,
    /// Accepted into a batch window
    Queued,
    /// Dropped by the user's preferences
    Suppressed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationResponse {
    pub id: Uuid,
    pub status: DispatchStatus,
    pub channel: Option<NotificationChannel>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deliveries: Vec<DeliveryResult>,
}

impl NotificationResponse {
    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: DispatchStatus::Failed,
            channel: None,
            sent_at: None,
            error: Some(error.into()),
            duration_ms,
            deliveries: Vec::new(),
        }
    }

    pub fn suppressed(reason: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: DispatchStatus::Suppressed,
            ..Self::failed(reason, duration_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request() -> NotificationRequest {
        NotificationRequest::new("u1", "file.uploaded", "Upload complete", "report.pdf uploaded")
            .with_channels([NotificationChannel::Email])
    }

    #[test]
    fn test_status_transitions() {
        use NotificationStatus::*;
        assert!(Pending.can_transition_to(Sent));
        assert!(Pending.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Failed.can_transition_to(FailedTerminal));
        assert!(Sent.can_transition_to(Read));

        assert!(!Pending.can_transition_to(Read));
        assert!(!Failed.can_transition_to(Sent));
        assert!(!Pending.can_transition_to(FailedTerminal));
        for next in [Pending, Sent, Failed, FailedTerminal, Read] {
            assert!(!Read.can_transition_to(next));
            assert!(!FailedTerminal.can_transition_to(next));
        }
    }

    #[test]
    fn test_failure_counts_retries_and_records_attempt() {
        let mut notification = Notification::from_request(&request(), NotificationChannel::Email);
        notification
            .record_failure(DeliveryAttempt::failed(Utc::now(), "smtp down", 12))
            .unwrap();

        assert_eq!(notification.status, NotificationStatus::Failed);
        assert_eq!(notification.retry_count, 1);
        assert_eq!(notification.delivery_attempts.len(), 1);
        assert_eq!(notification.last_error.as_deref(), Some("smtp down"));

        notification.requeue(Utc::now()).unwrap();
        notification
            .record_success(DeliveryAttempt::succeeded(Utc::now(), 3))
            .unwrap();
        assert_eq!(notification.status, NotificationStatus::Sent);
        assert_eq!(notification.delivery_attempts.len(), 2);
        assert!(notification.sent_at.is_some());
        assert!(notification.last_error.is_none());
    }

    #[test]
    fn test_attempt_must_match_target_status() {
        let mut notification = Notification::from_request(&request(), NotificationChannel::Email);
        let err = notification
            .record_success(DeliveryAttempt::failed(Utc::now(), "nope", 0))
            .unwrap_err();
        assert!(matches!(err, TransitionError::AttemptMismatch { .. }));
        assert_eq!(notification.status, NotificationStatus::Pending);
        assert!(notification.delivery_attempts.is_empty());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut notification = Notification::from_request(&request(), NotificationChannel::Email);
        notification
            .record_success(DeliveryAttempt::succeeded(Utc::now(), 1))
            .unwrap();
        notification.mark_read(Utc::now()).unwrap();

        assert!(notification.mark_read(Utc::now()).is_err());
        assert!(notification.requeue(Utc::now()).is_err());
        assert_eq!(notification.status, NotificationStatus::Read);
    }

    #[test]
    fn test_request_validation() {
        let valid = request();
        assert!(valid.validate().is_ok());
        assert!(valid.has_valid_channels());

        let mut missing_user = request();
        missing_user.user_id.clear();
        assert!(missing_user.validate().is_err());

        let no_channels = NotificationRequest::new("u1", "file.uploaded", "t", "b");
        assert!(!no_channels.has_valid_channels());
        assert!(no_channels.bypass_batching().has_valid_channels());
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(NotificationChannel::InApp.to_string(), "inapp");
        assert_eq!("in_app".parse::<NotificationChannel>().unwrap(), NotificationChannel::InApp);
        assert!("fax".parse::<NotificationChannel>().is_err());
        assert_eq!(
            serde_json::to_string(&NotificationChannel::InApp).unwrap(),
            "\"inapp\""
        );
    }

    #[test]
    fn test_metadata_scalars() {
        let json = serde_json::json!({"size": 42, "ratio": 0.5, "ok": true, "name": "a.txt"});
        let metadata: Metadata = serde_json::from_value(json).unwrap();
        assert_eq!(metadata["size"], MetadataValue::Integer(42));
        assert_eq!(metadata["ratio"], MetadataValue::Float(0.5));
        assert_eq!(metadata["ok"], MetadataValue::Bool(true));
        assert_eq!(metadata["name"].as_str(), Some("a.txt"));

        assert_eq!(MetadataValue::from_json(&serde_json::Value::Null), None);
        assert_eq!(
            MetadataValue::from_json(&serde_json::json!([1, 2])),
            Some(MetadataValue::Text("[1,2]".to_string()))
        );
    }
}
