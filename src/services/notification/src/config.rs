//! Configuration module for the notification service
//!
//! This module provides configuration structures and defaults for every
//! delivery channel and for the background schedulers. Provider credentials
//! default from their conventional environment variables; everything can be
//! overridden with `NOTIFICATION__<SECTION>__<KEY>` variables or a config file.

use fileshare_shared::NotificationChannel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure for the notification service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Email configuration
    pub email: EmailConfig,

    /// SMS configuration
    pub sms: SmsConfig,

    /// Push notification configuration
    pub push: PushConfig,

    /// In-app inbox configuration
    pub inapp: InAppConfig,

    /// WebSocket configuration
    pub websocket: WebSocketConfig,

    /// Fan-out, channel-level retry and fallback
    pub channel_manager: ChannelManagerConfig,

    /// Notification-level retry with exponential backoff
    pub retry: RetryConfig,

    /// Dead-letter queue reprocessing and retention
    pub dead_letter: DeadLetterConfig,

    /// Batching windows
    pub batch: BatchConfig,

    /// Event stream consumption
    pub ingest: IngestConfig,

    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub timeout_seconds: u64,
}

/// Email configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub smtp_use_tls: bool,
    pub from_email: String,
    pub from_name: String,
    pub reply_to: Option<String>,
    pub timeout_seconds: u64,
}

/// SMS configuration (Twilio REST API)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub enabled: bool,
    pub account_sid: String,
    pub auth_token: String,
    pub from_phone: String,
    pub api_base_url: String,
    pub timeout_seconds: u64,
}

/// Push notification configuration (FCM HTTP API)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    pub enabled: bool,
    pub fcm_server_key: String,
    pub fcm_endpoint: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InAppConfig {
    pub enabled: bool,
    /// Oldest messages are dropped past this many per user
    pub max_inbox_size: usize,
}

/// WebSocket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    pub enabled: bool,
    pub ping_interval_seconds: u64,
    pub message_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelManagerConfig {
    /// Overall deadline for one multi-channel fan-out
    pub send_timeout_ms: u64,
    /// Additional tries after the first one
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub fallback_enabled: bool,
    pub fallback_channel: Option<NotificationChannel>,
    pub fallback_retry_attempts: u32,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    /// Scheduled retries after the initial delivery attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Fraction of the delay that may be randomly shaved off, 0.0 disables jitter
    pub jitter: f64,
    pub batch_size: usize,
    /// How long a claimed retry may stay unsettled before another sweep
    /// takes it over
    #[serde(default = "default_claim_lease_ms")]
    pub claim_lease_ms: u64,
}

fn default_claim_lease_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    pub enabled: bool,
    pub poll_interval_seconds: u64,
    pub max_retries: u32,
    pub retry_interval_seconds: u64,
    pub max_retry_interval_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub retention_hours: u64,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub enabled: bool,
    pub window_ms: u64,
    pub max_size: usize,
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub enabled: bool,
    pub poll_batch_size: usize,
    pub poll_interval_ms: u64,
    pub error_backoff_ms: u64,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub per_user_per_minute: u32,
    pub burst: u32,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub namespace: String,
    pub histogram_buckets: Vec<f64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8086,
            timeout_seconds: 30,
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            smtp_host: std::env::var("SMTP_HOST").unwrap_or_default(),
            smtp_port: std::env::var("SMTP_PORT")
                .unwrap_or_else(|_| "587".to_string())
                .parse()
                .unwrap_or(587),
            smtp_username: std::env::var("SMTP_USERNAME").unwrap_or_default(),
            smtp_password: std::env::var("SMTP_PASSWORD").unwrap_or_default(),
            smtp_use_tls: std::env::var("SMTP_USE_TLS")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            from_email: std::env::var("FROM_EMAIL")
                .unwrap_or_else(|_| "noreply@fileshare.local".to_string()),
            from_name: std::env::var("FROM_NAME").unwrap_or_else(|_| "Fileshare".to_string()),
            reply_to: std::env::var("REPLY_TO_EMAIL").ok(),
            timeout_seconds: 30,
        }
    }
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            account_sid: std::env::var("TWILIO_ACCOUNT_SID").unwrap_or_default(),
            auth_token: std::env::var("TWILIO_AUTH_TOKEN").unwrap_or_default(),
            from_phone: std::env::var("TWILIO_FROM_PHONE").unwrap_or_default(),
            api_base_url: "https://api.twilio.com".to_string(),
            timeout_seconds: 30,
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fcm_server_key: std::env::var("FCM_SERVER_KEY").unwrap_or_default(),
            fcm_endpoint: "https://fcm.googleapis.com/fcm/send".to_string(),
            timeout_seconds: 30,
        }
    }
}

impl Default for InAppConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_inbox_size: 500,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ping_interval_seconds: 30,
            message_buffer_size: 256,
        }
    }
}

impl Default for ChannelManagerConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 30_000,
            retry_attempts: 2,
            retry_delay_ms: 1_000,
            fallback_enabled: true,
            fallback_channel: Some(NotificationChannel::InApp),
            fallback_retry_attempts: 1,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 5_000,
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000, // 5 minutes
            backoff_multiplier: 2.0,
            jitter: 0.2,
            batch_size: 100,
            claim_lease_ms: default_claim_lease_ms(),
        }
    }
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: 60,
            max_retries: 3,
            retry_interval_seconds: 3_600,
            max_retry_interval_seconds: 6 * 3_600,
            cleanup_interval_seconds: 3_600,
            retention_hours: 7 * 24,
            batch_size: 50,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 5_000,
            max_size: 10,
            sweep_interval_ms: 250,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_batch_size: 100,
            poll_interval_ms: 200,
            error_backoff_ms: 1_000,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_user_per_minute: 120,
            burst: 20,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "notification_service".to_string(),
            histogram_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        }
    }
}

impl ChannelManagerConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl BatchConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl NotificationConfig {
    /// Load configuration from environment variables and config file
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let mut cfg = config::Config::builder();

        // Start with default configuration
        cfg = cfg.add_source(config::Config::try_from(&NotificationConfig::default())?);

        // Add config file if it exists
        if let Ok(config_file) = std::env::var("NOTIFICATION_CONFIG_FILE") {
            cfg = cfg.add_source(config::File::with_name(&config_file).required(false));
        }

        // Environment variables win over the file
        cfg = cfg.add_source(
            config::Environment::with_prefix("NOTIFICATION")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        cfg.build()?.try_deserialize()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port must be greater than 0".to_string());
        }

        if self.channel_manager.send_timeout_ms == 0 {
            return Err("Channel send timeout must be greater than 0".to_string());
        }

        if self.channel_manager.fallback_enabled && self.channel_manager.fallback_channel.is_none()
        {
            return Err("A fallback channel is required when fallback is enabled".to_string());
        }

        if self.retry.backoff_multiplier <= 1.0 {
            return Err("Backoff multiplier must be greater than 1.0".to_string());
        }

        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err("Retry jitter must be between 0.0 and 1.0".to_string());
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err("Retry base delay cannot exceed the max delay".to_string());
        }

        if self.retry.claim_lease_ms == 0 {
            return Err("Retry claim lease must be greater than 0".to_string());
        }

        if self.retry.batch_size == 0 || self.dead_letter.batch_size == 0 {
            return Err("Scheduler batch sizes must be greater than 0".to_string());
        }

        if self.batch.max_size == 0 {
            return Err("Batch max size must be greater than 0".to_string());
        }

        if self.batch.window_ms == 0 || self.batch.sweep_interval_ms == 0 {
            return Err("Batch window and sweep interval must be greater than 0".to_string());
        }

        if self.rate_limit.enabled && self.rate_limit.per_user_per_minute == 0 {
            return Err("Rate limit must allow at least one notification per minute".to_string());
        }

        Ok(())
    }
}
