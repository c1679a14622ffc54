//! Email notification channel implementation using SMTP

use crate::channels::{Channel, ChannelInfo, DeliveryRequest};
use crate::config::EmailConfig;
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use fileshare_shared::{DeliveryResult, NotificationChannel};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{error, info, warn};

/// Email channel for sending notifications via SMTP
#[derive(Clone)]
pub struct EmailChannel {
    config: EmailConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from_mailbox: Option<Mailbox>,
    disabled_reason: Option<String>,
}

impl EmailChannel {
    /// Create a new email channel with the given configuration. Missing or
    /// invalid SMTP settings produce a disabled channel rather than an error.
    pub fn new(config: &EmailConfig) -> Self {
        info!("Initializing email channel");

        match Self::build_transport(config) {
            Ok((transport, from_mailbox)) => {
                info!(host = %config.smtp_host, "Email channel initialized successfully");
                Self {
                    config: config.clone(),
                    transport: Some(transport),
                    from_mailbox: Some(from_mailbox),
                    disabled_reason: None,
                }
            }
            Err(reason) => {
                warn!(%reason, "Email channel disabled");
                Self {
                    config: config.clone(),
                    transport: None,
                    from_mailbox: None,
                    disabled_reason: Some(reason),
                }
            }
        }
    }

    fn build_transport(
        config: &EmailConfig,
    ) -> std::result::Result<(AsyncSmtpTransport<Tokio1Executor>, Mailbox), String> {
        if !config.enabled {
            return Err("disabled by configuration".to_string());
        }
        if config.smtp_host.is_empty() {
            return Err("SMTP host is not configured".to_string());
        }
        if config.from_email.is_empty() {
            return Err("sender address is not configured".to_string());
        }

        let from_mailbox = format!("{} <{}>", config.from_name, config.from_email)
            .parse::<Mailbox>()
            .map_err(|e| format!("Invalid from email address: {}", e))?;

        let mut transport_builder = if config.smtp_use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
                .map_err(|e| format!("Failed to create SMTP relay: {}", e))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };

        transport_builder = transport_builder.port(config.smtp_port);

        if !config.smtp_username.is_empty() && !config.smtp_password.is_empty() {
            let creds =
                Credentials::new(config.smtp_username.clone(), config.smtp_password.clone());
            transport_builder = transport_builder.credentials(creds);
        }

        transport_builder = transport_builder
            .pool_config(PoolConfig::new().max_size(10).min_idle(1))
            .timeout(Some(Duration::from_secs(config.timeout_seconds)));

        Ok((transport_builder.build(), from_mailbox))
    }

    fn recipient(request: &DeliveryRequest) -> Result<Mailbox> {
        let address = request
            .contact
            .email
            .as_deref()
            .filter(|address| !address.is_empty())
            .ok_or_else(|| NotificationError::validation("email", "recipient has no email address"))?;

        address
            .parse::<Mailbox>()
            .map_err(|e| NotificationError::validation("email", format!("Invalid recipient email: {}", e)))
    }

    /// Build an email message from the delivery request
    fn build_message(&self, request: &DeliveryRequest, from: &Mailbox) -> Result<Message> {
        let to_mailbox = Self::recipient(request)?;

        let mut message_builder = Message::builder()
            .from(from.clone())
            .to(to_mailbox)
            .subject(&request.title);

        if let Some(ref reply_to) = self.config.reply_to {
            let reply_to_mailbox = reply_to
                .parse::<Mailbox>()
                .map_err(|e| NotificationError::email(format!("Invalid reply-to email: {}", e)))?;
            message_builder = message_builder.reply_to(reply_to_mailbox);
        }

        let content_type = if request.body.contains("<html>") || request.body.contains("<p>") {
            ContentType::TEXT_HTML
        } else {
            ContentType::TEXT_PLAIN
        };

        message_builder
            .header(content_type)
            .body(request.body.clone())
            .map_err(|e| NotificationError::email(format!("Failed to build email message: {}", e)))
    }
}

#[async_trait]
impl Channel for EmailChannel {
    fn kind(&self) -> NotificationChannel {
        NotificationChannel::Email
    }

    fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }

    fn validate(&self, request: &DeliveryRequest) -> Result<()> {
        Self::recipient(request).map(|_| ())
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryResult> {
        let (transport, from) = match (&self.transport, &self.from_mailbox) {
            (Some(transport), Some(from)) => (transport, from),
            _ => {
                return Err(NotificationError::channel_disabled(
                    self.name(),
                    self.disabled_reason.clone().unwrap_or_default(),
                ))
            }
        };

        let message = self.build_message(request, from)?;

        match transport.send(message).await {
            Ok(response) => {
                info!(
                    user_id = %request.user_id,
                    code = %response.code(),
                    "Email sent successfully"
                );
                Ok(DeliveryResult::success(self.kind()))
            }
            Err(e) => {
                error!(user_id = %request.user_id, error = %e, "Failed to send email");
                Err(NotificationError::email(format!("SMTP error: {}", e)))
            }
        }
    }

    fn info(&self) -> ChannelInfo {
        ChannelInfo {
            name: self.name().to_string(),
            description: "SMTP email notifications".to_string(),
            enabled: self.is_enabled(),
            disabled_reason: self.disabled_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileshare_shared::{ContactInfo, NotificationRequest};

    fn create_test_config() -> EmailConfig {
        EmailConfig {
            enabled: true,
            smtp_host: "localhost".to_string(),
            smtp_port: 2525,
            smtp_username: "test".to_string(),
            smtp_password: "test".to_string(),
            smtp_use_tls: false,
            from_email: "test@example.com".to_string(),
            from_name: "Test Service".to_string(),
            reply_to: None,
            timeout_seconds: 5,
        }
    }

    fn create_test_request(email: Option<&str>) -> DeliveryRequest {
        let request = NotificationRequest::new("u1", "file.uploaded", "Upload complete", "report.pdf is ready")
            .with_channels([NotificationChannel::Email]);
        DeliveryRequest::from_request(
            &request,
            ContactInfo {
                email: email.map(str::to_string),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_email_channel_creation() {
        let channel = EmailChannel::new(&create_test_config());
        assert!(channel.is_enabled());
        assert_eq!(channel.name(), "email");
    }

    #[tokio::test]
    async fn test_missing_host_disables_channel() {
        let mut config = create_test_config();
        config.smtp_host.clear();
        let channel = EmailChannel::new(&config);

        assert!(!channel.is_enabled());
        assert!(channel.info().disabled_reason.is_some());

        let err = channel
            .send(&create_test_request(Some("user@example.com")))
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::ChannelDisabled { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_validate_requires_address() {
        let channel = EmailChannel::new(&create_test_config());
        assert!(channel.validate(&create_test_request(Some("user@example.com"))).is_ok());
        assert!(matches!(
            channel.validate(&create_test_request(None)),
            Err(NotificationError::Validation { .. })
        ));
        assert!(channel.validate(&create_test_request(Some("not-an-address"))).is_err());
    }

    #[tokio::test]
    async fn test_build_message() {
        let channel = EmailChannel::new(&create_test_config());
        let from = channel.from_mailbox.clone().unwrap();
        let message = channel.build_message(&create_test_request(Some("recipient@example.com")), &from);
        assert!(message.is_ok());
    }
}
