//! SMS notification channel implementation using the Twilio REST API

use crate::channels::{Channel, ChannelInfo, DeliveryRequest};
use crate::config::SmsConfig;
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use fileshare_shared::{DeliveryResult, NotificationChannel};
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info, warn};

/// Longest body sent as one message; longer bodies are truncated
const MAX_SMS_LENGTH: usize = 1600;

/// SMS channel for sending notifications via Twilio
#[derive(Clone)]
pub struct SmsChannel {
    config: SmsConfig,
    client: reqwest::Client,
    disabled_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct TwilioError {
    code: Option<i64>,
    message: String,
}

impl SmsChannel {
    /// Create a new SMS channel with the given configuration
    pub fn new(config: &SmsConfig) -> Self {
        info!("Initializing SMS channel");

        let disabled_reason = if !config.enabled {
            Some("disabled by configuration".to_string())
        } else if config.account_sid.is_empty() || config.auth_token.is_empty() {
            Some("Twilio credentials are not configured".to_string())
        } else if config.from_phone.is_empty() {
            Some("sender phone number is not configured".to_string())
        } else {
            None
        };

        match &disabled_reason {
            Some(reason) => warn!(%reason, "SMS channel disabled"),
            None => info!("SMS channel initialized successfully"),
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();

        Self {
            config: config.clone(),
            client,
            disabled_reason,
        }
    }

    fn recipient_phone(request: &DeliveryRequest) -> Result<&str> {
        let phone = request
            .contact
            .phone
            .as_deref()
            .ok_or_else(|| NotificationError::validation("phone", "recipient has no phone number"))?;

        if !is_e164(phone) {
            return Err(NotificationError::validation(
                "phone",
                format!("'{}' is not an E.164 phone number", phone),
            ));
        }
        Ok(phone)
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.account_sid
        )
    }

    fn message_body(request: &DeliveryRequest) -> String {
        let text = format!("{}: {}", request.title, request.body);
        if text.chars().count() > MAX_SMS_LENGTH {
            text.chars().take(MAX_SMS_LENGTH).collect()
        } else {
            text
        }
    }
}

fn is_e164(phone: &str) -> bool {
    let digits = match phone.strip_prefix('+') {
        Some(digits) => digits,
        None => return false,
    };
    (8..=15).contains(&digits.len())
        && digits.chars().all(|c| c.is_ascii_digit())
        && !digits.starts_with('0')
}

#[async_trait]
impl Channel for SmsChannel {
    fn kind(&self) -> NotificationChannel {
        NotificationChannel::Sms
    }

    fn is_enabled(&self) -> bool {
        self.disabled_reason.is_none()
    }

    fn validate(&self, request: &DeliveryRequest) -> Result<()> {
        Self::recipient_phone(request).map(|_| ())
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryResult> {
        if let Some(reason) = &self.disabled_reason {
            return Err(NotificationError::channel_disabled(self.name(), reason.clone()));
        }

        let phone = Self::recipient_phone(request)?;
        let body = Self::message_body(request);

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[
                ("To", phone),
                ("From", self.config.from_phone.as_str()),
                ("Body", body.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let message: TwilioMessage = response.json().await?;
            info!(user_id = %request.user_id, sid = %message.sid, "SMS sent successfully");
            return Ok(DeliveryResult::success(self.kind()).with_provider_message_id(message.sid));
        }

        let detail = match response.json::<TwilioError>().await {
            Ok(err) => match err.code {
                Some(code) => format!("{} (code {})", err.message, code),
                None => err.message,
            },
            Err(_) => status.to_string(),
        };
        error!(user_id = %request.user_id, %status, %detail, "Twilio rejected SMS");

        // 4xx responses other than throttling will not succeed on retry
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Ok(DeliveryResult::failure(self.kind(), format!("Twilio rejected message: {}", detail))
                .non_retryable());
        }
        Err(NotificationError::sms(format!("Twilio error {}: {}", status, detail)))
    }

    fn info(&self) -> ChannelInfo {
        ChannelInfo {
            name: self.name().to_string(),
            description: "SMS notifications via Twilio".to_string(),
            enabled: self.is_enabled(),
            disabled_reason: self.disabled_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileshare_shared::{ContactInfo, NotificationRequest};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_config(base_url: &str) -> SmsConfig {
        SmsConfig {
            enabled: true,
            account_sid: "AC123".to_string(),
            auth_token: "secret".to_string(),
            from_phone: "+15550000000".to_string(),
            api_base_url: base_url.to_string(),
            timeout_seconds: 5,
        }
    }

    fn create_test_request(phone: Option<&str>) -> DeliveryRequest {
        let request = NotificationRequest::new("u1", "quota.exceeded", "Quota exceeded", "You are at 100%")
            .with_channels([NotificationChannel::Sms]);
        DeliveryRequest::from_request(
            &request,
            ContactInfo {
                phone: phone.map(str::to_string),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_e164_validation() {
        assert!(is_e164("+15551234567"));
        assert!(!is_e164("15551234567"));
        assert!(!is_e164("+1555abc4567"));
        assert!(!is_e164("+0123456789"));
    }

    #[tokio::test]
    async fn test_missing_credentials_disable_channel() {
        let mut config = create_test_config("http://localhost");
        config.auth_token.clear();
        let channel = SmsChannel::new(&config);

        assert!(!channel.is_enabled());
        let err = channel
            .send(&create_test_request(Some("+15551234567")))
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::ChannelDisabled { .. }));
    }

    #[tokio::test]
    async fn test_send_via_twilio() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
            .and(header_exists("authorization"))
            .and(body_string_contains("To=%2B15551234567"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"sid": "SM42"})))
            .expect(1)
            .mount(&server)
            .await;

        let channel = SmsChannel::new(&create_test_config(&server.uri()));
        let result = channel
            .send(&create_test_request(Some("+15551234567")))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.provider_message_id.as_deref(), Some("SM42"));
    }

    #[tokio::test]
    async fn test_twilio_rejection_is_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"code": 21211, "message": "Invalid 'To' Phone Number"})),
            )
            .mount(&server)
            .await;

        let channel = SmsChannel::new(&create_test_config(&server.uri()));
        let result = channel
            .send(&create_test_request(Some("+15551234567")))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(!result.retryable);
        assert!(result.error.unwrap().contains("21211"));
    }

    #[tokio::test]
    async fn test_twilio_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let channel = SmsChannel::new(&create_test_config(&server.uri()));
        let err = channel
            .send(&create_test_request(Some("+15551234567")))
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::Sms { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_validate_phone() {
        let channel = SmsChannel::new(&create_test_config("http://localhost"));
        assert!(channel.validate(&create_test_request(None)).is_err());
        assert!(channel.validate(&create_test_request(Some("555-1234"))).is_err());
        assert!(channel.validate(&create_test_request(Some("+15551234567"))).is_ok());
    }
}
