//! Push notification channel implementation using the FCM HTTP API

use crate::channels::{Channel, ChannelInfo, DeliveryRequest};
use crate::config::PushConfig;
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use fileshare_shared::{metadata_to_json, DeliveryResult, NotificationChannel, NotificationPriority};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};

/// Push notification channel for device tokens registered with FCM
#[derive(Clone)]
pub struct PushChannel {
    config: PushConfig,
    client: reqwest::Client,
    disabled_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FcmResponse {
    #[serde(default)]
    multicast_id: Option<i64>,
    success: u32,
    failure: u32,
    #[serde(default)]
    results: Vec<FcmResult>,
}

#[derive(Debug, Deserialize)]
struct FcmResult {
    #[serde(default)]
    error: Option<String>,
}

impl PushChannel {
    /// Create a new push channel with the given configuration
    pub fn new(config: &PushConfig) -> Self {
        info!("Initializing push channel");

        let disabled_reason = if !config.enabled {
            Some("disabled by configuration".to_string())
        } else if config.fcm_server_key.is_empty() {
            Some("FCM server key is not configured".to_string())
        } else {
            None
        };

        match &disabled_reason {
            Some(reason) => warn!(%reason, "Push channel disabled"),
            None => info!("Push channel initialized successfully"),
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

    fn payload(request: &DeliveryRequest) -> serde_json::Value {
        let priority = match request.priority {
            NotificationPriority::High | NotificationPriority::Critical => "high",
            _ => "normal",
        };
        json!({
            "registration_ids": request.contact.push_tokens,
            "priority": priority,
            "notification": {
                "title": request.title,
                "body": request.body,
            },
            "data": {
                "event_type": request.event_type,
                "notification_id": request.notification_id_for(NotificationChannel::Push),
                "metadata": metadata_to_json(&request.metadata),
            },
        })
    }
}

#[async_trait]
impl Channel for PushChannel {
    fn kind(&self) -> NotificationChannel {
        NotificationChannel::Push
    }

    fn is_enabled(&self) -> bool {
        self.disabled_reason.is_none()
    }

    fn validate(&self, request: &DeliveryRequest) -> Result<()> {
        if request.contact.push_tokens.iter().all(|token| token.is_empty()) {
            return Err(NotificationError::validation(
                "push_tokens",
                "recipient has no registered device",
            ));
        }
        Ok(())
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryResult> {
        if let Some(reason) = &self.disabled_reason {
            return Err(NotificationError::channel_disabled(self.name(), reason.clone()));
        }

        let response = self
            .client
            .post(&self.config.fcm_endpoint)
            .header("Authorization", format!("key={}", self.config.fcm_server_key))
            .json(&Self::payload(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            error!(user_id = %request.user_id, %status, "FCM request failed");
            return Err(NotificationError::push(format!("FCM returned {}", status)));
        }

        let body: FcmResponse = response.json().await?;
        if body.success == 0 {
            let reasons: Vec<String> = body.results.into_iter().filter_map(|r| r.error).collect();
            warn!(user_id = %request.user_id, failure = body.failure, ?reasons, "No device accepted push notification");
            return Ok(DeliveryResult::failure(
                self.kind(),
                format!("no device accepted the notification: {}", reasons.join(", ")),
            ));
        }

        info!(
            user_id = %request.user_id,
            success = body.success,
            failure = body.failure,
            "Push notification sent"
        );
        let mut result = DeliveryResult::success(self.kind());
        if let Some(id) = body.multicast_id {
            result = result.with_provider_message_id(id.to_string());
        }
        Ok(result)
    }

    fn info(&self) -> ChannelInfo {
        ChannelInfo {
            name: self.name().to_string(),
            description: "FCM push notifications".to_string(),
            enabled: self.is_enabled(),
            disabled_reason: self.disabled_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileshare_shared::{ContactInfo, NotificationRequest};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_config(endpoint: String) -> PushConfig {
        PushConfig {
            enabled: true,
            fcm_server_key: "server-key".to_string(),
            fcm_endpoint: endpoint,
            timeout_seconds: 5,
        }
    }

    fn create_test_request(tokens: &[&str]) -> DeliveryRequest {
        let request = NotificationRequest::new("u1", "file.shared", "New share", "Alice shared a folder")
            .with_channels([NotificationChannel::Push]);
        DeliveryRequest::from_request(
            &request,
            ContactInfo {
                push_tokens: tokens.iter().map(|t| t.to_string()).collect(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_send_accepted_by_one_device() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fcm/send"))
            .and(header("authorization", "key=server-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "multicast_id": 77,
                "success": 1,
                "failure": 1,
                "results": [{"message_id": "m1"}, {"error": "NotRegistered"}]
            })))
            .mount(&server)
            .await;

        let channel = PushChannel::new(&create_test_config(format!("{}/fcm/send", server.uri())));
        let result = channel.send(&create_test_request(&["t1", "t2"])).await.unwrap();

        assert!(result.success);
        assert_eq!(result.provider_message_id.as_deref(), Some("77"));
    }

    #[tokio::test]
    async fn test_send_rejected_by_every_device() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": 0,
                "failure": 1,
                "results": [{"error": "InvalidRegistration"}]
            })))
            .mount(&server)
            .await;

        let channel = PushChannel::new(&create_test_config(server.uri()));
        let result = channel.send(&create_test_request(&["bad"])).await.unwrap();

        assert!(!result.success);
        assert!(result.error.unwrap().contains("InvalidRegistration"));
    }

    #[tokio::test]
    async fn test_validate_requires_tokens() {
        let channel = PushChannel::new(&create_test_config("http://localhost".to_string()));
        assert!(channel.validate(&create_test_request(&[])).is_err());
        assert!(channel.validate(&create_test_request(&["t1"])).is_ok());
    }

    #[tokio::test]
    async fn test_missing_server_key_disables_channel() {
        let mut config = create_test_config("http://localhost".to_string());
        config.fcm_server_key.clear();
        let channel = PushChannel::new(&config);

        assert!(!channel.is_enabled());
        assert_eq!(
            channel.info().disabled_reason.as_deref(),
            Some("FCM server key is not configured")
        );
    }
}
