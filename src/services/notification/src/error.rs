//! Error handling for the notification service
//!
//! This module defines all error types that can occur in the notification service
//! and provides utilities for error handling and conversion.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fileshare_shared::{DeliveryResult, TransitionError};
use serde_json::json;
use thiserror::Error;

/// Result type alias for notification service operations
pub type Result<T> = std::result::Result<T, NotificationError>;

/// Main error type for the notification service
#[derive(Error, Debug)]
pub enum NotificationError {
    /// Persistence errors raised by a repository or store
    #[error("Repository error: {message}")]
    Repository { message: String },

    /// Email delivery errors
    #[error("Email error: {message}")]
    Email { message: String },

    /// SMS delivery errors
    #[error("SMS error: {message}")]
    Sms { message: String },

    /// Push notification errors
    #[error("Push notification error: {message}")]
    Push { message: String },

    /// WebSocket connection errors
    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    /// The user has no live real-time connection
    #[error("User {user_id} is not connected")]
    NotConnected { user_id: String },

    /// The channel is registered but lacks credentials or configuration
    #[error("Channel {channel} is disabled: {reason}")]
    ChannelDisabled { channel: String, reason: String },

    /// The channel is not registered with the manager
    #[error("Channel {channel} is not registered")]
    ChannelNotFound { channel: String },

    /// Every requested channel failed; carries the per-channel outcomes
    #[error("All channels failed: {message}")]
    AllChannelsFailed {
        message: String,
        results: Vec<DeliveryResult>,
    },

    /// Template processing errors
    #[error("Template error: {message}")]
    Template { message: String },

    /// Rate limiting errors
    #[error("Rate limit exceeded: {message}")]
    RateLimit { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    /// Not found errors
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    /// Conflicting state, e.g. a forbidden status transition
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// The caller cancelled the operation
    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    /// Network/connection errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// External service errors
    #[error("External service error: {service}: {message}")]
    ExternalService { service: String, message: String },

    /// Internal service errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl NotificationError {
    /// Get the HTTP status code that should be returned for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            NotificationError::Repository { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            NotificationError::Email { .. } => StatusCode::BAD_GATEWAY,
            NotificationError::Sms { .. } => StatusCode::BAD_GATEWAY,
            NotificationError::Push { .. } => StatusCode::BAD_GATEWAY,
            NotificationError::WebSocket { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            NotificationError::NotConnected { .. } => StatusCode::NOT_FOUND,
            NotificationError::ChannelDisabled { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            NotificationError::ChannelNotFound { .. } => StatusCode::BAD_REQUEST,
            NotificationError::AllChannelsFailed { .. } => StatusCode::BAD_GATEWAY,
            NotificationError::Template { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            NotificationError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            NotificationError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            NotificationError::Validation { .. } => StatusCode::BAD_REQUEST,
            NotificationError::NotFound { .. } => StatusCode::NOT_FOUND,
            NotificationError::Conflict { .. } => StatusCode::CONFLICT,
            NotificationError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            NotificationError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            NotificationError::Network { .. } => StatusCode::BAD_GATEWAY,
            NotificationError::Serialization { .. } => StatusCode::BAD_REQUEST,
            NotificationError::ExternalService { .. } => StatusCode::BAD_GATEWAY,
            NotificationError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            NotificationError::Repository { .. } => "REPOSITORY_ERROR",
            NotificationError::Email { .. } => "EMAIL_ERROR",
            NotificationError::Sms { .. } => "SMS_ERROR",
            NotificationError::Push { .. } => "PUSH_ERROR",
            NotificationError::WebSocket { .. } => "WEBSOCKET_ERROR",
            NotificationError::NotConnected { .. } => "NOT_CONNECTED",
            NotificationError::ChannelDisabled { .. } => "CHANNEL_DISABLED",
            NotificationError::ChannelNotFound { .. } => "CHANNEL_NOT_FOUND",
            NotificationError::AllChannelsFailed { .. } => "ALL_CHANNELS_FAILED",
            NotificationError::Template { .. } => "TEMPLATE_ERROR",
            NotificationError::RateLimit { .. } => "RATE_LIMIT_EXCEEDED",
            NotificationError::Config { .. } => "CONFIG_ERROR",
            NotificationError::Validation { .. } => "VALIDATION_ERROR",
            NotificationError::NotFound { .. } => "NOT_FOUND",
            NotificationError::Conflict { .. } => "CONFLICT",
            NotificationError::Timeout { .. } => "TIMEOUT",
            NotificationError::Cancelled { .. } => "CANCELLED",
            NotificationError::Network { .. } => "NETWORK_ERROR",
            NotificationError::Serialization { .. } => "SERIALIZATION_ERROR",
            NotificationError::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            NotificationError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            NotificationError::Repository { .. } => true,
            NotificationError::Email { .. } => true,
            NotificationError::Sms { .. } => true,
            NotificationError::Push { .. } => true,
            NotificationError::WebSocket { .. } => false,
            NotificationError::NotConnected { .. } => false,
            NotificationError::ChannelDisabled { .. } => false,
            NotificationError::ChannelNotFound { .. } => false,
            NotificationError::AllChannelsFailed { results, .. } => {
                results.iter().any(|result| result.retryable)
            }
            NotificationError::Template { .. } => false,
            NotificationError::RateLimit { .. } => true,
            NotificationError::Config { .. } => false,
            NotificationError::Validation { .. } => false,
            NotificationError::NotFound { .. } => false,
            NotificationError::Conflict { .. } => false,
            NotificationError::Timeout { .. } => true,
            NotificationError::Cancelled { .. } => false,
            NotificationError::Network { .. } => true,
            NotificationError::Serialization { .. } => false,
            NotificationError::ExternalService { .. } => true,
            NotificationError::Internal { .. } => true,
        }
    }
}

impl IntoResponse for NotificationError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

// Conversion implementations for external error types

impl From<lettre::error::Error> for NotificationError {
    fn from(err: lettre::error::Error) -> Self {
        NotificationError::Email {
            message: err.to_string(),
        }
    }
}

impl From<lettre::transport::smtp::Error> for NotificationError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        NotificationError::Email {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for NotificationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NotificationError::Timeout {
                operation: "HTTP request".to_string(),
            }
        } else if err.is_connect() {
            NotificationError::Network {
                message: err.to_string(),
            }
        } else {
            NotificationError::ExternalService {
                service: "HTTP".to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<handlebars::RenderError> for NotificationError {
    fn from(err: handlebars::RenderError) -> Self {
        NotificationError::Template {
            message: err.to_string(),
        }
    }
}

impl From<handlebars::TemplateError> for NotificationError {
    fn from(err: handlebars::TemplateError) -> Self {
        NotificationError::Template {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for NotificationError {
    fn from(err: config::ConfigError) -> Self {
        NotificationError::Config {
            message: err.to_string(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for NotificationError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        NotificationError::Timeout {
            operation: err.to_string(),
        }
    }
}

impl From<TransitionError> for NotificationError {
    fn from(err: TransitionError) -> Self {
        NotificationError::Conflict {
            message: err.to_string(),
        }
    }
}

impl From<validator::ValidationErrors> for NotificationError {
    fn from(err: validator::ValidationErrors) -> Self {
        let mut fields: Vec<_> = err.field_errors().into_iter().collect();
        fields.sort_by_key(|(field, _)| *field);

        let field = match fields.as_slice() {
            [(field, _)] => field.to_string(),
            _ => "multiple".to_string(),
        };

        let message = fields
            .iter()
            .map(|(field, errors)| {
                let field_errors: Vec<String> = errors
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| "Invalid value".to_string())
                    })
                    .collect();
                format!("{}: {}", field, field_errors.join(", "))
            })
            .collect::<Vec<String>>()
            .join("; ");

        NotificationError::Validation { field, message }
    }
}

// Utility functions for creating specific error types

impl NotificationError {
    /// Create a repository error
    pub fn repository<S: Into<String>>(message: S) -> Self {
        Self::Repository {
            message: message.into(),
        }
    }

    /// Create an email error
    pub fn email<S: Into<String>>(message: S) -> Self {
        Self::Email {
            message: message.into(),
        }
    }

    /// Create an SMS error
    pub fn sms<S: Into<String>>(message: S) -> Self {
        Self::Sms {
            message: message.into(),
        }
    }

    /// Create a push notification error
    pub fn push<S: Into<String>>(message: S) -> Self {
        Self::Push {
            message: message.into(),
        }
    }

    /// Create a WebSocket error
    pub fn websocket<S: Into<String>>(message: S) -> Self {
        Self::WebSocket {
            message: message.into(),
        }
    }

    pub fn not_connected<S: Into<String>>(user_id: S) -> Self {
        Self::NotConnected {
            user_id: user_id.into(),
        }
    }

    pub fn channel_disabled<S1: Into<String>, S2: Into<String>>(channel: S1, reason: S2) -> Self {
        Self::ChannelDisabled {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    pub fn channel_not_found<S: Into<String>>(channel: S) -> Self {
        Self::ChannelNotFound {
            channel: channel.into(),
        }
    }

    /// Aggregate error carrying every per-channel result
    pub fn all_channels_failed(results: Vec<DeliveryResult>) -> Self {
        let message = results
            .iter()
            .map(|result| {
                format!(
                    "{}: {}",
                    result.channel,
                    result.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        Self::AllChannelsFailed { message, results }
    }

    /// Create a template error
    pub fn template<S: Into<String>>(message: S) -> Self {
        Self::Template {
            message: message.into(),
        }
    }

    /// Create a rate limit error
    pub fn rate_limit<S: Into<String>>(message: S) -> Self {
        Self::RateLimit {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S1: Into<String>, S2: Into<String>>(field: S1, message: S2) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an external service error
    pub fn external_service<S1: Into<String>, S2: Into<String>>(service: S1, message: S2) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

}
