//! Inbound events published by the file/storage service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::notification::{Metadata, MetadataValue};

pub mod event_types {
    pub const FILE_UPLOADED: &str = "file.uploaded";
    pub const FILE_UPLOAD_FAILED: &str = "file.upload_failed";
    pub const FILE_DOWNLOADED: &str = "file.downloaded";
    pub const FILE_DELETED: &str = "file.deleted";
    pub const FILE_SHARED: &str = "file.shared";
    pub const SHARE_GRANTED: &str = "share.granted";
    pub const QUOTA_WARNING: &str = "quota.warning";
    pub const QUOTA_EXCEEDED: &str = "quota.exceeded";
    pub const SECURITY_ALERT: &str = "security.alert";
    pub const SYSTEM_ANNOUNCEMENT: &str = "system.announcement";

    pub const DEFAULT_SUBSCRIPTIONS: &[&str] = &[
        FILE_UPLOADED,
        FILE_UPLOAD_FAILED,
        FILE_DELETED,
        FILE_SHARED,
        SHARE_GRANTED,
        QUOTA_WARNING,
        QUOTA_EXCEEDED,
        SECURITY_ALERT,
        SYSTEM_ANNOUNCEMENT,
    ];

    /// Event types that must reach the user immediately
    pub const URGENT: &[&str] = &[SECURITY_ALERT, QUOTA_EXCEEDED];

    pub fn is_batchable(event_type: &str) -> bool {
        !URGENT.contains(&event_type)
    }
}

/// Event as consumed from the file service stream. Fields this struct does
/// not know about are collected in `extra` and end up in the metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub user_id: String,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub error_reason: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_success() -> bool {
    true
}

impl FileEvent {
    /// Event type used for routing. Failed uploads are reported separately so
    /// users can subscribe to them on their own.
    pub fn effective_event_type(&self) -> &str {
        if !self.success && self.event_type == event_types::FILE_UPLOADED {
            event_types::FILE_UPLOAD_FAILED
        } else {
            &self.event_type
        }
    }

    /// Metadata merged from the event's known fields, its own metadata and
    /// any unknown fields. Known fields win over unknown ones.
    pub fn flattened_metadata(&self) -> Metadata {
        let mut metadata: Metadata = self
            .extra
            .iter()
            .filter_map(|(key, value)| MetadataValue::from_json(value).map(|v| (key.clone(), v)))
            .collect();
        metadata.extend(self.metadata.clone());

        if let Some(file_id) = &self.file_id {
            metadata.insert("file_id".into(), file_id.clone().into());
        }
        if let Some(file_name) = &self.file_name {
            metadata.insert("file_name".into(), file_name.clone().into());
        }
        if let Some(file_size) = self.file_size {
            metadata.insert("file_size".into(), file_size.into());
        }
        if let Some(reason) = &self.error_reason {
            metadata.insert("error_reason".into(), reason.clone().into());
        }
        metadata.insert("success".into(), self.success.into());
        metadata.insert("event_timestamp".into(), self.timestamp.to_rfc3339().into());
        metadata
    }
}
