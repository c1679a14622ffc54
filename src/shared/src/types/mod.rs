//! Shared type definitions for the notification core
//!
//! Everything here is plain serde data plus the notification status state
//! machine, so that producers of events and the notification service agree on
//! one schema.

pub mod batch;
pub mod dead_letter;
pub mod events;
pub mod notification;
pub mod preferences;
pub mod realtime;

pub use batch::{BatchItem, BatchNotification, BatchStatus};
pub use dead_letter::{DeadLetterEntry, DeadLetterPayload, DeadLetterStats, RetryAttempt};
pub use events::{event_types, FileEvent};
pub use notification::{
    metadata_to_json, DeliveryAttempt, DeliveryResult, DispatchStatus, Metadata, MetadataValue,
    Notification, NotificationChannel, NotificationPriority, NotificationRequest,
    NotificationResponse, NotificationStatus, TransitionError, UnknownChannel,
};
pub use preferences::{ContactInfo, QuietHours, UserNotificationPreferences};
pub use realtime::{ClientMessage, RealtimeMessage, RealtimeMessageType};
