//! End-to-end scenarios through the public service surface

use fileshare_shared::{event_types, MetadataValue};
use notification_service::{
    DispatchStatus, FileEvent, NotificationChannel, NotificationConfig, NotificationRequest,
    NotificationService, NotificationStatus, UserNotificationPreferences,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn service() -> NotificationService {
    NotificationService::new(NotificationConfig::default()).unwrap()
}

fn upload(user_id: &str, file_name: &str) -> NotificationRequest {
    NotificationRequest::new(user_id, event_types::FILE_UPLOADED, "Uploaded", file_name)
        .with_channels([NotificationChannel::InApp])
        .with_metadata("file_name", file_name)
        .with_metadata("file_size", 2048u64)
}

fn file_event(value: serde_json::Value) -> FileEvent {
    serde_json::from_value(value).unwrap()
}

#[tokio::test(start_paused = true)]
async fn uploads_within_one_window_become_one_notification() {
    let service = service();

    let first = service.notify(upload("alice", "a.txt")).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    let second = service.notify(upload("alice", "b.txt")).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    let third = service.notify(upload("alice", "c.txt")).await;

    for response in [&first, &second, &third] {
        assert_eq!(response.status, DispatchStatus::Queued);
        assert_eq!(response.id, first.id);
    }
    assert!(service.inbox("alice", 10).await.unwrap().is_empty());

    // t = 6s: the first window has closed, so this event opens a new one
    tokio::time::sleep(Duration::from_secs(2)).await;
    let late = service.notify(upload("alice", "d.txt")).await;
    assert_eq!(late.status, DispatchStatus::Queued);
    assert_ne!(late.id, first.id);

    let inbox = service.inbox("alice", 10).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].metadata.get("batch_count"), Some(&MetadataValue::Integer(3)));
    assert_eq!(
        inbox[0].metadata.get("batch_id"),
        Some(&MetadataValue::Text(first.id.to_string()))
    );

    assert_eq!(service.batches().flush_all().await, 1);
    let inbox = service.inbox("alice", 10).await.unwrap();
    assert_eq!(inbox.len(), 2);
    assert_eq!(inbox[0].metadata.get("batch_count"), Some(&MetadataValue::Integer(1)));
}

#[tokio::test]
async fn disabled_sms_does_not_fail_the_request() {
    let service = service();
    let mut preferences = UserNotificationPreferences::defaults_for("bob");
    preferences.sms_enabled = true;
    service.orchestrator().update_preferences(preferences).await.unwrap();

    let response = service
        .notify(
            NotificationRequest::new("bob", event_types::FILE_SHARED, "Shared", "a.txt was shared")
                .with_channels([NotificationChannel::Sms, NotificationChannel::InApp])
                .bypass_batching(),
        )
        .await;

    assert_eq!(response.status, DispatchStatus::Sent);
    assert_eq!(response.error, None);
    assert_eq!(response.channel, Some(NotificationChannel::InApp));

    let sms = response
        .deliveries
        .iter()
        .find(|result| result.channel == NotificationChannel::Sms)
        .unwrap();
    assert!(!sms.success);
    assert!(!sms.retryable);

    let stored = service.orchestrator().get_notification(response.id).await.unwrap();
    assert_eq!(stored.status, NotificationStatus::Sent);
    assert_eq!(service.inbox("bob", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn ingested_events_reach_the_inbox() {
    let service = service();

    for name in ["a.txt", "b.txt", "c.txt"] {
        service
            .publish_event(&file_event(json!({
                "type": "file.uploaded",
                "user_id": "carol",
                "file_name": name,
                "file_size": 1024
            })))
            .unwrap();
    }
    service.events().publish_raw("not json");
    service
        .publish_event(&file_event(json!({
            "type": "security.alert",
            "user_id": "carol",
            "ip_address": "203.0.113.7"
        })))
        .unwrap();

    let sweep = service.ingestor().process_once().await.unwrap();
    assert_eq!(sweep.accepted, 4);
    assert_eq!(sweep.malformed, 1);
    assert!(!sweep.rewound);
    assert_eq!(service.events().lag(), 0);

    // The alert skips batching
    let inbox = service.inbox("carol", 10).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].event_type, event_types::SECURITY_ALERT);

    service.batches().flush_all().await;
    let inbox = service.inbox("carol", 10).await.unwrap();
    assert_eq!(inbox.len(), 2);
    assert_eq!(inbox[0].event_type, event_types::FILE_UPLOADED);
    assert_eq!(inbox[0].metadata.get("batch_count"), Some(&MetadataValue::Integer(3)));

    let again = service.ingestor().process_once().await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn shutdown_flushes_open_windows() {
    let service = service();
    service.start(CancellationToken::new());

    let queued = service.notify(upload("dave", "a.txt")).await;
    assert_eq!(queued.status, DispatchStatus::Queued);

    tokio::time::timeout(Duration::from_secs(5), service.shutdown())
        .await
        .unwrap();
    assert_eq!(service.batches().open_windows(), 0);
    assert_eq!(service.inbox("dave", 10).await.unwrap().len(), 1);
}
