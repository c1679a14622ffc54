//! WebSocket sessions for real-time notification delivery
//!
//! Each upgraded socket registers with the [`RealtimeHub`] and is split into
//! a writer, which drains the hub's outbound frames, and a reader, which
//! handles client acknowledgements and pings. The session ends when either
//! side finishes, the client goes away or a newer connection for the same
//! user supersedes this one.

use crate::orchestrator::NotificationOrchestrator;
use crate::realtime::{OutboundFrame, RealtimeHub};
use axum::extract::ws::{Message, WebSocket};
use fileshare_shared::{ClientMessage, RealtimeMessage, RealtimeMessageType};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REPLY_BUFFER: usize = 16;

/// Run one session until it ends. Always unregisters the connection.
pub async fn serve_socket(socket: WebSocket, user_id: String, orchestrator: Arc<NotificationOrchestrator>) {
    let hub = orchestrator.hub().clone();
    let handle = hub.connect(&user_id);
    let connection_id = handle.connection_id;
    info!(%user_id, %connection_id, "Real-time session opened");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let welcome = RealtimeMessage::new(
        RealtimeMessageType::ConnectionStatus,
        json!({
            "status": "connected",
            "connection_id": connection_id,
            "user_id": user_id,
        }),
    );
    if send_message(&mut ws_sender, &welcome).await.is_err() {
        hub.disconnect(&user_id, connection_id);
        return;
    }

    let (reply_tx, mut reply_rx) = mpsc::channel::<RealtimeMessage>(REPLY_BUFFER);
    let mut outbound = handle.receiver;
    let closed = handle.closed;

    let mut writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                _ = closed.cancelled() => None,
                frame = outbound.recv() => match frame {
                    Some(OutboundFrame::Text(text)) => Some(Message::Text(text)),
                    Some(OutboundFrame::Ping) => Some(Message::Ping(Vec::new())),
                    Some(OutboundFrame::Close) | None => None,
                },
                Some(reply) = reply_rx.recv() => match serde_json::to_string(&reply) {
                    Ok(text) => Some(Message::Text(text)),
                    Err(e) => {
                        warn!(error = %e, "Failed to encode reply");
                        continue;
                    }
                },
            };

            let Some(message) = message else {
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            };
            if let Err(e) = ws_sender.send(message).await {
                debug!(error = %e, "Real-time write failed");
                break;
            }
        }
    });

    let mut reader = {
        let orchestrator = orchestrator.clone();
        let user_id = user_id.clone();
        tokio::spawn(async move {
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(reply) = handle_client_text(&orchestrator, &user_id, &text).await {
                            if reply_tx.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    // Pongs are answered by the protocol layer
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                    Ok(Message::Binary(_)) => {
                        debug!(%user_id, "Ignoring binary frame");
                    }
                    Err(e) => {
                        debug!(%user_id, error = %e, "Real-time read failed");
                        break;
                    }
                }
            }
        })
    };

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    hub.disconnect(&user_id, connection_id);
    info!(%user_id, %connection_id, "Real-time session closed");
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &RealtimeMessage,
) -> Result<(), ()> {
    let text = serde_json::to_string(message).map_err(|e| warn!(error = %e, "Failed to encode message"))?;
    sender
        .send(Message::Text(text))
        .await
        .map_err(|e| debug!(error = %e, "Real-time write failed"))
}

/// Handle one text frame from a client. Returns the reply to send back, if
/// any.
pub async fn handle_client_text(
    orchestrator: &NotificationOrchestrator,
    user_id: &str,
    text: &str,
) -> Option<RealtimeMessage> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(user_id, error = %e, "Unrecognised client message");
            return None;
        }
    };

    match message {
        ClientMessage::Ack { notification_id } => {
            match orchestrator.mark_read_for_user(user_id, notification_id).await {
                Ok(_) => debug!(user_id, %notification_id, "Notification acknowledged"),
                Err(e) => warn!(user_id, %notification_id, error = %e, "Acknowledgement rejected"),
            }
            None
        }
        ClientMessage::Ping => Some(RealtimeMessage::new(
            RealtimeMessageType::Heartbeat,
            json!({ "status": "pong" }),
        )),
    }
}

/// Ping every connection on `interval`, evicting the dead ones
pub async fn run_heartbeat(hub: Arc<RealtimeHub>, interval: Duration, cancel: CancellationToken) {
    if interval.is_zero() {
        error!("Heartbeat interval must be positive, heartbeat disabled");
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = hub.ping_all();
                if report.evicted > 0 {
                    info!(alive = report.delivered, evicted = report.evicted, "Heartbeat evicted dead connections");
                }
            }
        }
    }

    debug!("Heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationConfig;
    use crate::NotificationService;
    use fileshare_shared::{event_types, NotificationChannel, NotificationRequest, NotificationStatus};
    use uuid::Uuid;

    fn service() -> NotificationService {
        NotificationService::new(NotificationConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_ping_gets_heartbeat() {
        let service = service();
        let reply = handle_client_text(service.orchestrator(), "u1", r#"{"type":"ping"}"#)
            .await
            .unwrap();
        assert_eq!(reply.message_type, RealtimeMessageType::Heartbeat);
    }

    #[tokio::test]
    async fn test_ack_marks_notification_read() {
        let service = service();
        let response = service
            .orchestrator()
            .notify(
                NotificationRequest::new("u1", event_types::FILE_SHARED, "Shared", "a.txt")
                    .with_channels([NotificationChannel::InApp])
                    .bypass_batching(),
            )
            .await;

        let ack = format!(r#"{{"type":"ack","notification_id":"{}"}}"#, response.id);
        // Another user's ack is ignored
        assert!(handle_client_text(service.orchestrator(), "u2", &ack).await.is_none());
        assert_eq!(
            service.orchestrator().get_notification(response.id).await.unwrap().status,
            NotificationStatus::Sent
        );

        assert!(handle_client_text(service.orchestrator(), "u1", &ack).await.is_none());
        assert_eq!(
            service.orchestrator().get_notification(response.id).await.unwrap().status,
            NotificationStatus::Read
        );
    }

    #[tokio::test]
    async fn test_garbage_is_ignored() {
        let service = service();
        assert!(handle_client_text(service.orchestrator(), "u1", "hello").await.is_none());
        let unknown = format!(r#"{{"type":"ack","notification_id":"{}"}}"#, Uuid::new_v4());
        assert!(handle_client_text(service.orchestrator(), "u1", &unknown).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_and_evicts() {
        let service = service();
        let hub = service.orchestrator().hub().clone();
        let mut alive = hub.connect("alive");
        let dead = hub.connect("dead");
        drop(dead);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_heartbeat(hub.clone(), Duration::from_secs(30), cancel.clone()));
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(alive.receiver.recv().await, Some(OutboundFrame::Ping));
        assert!(!hub.is_connected("dead"));
        assert!(hub.is_connected("alive"));

        cancel.cancel();
        task.await.unwrap();
    }
}
