//! # Notification Service
//!
//! Notification delivery core for the file-sharing platform:
//! - Email notifications via SMTP
//! - SMS notifications via Twilio
//! - Push notifications via FCM
//! - In-app inbox and real-time WebSocket delivery
//! - Handlebars templates per event type and channel
//! - Batching of repeated events into one summary per window
//! - Notification-level retries with exponential backoff and a dead-letter queue
//! - Ingestion of file-service events
//!
//! ## Usage
//!
//! ```rust,no_run
//! use notification_service::{NotificationConfig, NotificationService};
//! use fileshare_shared::{event_types, NotificationChannel, NotificationRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = NotificationService::new(NotificationConfig::default())?;
//!     let shutdown = CancellationToken::new();
//!     service.start(shutdown.clone());
//!
//!     let request = NotificationRequest::new(
//!         "user123",
//!         event_types::FILE_SHARED,
//!         "New shared file",
//!         "report.pdf was shared with you",
//!     )
//!     .with_channels([NotificationChannel::Email, NotificationChannel::InApp])
//!     .bypass_batching();
//!
//!     let response = service.notify(request).await;
//!     println!("Notification {} is {:?}", response.id, response.status);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod batch;
pub mod channel_manager;
pub mod channels;
pub mod config;
pub mod dead_letter;
pub mod delivery;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod metrics;
pub mod orchestrator;
pub mod preferences;
pub mod realtime;
pub mod repository;
pub mod retry;
pub mod routes;
pub mod templates;
pub mod websocket;

pub use config::NotificationConfig;
pub use error::{NotificationError, Result};
pub use orchestrator::NotificationOrchestrator;

use batch::BatchEngine;
use channel_manager::ChannelManager;
use channels::{EmailChannel, InAppChannel, InMemoryInboxStore, InboxStore, PushChannel, SmsChannel, WebSocketChannel};
use dead_letter::DeadLetterManager;
use delivery::DeliveryPipeline;
use handlers::AppState;
use ingest::{EventIngestor, MemoryEventSource};
use metrics::NotificationMetrics;
use orchestrator::OrchestratorParts;
use preferences::{InMemoryPreferenceStore, PreferenceResolver};
use realtime::{ConnectionRegistry, RealtimeHub};
use repository::{
    InMemoryBatchRepository, InMemoryDeadLetterRepository, InMemoryNotificationRepository,
    NotificationRepository,
};
use retry::{RetryPolicy, RetryScheduler};
use templates::{InMemoryTemplateStore, TemplateResolver};

// Re-export shared types for convenience
pub use fileshare_shared::{
    event_types, DeliveryResult, DispatchStatus, FileEvent, Notification, NotificationChannel,
    NotificationPriority, NotificationRequest, NotificationResponse, NotificationStatus,
    UserNotificationPreferences,
};

/// Every component wired together over in-memory stores, plus the
/// background tasks that drive them
pub struct NotificationService {
    config: NotificationConfig,
    orchestrator: Arc<NotificationOrchestrator>,
    templates: Arc<TemplateResolver>,
    retry: Arc<RetryScheduler>,
    dead_letters: Arc<DeadLetterManager>,
    batches: Arc<BatchEngine>,
    ingestor: Arc<EventIngestor>,
    events: Arc<MemoryEventSource>,
    inbox: Arc<InMemoryInboxStore>,
    hub: Arc<RealtimeHub>,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

impl NotificationService {
    /// Create a new notification service with the given configuration
    pub fn new(config: NotificationConfig) -> Result<Self> {
        config.validate().map_err(NotificationError::config)?;

        let metrics = Arc::new(NotificationMetrics::new(&config.metrics)?);
        let hub = Arc::new(RealtimeHub::new(
            Arc::new(ConnectionRegistry::new()),
            config.websocket.message_buffer_size,
            metrics.clone(),
        ));
        let preferences = Arc::new(PreferenceResolver::new(Arc::new(InMemoryPreferenceStore::new())));
        let templates = Arc::new(TemplateResolver::new(Arc::new(InMemoryTemplateStore::with_defaults())));
        let inbox = Arc::new(InMemoryInboxStore::new());

        let channels = Arc::new(
            ChannelManager::new(config.channel_manager.clone(), metrics.clone())
                .with_channel(Arc::new(EmailChannel::new(&config.email)))
                .with_channel(Arc::new(SmsChannel::new(&config.sms)))
                .with_channel(Arc::new(PushChannel::new(&config.push)))
                .with_channel(Arc::new(InAppChannel::new(&config.inapp, inbox.clone())))
                .with_channel(Arc::new(WebSocketChannel::new(&config.websocket, hub.clone()))),
        );
        for info in channels.channel_info() {
            if !info.enabled {
                warn!(channel = %info.name, reason = ?info.disabled_reason, "Channel disabled");
            }
        }

        let notifications: Arc<dyn NotificationRepository> = Arc::new(InMemoryNotificationRepository::new());
        let dead_letters = Arc::new(DeadLetterManager::new(
            config.dead_letter.clone(),
            Arc::new(InMemoryDeadLetterRepository::new()),
            channels.clone(),
            preferences.clone(),
            metrics.clone(),
        ));
        let pipeline = Arc::new(DeliveryPipeline::new(
            channels.clone(),
            notifications.clone(),
            dead_letters.clone(),
            preferences.clone(),
            RetryPolicy::from_config(&config.retry),
        ));
        let batches = Arc::new(BatchEngine::new(
            config.batch.clone(),
            Arc::new(InMemoryBatchRepository::new()),
            templates.clone(),
            channels.clone(),
            pipeline.clone(),
            metrics.clone(),
        ));
        let retry = Arc::new(RetryScheduler::new(
            config.retry.clone(),
            notifications.clone(),
            pipeline.clone(),
            metrics.clone(),
        ));

        let cancel = CancellationToken::new();
        let orchestrator = Arc::new(NotificationOrchestrator::new(
            config.rate_limit.clone(),
            OrchestratorParts {
                preferences: preferences.clone(),
                channels,
                pipeline,
                batches: batches.clone(),
                notifications,
                dead_letters: dead_letters.clone(),
                hub: hub.clone(),
                metrics: metrics.clone(),
            },
            cancel.clone(),
        ));

        let events = Arc::new(MemoryEventSource::new());
        let ingestor = Arc::new(EventIngestor::new(
            config.ingest.clone(),
            events.clone(),
            orchestrator.clone(),
            preferences,
            templates.clone(),
            metrics,
        ));

        info!("Notification service initialized");
        Ok(Self {
            config,
            orchestrator,
            templates,
            retry,
            dead_letters,
            batches,
            ingestor,
            events,
            inbox,
            hub,
            cancel,
            started: AtomicBool::new(false),
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    /// Spawn the background loops. They stop when `shutdown` fires or
    /// [`shutdown`](Self::shutdown) is called. Starting twice is a no-op.
    pub fn start(&self, shutdown: CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Notification service already started");
            return;
        }

        let mut tasks = self.tasks.lock();

        let cancel = self.cancel.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => cancel.cancel(),
                _ = cancel.cancelled() => {}
            }
        });

        if self.config.retry.enabled {
            let retry = self.retry.clone();
            let cancel = self.cancel.clone();
            tasks.spawn(async move { retry.run(cancel).await });
        }
        if self.config.dead_letter.enabled {
            let dead_letters = self.dead_letters.clone();
            let cancel = self.cancel.clone();
            tasks.spawn(async move { dead_letters.run(cancel).await });
        }
        if self.config.batch.enabled {
            let batches = self.batches.clone();
            let cancel = self.cancel.clone();
            tasks.spawn(async move { batches.run(cancel).await });
        }
        if self.config.ingest.enabled {
            let ingestor = self.ingestor.clone();
            let cancel = self.cancel.clone();
            tasks.spawn(async move { ingestor.run(cancel).await });
        }
        if self.config.websocket.enabled {
            let interval = Duration::from_secs(self.config.websocket.ping_interval_seconds);
            tasks.spawn(websocket::run_heartbeat(self.hub.clone(), interval, self.cancel.clone()));
        }

        info!(tasks = tasks.len(), "Background tasks started");
    }

    /// Cancel the background loops and wait for them to finish. Open batch
    /// windows are flushed on the way out.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Background task failed during shutdown");
            }
        }
        info!("Notification service stopped");
    }

    pub async fn notify(&self, request: NotificationRequest) -> NotificationResponse {
        self.orchestrator.notify(request).await
    }

    /// Append an event to the built-in event stream
    pub fn publish_event(&self, event: &FileEvent) -> Result<u64> {
        self.events.publish(event)
    }

    /// Messages in a user's in-app inbox
    pub async fn inbox(&self, user_id: &str, limit: usize) -> Result<Vec<channels::InboxMessage>> {
        self.inbox.list(user_id, limit).await
    }

    pub fn orchestrator(&self) -> &Arc<NotificationOrchestrator> {
        &self.orchestrator
    }

    pub fn events(&self) -> &Arc<MemoryEventSource> {
        &self.events
    }

    pub fn ingestor(&self) -> &Arc<EventIngestor> {
        &self.ingestor
    }

    pub fn batches(&self) -> &Arc<BatchEngine> {
        &self.batches
    }

    pub fn retry_scheduler(&self) -> &Arc<RetryScheduler> {
        &self.retry
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterManager> {
        &self.dead_letters
    }

    pub fn config(&self) -> &NotificationConfig {
        &self.config
    }

    /// The HTTP and WebSocket surface
    pub fn router(&self) -> axum::Router {
        routes::create_router(
            AppState {
                orchestrator: self.orchestrator.clone(),
                templates: self.templates.clone(),
                metrics_enabled: self.config.metrics.enabled,
            },
            Duration::from_secs(self.config.server.timeout_seconds),
        )
    }
}
