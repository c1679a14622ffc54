//! Batching of rapid repeated events
//!
//! One window is open per (user, event type, channel). The first event starts
//! the window's clock; later events are appended without extending it. A
//! window closes when its deadline passes or it reaches `max_size` items,
//! whichever comes first, and produces exactly one summary notification.
//! Open windows live in memory; the batch record is persisted when it closes,
//! before its summary is sent, and linked to the summary afterwards.

use crate::channel_manager::ChannelManager;
use crate::config::BatchConfig;
use crate::delivery::DeliveryPipeline;
use crate::error::Result;
use crate::metrics::NotificationMetrics;
use crate::repository::BatchRepository;
use crate::templates::{RenderedContent, TemplateResolver};
use chrono::Utc;
use fileshare_shared::{
    BatchItem, BatchNotification, ContactInfo, Notification, NotificationChannel,
    NotificationPriority, NotificationRequest,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BatchKey {
    user_id: String,
    event_type: String,
    channel: NotificationChannel,
}

struct OpenWindow {
    batch: BatchNotification,
    deadline: Instant,
    priority: NotificationPriority,
    contact: ContactInfo,
}

/// What happened to an event handed to the engine
#[derive(Debug, Clone)]
pub enum Admission {
    /// Added to an open window
    Queued { batch_id: Uuid, count: usize },
    /// The event filled its window, which was delivered right away
    Flushed(FlushedBatch),
}

impl Admission {
    pub fn batch_id(&self) -> Uuid {
        match self {
            Self::Queued { batch_id, .. } => *batch_id,
            Self::Flushed(flushed) => flushed.batch.id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlushedBatch {
    pub batch: BatchNotification,
    pub notification: Notification,
}

pub struct BatchEngine {
    config: BatchConfig,
    windows: Mutex<HashMap<BatchKey, OpenWindow>>,
    repository: Arc<dyn BatchRepository>,
    templates: Arc<TemplateResolver>,
    channels: Arc<ChannelManager>,
    pipeline: Arc<DeliveryPipeline>,
    metrics: Arc<NotificationMetrics>,
}

impl BatchEngine {
    pub fn new(
        config: BatchConfig,
        repository: Arc<dyn BatchRepository>,
        templates: Arc<TemplateResolver>,
        channels: Arc<ChannelManager>,
        pipeline: Arc<DeliveryPipeline>,
        metrics: Arc<NotificationMetrics>,
    ) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            repository,
            templates,
            channels,
            pipeline,
            metrics,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn open_windows(&self) -> usize {
        self.windows.lock().len()
    }

    /// Add one event for `channel` to its window
    pub async fn add(
        &self,
        request: &NotificationRequest,
        channel: NotificationChannel,
        contact: ContactInfo,
    ) -> Result<Admission> {
        self.channels.validate_channels(&[channel])?;

        let key = BatchKey {
            user_id: request.user_id.clone(),
            event_type: request.event_type.clone(),
            channel,
        };
        let item = BatchItem {
            title: request.title.clone(),
            body: request.body.clone(),
            metadata: request.metadata.clone(),
            received_at: Utc::now(),
        };
        let now = Instant::now();

        let (expired, full, batch_id, count) = {
            let mut windows = self.windows.lock();

            // Closed by time but not swept yet: the event starts a new window
            let expired = match windows.get(&key) {
                Some(window) if window.deadline <= now => windows.remove(&key),
                _ => None,
            };

            let window = windows.entry(key.clone()).or_insert_with(|| OpenWindow {
                batch: BatchNotification::open(&request.user_id, &request.event_type, channel),
                deadline: now + self.config.window(),
                priority: request.priority,
                contact: contact.clone(),
            });
            window.batch.push(item);
            window.priority = window.priority.max(request.priority);
            window.contact = contact;

            let batch_id = window.batch.id;
            let count = window.batch.count;
            let full = if count >= self.config.max_size {
                windows.remove(&key)
            } else {
                None
            };
            (expired, full, batch_id, count)
        };
        self.metrics.record_batch_item();

        if let Some(expired) = expired {
            if let Err(e) = self.flush(expired).await {
                error!(user_id = %request.user_id, error = %e, "Failed to flush expired batch");
            }
        }

        if let Some(full) = full {
            debug!(%batch_id, count, "Batch reached max size");
            return Ok(Admission::Flushed(self.flush(full).await?));
        }

        debug!(%batch_id, count, user_id = %request.user_id, channel = %channel, "Event batched");
        Ok(Admission::Queued { batch_id, count })
    }

    /// Close and deliver every window whose deadline has passed
    pub async fn flush_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<OpenWindow> = {
            let mut windows = self.windows.lock();
            let keys: Vec<BatchKey> = windows
                .iter()
                .filter(|(_, window)| window.deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| windows.remove(key)).collect()
        };
        self.flush_windows(expired).await
    }

    /// Close and deliver every open window regardless of its deadline
    pub async fn flush_all(&self) -> usize {
        let open: Vec<OpenWindow> = self.windows.lock().drain().map(|(_, window)| window).collect();
        self.flush_windows(open).await
    }

    async fn flush_windows(&self, windows: Vec<OpenWindow>) -> usize {
        let mut flushed = 0;
        for window in windows {
            let batch_id = window.batch.id;
            match self.flush(window).await {
                Ok(_) => flushed += 1,
                Err(e) => error!(%batch_id, error = %e, "Failed to flush batch"),
            }
        }
        flushed
    }

    async fn flush(&self, window: OpenWindow) -> Result<FlushedBatch> {
        let OpenWindow {
            mut batch,
            priority,
            contact,
            ..
        } = window;
        batch.close(Utc::now());

        let content = match self.templates.render_batch(&batch).await {
            Ok(content) => content,
            Err(e) => {
                warn!(batch_id = %batch.id, error = %e, "Batch template failed, using plain summary");
                plain_summary(&batch)
            }
        };

        let request = NotificationRequest::new(&batch.user_id, &batch.event_type, content.title, content.body)
            .with_channels([batch.channel])
            .with_priority(priority)
            .with_metadata("batch_id", batch.id.to_string())
            .with_metadata("batch_count", batch.count as u64)
            .bypass_batching();

        let persisted = match self.repository.create(batch.clone()).await {
            Ok(_) => true,
            Err(e) => {
                warn!(batch_id = %batch.id, error = %e, "Failed to store closed batch, delivering anyway");
                false
            }
        };

        let notification = self
            .pipeline
            .dispatch_batch(&request, batch.channel, contact, batch.id, &CancellationToken::new())
            .await?;
        batch.notification_id = Some(notification.id);

        let recorded = if persisted {
            self.repository.attach_notification(batch.id, notification.id).await
        } else {
            self.repository.create(batch.clone()).await.map(|_| ())
        };
        if let Err(e) = recorded {
            // the summary is already out; the record only lacks its link
            error!(batch_id = %batch.id, notification_id = %notification.id, error = %e, "Failed to record batch delivery");
        }
        self.metrics.record_batch_flushed();

        info!(
            batch_id = %batch.id,
            user_id = %batch.user_id,
            event_type = %batch.event_type,
            channel = %batch.channel,
            count = batch.count,
            status = %notification.status,
            "Batch window closed"
        );
        Ok(FlushedBatch {
            batch,
            notification,
        })
    }

    /// Sweep expired windows until `cancel` fires, then flush what is left
    pub async fn run(&self, cancel: CancellationToken) {
        info!(window_ms = self.config.window_ms, max_size = self.config.max_size, "Batch window closer started");
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.flush_expired().await;
                }
            }
        }

        let flushed = self.flush_all().await;
        info!(flushed, "Batch window closer stopped");
    }
}

fn plain_summary(batch: &BatchNotification) -> RenderedContent {
    RenderedContent {
        title: format!("{} new notifications", batch.count),
        body: batch
            .items
            .iter()
            .map(|item| format!("- {}", item.title))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}
