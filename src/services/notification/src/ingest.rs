//! File-service event ingestion
//!
//! Events arrive on an offset-based stream. Each record is decoded into a
//! [`FileEvent`], turned into a [`NotificationRequest`] using the user's
//! channel preferences and the event's template, and handed to a
//! [`NotificationSink`]. Offsets are committed only after the sink accepted
//! the request, so a crash redelivers rather than drops.

use crate::config::IngestConfig;
use crate::error::{NotificationError, Result};
use crate::metrics::NotificationMetrics;
use crate::preferences::PreferenceResolver;
use crate::templates::TemplateResolver;
use async_trait::async_trait;
use fileshare_shared::{
    event_types, FileEvent, NotificationPriority, NotificationRequest, NotificationResponse,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One raw record of the event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub offset: u64,
    pub payload: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Up to `max` records following the current read position
    async fn poll(&self, max: usize) -> Result<Vec<SourceRecord>>;

    /// Everything before `offset` has been handled
    async fn commit(&self, offset: u64) -> Result<()>;

    /// Read again from `offset` on the next poll
    async fn rewind(&self, offset: u64) -> Result<()>;
}

/// Receives the requests produced from events
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn submit(&self, request: NotificationRequest) -> Result<NotificationResponse>;
}

#[derive(Default)]
struct MemoryLog {
    records: Vec<String>,
    position: u64,
    committed: u64,
}

/// Append-only in-process stream, used for local runs and tests
#[derive(Default)]
pub struct MemoryEventSource {
    log: Mutex<MemoryLog>,
}

impl MemoryEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw payload and return its offset
    pub fn publish_raw(&self, payload: impl Into<String>) -> u64 {
        let mut log = self.log.lock();
        log.records.push(payload.into());
        (log.records.len() - 1) as u64
    }

    pub fn publish(&self, event: &FileEvent) -> Result<u64> {
        Ok(self.publish_raw(serde_json::to_string(event)?))
    }

    pub fn committed(&self) -> u64 {
        self.log.lock().committed
    }

    /// Records not yet committed
    pub fn lag(&self) -> u64 {
        let log = self.log.lock();
        log.records.len() as u64 - log.committed
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn poll(&self, max: usize) -> Result<Vec<SourceRecord>> {
        let mut log = self.log.lock();
        let start = log.position as usize;
        let records: Vec<SourceRecord> = log
            .records
            .iter()
            .enumerate()
            .skip(start)
            .take(max)
            .map(|(offset, payload)| SourceRecord {
                offset: offset as u64,
                payload: payload.clone(),
            })
            .collect();
        log.position += records.len() as u64;
        Ok(records)
    }

    async fn commit(&self, offset: u64) -> Result<()> {
        let mut log = self.log.lock();
        if offset > log.records.len() as u64 {
            return Err(NotificationError::validation(
                "offset",
                format!("{} is past the end of the stream", offset),
            ));
        }
        log.committed = log.committed.max(offset);
        Ok(())
    }

    async fn rewind(&self, offset: u64) -> Result<()> {
        let mut log = self.log.lock();
        log.position = offset.max(log.committed);
        Ok(())
    }
}

/// Counts of one ingestion pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSweep {
    pub accepted: usize,
    pub malformed: usize,
    /// Valid events with nowhere to deliver
    pub skipped: usize,
    /// Set when a transient failure stopped the pass early
    pub rewound: bool,
}

impl IngestSweep {
    pub fn is_empty(&self) -> bool {
        self.accepted == 0 && self.malformed == 0 && self.skipped == 0 && !self.rewound
    }
}

enum Handled {
    Accepted,
    Malformed,
    Skipped,
}

pub struct EventIngestor {
    config: IngestConfig,
    source: Arc<dyn EventSource>,
    sink: Arc<dyn NotificationSink>,
    preferences: Arc<PreferenceResolver>,
    templates: Arc<TemplateResolver>,
    metrics: Arc<NotificationMetrics>,
}

impl EventIngestor {
    pub fn new(
        config: IngestConfig,
        source: Arc<dyn EventSource>,
        sink: Arc<dyn NotificationSink>,
        preferences: Arc<PreferenceResolver>,
        templates: Arc<TemplateResolver>,
        metrics: Arc<NotificationMetrics>,
    ) -> Self {
        Self {
            config,
            source,
            sink,
            preferences,
            templates,
            metrics,
        }
    }

    /// Build the request for one event. Channels come from the user's
    /// preferences; title and body from the event's template, rendered for
    /// the first of those channels.
    pub async fn map_event(&self, event: &FileEvent) -> Result<NotificationRequest> {
        if event.user_id.trim().is_empty() {
            return Err(NotificationError::validation("user_id", "event has no user"));
        }
        if event.event_type.trim().is_empty() {
            return Err(NotificationError::validation("type", "event has no type"));
        }

        let event_type = event.effective_event_type().to_string();
        let preferences = self.preferences.get(&event.user_id).await?;
        let channels = PreferenceResolver::preferred_channels(&preferences, &event_type);

        let mut request = NotificationRequest::new(
            &event.user_id,
            &event_type,
            event_type.clone(),
            default_body(event, &event_type),
        )
        .with_channels(channels);
        request.metadata = event.flattened_metadata();

        let rendered = self
            .templates
            .render(&request, request.channels.first().copied())
            .await?;
        request.title = rendered.title;
        request.body = rendered.body;

        if !event_types::is_batchable(&event_type) {
            let priority = if event_type == event_types::SECURITY_ALERT {
                NotificationPriority::Critical
            } else {
                NotificationPriority::High
            };
            request = request
                .bypass_batching()
                .bypass_quiet_hours()
                .with_priority(priority);
        } else if event_type == event_types::FILE_UPLOAD_FAILED {
            request.priority = NotificationPriority::High;
        }

        Ok(request)
    }

    /// Poll once and feed every record to the sink. A transient failure
    /// commits the records handled so far and rewinds to the failed one.
    pub async fn process_once(&self) -> Result<IngestSweep> {
        let records = self.source.poll(self.config.poll_batch_size).await?;
        let mut sweep = IngestSweep::default();
        let mut next_offset = None;

        for record in records {
            match self.handle(&record).await {
                Ok(Handled::Accepted) => sweep.accepted += 1,
                Ok(Handled::Malformed) => sweep.malformed += 1,
                Ok(Handled::Skipped) => sweep.skipped += 1,
                Err(e) => {
                    warn!(offset = record.offset, error = %e, "Transient ingestion failure, rewinding");
                    if let Some(offset) = next_offset {
                        self.source.commit(offset).await?;
                    }
                    self.source.rewind(record.offset).await?;
                    self.metrics.record_ingested("rewound");
                    sweep.rewound = true;
                    return Ok(sweep);
                }
            }
            next_offset = Some(record.offset + 1);
        }

        if let Some(offset) = next_offset {
            self.source.commit(offset).await?;
        }
        Ok(sweep)
    }

    /// Errors returned from here are retryable; everything else is recorded
    /// and the record is skipped.
    async fn handle(&self, record: &SourceRecord) -> Result<Handled> {
        let event: FileEvent = match serde_json::from_str(&record.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(offset = record.offset, error = %e, "Dropping malformed event");
                self.metrics.record_ingested("malformed");
                return Ok(Handled::Malformed);
            }
        };

        let request = match self.map_event(&event).await {
            Ok(request) => request,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                warn!(offset = record.offset, event_type = %event.event_type, error = %e, "Dropping unusable event");
                self.metrics.record_ingested("malformed");
                return Ok(Handled::Malformed);
            }
        };

        if request.channels.is_empty() {
            debug!(user_id = %request.user_id, event_type = %request.event_type, "No enabled channels for event");
            self.metrics.record_ingested("skipped");
            return Ok(Handled::Skipped);
        }

        match self.sink.submit(request).await {
            Ok(response) => {
                debug!(offset = record.offset, notification_id = %response.id, status = ?response.status, "Event accepted");
                self.metrics.record_ingested("accepted");
                Ok(Handled::Accepted)
            }
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                warn!(offset = record.offset, error = %e, "Event rejected");
                self.metrics.record_ingested("malformed");
                Ok(Handled::Malformed)
            }
        }
    }

    /// Consume until `cancel` fires. Idle polls wait `poll_interval_ms`,
    /// failures wait `error_backoff_ms`.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(batch_size = self.config.poll_batch_size, "Event ingestor started");
        let idle = Duration::from_millis(self.config.poll_interval_ms);
        let backoff = Duration::from_millis(self.config.error_backoff_ms);

        loop {
            let pause = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.process_once() => match result {
                    Ok(sweep) if sweep.rewound => backoff,
                    Ok(sweep) if sweep.is_empty() => idle,
                    Ok(sweep) => {
                        debug!(?sweep, "Ingested events");
                        Duration::ZERO
                    }
                    Err(e) => {
                        error!(error = %e, "Event source failed");
                        backoff
                    }
                },
            };

            if !pause.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!("Event ingestor stopped");
    }
}

fn default_body(event: &FileEvent, event_type: &str) -> String {
    match (&event.file_name, &event.error_reason) {
        (Some(name), Some(reason)) => format!("{}: {}", name, reason),
        (Some(name), None) => name.clone(),
        (None, Some(reason)) => reason.clone(),
        (None, None) => format!("{} event", event_type),
    }
}
