//! In-memory repositories backed by `DashMap`
//!
//! Conditional updates run while holding the entry's shard lock, which makes
//! them atomic with respect to every other caller of the same repository.

use super::{
    BatchRepository, DeadLetterRepository, NotificationRepository, PagedResult, Pagination,
};
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fileshare_shared::{
    BatchNotification, BatchStatus, DeadLetterEntry, DeadLetterStats, Notification,
    NotificationStatus,
};
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryNotificationRepository {
    notifications: DashMap<Uuid, Notification>,
}

impl InMemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.notifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }

    /// Every stored notification, oldest first
    pub fn all(&self) -> Vec<Notification> {
        let mut all: Vec<Notification> = self.notifications.iter().map(|n| n.value().clone()).collect();
        all.sort_by_key(|n| n.created_at);
        all
    }
}

fn check_notification_update(stored: &Notification, next: &Notification) -> Result<()> {
    if stored.status.is_terminal() {
        return Err(NotificationError::conflict(format!(
            "notification {} is {} and can no longer change",
            stored.id, stored.status
        )));
    }
    if stored.status != next.status && !stored.status.can_transition_to(next.status) {
        return Err(NotificationError::conflict(format!(
            "notification {} cannot move from {} to {}",
            stored.id, stored.status, next.status
        )));
    }
    if next.delivery_attempts.len() < stored.delivery_attempts.len() {
        return Err(NotificationError::conflict(format!(
            "delivery attempts of notification {} are append-only",
            stored.id
        )));
    }
    Ok(())
}

/// A `failed` record past its retry time, or a retry claim (pending with at
/// least one failure and a lease) past its lease
fn is_due_for_retry(notification: &Notification, now: DateTime<Utc>) -> bool {
    let expired = notification.next_retry_at.is_some_and(|at| at <= now);
    match notification.status {
        NotificationStatus::Failed => expired,
        NotificationStatus::Pending => notification.retry_count > 0 && expired,
        _ => false,
    }
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationRepository {
    async fn create(&self, notification: Notification) -> Result<Notification> {
        if self.notifications.contains_key(&notification.id) {
            return Err(NotificationError::conflict(format!(
                "notification {} already exists",
                notification.id
            )));
        }
        self.notifications.insert(notification.id, notification.clone());
        Ok(notification)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>> {
        Ok(self.notifications.get(&id).map(|n| n.value().clone()))
    }

    async fn list_for_user(&self, user_id: &str, pagination: Pagination) -> Result<PagedResult<Notification>> {
        let mut items: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .map(|n| n.value().clone())
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(pagination.apply(items))
    }

    async fn update(&self, notification: &Notification) -> Result<()> {
        let mut stored = self
            .notifications
            .get_mut(&notification.id)
            .ok_or_else(|| NotificationError::not_found(format!("notification {}", notification.id)))?;

        check_notification_update(&stored, notification)?;
        *stored = notification.clone();
        Ok(())
    }

    async fn list_due_for_retry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Notification>> {
        let mut due: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|n| is_due_for_retry(n, now))
            .map(|n| n.value().clone())
            .collect();
        due.sort_by_key(|n| n.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_for_retry(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Notification>> {
        let Some(mut stored) = self.notifications.get_mut(&id) else {
            return Ok(None);
        };

        if !is_due_for_retry(&stored, now) {
            return Ok(None);
        }

        // An expired claim is taken over as it is, already pending
        if stored.status == NotificationStatus::Failed {
            stored.requeue(now)?;
        } else {
            stored.updated_at = now;
        }
        stored.next_retry_at = Some(lease_until);
        Ok(Some(stored.clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.notifications.remove(&id).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryBatchRepository {
    batches: DashMap<Uuid, BatchNotification>,
}

impl InMemoryBatchRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored batch, oldest window first
    pub fn all(&self) -> Vec<BatchNotification> {
        let mut all: Vec<BatchNotification> = self.batches.iter().map(|b| b.value().clone()).collect();
        all.sort_by_key(|b| b.window_started_at);
        all
    }
}

#[async_trait]
impl BatchRepository for InMemoryBatchRepository {
    async fn create(&self, batch: BatchNotification) -> Result<BatchNotification> {
        if batch.count != batch.items.len() {
            return Err(NotificationError::validation(
                "count",
                format!("count {} does not match {} items", batch.count, batch.items.len()),
            ));
        }
        self.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn get(&self, id: Uuid) -> Result<Option<BatchNotification>> {
        Ok(self.batches.get(&id).map(|b| b.value().clone()))
    }

    async fn list_for_user(&self, user_id: &str, pagination: Pagination) -> Result<PagedResult<BatchNotification>> {
        let mut items: Vec<BatchNotification> = self
            .batches
            .iter()
            .filter(|b| b.user_id == user_id)
            .map(|b| b.value().clone())
            .collect();
        items.sort_by(|a, b| b.window_started_at.cmp(&a.window_started_at));
        Ok(pagination.apply(items))
    }

    async fn update(&self, batch: &BatchNotification) -> Result<()> {
        let mut stored = self
            .batches
            .get_mut(&batch.id)
            .ok_or_else(|| NotificationError::not_found(format!("batch {}", batch.id)))?;

        if stored.status == BatchStatus::Closed {
            return Err(NotificationError::conflict(format!("batch {} is already closed", batch.id)));
        }
        *stored = batch.clone();
        Ok(())
    }

    async fn attach_notification(&self, id: Uuid, notification_id: Uuid) -> Result<()> {
        let mut stored = self
            .batches
            .get_mut(&id)
            .ok_or_else(|| NotificationError::not_found(format!("batch {}", id)))?;

        match stored.notification_id {
            Some(existing) if existing != notification_id => Err(NotificationError::conflict(format!(
                "batch {} already belongs to notification {}",
                id, existing
            ))),
            _ => {
                stored.notification_id = Some(notification_id);
                Ok(())
            }
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.batches.remove(&id).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryDeadLetterRepository {
    entries: DashMap<Uuid, DeadLetterEntry>,
}

impl InMemoryDeadLetterRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_dead_letter_update(stored: &DeadLetterEntry, next: &DeadLetterEntry) -> Result<()> {
    if stored.is_processed {
        return Err(NotificationError::conflict(format!(
            "dead letter {} is already processed",
            stored.id
        )));
    }
    if let Some(current) = stored.next_retry_at {
        if next.next_retry_at.map_or(true, |at| at < current) {
            return Err(NotificationError::conflict(format!(
                "next_retry_at of dead letter {} cannot move backwards",
                stored.id
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl DeadLetterRepository for InMemoryDeadLetterRepository {
    async fn create(&self, entry: DeadLetterEntry) -> Result<DeadLetterEntry> {
        self.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>> {
        Ok(self.entries.get(&id).map(|e| e.value().clone()))
    }

    async fn find_by_notification(&self, notification_id: Uuid) -> Result<Option<DeadLetterEntry>> {
        Ok(self
            .entries
            .iter()
            .find(|e| e.notification_id == notification_id)
            .map(|e| e.value().clone()))
    }

    async fn list(&self, pagination: Pagination) -> Result<PagedResult<DeadLetterEntry>> {
        let mut items: Vec<DeadLetterEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(pagination.apply(items))
    }

    async fn update(&self, entry: &DeadLetterEntry) -> Result<()> {
        let mut stored = self
            .entries
            .get_mut(&entry.id)
            .ok_or_else(|| NotificationError::not_found(format!("dead letter {}", entry.id)))?;

        check_dead_letter_update(&stored, entry)?;
        *stored = entry.clone();
        Ok(())
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let mut due: Vec<DeadLetterEntry> = self
            .entries
            .iter()
            .filter(|e| e.is_due(now))
            .map(|e| e.value().clone())
            .collect();
        due.sort_by_key(|e| (e.next_retry_at, e.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(&self, id: Uuid, now: DateTime<Utc>, lease_until: DateTime<Utc>) -> Result<Option<DeadLetterEntry>> {
        let Some(mut stored) = self.entries.get_mut(&id) else {
            return Ok(None);
        };
        if !stored.is_due(now) {
            return Ok(None);
        }

        let lease_until = stored.next_retry_at.map_or(lease_until, |at| at.max(lease_until));
        stored.next_retry_at = Some(lease_until);
        stored.updated_at = now;
        Ok(Some(stored.clone()))
    }

    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| !(e.is_processed && e.processed_at.is_some_and(|at| at < cutoff)));
        Ok(before - self.entries.len())
    }

    async fn stats(&self) -> Result<DeadLetterStats> {
        let mut stats = DeadLetterStats::default();
        for entry in self.entries.iter() {
            stats.total += 1;
            if entry.is_processed {
                stats.processed += 1;
            } else if entry.is_exhausted() {
                stats.exhausted += 1;
                *stats
                    .exhausted_by_event_type
                    .entry(entry.event_type.clone())
                    .or_default() += 1;
            } else {
                stats.pending += 1;
            }
        }
        Ok(stats)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.entries.remove(&id).is_some())
    }
}
