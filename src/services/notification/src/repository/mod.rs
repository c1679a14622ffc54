//! Persistence contracts for notifications, batches and dead-letter entries
//!
//! The notification repository is the single source of truth for retry
//! eligibility. Updates are checked against the status state machine, and the
//! retry claim is an atomic compare-and-set so two schedulers never pick the
//! same notification.

pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileshare_shared::{BatchNotification, DeadLetterEntry, DeadLetterStats, Notification};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::{InMemoryBatchRepository, InMemoryDeadLetterRepository, InMemoryNotificationRepository};

/// Pagination parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub offset: u32,
}

impl Pagination {
    pub fn new(page: u32, limit: u32) -> Self {
        let page = page.max(1);
        let limit = limit.clamp(1, 100);
        let offset = (page - 1) * limit;
        Self { page, limit, offset }
    }

    /// Slice an already ordered collection
    pub fn apply<T>(&self, items: Vec<T>) -> PagedResult<T> {
        let total = items.len() as u64;
        let data = items
            .into_iter()
            .skip(self.offset as usize)
            .take(self.limit as usize)
            .collect();
        PagedResult {
            data,
            pagination: PaginationMeta::new(self.page, self.limit, total),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

/// Query result with pagination metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagedResult<T> {
    pub data: Vec<T>,
    pub pagination: PaginationMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationMeta {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u32,
    pub has_next: bool,
    pub has_prev: bool,
}

impl PaginationMeta {
    pub fn new(page: u32, limit: u32, total: u64) -> Self {
        let total_pages = total.div_ceil(u64::from(limit.max(1))) as u32;
        Self {
            page,
            limit,
            total,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn create(&self, notification: Notification) -> Result<Notification>;

    async fn get(&self, id: Uuid) -> Result<Option<Notification>>;

    /// Newest first
    async fn list_for_user(&self, user_id: &str, pagination: Pagination) -> Result<PagedResult<Notification>>;

    /// Replace the stored record. Fails with a conflict when the status change
    /// is not allowed by the state machine or the stored record is terminal.
    async fn update(&self, notification: &Notification) -> Result<()>;

    /// Notifications due for a retry, oldest first: `failed` ones whose
    /// `next_retry_at` has passed, and retry claims whose lease ran out
    async fn list_due_for_retry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Notification>>;

    /// Atomically claim a due notification for retry: it becomes `pending`
    /// with `next_retry_at` pushed to `lease_until`. A claim that is never
    /// settled becomes due again once the lease expires. Returns `None` when
    /// another worker holds the claim or it is not due.
    async fn claim_for_retry(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Notification>>;

    async fn delete(&self, id: Uuid) -> Result<bool>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchRepository: Send + Sync {
    async fn create(&self, batch: BatchNotification) -> Result<BatchNotification>;

    async fn get(&self, id: Uuid) -> Result<Option<BatchNotification>>;

    async fn list_for_user(&self, user_id: &str, pagination: Pagination) -> Result<PagedResult<BatchNotification>>;

    /// A closed batch can no longer be changed
    async fn update(&self, batch: &BatchNotification) -> Result<()>;

    /// Link a stored batch to the summary notification sent for it. Linking
    /// it to a different notification is a conflict.
    async fn attach_notification(&self, id: Uuid, notification_id: Uuid) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    async fn create(&self, entry: DeadLetterEntry) -> Result<DeadLetterEntry>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>>;

    async fn find_by_notification(&self, notification_id: Uuid) -> Result<Option<DeadLetterEntry>>;

    /// Newest first
    async fn list(&self, pagination: Pagination) -> Result<PagedResult<DeadLetterEntry>>;

    /// Rejects updates to processed entries and moving `next_retry_at` backwards
    async fn update(&self, entry: &DeadLetterEntry) -> Result<()>;

    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeadLetterEntry>>;

    /// Atomically lease a due entry until `lease_until` by pushing its
    /// `next_retry_at` forward. Returns `None` if it is not due any more.
    async fn claim(&self, id: Uuid, now: DateTime<Utc>, lease_until: DateTime<Utc>) -> Result<Option<DeadLetterEntry>>;

    /// Remove processed entries whose `processed_at` is before `cutoff`
    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    async fn stats(&self) -> Result<DeadLetterStats>;

    async fn delete(&self, id: Uuid) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination() {
        let pagination = Pagination::new(2, 10);
        assert_eq!(pagination.page, 2);
        assert_eq!(pagination.limit, 10);
        assert_eq!(pagination.offset, 10);
    }

    #[test]
    fn test_pagination_limits() {
        assert_eq!(Pagination::new(1, 200).limit, 100);
        assert_eq!(Pagination::new(1, 0).limit, 1);
        assert_eq!(Pagination::new(0, 10).offset, 0);
    }

    #[test]
    fn test_pagination_meta() {
        let meta = PaginationMeta::new(2, 10, 45);
        assert_eq!(meta.total_pages, 5);
        assert!(meta.has_next);
        assert!(meta.has_prev);
    }

    #[test]
    fn test_apply_slices_in_order() {
        let page = Pagination::new(2, 2).apply((1..=5).collect::<Vec<_>>());
        assert_eq!(page.data, vec![3, 4]);
        assert_eq!(page.pagination.total, 5);
        assert_eq!(page.pagination.total_pages, 3);
    }
}
