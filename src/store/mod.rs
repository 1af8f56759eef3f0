//! Collaborator contracts for persistence and change notification.
//!
//! The core never talks to a concrete database: it sees an ordered,
//! transactional [`ScheduleStore`] and a per-row-ordered [`ChangeFeed`].
//! Polling, log-tailing or push transports all satisfy the feed contract.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::StoreError;
use crate::model::{Assignment, Job, Resource, ScheduleSnapshot};

pub use memory::MemoryStore;

/// Entity tables a feed subscription can follow.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntityTable {
    Resources,
    Jobs,
    Assignments,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One committed change, delivered at-least-once, ordered per row. Rows are
/// carried as JSON values so the feed stays store-agnostic; `commit_seq` is
/// the store-assigned monotonic ordering authority.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChangeEvent {
    pub table: EntityTable,
    pub kind: ChangeKind,
    pub new_row: Option<serde_json::Value>,
    pub old_row: Option<serde_json::Value>,
    pub commit_seq: u64,
}

impl ChangeEvent {
    /// Id of the row this event concerns.
    pub fn row_id(&self) -> Option<String> {
        let row = self.new_row.as_ref().or(self.old_row.as_ref())?;
        row.get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

/// Envelope returned for every accepted write. `commit_seq` is assigned
/// under the store's write lock and is the only cross-session ordering;
/// `committed_at` is informational and never compared.
#[derive(Clone, Debug)]
pub struct Committed<T> {
    pub row: T,
    pub commit_seq: u64,
    pub committed_at: DateTime<Utc>,
}

/// One member's destination within an atomic group move.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MovePlacement {
    pub assignment_id: String,
    pub job_id: String,
    pub row_type: String,
    pub position: i32,
}

/// Ordered, transactional storage collaborator. The store's own constraint
/// machinery is the single arbiter of conflicting writes; the core uses no
/// client-side locks.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert_resource(&self, resource: Resource) -> Result<Committed<Resource>, StoreError>;
    async fn update_resource(&self, resource: Resource) -> Result<Committed<Resource>, StoreError>;
    /// Cascades: the resource's assignments are deleted and subordinate
    /// parent pointers cleared in the same commit.
    async fn delete_resource(&self, id: &str) -> Result<u64, StoreError>;

    async fn insert_job(&self, job: Job) -> Result<Committed<Job>, StoreError>;
    async fn update_job(&self, job: Job) -> Result<Committed<Job>, StoreError>;
    async fn delete_job(&self, id: &str) -> Result<u64, StoreError>;

    async fn insert_assignment(
        &self,
        assignment: Assignment,
    ) -> Result<Committed<Assignment>, StoreError>;
    async fn update_assignment(
        &self,
        assignment: Assignment,
    ) -> Result<Committed<Assignment>, StoreError>;
    async fn delete_assignment(&self, id: &str) -> Result<u64, StoreError>;

    /// Jobs whose schedule date falls in `from..=to`.
    async fn jobs_in_range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Job>, StoreError>;

    /// Assignments belonging to jobs scheduled on `date`.
    async fn assignments_for_date(&self, date: NaiveDate) -> Result<Vec<Assignment>, StoreError>;

    /// Relocate a whole attachment group in one transaction. Either every
    /// placement commits or none does.
    async fn move_group(
        &self,
        placements: Vec<MovePlacement>,
    ) -> Result<Vec<Committed<Assignment>>, StoreError>;

    /// Full current contents, for session bootstrap and read-only export
    /// consumers.
    async fn snapshot(&self) -> Result<ScheduleSnapshot, StoreError>;
}

/// Handle returned by [`ChangeFeed::subscribe`]; pass it back to
/// unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Change-notification collaborator. Delivery is at-least-once and ordered
/// per row; there is no cross-table ordering guarantee.
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self, table: EntityTable, sender: mpsc::Sender<ChangeEvent>) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId);
}
