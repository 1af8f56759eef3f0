//! In-process store used by tests and embedding callers.
//!
//! Implements the full collaborator contract: monotonic commit sequence,
//! position-uniqueness constraint per (job, row), atomic group moves and
//! delete cascades, with change events fanned out to per-table subscribers.
//! The commit sequence is assigned under the write lock, which makes it the
//! single ordering authority across sessions.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use indexmap::IndexMap;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tracing::{debug, warn};

use crate::errors::StoreError;
use crate::model::{Assignment, Job, Resource, ScheduleSnapshot};
use crate::store::{
    ChangeEvent, ChangeFeed, ChangeKind, Committed, EntityTable, MovePlacement, ScheduleStore,
    SubscriptionId,
};

#[derive(Clone, Debug)]
struct Versioned<T> {
    row: T,
    commit_seq: u64,
}

#[derive(Default)]
struct Tables {
    resources: IndexMap<String, Versioned<Resource>>,
    jobs: IndexMap<String, Versioned<Job>>,
    assignments: IndexMap<String, Versioned<Assignment>>,
    commit_seq: u64,
}

impl Tables {
    fn next_seq(&mut self) -> u64 {
        self.commit_seq += 1;
        self.commit_seq
    }

    fn position_clash(&self, candidate: &Assignment) -> bool {
        self.assignments.values().any(|v| {
            v.row.id != candidate.id
                && v.row.job_id == candidate.job_id
                && v.row.row_type == candidate.row_type
                && v.row.position == candidate.position
        })
    }
}

type Subscribers = HashMap<EntityTable, Vec<(SubscriptionId, mpsc::Sender<ChangeEvent>)>>;

pub struct MemoryStore {
    tables: RwLock<Tables>,
    subscribers: Mutex<Subscribers>,
    next_subscription: Mutex<u64>,
    /// Held from sequence assignment through event delivery, so the feed
    /// observes commits in `commit_seq` order.
    commit_order: AsyncMutex<()>,
    fail_next: Mutex<Option<StoreError>>,
    latency: Mutex<Option<Duration>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscription: Mutex::new(0),
            commit_order: AsyncMutex::new(()),
            fail_next: Mutex::new(None),
            latency: Mutex::new(None),
        }
    }

    /// Make the next store call fail with the given error. One-shot.
    pub fn fail_next(&self, err: StoreError) {
        *self.fail_next.lock().expect("fail_next lock") = Some(err);
    }

    /// Delay every store call, for timeout tests.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().expect("latency lock") = latency;
    }

    async fn gate(&self) -> Result<(), StoreError> {
        let latency = *self.latency.lock().expect("latency lock");
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = self.fail_next.lock().expect("fail_next lock").take() {
            return Err(err);
        }
        Ok(())
    }

    async fn emit(&self, events: Vec<ChangeEvent>) {
        for event in events {
            let targets: Vec<(SubscriptionId, mpsc::Sender<ChangeEvent>)> = {
                let subscribers = self.subscribers.lock().expect("subscribers lock");
                subscribers
                    .get(&event.table)
                    .map(|v| v.to_vec())
                    .unwrap_or_default()
            };

            let mut dead = Vec::new();
            for (id, sender) in targets {
                if sender.send(event.clone()).await.is_err() {
                    warn!("Dropping dead change-feed subscriber {:?}", id);
                    dead.push(id);
                }
            }
            if !dead.is_empty() {
                let mut subscribers = self.subscribers.lock().expect("subscribers lock");
                if let Some(list) = subscribers.get_mut(&event.table) {
                    list.retain(|(id, _)| !dead.contains(id));
                }
            }
        }
    }

    fn event<T: serde::Serialize>(
        table: EntityTable,
        kind: ChangeKind,
        new_row: Option<&T>,
        old_row: Option<&T>,
        commit_seq: u64,
    ) -> ChangeEvent {
        ChangeEvent {
            table,
            kind,
            new_row: new_row.map(|r| serde_json::to_value(r).expect("serializable row")),
            old_row: old_row.map(|r| serde_json::to_value(r).expect("serializable row")),
            commit_seq,
        }
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn insert_resource(&self, resource: Resource) -> Result<Committed<Resource>, StoreError> {
        self.gate().await?;
        let _commit = self.commit_order.lock().await;
        let mut events = Vec::new();
        let committed = {
            let mut tables = self.tables.write().await;
            if tables.resources.contains_key(&resource.id) {
                return Err(StoreError::Conflict(format!(
                    "resource '{}' already exists",
                    resource.id
                )));
            }
            let seq = tables.next_seq();
            tables.resources.insert(
                resource.id.clone(),
                Versioned {
                    row: resource.clone(),
                    commit_seq: seq,
                },
            );
            events.push(Self::event(
                EntityTable::Resources,
                ChangeKind::Insert,
                Some(&resource),
                None,
                seq,
            ));
            Committed {
                row: resource,
                commit_seq: seq,
                committed_at: Utc::now(),
            }
        };
        self.emit(events).await;
        Ok(committed)
    }

    async fn update_resource(&self, resource: Resource) -> Result<Committed<Resource>, StoreError> {
        self.gate().await?;
        let _commit = self.commit_order.lock().await;
        let mut events = Vec::new();
        let committed = {
            let mut tables = self.tables.write().await;
            let old = tables
                .resources
                .get(&resource.id)
                .map(|v| v.row.clone())
                .ok_or_else(|| StoreError::NotFound(format!("resource '{}'", resource.id)))?;
            let seq = tables.next_seq();
            tables.resources.insert(
                resource.id.clone(),
                Versioned {
                    row: resource.clone(),
                    commit_seq: seq,
                },
            );
            events.push(Self::event(
                EntityTable::Resources,
                ChangeKind::Update,
                Some(&resource),
                Some(&old),
                seq,
            ));
            Committed {
                row: resource,
                commit_seq: seq,
                committed_at: Utc::now(),
            }
        };
        self.emit(events).await;
        Ok(committed)
    }

    async fn delete_resource(&self, id: &str) -> Result<u64, StoreError> {
        self.gate().await?;
        let _commit = self.commit_order.lock().await;
        let mut events = Vec::new();
        let seq = {
            let mut tables = self.tables.write().await;
            let old = tables
                .resources
                .shift_remove(id)
                .ok_or_else(|| StoreError::NotFound(format!("resource '{id}'")))?;

            // Cascade: the resource's assignments go, and their
            // subordinates' parent pointers are cleared, in this commit.
            let doomed: Vec<String> = tables
                .assignments
                .values()
                .filter(|v| v.row.resource_id == id)
                .map(|v| v.row.id.clone())
                .collect();
            for assignment_id in &doomed {
                cascade_delete_assignment(&mut tables, assignment_id, &mut events);
            }

            let seq = tables.next_seq();
            events.push(Self::event(
                EntityTable::Resources,
                ChangeKind::Delete,
                None,
                Some(&old.row),
                seq,
            ));
            seq
        };
        self.emit(events).await;
        Ok(seq)
    }

    async fn insert_job(&self, job: Job) -> Result<Committed<Job>, StoreError> {
        self.gate().await?;
        let _commit = self.commit_order.lock().await;
        let mut events = Vec::new();
        let committed = {
            let mut tables = self.tables.write().await;
            if tables.jobs.contains_key(&job.id) {
                return Err(StoreError::Conflict(format!("job '{}' already exists", job.id)));
            }
            let seq = tables.next_seq();
            tables.jobs.insert(
                job.id.clone(),
                Versioned {
                    row: job.clone(),
                    commit_seq: seq,
                },
            );
            events.push(Self::event(
                EntityTable::Jobs,
                ChangeKind::Insert,
                Some(&job),
                None,
                seq,
            ));
            Committed {
                row: job,
                commit_seq: seq,
                committed_at: Utc::now(),
            }
        };
        self.emit(events).await;
        Ok(committed)
    }

    async fn update_job(&self, job: Job) -> Result<Committed<Job>, StoreError> {
        self.gate().await?;
        let _commit = self.commit_order.lock().await;
        let mut events = Vec::new();
        let committed = {
            let mut tables = self.tables.write().await;
            let old = tables
                .jobs
                .get(&job.id)
                .map(|v| v.row.clone())
                .ok_or_else(|| StoreError::NotFound(format!("job '{}'", job.id)))?;
            let seq = tables.next_seq();
            tables.jobs.insert(
                job.id.clone(),
                Versioned {
                    row: job.clone(),
                    commit_seq: seq,
                },
            );
            events.push(Self::event(
                EntityTable::Jobs,
                ChangeKind::Update,
                Some(&job),
                Some(&old),
                seq,
            ));
            Committed {
                row: job,
                commit_seq: seq,
                committed_at: Utc::now(),
            }
        };
        self.emit(events).await;
        Ok(committed)
    }

    async fn delete_job(&self, id: &str) -> Result<u64, StoreError> {
        self.gate().await?;
        let _commit = self.commit_order.lock().await;
        let mut events = Vec::new();
        let seq = {
            let mut tables = self.tables.write().await;
            let old = tables
                .jobs
                .shift_remove(id)
                .ok_or_else(|| StoreError::NotFound(format!("job '{id}'")))?;

            let doomed: Vec<String> = tables
                .assignments
                .values()
                .filter(|v| v.row.job_id == id)
                .map(|v| v.row.id.clone())
                .collect();
            for assignment_id in &doomed {
                cascade_delete_assignment(&mut tables, assignment_id, &mut events);
            }

            let seq = tables.next_seq();
            events.push(Self::event(
                EntityTable::Jobs,
                ChangeKind::Delete,
                None,
                Some(&old.row),
                seq,
            ));
            seq
        };
        self.emit(events).await;
        Ok(seq)
    }

    async fn insert_assignment(
        &self,
        assignment: Assignment,
    ) -> Result<Committed<Assignment>, StoreError> {
        self.gate().await?;
        let _commit = self.commit_order.lock().await;
        let mut events = Vec::new();
        let committed = {
            let mut tables = self.tables.write().await;
            if tables.assignments.contains_key(&assignment.id) {
                return Err(StoreError::Conflict(format!(
                    "assignment '{}' already exists",
                    assignment.id
                )));
            }
            check_assignment_constraints(&tables, &assignment)?;
            let seq = tables.next_seq();
            tables.assignments.insert(
                assignment.id.clone(),
                Versioned {
                    row: assignment.clone(),
                    commit_seq: seq,
                },
            );
            events.push(Self::event(
                EntityTable::Assignments,
                ChangeKind::Insert,
                Some(&assignment),
                None,
                seq,
            ));
            Committed {
                row: assignment,
                commit_seq: seq,
                committed_at: Utc::now(),
            }
        };
        self.emit(events).await;
        Ok(committed)
    }

    async fn update_assignment(
        &self,
        assignment: Assignment,
    ) -> Result<Committed<Assignment>, StoreError> {
        self.gate().await?;
        let _commit = self.commit_order.lock().await;
        let mut events = Vec::new();
        let committed = {
            let mut tables = self.tables.write().await;
            let old = tables
                .assignments
                .get(&assignment.id)
                .map(|v| v.row.clone())
                .ok_or_else(|| StoreError::NotFound(format!("assignment '{}'", assignment.id)))?;
            check_assignment_constraints(&tables, &assignment)?;
            let seq = tables.next_seq();
            tables.assignments.insert(
                assignment.id.clone(),
                Versioned {
                    row: assignment.clone(),
                    commit_seq: seq,
                },
            );
            events.push(Self::event(
                EntityTable::Assignments,
                ChangeKind::Update,
                Some(&assignment),
                Some(&old),
                seq,
            ));
            Committed {
                row: assignment,
                commit_seq: seq,
                committed_at: Utc::now(),
            }
        };
        self.emit(events).await;
        Ok(committed)
    }

    async fn delete_assignment(&self, id: &str) -> Result<u64, StoreError> {
        self.gate().await?;
        let _commit = self.commit_order.lock().await;
        let mut events = Vec::new();
        let seq = {
            let mut tables = self.tables.write().await;
            if !tables.assignments.contains_key(id) {
                return Err(StoreError::NotFound(format!("assignment '{id}'")));
            }
            cascade_delete_assignment(&mut tables, id, &mut events);
            tables.commit_seq
        };
        self.emit(events).await;
        Ok(seq)
    }

    async fn jobs_in_range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Job>, StoreError> {
        self.gate().await?;
        let tables = self.tables.read().await;
        Ok(tables
            .jobs
            .values()
            .filter(|v| v.row.schedule_date >= from && v.row.schedule_date <= to)
            .map(|v| v.row.clone())
            .collect())
    }

    async fn assignments_for_date(&self, date: NaiveDate) -> Result<Vec<Assignment>, StoreError> {
        self.gate().await?;
        let tables = self.tables.read().await;
        let job_ids: Vec<&String> = tables
            .jobs
            .values()
            .filter(|v| v.row.schedule_date == date)
            .map(|v| &v.row.id)
            .collect();
        Ok(tables
            .assignments
            .values()
            .filter(|v| job_ids.contains(&&v.row.job_id))
            .map(|v| v.row.clone())
            .collect())
    }

    async fn move_group(
        &self,
        placements: Vec<MovePlacement>,
    ) -> Result<Vec<Committed<Assignment>>, StoreError> {
        self.gate().await?;
        let _commit = self.commit_order.lock().await;
        let mut events = Vec::new();
        let committed = {
            let mut tables = self.tables.write().await;

            // Validate the whole batch before touching any row.
            for placement in &placements {
                if !tables.assignments.contains_key(&placement.assignment_id) {
                    return Err(StoreError::NotFound(format!(
                        "assignment '{}'",
                        placement.assignment_id
                    )));
                }
                if !tables.jobs.contains_key(&placement.job_id) {
                    return Err(StoreError::Constraint(format!(
                        "job '{}' does not exist",
                        placement.job_id
                    )));
                }
            }
            for (i, a) in placements.iter().enumerate() {
                for b in placements.iter().skip(i + 1) {
                    if a.job_id == b.job_id && a.row_type == b.row_type && a.position == b.position
                    {
                        return Err(StoreError::Constraint(format!(
                            "duplicate position {} in batch",
                            a.position
                        )));
                    }
                }
            }
            let moving: Vec<&String> = placements.iter().map(|p| &p.assignment_id).collect();
            for placement in &placements {
                let clash = tables.assignments.values().any(|v| {
                    !moving.contains(&&v.row.id)
                        && v.row.job_id == placement.job_id
                        && v.row.row_type == placement.row_type
                        && v.row.position == placement.position
                });
                if clash {
                    return Err(StoreError::Conflict(format!(
                        "position {} on job '{}' row '{}' is taken",
                        placement.position, placement.job_id, placement.row_type
                    )));
                }
            }

            debug!("Committing group move of {} assignments", placements.len());
            let mut committed = Vec::with_capacity(placements.len());
            for placement in &placements {
                let seq = tables.next_seq();
                let entry = tables
                    .assignments
                    .get_mut(&placement.assignment_id)
                    .expect("validated above");
                let old = entry.row.clone();
                entry.row.job_id = placement.job_id.clone();
                entry.row.row_type = placement.row_type.clone();
                entry.row.position = placement.position;
                entry.commit_seq = seq;
                let row = entry.row.clone();
                events.push(Self::event(
                    EntityTable::Assignments,
                    ChangeKind::Update,
                    Some(&row),
                    Some(&old),
                    seq,
                ));
                committed.push(Committed {
                    row,
                    commit_seq: seq,
                    committed_at: Utc::now(),
                });
            }
            committed
        };
        self.emit(events).await;
        Ok(committed)
    }

    async fn snapshot(&self) -> Result<ScheduleSnapshot, StoreError> {
        self.gate().await?;
        let tables = self.tables.read().await;
        Ok(ScheduleSnapshot {
            jobs: tables.jobs.values().map(|v| v.row.clone()).collect(),
            resources: tables.resources.values().map(|v| v.row.clone()).collect(),
            assignments: tables.assignments.values().map(|v| v.row.clone()).collect(),
        })
    }
}

/// Position uniqueness and reference checks applied to every write.
fn check_assignment_constraints(tables: &Tables, assignment: &Assignment) -> Result<(), StoreError> {
    if !tables.jobs.contains_key(&assignment.job_id) {
        return Err(StoreError::Constraint(format!(
            "job '{}' does not exist",
            assignment.job_id
        )));
    }
    if !tables.resources.contains_key(&assignment.resource_id) {
        return Err(StoreError::Constraint(format!(
            "resource '{}' does not exist",
            assignment.resource_id
        )));
    }
    if tables.position_clash(assignment) {
        return Err(StoreError::Conflict(format!(
            "position {} on job '{}' row '{}' is taken",
            assignment.position, assignment.job_id, assignment.row_type
        )));
    }
    if let Some(parent_id) = &assignment.attached_to {
        match tables.assignments.get(parent_id) {
            None => {
                return Err(StoreError::Constraint(format!(
                    "attached_to '{parent_id}' does not exist"
                )))
            }
            Some(parent) if parent.row.job_id != assignment.job_id => {
                return Err(StoreError::Constraint(format!(
                    "attached_to '{parent_id}' is on a different job"
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Delete one assignment, clearing subordinate parent pointers, recording
/// an event per touched row.
fn cascade_delete_assignment(tables: &mut Tables, id: &str, events: &mut Vec<ChangeEvent>) {
    let Some(old) = tables.assignments.shift_remove(id) else {
        return;
    };

    let subordinate_ids: Vec<String> = tables
        .assignments
        .values()
        .filter(|v| v.row.attached_to.as_deref() == Some(id))
        .map(|v| v.row.id.clone())
        .collect();
    for subordinate_id in subordinate_ids {
        let seq = tables.next_seq();
        let entry = tables
            .assignments
            .get_mut(&subordinate_id)
            .expect("collected above");
        let before = entry.row.clone();
        entry.row.attached_to = None;
        entry.commit_seq = seq;
        let after = entry.row.clone();
        events.push(MemoryStore::event(
            EntityTable::Assignments,
            ChangeKind::Update,
            Some(&after),
            Some(&before),
            seq,
        ));
    }

    let seq = tables.next_seq();
    events.push(MemoryStore::event(
        EntityTable::Assignments,
        ChangeKind::Delete,
        None,
        Some(&old.row),
        seq,
    ));
}

impl ChangeFeed for MemoryStore {
    fn subscribe(&self, table: EntityTable, sender: mpsc::Sender<ChangeEvent>) -> SubscriptionId {
        let mut next = self.next_subscription.lock().expect("subscription lock");
        *next += 1;
        let id = SubscriptionId(*next);
        self.subscribers
            .lock()
            .expect("subscribers lock")
            .entry(table)
            .or_default()
            .push((id, sender));
        debug!("Subscribed {:?} to {:?}", id, table);
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscribers = self.subscribers.lock().expect("subscribers lock");
        for list in subscribers.values_mut() {
            list.retain(|(sub_id, _)| *sub_id != id);
        }
    }
}
