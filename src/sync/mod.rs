//! Optimistic synchronization layer.
//!
//! One `ScheduleSession` per editor. A mutation is applied to the local
//! board immediately, then submitted to the store within a bounded wait;
//! the store's commit sequence is the only cross-session ordering
//! authority. On any submission failure the pre-mutation snapshot is
//! restored, so no other session ever observes optimistic state.

pub mod command;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::board::ScheduleBoard;
use crate::errors::{StoreError, SyncError, ValidationError};
use crate::model::{Assignment, ScheduleSnapshot, TimeSlot};
use crate::rules::RuleSet;
use crate::store::{ChangeEvent, ChangeKind, Committed, EntityTable, ScheduleStore};

pub use command::{CommandEffect, ScheduleCommand};

/// Lifecycle of the session's current mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationState {
    Idle,
    OptimisticApplied,
    Committed,
    RolledBack,
}

/// Acknowledgment for an accepted mutation; `commit_seq` is the highest
/// sequence the store assigned to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitReceipt {
    pub commit_seq: u64,
}

struct StagedMutation {
    command: ScheduleCommand,
    effect: CommandEffect,
    inverse: Option<ScheduleCommand>,
    before: ScheduleSnapshot,
}

pub struct ScheduleSession {
    session_id: String,
    rules: RuleSet,
    board: ScheduleBoard,
    store: Arc<dyn ScheduleStore>,
    commit_timeout: Duration,
    state: MutationState,
    staged: Option<StagedMutation>,
    /// Per-row high-water mark of applied commit sequences; dedupes the
    /// at-least-once feed and drops stale events.
    seen_seq: HashMap<String, u64>,
    /// Compensation for the most recent committed mutation.
    last_inverse: Option<ScheduleCommand>,
}

impl ScheduleSession {
    pub fn new(store: Arc<dyn ScheduleStore>, rules: RuleSet) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            rules,
            board: ScheduleBoard::new(),
            store,
            commit_timeout: Duration::from_secs(5),
            state: MutationState::Idle,
            staged: None,
            seen_seq: HashMap::new(),
            last_inverse: None,
        }
    }

    pub fn with_commit_timeout(mut self, commit_timeout: Duration) -> Self {
        self.commit_timeout = commit_timeout;
        self
    }

    pub fn board(&self) -> &ScheduleBoard {
        &self.board
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn state(&self) -> MutationState {
        self.state
    }

    /// Load the store's current contents into the local board.
    pub async fn bootstrap(&mut self) -> Result<(), SyncError> {
        let snapshot = self.store.snapshot().await?;
        self.board = ScheduleBoard::from_snapshot(snapshot);
        let healed = self.board.heal_dangling();
        if healed > 0 {
            warn!(
                "Session {} healed {} dangling references at bootstrap",
                self.session_id, healed
            );
        }
        info!("Session {} bootstrapped: {}", self.session_id, self.board.stats());
        Ok(())
    }

    // ---- staged mutation lifecycle ------------------------------------

    /// Apply a command optimistically without submitting it. The session
    /// holds at most one staged mutation; commits happen in program order.
    pub fn stage(&mut self, command: ScheduleCommand) -> Result<(), SyncError> {
        if self.staged.is_some() {
            return Err(SyncError::Conflict(
                "a mutation is already staged in this session".to_string(),
            ));
        }
        let before = self.board.snapshot();
        let inverse = command.inverse(&self.board, &self.rules);
        let effect = command
            .apply(&mut self.board, &self.rules)
            .map_err(SyncError::Validation)?;
        debug!("Session {} staged {:?}", self.session_id, command);
        self.state = MutationState::OptimisticApplied;
        self.staged = Some(StagedMutation {
            command,
            effect,
            inverse,
            before,
        });
        Ok(())
    }

    /// Abandon the staged mutation before submission: pure local rollback,
    /// no network call. Returns false when nothing was staged.
    pub fn cancel_staged(&mut self) -> bool {
        match self.staged.take() {
            Some(staged) => {
                self.board = ScheduleBoard::from_snapshot(staged.before);
                self.state = MutationState::RolledBack;
                debug!("Session {} cancelled staged mutation", self.session_id);
                true
            }
            None => false,
        }
    }

    /// Submit the staged mutation. On conflict the whole mutation is
    /// retried exactly once against refreshed state; on transport failure
    /// or timeout the optimistic state is rolled back. `Ok(None)` means the
    /// command was a local no-op and nothing was submitted.
    pub async fn commit_staged(&mut self) -> Result<Option<CommitReceipt>, SyncError> {
        let staged = self.staged.take().ok_or_else(|| {
            SyncError::Conflict("no staged mutation to commit".to_string())
        })?;

        match self.submit_effect(&staged.effect).await {
            Ok(Some(receipt)) => {
                self.state = MutationState::Committed;
                self.last_inverse = staged.inverse;
                Ok(Some(receipt))
            }
            Ok(None) => {
                self.state = MutationState::Idle;
                Ok(None)
            }
            Err(SyncError::Conflict(reason)) => {
                debug!(
                    "Session {} lost a race ({}); retrying against refreshed state",
                    self.session_id, reason
                );
                self.board = ScheduleBoard::from_snapshot(staged.before);
                self.retry_once(staged.command).await
            }
            Err(err) => {
                self.board = ScheduleBoard::from_snapshot(staged.before);
                self.state = MutationState::RolledBack;
                Err(err)
            }
        }
    }

    /// Stage and submit in one step: the normal path for a user intent.
    pub async fn apply(
        &mut self,
        command: ScheduleCommand,
    ) -> Result<Option<CommitReceipt>, SyncError> {
        self.stage(command)?;
        self.commit_staged().await
    }

    /// Compensate the most recent committed mutation. Cancelling after
    /// submission cannot be a bare revert: the store may have committed, so
    /// an inverse command goes through the same optimistic cycle.
    pub async fn cancel_last_committed(
        &mut self,
    ) -> Result<Option<CommitReceipt>, SyncError> {
        match self.last_inverse.take() {
            Some(inverse) => self.apply(inverse).await,
            None => Ok(None),
        }
    }

    async fn retry_once(
        &mut self,
        command: ScheduleCommand,
    ) -> Result<Option<CommitReceipt>, SyncError> {
        // Refresh from the store, then re-validate and re-submit the same
        // intent exactly once.
        let snapshot = self.store.snapshot().await?;
        self.board = ScheduleBoard::from_snapshot(snapshot);
        self.board.heal_dangling();
        let before = self.board.snapshot();

        let inverse = command.inverse(&self.board, &self.rules);
        let effect = match command.apply(&mut self.board, &self.rules) {
            Ok(effect) => effect,
            Err(reason) => {
                self.state = MutationState::RolledBack;
                return Err(SyncError::Conflict(format!(
                    "state changed, please retry: {reason}"
                )));
            }
        };

        match self.submit_effect(&effect).await {
            Ok(Some(receipt)) => {
                self.state = MutationState::Committed;
                self.last_inverse = inverse;
                Ok(Some(receipt))
            }
            Ok(None) => {
                self.state = MutationState::Idle;
                Ok(None)
            }
            Err(err) => {
                self.board = ScheduleBoard::from_snapshot(before);
                self.state = MutationState::RolledBack;
                match err {
                    SyncError::Conflict(_) => Err(SyncError::Conflict(
                        "state changed, please retry".to_string(),
                    )),
                    other => Err(other),
                }
            }
        }
    }

    /// Submit one effect within the bounded commit wait, reconciling
    /// server-issued fields into local state on success. `None` means the
    /// effect had nothing to submit.
    async fn submit_effect(
        &mut self,
        effect: &CommandEffect,
    ) -> Result<Option<CommitReceipt>, SyncError> {
        let wait = self.commit_timeout;
        let store = Arc::clone(&self.store);
        match effect {
            CommandEffect::Nothing => Ok(None),
            CommandEffect::InsertAssignment(row) => {
                let row = row.clone();
                let committed =
                    bounded(wait, async move { store.insert_assignment(row).await }).await?;
                Ok(Some(self.reconcile_assignment(committed)))
            }
            CommandEffect::UpdateAssignment(row) => {
                let row = row.clone();
                let committed =
                    bounded(wait, async move { store.update_assignment(row).await }).await?;
                Ok(Some(self.reconcile_assignment(committed)))
            }
            CommandEffect::DeleteAssignment(id) => {
                let owned = id.clone();
                let seq =
                    bounded(wait, async move { store.delete_assignment(&owned).await }).await?;
                self.seen_seq.insert(id.clone(), seq);
                Ok(Some(CommitReceipt { commit_seq: seq }))
            }
            CommandEffect::MoveGroup(placements) => {
                let batch = placements.clone();
                let committed =
                    bounded(wait, async move { store.move_group(batch).await }).await?;
                let mut max_seq = 0;
                for row in committed {
                    max_seq = max_seq.max(self.reconcile_assignment(row).commit_seq);
                }
                Ok(Some(CommitReceipt { commit_seq: max_seq }))
            }
            CommandEffect::Reinstate {
                primary,
                subordinates,
            } => {
                let row = primary.clone();
                let insert_store = Arc::clone(&store);
                let committed =
                    bounded(wait, async move { insert_store.insert_assignment(row).await })
                        .await?;
                let mut receipt = self.reconcile_assignment(committed);
                for subordinate in subordinates {
                    let row = subordinate.clone();
                    let update_store = Arc::clone(&store);
                    let committed =
                        bounded(wait, async move { update_store.update_assignment(row).await })
                            .await?;
                    receipt = self.reconcile_assignment(committed);
                }
                Ok(Some(receipt))
            }
        }
    }

    fn reconcile_assignment(&mut self, committed: Committed<Assignment>) -> CommitReceipt {
        self.seen_seq
            .insert(committed.row.id.clone(), committed.commit_seq);
        self.board.set_assignment(committed.row);
        CommitReceipt {
            commit_seq: committed.commit_seq,
        }
    }

    // ---- remote change ingestion --------------------------------------

    /// Merge one change-feed event. Duplicates and stale deliveries are
    /// dropped by the per-row sequence high-water mark; merging rows other
    /// sessions committed never conflicts with local state, because the
    /// event carries what the store accepted last.
    pub fn ingest(&mut self, event: ChangeEvent) {
        let Some(row_id) = event.row_id() else {
            warn!("Session {} ignoring change event without row id", self.session_id);
            return;
        };
        if let Some(seen) = self.seen_seq.get(&row_id) {
            if event.commit_seq <= *seen {
                debug!(
                    "Session {} dropping stale event seq {} for {}",
                    self.session_id, event.commit_seq, row_id
                );
                return;
            }
        }
        self.seen_seq.insert(row_id.clone(), event.commit_seq);

        match (event.table, event.kind) {
            (EntityTable::Assignments, ChangeKind::Insert)
            | (EntityTable::Assignments, ChangeKind::Update) => {
                if let Some(row) = decode::<Assignment>(event.new_row) {
                    self.board.set_assignment(row);
                }
            }
            (EntityTable::Assignments, ChangeKind::Delete) => {
                self.board.remove_assignment(&row_id);
            }
            (EntityTable::Resources, ChangeKind::Insert)
            | (EntityTable::Resources, ChangeKind::Update) => {
                if let Some(row) = decode::<crate::model::Resource>(event.new_row) {
                    self.board.upsert_resource(row);
                }
            }
            (EntityTable::Resources, ChangeKind::Delete) => {
                self.board.remove_resource(&row_id);
            }
            (EntityTable::Jobs, ChangeKind::Insert) | (EntityTable::Jobs, ChangeKind::Update) => {
                if let Some(row) = decode::<crate::model::Job>(event.new_row) {
                    self.board.upsert_job(row);
                }
            }
            (EntityTable::Jobs, ChangeKind::Delete) => {
                self.board.remove_job(&row_id);
            }
        }

        // A parent may have vanished in a table we merged before its
        // children's updates arrived; never crash on it.
        self.board.heal_dangling();
    }

    /// Drain everything currently queued on a feed receiver.
    pub fn drain_events(&mut self, rx: &mut mpsc::Receiver<ChangeEvent>) -> usize {
        let mut ingested = 0;
        while let Ok(event) = rx.try_recv() {
            self.ingest(event);
            ingested += 1;
        }
        ingested
    }

    // ---- convenience intents ------------------------------------------

    /// Place a resource on a job row; returns the committed assignment.
    pub async fn place_resource(
        &mut self,
        resource_id: &str,
        job_id: &str,
        row_type: &str,
        position: i32,
    ) -> Result<Assignment, SyncError> {
        let assignment = Assignment::new(resource_id, job_id, row_type, position);
        let id = assignment.id.clone();
        self.apply(ScheduleCommand::Place { assignment }).await?;
        self.board
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::Validation(ValidationError::UnknownAssignment(id)))
    }

    pub async fn attach(
        &mut self,
        a_id: &str,
        b_id: &str,
    ) -> Result<Option<CommitReceipt>, SyncError> {
        self.apply(ScheduleCommand::Attach {
            a_id: a_id.to_string(),
            b_id: b_id.to_string(),
        })
        .await
    }

    /// `Ok(None)` when the id was already unattached and nothing was
    /// submitted.
    pub async fn detach(
        &mut self,
        assignment_id: &str,
    ) -> Result<Option<CommitReceipt>, SyncError> {
        self.apply(ScheduleCommand::Detach {
            assignment_id: assignment_id.to_string(),
        })
        .await
    }

    pub async fn remove_assignment(
        &mut self,
        assignment_id: &str,
    ) -> Result<Option<CommitReceipt>, SyncError> {
        self.apply(ScheduleCommand::Remove {
            assignment_id: assignment_id.to_string(),
        })
        .await
    }

    pub async fn set_time_slot(
        &mut self,
        assignment_id: &str,
        time_slot: Option<TimeSlot>,
    ) -> Result<Option<CommitReceipt>, SyncError> {
        self.apply(ScheduleCommand::SetTimeSlot {
            assignment_id: assignment_id.to_string(),
            time_slot,
        })
        .await
    }

    /// Relocate a primary and its whole closure as one atomic operation.
    pub async fn move_group(
        &mut self,
        primary_id: &str,
        job_id: &str,
        row_type: &str,
        position: i32,
    ) -> Result<Option<CommitReceipt>, SyncError> {
        self.apply(ScheduleCommand::MoveGroup {
            primary_id: primary_id.to_string(),
            job_id: job_id.to_string(),
            row_type: row_type.to_string(),
            position,
        })
        .await
    }
}

/// Await a store response within the commit window. The submission keeps
/// running on its own task after expiry, so a late success still commits
/// and comes back to every session as a remote change event.
async fn bounded<T: Send + 'static>(
    wait: Duration,
    fut: impl std::future::Future<Output = Result<T, StoreError>> + Send + 'static,
) -> Result<T, SyncError> {
    let mut handle = tokio::spawn(fut);
    match timeout(wait, &mut handle).await {
        Ok(Ok(result)) => result.map_err(SyncError::from),
        Ok(Err(join_err)) => Err(SyncError::Transport(format!(
            "commit task failed: {join_err}"
        ))),
        Err(_) => Err(SyncError::Transport(
            "commit acknowledgment timed out".to_string(),
        )),
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Option<serde_json::Value>) -> Option<T> {
    let value = value?;
    match serde_json::from_value(value) {
        Ok(row) => Some(row),
        Err(err) => {
            warn!("Discarding undecodable change-feed row: {}", err);
            None
        }
    }
}
