//! In-memory assignment graph and its maintenance operations.
//!
//! `ScheduleBoard` is an explicit service object owning its own maps; there
//! is no process-wide singleton. All mutations are all-or-nothing: a failed
//! validation leaves the board untouched and returns a typed reason.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::errors::{GraphIntegrityError, ValidationError};
use crate::model::{Assignment, Job, Resource, ScheduleSnapshot, TimeSlot};
use crate::rules::RuleSet;

#[derive(Clone, Debug, Default)]
pub struct ScheduleBoard {
    resources: IndexMap<String, Resource>,
    jobs: IndexMap<String, Job>,
    assignments: IndexMap<String, Assignment>,
}

impl ScheduleBoard {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- resources and jobs -------------------------------------------

    pub fn upsert_resource(&mut self, resource: Resource) {
        self.resources.insert(resource.id.clone(), resource);
    }

    pub fn get_resource(&self, id: &str) -> Option<&Resource> {
        self.resources.get(id)
    }

    /// Remove a resource and cascade: its assignments are destroyed and
    /// their subordinates' parent pointers cleared.
    pub fn remove_resource(&mut self, id: &str) -> Vec<String> {
        let doomed: Vec<String> = self
            .assignments
            .values()
            .filter(|a| a.resource_id == id)
            .map(|a| a.id.clone())
            .collect();
        for assignment_id in &doomed {
            self.remove_assignment(assignment_id);
        }
        self.resources.shift_remove(id);
        doomed
    }

    pub fn upsert_job(&mut self, job: Job) {
        self.jobs.insert(job.id.clone(), job);
    }

    pub fn get_job(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn remove_job(&mut self, id: &str) -> Vec<String> {
        let doomed: Vec<String> = self
            .assignments
            .values()
            .filter(|a| a.job_id == id)
            .map(|a| a.id.clone())
            .collect();
        for assignment_id in &doomed {
            self.remove_assignment(assignment_id);
        }
        self.jobs.shift_remove(id);
        doomed
    }

    // ---- assignments --------------------------------------------------

    pub fn get(&self, id: &str) -> Option<&Assignment> {
        self.assignments.get(id)
    }

    pub fn assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.assignments.values()
    }

    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }

    /// Place a resource on a job row, validating the drop matrix and
    /// position uniqueness.
    pub fn place(&mut self, assignment: Assignment, rules: &RuleSet) -> Result<(), ValidationError> {
        let resource = self
            .resources
            .get(&assignment.resource_id)
            .ok_or_else(|| ValidationError::UnknownResource(assignment.resource_id.clone()))?;
        if !self.jobs.contains_key(&assignment.job_id) {
            return Err(ValidationError::UnknownJob(assignment.job_id.clone()));
        }

        rules.can_drop(&resource.resource_type, &assignment.row_type)?;

        if self.position_occupied(
            &assignment.job_id,
            &assignment.row_type,
            assignment.position,
            &HashSet::new(),
        ) {
            return Err(ValidationError::PositionTaken {
                job_id: assignment.job_id.clone(),
                row_type: assignment.row_type.clone(),
                position: assignment.position,
            });
        }

        debug!(
            "Placing resource {} on job {} row {} position {}",
            assignment.resource_id, assignment.job_id, assignment.row_type, assignment.position
        );
        self.assignments.insert(assignment.id.clone(), assignment);
        Ok(())
    }

    /// Upsert without validation. Used when merging rows the store has
    /// already accepted; the store is the arbiter, not this board.
    pub fn set_assignment(&mut self, assignment: Assignment) {
        self.assignments.insert(assignment.id.clone(), assignment);
    }

    /// Destroy an assignment, clearing parent pointers of its subordinates
    /// so no dangling reference survives.
    pub fn remove_assignment(&mut self, id: &str) -> Option<Assignment> {
        let removed = self.assignments.shift_remove(id)?;
        for subordinate in self.assignments.values_mut() {
            if subordinate.attached_to.as_deref() == Some(id) {
                debug!(
                    "Clearing parent pointer of {} after removal of {}",
                    subordinate.id, id
                );
                subordinate.attached_to = None;
            }
        }
        Some(removed)
    }

    pub fn set_time_slot(
        &mut self,
        assignment_id: &str,
        time_slot: Option<TimeSlot>,
    ) -> Result<(), ValidationError> {
        let assignment = self
            .assignments
            .get_mut(assignment_id)
            .ok_or_else(|| ValidationError::UnknownAssignment(assignment_id.to_string()))?;
        assignment.time_slot = time_slot;
        Ok(())
    }

    // ---- attachment edges ---------------------------------------------

    /// Link two assignments. The pair may arrive in drag order; the
    /// canonical direction is resolved here, so the returned tuple names
    /// the actual (subordinate, primary).
    pub fn attach(
        &mut self,
        a_id: &str,
        b_id: &str,
        rules: &RuleSet,
    ) -> Result<(String, String), ValidationError> {
        let a = self
            .assignments
            .get(a_id)
            .ok_or_else(|| ValidationError::UnknownAssignment(a_id.to_string()))?;
        let b = self
            .assignments
            .get(b_id)
            .ok_or_else(|| ValidationError::UnknownAssignment(b_id.to_string()))?;

        let a_resource = self
            .resources
            .get(&a.resource_id)
            .ok_or_else(|| ValidationError::UnknownResource(a.resource_id.clone()))?;
        let b_resource = self
            .resources
            .get(&b.resource_id)
            .ok_or_else(|| ValidationError::UnknownResource(b.resource_id.clone()))?;

        let (source_res, _target_res) = rules.resolve_direction(a_resource, b_resource);
        let (subordinate_id, primary_id) = if source_res.id == a_resource.id {
            (a.id.clone(), b.id.clone())
        } else {
            (b.id.clone(), a.id.clone())
        };

        let subordinate = &self.assignments[&subordinate_id];
        let primary = &self.assignments[&primary_id];

        if subordinate.job_id != primary.job_id {
            return Err(ValidationError::CrossJobAttachment {
                subordinate: subordinate_id,
                primary: primary_id,
            });
        }
        if subordinate.attached_to.is_some() {
            return Err(ValidationError::AlreadyAttached(subordinate_id));
        }
        // Depth is one level: a primary that is itself attached, or a
        // subordinate that already carries attachments, would chain.
        if primary.attached_to.as_deref() == Some(subordinate_id.as_str()) {
            return Err(ValidationError::CycleDetected {
                subordinate: subordinate_id,
                primary: primary_id,
            });
        }
        if primary.attached_to.is_some() {
            return Err(ValidationError::DepthExceeded {
                assignment_id: primary_id,
            });
        }
        if !self.attachments_of(&subordinate_id).is_empty() {
            return Err(ValidationError::DepthExceeded {
                assignment_id: subordinate_id,
            });
        }

        let source_type = self.resources[&subordinate.resource_id].resource_type.clone();
        let target_type = self.resources[&primary.resource_id].resource_type.clone();
        let current = self.attachment_count_of_type(&primary_id, &source_type);
        rules.can_attach(&source_type, &target_type, current)?;

        debug!("Attaching {} -> {}", subordinate_id, primary_id);
        self.assignments
            .get_mut(&subordinate_id)
            .expect("subordinate looked up above")
            .attached_to = Some(primary_id.clone());
        Ok((subordinate_id, primary_id))
    }

    /// Clear an assignment's parent pointer. Idempotent: detaching an
    /// unattached or unknown id returns false and mutates nothing.
    pub fn detach(&mut self, assignment_id: &str) -> bool {
        match self.assignments.get_mut(assignment_id) {
            Some(a) if a.attached_to.is_some() => {
                debug!("Detaching {}", assignment_id);
                a.attached_to = None;
                true
            }
            _ => false,
        }
    }

    /// Assignments whose parent pointer is `id`.
    pub fn attachments_of(&self, id: &str) -> Vec<&Assignment> {
        self.assignments
            .values()
            .filter(|a| a.attached_to.as_deref() == Some(id))
            .collect()
    }

    /// Count of attachments on `primary_id` whose resource is of
    /// `source_type`.
    pub fn attachment_count_of_type(&self, primary_id: &str, source_type: &str) -> i32 {
        self.attachments_of(primary_id)
            .iter()
            .filter(|a| {
                self.resources
                    .get(&a.resource_id)
                    .map(|r| r.resource_type == source_type)
                    .unwrap_or(false)
            })
            .count() as i32
    }

    /// The primary plus everything transitively attached to it, primary
    /// first. Depth is one level today; written transitively so deeper
    /// chains would still move as one unit.
    pub fn closure(&self, primary_id: &str) -> Vec<String> {
        let mut members = vec![primary_id.to_string()];
        let mut cursor = 0;
        while cursor < members.len() {
            let parent = members[cursor].clone();
            for child in self.attachments_of(&parent) {
                if !members.iter().any(|m| m == &child.id) {
                    members.push(child.id.clone());
                }
            }
            cursor += 1;
        }
        members
    }

    // ---- row geometry -------------------------------------------------

    /// Assignments in one (job, row), ascending by position.
    pub fn assignments_in_row(&self, job_id: &str, row_type: &str) -> Vec<&Assignment> {
        let mut row: Vec<&Assignment> = self
            .assignments
            .values()
            .filter(|a| a.job_id == job_id && a.row_type == row_type)
            .collect();
        row.sort_by_key(|a| a.position);
        row
    }

    pub fn position_occupied(
        &self,
        job_id: &str,
        row_type: &str,
        position: i32,
        exclude: &HashSet<String>,
    ) -> bool {
        self.assignments.values().any(|a| {
            a.job_id == job_id
                && a.row_type == row_type
                && a.position == position
                && !exclude.contains(&a.id)
        })
    }

    /// The next `count` free positions in a row, ascending from `from`,
    /// treating assignments in `exclude` as absent.
    pub fn next_free_positions(
        &self,
        job_id: &str,
        row_type: &str,
        from: i32,
        count: usize,
        exclude: &HashSet<String>,
    ) -> Vec<i32> {
        let mut slots = Vec::with_capacity(count);
        let mut cursor = from;
        while slots.len() < count {
            if !self.position_occupied(job_id, row_type, cursor, exclude) {
                slots.push(cursor);
            }
            cursor += 1;
        }
        slots
    }

    // ---- integrity ----------------------------------------------------

    /// Scan for broken references. Findings are reported, not panicked on.
    pub fn verify_integrity(&self) -> Vec<GraphIntegrityError> {
        let mut findings = Vec::new();
        for assignment in self.assignments.values() {
            if let Some(parent) = &assignment.attached_to {
                if !self.assignments.contains_key(parent) {
                    findings.push(GraphIntegrityError::DanglingParent {
                        assignment_id: assignment.id.clone(),
                        missing_parent: parent.clone(),
                    });
                }
            }
            if !self.resources.contains_key(&assignment.resource_id) {
                findings.push(GraphIntegrityError::MissingResource {
                    assignment_id: assignment.id.clone(),
                    resource_id: assignment.resource_id.clone(),
                });
            }
            if !self.jobs.contains_key(&assignment.job_id) {
                findings.push(GraphIntegrityError::MissingJob {
                    assignment_id: assignment.id.clone(),
                    job_id: assignment.job_id.clone(),
                });
            }
        }
        findings
    }

    /// Clear dangling parent pointers in place, returning how many were
    /// healed. A parent deleted by another session must never crash this
    /// one.
    pub fn heal_dangling(&mut self) -> usize {
        let known: HashSet<String> = self.assignments.keys().cloned().collect();
        let mut healed = 0;
        for assignment in self.assignments.values_mut() {
            if let Some(parent) = &assignment.attached_to {
                if !known.contains(parent) {
                    warn!(
                        "Healing dangling attachment: {} pointed at missing {}",
                        assignment.id, parent
                    );
                    assignment.attached_to = None;
                    healed += 1;
                }
            }
        }
        healed
    }

    // ---- snapshot -----------------------------------------------------

    pub fn snapshot(&self) -> ScheduleSnapshot {
        ScheduleSnapshot {
            jobs: self.jobs.values().cloned().collect(),
            resources: self.resources.values().cloned().collect(),
            assignments: self.assignments.values().cloned().collect(),
        }
    }

    pub fn from_snapshot(snapshot: ScheduleSnapshot) -> Self {
        let mut board = Self::new();
        for job in snapshot.jobs {
            board.upsert_job(job);
        }
        for resource in snapshot.resources {
            board.upsert_resource(resource);
        }
        for assignment in snapshot.assignments {
            board.set_assignment(assignment);
        }
        board
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(path, json)
            .with_context(|| format!("writing snapshot to {}", path.display()))?;
        Ok(())
    }

    pub fn load_snapshot(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading snapshot from {}", path.display()))?;
        let snapshot: ScheduleSnapshot = serde_json::from_str(&json)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn stats(&self) -> String {
        format!(
            "Jobs: {}, Resources: {}, Assignments: {}",
            self.jobs.len(),
            self.resources.len(),
            self.assignments.len()
        )
    }
}
