use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ValidationError;

/// Broad resource classification, derived from the concrete type via the
/// rule set's category map and never stored on a record.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceCategory {
    Personnel,
    Equipment,
    Vehicle,
}

impl ResourceCategory {
    /// Personnel on one side, machinery on the other. Attachment direction
    /// is canonicalized over this split, not over drag order.
    pub fn is_personnel(&self) -> bool {
        matches!(self, ResourceCategory::Personnel)
    }
}

/// A schedulable resource: a person, a machine or a vehicle. Identity is
/// immutable; descriptive fields may change.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Resource {
    pub id: String,
    pub resource_type: String,
    pub name: String,
    pub identifier: String,
    pub on_site: bool,
}

impl Resource {
    pub fn new(resource_type: &str, name: &str, identifier: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            identifier: identifier.to_string(),
            on_site: false,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Shift {
    Day,
    Night,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub job_type: String,
    pub shift: Shift,
    pub schedule_date: NaiveDate,
}

impl Job {
    pub fn new(name: &str, job_type: &str, shift: Shift, schedule_date: NaiveDate) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            job_type: job_type.to_string(),
            shift,
            schedule_date,
        }
    }
}

/// Working window within a shift, minutes since midnight.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeSlot {
    pub start_minute: i32,
    pub end_minute: i32,
}

impl TimeSlot {
    pub fn new(start_minute: i32, end_minute: i32) -> Result<Self, ValidationError> {
        if start_minute < 0 || end_minute <= start_minute {
            return Err(ValidationError::InvalidTimeSlot {
                start_minute,
                end_minute,
            });
        }
        Ok(Self {
            start_minute,
            end_minute,
        })
    }
}

/// Placement of one resource on one job row. `attached_to` is a weak
/// reference to a primary assignment on the same job; it expresses a
/// co-location relation, not ownership.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Assignment {
    pub id: String,
    pub resource_id: String,
    pub job_id: String,
    pub row_type: String,
    pub position: i32,
    pub attached_to: Option<String>,
    pub time_slot: Option<TimeSlot>,
}

impl Assignment {
    pub fn new(resource_id: &str, job_id: &str, row_type: &str, position: i32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            resource_id: resource_id.to_string(),
            job_id: job_id.to_string(),
            row_type: row_type.to_string(),
            position,
            attached_to: None,
            time_slot: None,
        }
    }
}

/// Permission for one directed type pair. Keyed by canonical direction
/// (personnel side is the source in mixed pairs).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AttachmentRule {
    pub source_type: String,
    pub target_type: String,
    pub can_attach: bool,
    pub is_required: bool,
    pub max_count: i32,
}

/// Which resource types a row admits. Rows without a rule are unrestricted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DropRule {
    pub row_type: String,
    pub allowed_types: Vec<String>,
}

/// Point-in-time copy of the board, consumed read-only by export and
/// estimation modules and used for persistence round trips.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ScheduleSnapshot {
    pub jobs: Vec<Job>,
    pub resources: Vec<Resource>,
    pub assignments: Vec<Assignment>,
}
