//! Error types for scheduling operations
//!
//! Rule and graph failures are expected outcomes and are returned as typed
//! values, never panics. Only infrastructure faults (store unreachable)
//! surface at the synchronization seam, which always has a rollback path.

use thiserror::Error;

/// Rejections raised before any mutation takes place.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// No attachment rule exists for the (source, target) type pair
    #[error("no attachment rule for '{source_type}' -> '{target_type}'")]
    RuleNotFound {
        source_type: String,
        target_type: String,
    },

    /// An attachment rule exists but forbids the combination
    #[error("'{source_type}' may not attach to '{target_type}'")]
    AttachmentDisallowed {
        source_type: String,
        target_type: String,
    },

    /// The target already carries the maximum number of this source type
    #[error("'{target_type}' already has {max_count} attached '{source_type}'")]
    CapacityExceeded {
        source_type: String,
        target_type: String,
        max_count: i32,
    },

    /// The row does not admit this resource type
    #[error("'{resource_type}' may not be placed on row '{row_type}'")]
    DropDisallowed {
        resource_type: String,
        row_type: String,
    },

    /// Attaching would close a parent loop
    #[error("attachment cycle between '{subordinate}' and '{primary}'")]
    CycleDetected { subordinate: String, primary: String },

    /// Attachments are one level deep; the chosen primary is itself
    /// attached, or the subordinate already carries attachments
    #[error("attachment depth limit: '{assignment_id}' cannot take part as requested")]
    DepthExceeded { assignment_id: String },

    /// The subordinate already has a parent
    #[error("assignment '{0}' is already attached")]
    AlreadyAttached(String),

    /// Attachments must stay within a single job
    #[error("'{subordinate}' and '{primary}' are on different jobs")]
    CrossJobAttachment { subordinate: String, primary: String },

    /// Position already occupied within (job, row)
    #[error("position {position} on job '{job_id}' row '{row_type}' is taken")]
    PositionTaken {
        job_id: String,
        row_type: String,
        position: i32,
    },

    #[error("assignment '{0}' not found")]
    UnknownAssignment(String),

    #[error("resource '{0}' not found")]
    UnknownResource(String),

    #[error("job '{0}' not found")]
    UnknownJob(String),

    #[error("time slot {start_minute}..{end_minute} is not a valid interval")]
    InvalidTimeSlot { start_minute: i32, end_minute: i32 },
}

impl ValidationError {
    /// Machine-readable reason for presentation layers.
    pub fn error_code(&self) -> &'static str {
        match self {
            ValidationError::RuleNotFound { .. } => "RULE_NOT_FOUND",
            ValidationError::AttachmentDisallowed { .. } => "ATTACHMENT_DISALLOWED",
            ValidationError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            ValidationError::DropDisallowed { .. } => "DROP_DISALLOWED",
            ValidationError::CycleDetected { .. } => "CYCLE_DETECTED",
            ValidationError::DepthExceeded { .. } | ValidationError::AlreadyAttached(_) => {
                "DEPTH_EXCEEDED"
            }
            ValidationError::CrossJobAttachment { .. } => "CROSS_JOB",
            ValidationError::PositionTaken { .. } => "POSITION_TAKEN",
            ValidationError::UnknownAssignment(_)
            | ValidationError::UnknownResource(_)
            | ValidationError::UnknownJob(_) => "NOT_FOUND",
            ValidationError::InvalidTimeSlot { .. } => "INVALID_TIME_SLOT",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ValidationError::UnknownAssignment(_)
                | ValidationError::UnknownResource(_)
                | ValidationError::UnknownJob(_)
        )
    }
}

/// Failures reported by the storage collaborator.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The write lost a race with a concurrent commit
    #[error("conflict: {0}")]
    Conflict(String),

    /// A store constraint rejected the write
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// Referenced row does not exist
    #[error("row not found: {0}")]
    NotFound(String),

    /// Store unreachable or refused the connection
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A dangling reference discovered in the attachment graph. Detected
/// references are self-healed by clearing them, never propagated as a crash.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphIntegrityError {
    #[error("assignment '{assignment_id}' attached to missing assignment '{missing_parent}'")]
    DanglingParent {
        assignment_id: String,
        missing_parent: String,
    },

    #[error("assignment '{assignment_id}' references missing resource '{resource_id}'")]
    MissingResource {
        assignment_id: String,
        resource_id: String,
    },

    #[error("assignment '{assignment_id}' references missing job '{job_id}'")]
    MissingJob {
        assignment_id: String,
        job_id: String,
    },
}

/// Umbrella error at the session seam.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Lost a race with a concurrent commit; state has been refreshed,
    /// caller may retry
    #[error("state changed concurrently: {0}")]
    Conflict(String),

    /// Network failure or commit acknowledgment timeout; the optimistic
    /// mutation has been rolled back
    #[error("transport failure: {0}")]
    Transport(String),

    #[error(transparent)]
    Integrity(#[from] GraphIntegrityError),
}

impl SyncError {
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::Validation(v) => v.error_code(),
            SyncError::Conflict(_) => "CONFLICT",
            SyncError::Transport(_) => "TRANSPORT",
            SyncError::Integrity(_) => "GRAPH_INTEGRITY",
        }
    }

    /// Whether the caller may simply retry the same intent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Conflict(_) | SyncError::Transport(_))
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) | StoreError::Constraint(msg) => SyncError::Conflict(msg),
            StoreError::NotFound(msg) => SyncError::Conflict(format!("row vanished: {msg}")),
            StoreError::Unavailable(msg) => SyncError::Transport(msg),
        }
    }
}
