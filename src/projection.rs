//! Read-only view models for presentation layers.
//!
//! Everything here is computed from the board and the rule set; nothing
//! mutates. The UI reads these to decorate magnets without re-implementing
//! rule logic.

use serde::{Deserialize, Serialize};

use crate::board::ScheduleBoard;
use crate::rules::RuleSet;

/// Per-assignment decoration derived from the attachment graph.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct VisualState {
    /// All `is_required` source types are present on this assignment
    pub has_required_role: bool,
    /// Participates in an attachment, on either end
    pub is_attached: bool,
    /// Could act as a primary for at least one more attachment
    pub can_receive_attachment: bool,
}

/// How many more resources of `source_type` may attach to the given
/// primary assignment.
pub fn remaining_capacity(
    board: &ScheduleBoard,
    rules: &RuleSet,
    primary_id: &str,
    source_type: &str,
) -> i32 {
    let Some(primary) = board.get(primary_id) else {
        return 0;
    };
    let Some(target) = board.get_resource(&primary.resource_id) else {
        return 0;
    };
    let current = board.attachment_count_of_type(primary_id, source_type);
    rules.remaining_capacity(source_type, &target.resource_type, current)
}

/// True when no source type has remaining capacity on this assignment.
/// An assignment whose type admits no attachments at all is trivially full.
pub fn is_attachment_full(board: &ScheduleBoard, rules: &RuleSet, primary_id: &str) -> bool {
    let Some(primary) = board.get(primary_id) else {
        return true;
    };
    let Some(target) = board.get_resource(&primary.resource_id) else {
        return true;
    };
    rules
        .attachable_source_types(&target.resource_type)
        .iter()
        .all(|source_type| remaining_capacity(board, rules, primary_id, source_type) == 0)
}

pub fn visual_state(board: &ScheduleBoard, rules: &RuleSet, assignment_id: &str) -> VisualState {
    let Some(assignment) = board.get(assignment_id) else {
        return VisualState {
            has_required_role: false,
            is_attached: false,
            can_receive_attachment: false,
        };
    };

    let attachments = board.attachments_of(assignment_id);
    let is_attached = assignment.attached_to.is_some() || !attachments.is_empty();

    let has_required_role = match board.get_resource(&assignment.resource_id) {
        Some(resource) => rules
            .required_source_types(&resource.resource_type)
            .iter()
            .all(|required| board.attachment_count_of_type(assignment_id, required) > 0),
        None => false,
    };

    // Subordinates cannot take attachments of their own (one-level depth)
    let can_receive_attachment =
        assignment.attached_to.is_none() && !is_attachment_full(board, rules, assignment_id);

    VisualState {
        has_required_role,
        is_attached,
        can_receive_attachment,
    }
}
