//! Atomic relocation of an attachment closure.
//!
//! Planning is pure: it reads the board, validates every member against the
//! destination, and emits the placement batch the store commits as one
//! transaction. A half-moved group (primary relocated, subordinate left
//! behind) is impossible by construction: either the whole plan validates
//! and commits, or nothing changes.

use std::collections::HashSet;

use tracing::debug;

use crate::board::ScheduleBoard;
use crate::errors::ValidationError;
use crate::rules::RuleSet;
use crate::store::MovePlacement;

/// Compute the destination placement for every member of the primary's
/// closure. The primary gets the requested slot; subordinates take the next
/// free slots in the same row, skipping slots held by non-members.
pub fn plan_group_move(
    board: &ScheduleBoard,
    rules: &RuleSet,
    primary_id: &str,
    target_job_id: &str,
    target_row_type: &str,
    target_position: i32,
) -> Result<Vec<MovePlacement>, ValidationError> {
    if board.get(primary_id).is_none() {
        return Err(ValidationError::UnknownAssignment(primary_id.to_string()));
    }
    if board.get_job(target_job_id).is_none() {
        return Err(ValidationError::UnknownJob(target_job_id.to_string()));
    }

    let members = board.closure(primary_id);
    debug!(
        "Planning group move of {} ({} members) to job {} row {} position {}",
        primary_id,
        members.len(),
        target_job_id,
        target_row_type,
        target_position
    );

    // Every member must be admissible on the destination row before any
    // member is altered.
    for member_id in &members {
        let member = board
            .get(member_id)
            .ok_or_else(|| ValidationError::UnknownAssignment(member_id.clone()))?;
        let resource = board
            .get_resource(&member.resource_id)
            .ok_or_else(|| ValidationError::UnknownResource(member.resource_id.clone()))?;
        rules.can_drop(&resource.resource_type, target_row_type)?;
    }

    let moving: HashSet<String> = members.iter().cloned().collect();

    if board.position_occupied(target_job_id, target_row_type, target_position, &moving) {
        return Err(ValidationError::PositionTaken {
            job_id: target_job_id.to_string(),
            row_type: target_row_type.to_string(),
            position: target_position,
        });
    }

    let mut placements = Vec::with_capacity(members.len());
    placements.push(MovePlacement {
        assignment_id: primary_id.to_string(),
        job_id: target_job_id.to_string(),
        row_type: target_row_type.to_string(),
        position: target_position,
    });

    let slots = board.next_free_positions(
        target_job_id,
        target_row_type,
        target_position + 1,
        members.len() - 1,
        &moving,
    );
    for (member_id, position) in members.iter().skip(1).zip(slots) {
        placements.push(MovePlacement {
            assignment_id: member_id.clone(),
            job_id: target_job_id.to_string(),
            row_type: target_row_type.to_string(),
            position,
        });
    }

    Ok(placements)
}

/// Inverse plan: where the members sit right now, for compensating a move
/// that must be undone after submission.
pub fn current_placements(board: &ScheduleBoard, member_ids: &[String]) -> Vec<MovePlacement> {
    member_ids
        .iter()
        .filter_map(|id| board.get(id))
        .map(|a| MovePlacement {
            assignment_id: a.id.clone(),
            job_id: a.job_id.clone(),
            row_type: a.row_type.clone(),
            position: a.position,
        })
        .collect()
}
