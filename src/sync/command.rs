//! Undoable mutation commands.
//!
//! Every user intent is a command with a local `apply` and a computable
//! `inverse`, so optimistic rollback and post-commit compensation both have
//! a defined path instead of ad hoc state patching.

use serde::{Deserialize, Serialize};

use crate::board::ScheduleBoard;
use crate::errors::ValidationError;
use crate::group_move::{current_placements, plan_group_move};
use crate::model::{Assignment, TimeSlot};
use crate::rules::RuleSet;
use crate::store::MovePlacement;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum ScheduleCommand {
    /// Place a resource on a job row
    Place { assignment: Assignment },
    /// Remove an assignment from its job
    Remove { assignment_id: String },
    /// Link a dragged pair; canonical direction is resolved on apply
    Attach { a_id: String, b_id: String },
    Detach { assignment_id: String },
    SetTimeSlot {
        assignment_id: String,
        time_slot: Option<TimeSlot>,
    },
    /// Relocate a primary and its whole closure
    MoveGroup {
        primary_id: String,
        job_id: String,
        row_type: String,
        position: i32,
    },
    /// Re-apply recorded placements verbatim; the inverse of a group move
    Restore { placements: Vec<MovePlacement> },
    /// Re-insert a removed assignment and re-link the subordinates its
    /// removal detached; the inverse of `Remove`
    Reinstate {
        assignment: Assignment,
        subordinate_ids: Vec<String>,
    },
}

/// What the store must be told after a successful local apply.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandEffect {
    InsertAssignment(Assignment),
    UpdateAssignment(Assignment),
    DeleteAssignment(String),
    MoveGroup(Vec<MovePlacement>),
    /// Insert the primary again and re-point its former subordinates at it
    Reinstate {
        primary: Assignment,
        subordinates: Vec<Assignment>,
    },
    /// Local no-op (idempotent detach of an unattached id); nothing to
    /// submit
    Nothing,
}

impl ScheduleCommand {
    /// Apply the mutation to local state, returning the store submission it
    /// implies. On any failure the board is untouched.
    pub fn apply(
        &self,
        board: &mut ScheduleBoard,
        rules: &RuleSet,
    ) -> Result<CommandEffect, ValidationError> {
        match self {
            ScheduleCommand::Place { assignment } => {
                board.place(assignment.clone(), rules)?;
                Ok(CommandEffect::InsertAssignment(assignment.clone()))
            }
            ScheduleCommand::Remove { assignment_id } => {
                board
                    .remove_assignment(assignment_id)
                    .ok_or_else(|| ValidationError::UnknownAssignment(assignment_id.clone()))?;
                Ok(CommandEffect::DeleteAssignment(assignment_id.clone()))
            }
            ScheduleCommand::Attach { a_id, b_id } => {
                let (subordinate_id, _primary_id) = board.attach(a_id, b_id, rules)?;
                let row = board
                    .get(&subordinate_id)
                    .expect("attached row exists")
                    .clone();
                Ok(CommandEffect::UpdateAssignment(row))
            }
            ScheduleCommand::Detach { assignment_id } => {
                if board.detach(assignment_id) {
                    let row = board
                        .get(assignment_id)
                        .expect("detached row exists")
                        .clone();
                    Ok(CommandEffect::UpdateAssignment(row))
                } else {
                    Ok(CommandEffect::Nothing)
                }
            }
            ScheduleCommand::SetTimeSlot {
                assignment_id,
                time_slot,
            } => {
                board.set_time_slot(assignment_id, *time_slot)?;
                let row = board
                    .get(assignment_id)
                    .expect("updated row exists")
                    .clone();
                Ok(CommandEffect::UpdateAssignment(row))
            }
            ScheduleCommand::MoveGroup {
                primary_id,
                job_id,
                row_type,
                position,
            } => {
                let placements =
                    plan_group_move(board, rules, primary_id, job_id, row_type, *position)?;
                apply_placements(board, &placements);
                Ok(CommandEffect::MoveGroup(placements))
            }
            ScheduleCommand::Restore { placements } => {
                apply_placements(board, placements);
                Ok(CommandEffect::MoveGroup(placements.clone()))
            }
            ScheduleCommand::Reinstate {
                assignment,
                subordinate_ids,
            } => {
                board.place(assignment.clone(), rules)?;
                // The rows were linked when the removal cascaded; re-point
                // them without re-running attach validation.
                let mut subordinates = Vec::new();
                for id in subordinate_ids {
                    if let Some(row) = board.get(id) {
                        let mut row = row.clone();
                        row.attached_to = Some(assignment.id.clone());
                        board.set_assignment(row.clone());
                        subordinates.push(row);
                    }
                }
                Ok(CommandEffect::Reinstate {
                    primary: assignment.clone(),
                    subordinates,
                })
            }
        }
    }

    /// The compensating command, computed against the pre-apply board.
    /// `None` means the command needs no compensation (it will be a local
    /// no-op).
    pub fn inverse(&self, board: &ScheduleBoard, rules: &RuleSet) -> Option<ScheduleCommand> {
        match self {
            ScheduleCommand::Place { assignment } => Some(ScheduleCommand::Remove {
                assignment_id: assignment.id.clone(),
            }),
            ScheduleCommand::Remove { assignment_id } => {
                // Removal cascades attached_to = None onto subordinates, so
                // the undo must restore those edges, not just the row.
                let old = board.get(assignment_id)?.clone();
                let subordinate_ids = board
                    .attachments_of(assignment_id)
                    .iter()
                    .map(|a| a.id.clone())
                    .collect();
                Some(ScheduleCommand::Reinstate {
                    assignment: old,
                    subordinate_ids,
                })
            }
            ScheduleCommand::Attach { a_id, b_id } => {
                // Resolve the same canonical direction apply will use
                let a = board.get(a_id)?;
                let b = board.get(b_id)?;
                let a_res = board.get_resource(&a.resource_id)?;
                let b_res = board.get_resource(&b.resource_id)?;
                let (source, _target) = rules.resolve_direction(a_res, b_res);
                let subordinate_id = if source.id == a_res.id {
                    a.id.clone()
                } else {
                    b.id.clone()
                };
                Some(ScheduleCommand::Detach {
                    assignment_id: subordinate_id,
                })
            }
            ScheduleCommand::Detach { assignment_id } => {
                let parent = board.get(assignment_id)?.attached_to.clone()?;
                Some(ScheduleCommand::Attach {
                    a_id: assignment_id.clone(),
                    b_id: parent,
                })
            }
            ScheduleCommand::SetTimeSlot { assignment_id, .. } => {
                let old = board.get(assignment_id)?;
                Some(ScheduleCommand::SetTimeSlot {
                    assignment_id: assignment_id.clone(),
                    time_slot: old.time_slot,
                })
            }
            ScheduleCommand::MoveGroup { primary_id, .. } => {
                let members = board.closure(primary_id);
                Some(ScheduleCommand::Restore {
                    placements: current_placements(board, &members),
                })
            }
            ScheduleCommand::Restore { placements } => {
                let members: Vec<String> =
                    placements.iter().map(|p| p.assignment_id.clone()).collect();
                Some(ScheduleCommand::Restore {
                    placements: current_placements(board, &members),
                })
            }
            ScheduleCommand::Reinstate { assignment, .. } => Some(ScheduleCommand::Remove {
                assignment_id: assignment.id.clone(),
            }),
        }
    }
}

fn apply_placements(board: &mut ScheduleBoard, placements: &[MovePlacement]) {
    for placement in placements {
        if let Some(row) = board.get(&placement.assignment_id) {
            let mut row = row.clone();
            row.job_id = placement.job_id.clone();
            row.row_type = placement.row_type.clone();
            row.position = placement.position;
            board.set_assignment(row);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttachmentRule, Job, Resource, ResourceCategory, Shift};
    use chrono::NaiveDate;
    use std::collections::HashMap;

    fn fixture() -> (ScheduleBoard, RuleSet, String, String, String) {
        let mut categories = HashMap::new();
        categories.insert("operator".to_string(), ResourceCategory::Personnel);
        categories.insert("excavator".to_string(), ResourceCategory::Equipment);
        let rules = RuleSet {
            attachment_rules: vec![AttachmentRule {
                source_type: "operator".to_string(),
                target_type: "excavator".to_string(),
                can_attach: true,
                is_required: true,
                max_count: 1,
            }],
            drop_rules: vec![],
            categories,
        };

        let mut board = ScheduleBoard::new();
        let job = Job::new(
            "North ramp",
            "paving",
            Shift::Day,
            NaiveDate::from_ymd_opt(2026, 5, 4).unwrap(),
        );
        let job_id = job.id.clone();
        board.upsert_job(job);

        let excavator = Resource::new("excavator", "EX-210", "EX1");
        let operator = Resource::new("operator", "Jan", "OP1");
        let ex = Assignment::new(&excavator.id, &job_id, "Equipment", 0);
        let op = Assignment::new(&operator.id, &job_id, "Crew", 0);
        let ex_id = ex.id.clone();
        let op_id = op.id.clone();
        board.upsert_resource(excavator);
        board.upsert_resource(operator);
        board.place(ex, &rules).unwrap();
        board.place(op, &rules).unwrap();

        (board, rules, job_id, ex_id, op_id)
    }

    #[test]
    fn test_attach_then_inverse_round_trips() {
        let (mut board, rules, _job, ex_id, op_id) = fixture();
        let command = ScheduleCommand::Attach {
            a_id: ex_id.clone(),
            b_id: op_id.clone(),
        };
        let inverse = command.inverse(&board, &rules).unwrap();
        // Direction was canonicalized: the operator is the subordinate
        assert_eq!(
            inverse,
            ScheduleCommand::Detach {
                assignment_id: op_id.clone()
            }
        );

        command.apply(&mut board, &rules).unwrap();
        assert!(board.get(&op_id).unwrap().attached_to.is_some());
        inverse.apply(&mut board, &rules).unwrap();
        assert!(board.get(&op_id).unwrap().attached_to.is_none());
    }

    #[test]
    fn test_detach_of_unattached_is_a_local_no_op() {
        let (mut board, rules, _job, _ex_id, op_id) = fixture();
        let command = ScheduleCommand::Detach {
            assignment_id: op_id.clone(),
        };
        assert!(command.inverse(&board, &rules).is_none());
        assert_eq!(
            command.apply(&mut board, &rules).unwrap(),
            CommandEffect::Nothing
        );
    }

    #[test]
    fn test_remove_inverse_restores_the_row() {
        let (mut board, rules, _job, ex_id, _op_id) = fixture();
        let command = ScheduleCommand::Remove {
            assignment_id: ex_id.clone(),
        };
        let inverse = command.inverse(&board, &rules).unwrap();
        command.apply(&mut board, &rules).unwrap();
        assert!(board.get(&ex_id).is_none());
        inverse.apply(&mut board, &rules).unwrap();
        assert!(board.get(&ex_id).is_some());
    }

    #[test]
    fn test_remove_inverse_reinstates_subordinate_links() {
        let (mut board, rules, _job, ex_id, op_id) = fixture();
        board.attach(&op_id, &ex_id, &rules).unwrap();

        let command = ScheduleCommand::Remove {
            assignment_id: ex_id.clone(),
        };
        let inverse = command.inverse(&board, &rules).unwrap();

        command.apply(&mut board, &rules).unwrap();
        assert!(board.get(&ex_id).is_none());
        assert!(board.get(&op_id).unwrap().attached_to.is_none());

        inverse.apply(&mut board, &rules).unwrap();
        assert!(board.get(&ex_id).is_some());
        assert_eq!(
            board.get(&op_id).unwrap().attached_to.as_deref(),
            Some(ex_id.as_str())
        );
    }

    #[test]
    fn test_move_group_inverse_restores_placements() {
        let (mut board, rules, job_id, ex_id, op_id) = fixture();
        board.attach(&op_id, &ex_id, &rules).unwrap();

        let date = board.get_job(&job_id).unwrap().schedule_date;
        let job_b = Job::new("Job B", "paving", Shift::Day, date);
        let job_b_id = job_b.id.clone();
        board.upsert_job(job_b);

        let command = ScheduleCommand::MoveGroup {
            primary_id: ex_id.clone(),
            job_id: job_b_id.clone(),
            row_type: "Equipment".to_string(),
            position: 3,
        };
        let inverse = command.inverse(&board, &rules).unwrap();

        command.apply(&mut board, &rules).unwrap();
        assert_eq!(board.get(&ex_id).unwrap().job_id, job_b_id);
        assert_eq!(board.get(&op_id).unwrap().job_id, job_b_id);

        inverse.apply(&mut board, &rules).unwrap();
        assert_eq!(board.get(&ex_id).unwrap().job_id, job_id);
        assert_eq!(board.get(&ex_id).unwrap().position, 0);
        assert_eq!(board.get(&op_id).unwrap().row_type, "Crew");
        assert_eq!(board.get(&op_id).unwrap().position, 0);
    }
}
