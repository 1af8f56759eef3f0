//! Persistence round trips: board snapshots to JSON files and rule
//! configuration to YAML.

use std::collections::HashMap;

use anyhow::Result;
use chrono::NaiveDate;

use siteboard::board::ScheduleBoard;
use siteboard::model::{
    Assignment, AttachmentRule, DropRule, Job, Resource, ResourceCategory, Shift, TimeSlot,
};
use siteboard::rules::RuleSet;

fn rules() -> RuleSet {
    let mut categories = HashMap::new();
    categories.insert("operator".to_string(), ResourceCategory::Personnel);
    categories.insert("excavator".to_string(), ResourceCategory::Equipment);
    RuleSet {
        attachment_rules: vec![AttachmentRule {
            source_type: "operator".to_string(),
            target_type: "excavator".to_string(),
            can_attach: true,
            is_required: true,
            max_count: 1,
        }],
        drop_rules: vec![DropRule {
            row_type: "Equipment".to_string(),
            allowed_types: vec!["excavator".to_string(), "operator".to_string()],
        }],
        categories,
    }
}

fn populated_board() -> Result<(ScheduleBoard, String, String)> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let rules = rules();
    let mut board = ScheduleBoard::new();
    let date = NaiveDate::from_ymd_opt(2026, 5, 4).unwrap();
    let job = Job::new("Main St resurfacing", "paving", Shift::Night, date);
    let job_id = job.id.clone();
    board.upsert_job(job);

    let excavator = Resource::new("excavator", "EX-210", "EX1");
    let operator = Resource::new("operator", "Jan", "OP1");
    let mut ex = Assignment::new(&excavator.id, &job_id, "Equipment", 0);
    ex.time_slot = Some(TimeSlot::new(6 * 60, 14 * 60)?);
    let op = Assignment::new(&operator.id, &job_id, "Equipment", 1);
    let ex_id = ex.id.clone();
    let op_id = op.id.clone();
    board.upsert_resource(excavator);
    board.upsert_resource(operator);
    board.place(ex, &rules)?;
    board.place(op, &rules)?;
    board.attach(&op_id, &ex_id, &rules)?;
    Ok((board, ex_id, op_id))
}

#[test]
fn test_board_snapshot_file_round_trip() -> Result<()> {
    let (board, ex_id, op_id) = populated_board()?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("board.json");
    board.save_snapshot(&path)?;

    let restored = ScheduleBoard::load_snapshot(&path)?;
    assert_eq!(restored.assignment_count(), board.assignment_count());
    assert_eq!(restored.get(&ex_id), board.get(&ex_id));
    assert_eq!(
        restored.get(&op_id).unwrap().attached_to.as_deref(),
        Some(ex_id.as_str())
    );
    assert_eq!(
        restored.get(&ex_id).unwrap().time_slot,
        Some(TimeSlot::new(360, 840)?)
    );
    assert!(restored.verify_integrity().is_empty());
    Ok(())
}

#[test]
fn test_snapshot_reload_preserves_closures() -> Result<()> {
    let (board, ex_id, op_id) = populated_board()?;

    let restored = ScheduleBoard::from_snapshot(board.snapshot());
    let closure = restored.closure(&ex_id);
    assert_eq!(closure, vec![ex_id, op_id]);
    Ok(())
}

#[test]
fn test_rule_config_yaml_round_trip() -> Result<()> {
    let original = rules();
    let yaml = original.to_yaml()?;
    let restored = RuleSet::from_yaml(&yaml)?;

    assert_eq!(restored.attachment_rules, original.attachment_rules);
    assert_eq!(restored.drop_rules, original.drop_rules);
    assert!(restored
        .categories
        .get("operator")
        .is_some_and(|c| c.is_personnel()));
    Ok(())
}

#[test]
fn test_rule_config_parses_hand_written_yaml() -> Result<()> {
    let yaml = r#"
attachment_rules:
  - source_type: screwman
    target_type: paver
    can_attach: true
    is_required: false
    max_count: 2
drop_rules:
  - row_type: Crew
    allowed_types: [screwman, operator]
categories:
  screwman: personnel
  paver: equipment
"#;
    let rules = RuleSet::from_yaml(yaml)?;
    assert_eq!(rules.attachment_rules[0].max_count, 2);
    assert!(rules.can_drop("screwman", "Crew").is_ok());
    assert!(rules.can_drop("paver", "Crew").is_err());
    Ok(())
}
