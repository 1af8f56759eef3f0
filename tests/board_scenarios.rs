//! End-to-end scheduling scenarios driven through a session against the
//! in-process store: attachment capacity, required roles and atomic group
//! moves.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;

use siteboard::model::{
    AttachmentRule, DropRule, Job, Resource, ResourceCategory, Shift,
};
use siteboard::projection;
use siteboard::rules::RuleSet;
use siteboard::store::{MemoryStore, ScheduleStore};
use siteboard::sync::ScheduleSession;

fn site_rules() -> RuleSet {
    let mut categories = HashMap::new();
    categories.insert("operator".to_string(), ResourceCategory::Personnel);
    categories.insert("screwman".to_string(), ResourceCategory::Personnel);
    categories.insert("excavator".to_string(), ResourceCategory::Equipment);
    categories.insert("paver".to_string(), ResourceCategory::Equipment);

    RuleSet {
        attachment_rules: vec![
            AttachmentRule {
                source_type: "operator".to_string(),
                target_type: "excavator".to_string(),
                can_attach: true,
                is_required: true,
                max_count: 1,
            },
            AttachmentRule {
                source_type: "screwman".to_string(),
                target_type: "paver".to_string(),
                can_attach: true,
                is_required: false,
                max_count: 2,
            },
        ],
        // EquipmentOnly is the restrictive destination used by the
        // all-or-nothing abort scenario
        drop_rules: vec![DropRule {
            row_type: "EquipmentOnly".to_string(),
            allowed_types: vec!["excavator".to_string(), "paver".to_string()],
        }],
        categories,
    }
}

struct Site {
    store: Arc<MemoryStore>,
    job_a: Job,
    job_b: Job,
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn setup_site() -> Result<Site> {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let date = NaiveDate::from_ymd_opt(2026, 5, 4).unwrap();
    let job_a = store
        .insert_job(Job::new("Job A", "earthworks", Shift::Day, date))
        .await?
        .row;
    let job_b = store
        .insert_job(Job::new("Job B", "earthworks", Shift::Day, date))
        .await?
        .row;
    Ok(Site { store, job_a, job_b })
}

async fn add_resource(site: &Site, resource_type: &str, name: &str) -> Result<Resource> {
    let committed = site
        .store
        .insert_resource(Resource::new(resource_type, name, name))
        .await?;
    Ok(committed.row)
}

/// Operator -> excavator, required, max 1: second operator is rejected and
/// the whole group relocates to Job B.
#[tokio::test]
async fn test_scenario_required_operator_moves_with_excavator() -> Result<()> {
    let site = setup_site().await?;
    let excavator = add_resource(&site, "excavator", "EX-210").await?;
    let operator_1 = add_resource(&site, "operator", "Jan").await?;
    let operator_2 = add_resource(&site, "operator", "Mila").await?;

    let mut session = ScheduleSession::new(site.store.clone(), site_rules());
    session.bootstrap().await?;

    let ex = session
        .place_resource(&excavator.id, &site.job_a.id, "Equipment", 0)
        .await?;
    let op1 = session
        .place_resource(&operator_1.id, &site.job_a.id, "Crew", 0)
        .await?;
    let op2 = session
        .place_resource(&operator_2.id, &site.job_a.id, "Crew", 1)
        .await?;

    session.attach(&op1.id, &ex.id).await?;

    let err = session.attach(&op2.id, &ex.id).await.unwrap_err();
    assert_eq!(err.error_code(), "CAPACITY_EXCEEDED");
    let attached: Vec<String> = session
        .board()
        .attachments_of(&ex.id)
        .iter()
        .map(|a| a.id.clone())
        .collect();
    assert_eq!(attached, vec![op1.id.clone()]);

    let state = projection::visual_state(session.board(), session.rules(), &ex.id);
    assert!(state.has_required_role);

    session
        .move_group(&ex.id, &site.job_b.id, "Equipment", 0)
        .await?;

    // Session view and store agree: both members on Job B, none left on A
    let snapshot = site.store.snapshot().await?;
    for id in [&ex.id, &op1.id] {
        let row = snapshot.assignments.iter().find(|a| &a.id == id).unwrap();
        assert_eq!(row.job_id, site.job_b.id);
        assert_eq!(row.row_type, "Equipment");
    }
    assert!(!snapshot
        .assignments
        .iter()
        .any(|a| a.job_id == site.job_a.id && (a.id == ex.id || a.id == op1.id)));
    assert_eq!(session.board().get(&op1.id).unwrap().job_id, site.job_b.id);
    // The unattached second operator stays behind
    assert_eq!(session.board().get(&op2.id).unwrap().job_id, site.job_a.id);
    Ok(())
}

/// Screwman -> paver, max 2: the third attachment is rejected and the
/// paver reads as full.
#[tokio::test]
async fn test_scenario_paver_capacity_two() -> Result<()> {
    let site = setup_site().await?;
    let paver = add_resource(&site, "paver", "PV-1").await?;
    let mut crew = Vec::new();
    for name in ["Ada", "Ben", "Cleo"] {
        crew.push(add_resource(&site, "screwman", name).await?);
    }

    let mut session = ScheduleSession::new(site.store.clone(), site_rules());
    session.bootstrap().await?;

    let pv = session
        .place_resource(&paver.id, &site.job_a.id, "Equipment", 0)
        .await?;
    let mut crew_assignments = Vec::new();
    for (i, screwman) in crew.iter().enumerate() {
        crew_assignments.push(
            session
                .place_resource(&screwman.id, &site.job_a.id, "Crew", i as i32)
                .await?,
        );
    }

    session.attach(&crew_assignments[0].id, &pv.id).await?;
    session.attach(&crew_assignments[1].id, &pv.id).await?;

    let err = session
        .attach(&crew_assignments[2].id, &pv.id)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "CAPACITY_EXCEEDED");
    assert_eq!(session.board().attachments_of(&pv.id).len(), 2);
    assert!(projection::is_attachment_full(
        session.board(),
        session.rules(),
        &pv.id
    ));
    assert_eq!(
        projection::remaining_capacity(session.board(), session.rules(), &pv.id, "screwman"),
        0
    );
    Ok(())
}

/// The destination row rejects an attached member's type: the move aborts
/// and no member changes job, row or position.
#[tokio::test]
async fn test_scenario_move_aborts_when_destination_rejects_member() -> Result<()> {
    let site = setup_site().await?;
    let excavator = add_resource(&site, "excavator", "EX-210").await?;
    let operator = add_resource(&site, "operator", "Jan").await?;

    let mut session = ScheduleSession::new(site.store.clone(), site_rules());
    session.bootstrap().await?;

    let ex = session
        .place_resource(&excavator.id, &site.job_a.id, "Equipment", 0)
        .await?;
    let op = session
        .place_resource(&operator.id, &site.job_a.id, "Crew", 0)
        .await?;
    session.attach(&op.id, &ex.id).await?;

    let err = session
        .move_group(&ex.id, &site.job_b.id, "EquipmentOnly", 0)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "DROP_DISALLOWED");

    // Zero members changed, locally and in the store
    let snapshot = site.store.snapshot().await?;
    let ex_row = snapshot.assignments.iter().find(|a| a.id == ex.id).unwrap();
    let op_row = snapshot.assignments.iter().find(|a| a.id == op.id).unwrap();
    assert_eq!((ex_row.job_id.as_str(), ex_row.row_type.as_str(), ex_row.position),
        (site.job_a.id.as_str(), "Equipment", 0));
    assert_eq!((op_row.job_id.as_str(), op_row.row_type.as_str(), op_row.position),
        (site.job_a.id.as_str(), "Crew", 0));
    assert_eq!(session.board().get(&ex.id).unwrap().row_type, "Equipment");
    assert_eq!(
        session.board().get(&op.id).unwrap().attached_to.as_deref(),
        Some(ex.id.as_str())
    );
    Ok(())
}

/// Detaching twice is harmless and reports nothing happened the second
/// time.
#[tokio::test]
async fn test_detach_is_idempotent_through_the_session() -> Result<()> {
    let site = setup_site().await?;
    let excavator = add_resource(&site, "excavator", "EX-210").await?;
    let operator = add_resource(&site, "operator", "Jan").await?;

    let mut session = ScheduleSession::new(site.store.clone(), site_rules());
    session.bootstrap().await?;
    let ex = session
        .place_resource(&excavator.id, &site.job_a.id, "Equipment", 0)
        .await?;
    let op = session
        .place_resource(&operator.id, &site.job_a.id, "Crew", 0)
        .await?;
    session.attach(&op.id, &ex.id).await?;

    assert!(session.detach(&op.id).await?.is_some());
    assert!(session.board().get(&op.id).unwrap().attached_to.is_none());

    // Second detach is a local no-op and must not touch the store
    assert!(session.detach(&op.id).await?.is_none());
    assert!(session.board().attachments_of(&ex.id).is_empty());
    Ok(())
}
