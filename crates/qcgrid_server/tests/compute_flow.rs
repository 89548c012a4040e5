//! End-to-end tests for the record execution engine.
//!
//! Each test creates an isolated database via CREATE DATABASE, applies the
//! schema, and drives the store ports the same way the HTTP layer does.
//!
//! Requires a running PostgreSQL with CREATE DATABASE rights.
//! Run with: DATABASE_URL="postgresql:///postgres" cargo test -p qcgrid_server --test compute_flow -- --ignored --nocapture

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::Utc;
use serde_json::{json, Map, Value};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use qcgrid_core::molecule::{Molecule, MoleculeRef};
use qcgrid_core::proto::{ApiLimits, ManagerActivationBody};
use qcgrid_core::record::{InternalJobSpec, RecordAddInput, RecordIncludes};
use qcgrid_core::results::{AtomicResult, ResultPayload};
use qcgrid_core::specification::{
    ReactionSpecification, SinglepointDriver, SinglepointSpecification, Specification,
};
use qcgrid_core::types::{
    CompressionType, InternalJobStatus, ManagerName, ManagerStatus, OutputType, PriorityEnum,
    RecordStatus, TaskRejectReason,
};
use qcgrid_server::config::ServerConfig;
use qcgrid_server::state::AppState;

// ── Isolated test database ─────────────────────────────────────

struct IsolatedDb {
    state: AppState,
    dbname: String,
    admin: PgPool,
}

async fn isolated_state() -> IsolatedDb {
    let admin_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let dbname = format!("qcgrid_test_{}", uuid::Uuid::new_v4().simple());

    let admin_opts = PgConnectOptions::from_str(&admin_url).expect("admin url parse failed");
    let admin = PgPoolOptions::new()
        .max_connections(1)
        .connect_with(admin_opts)
        .await
        .expect("admin connect failed");

    sqlx::query(&format!(r#"CREATE DATABASE "{dbname}""#))
        .execute(&admin)
        .await
        .expect("CREATE DATABASE failed");

    let test_opts = PgConnectOptions::from_str(&admin_url)
        .expect("admin url parse failed")
        .database(&dbname);
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(test_opts)
        .await
        .expect("test db connect failed");

    qcgrid_postgres::apply_schema(&pool).await.expect("schema failed");

    let config = ServerConfig {
        database_url: String::new(),
        bind_addr: String::new(),
        heartbeat_frequency: 1.0,
        heartbeat_max_missed: 2,
        service_frequency: 1.0,
        statistics_frequency: 60.0,
        internal_job_poll_frequency: 0.1,
        internal_job_stale_after: 60.0,
        api_limits: ApiLimits {
            get_records: 1000,
            add_records: 500,
            get_managers: 1000,
            manager_tasks_claim: 200,
            manager_tasks_return: 200,
        },
        motd: String::new(),
        geolocation_file_path: None,
    };

    IsolatedDb {
        state: AppState::new(pool, config),
        dbname,
        admin,
    }
}

async fn drop_db(iso: IsolatedDb) {
    iso.state.pool.close().await;
    let drop_sql = format!(r#"DROP DATABASE IF EXISTS "{}" WITH (FORCE)"#, iso.dbname);
    let _ = sqlx::query(&drop_sql).execute(&iso.admin).await;
    iso.admin.close().await;
}

// ── Fixtures ───────────────────────────────────────────────────

fn water() -> Molecule {
    Molecule {
        symbols: vec!["O".into(), "H".into(), "H".into()],
        geometry: vec![0.0, 0.0, 0.0, 0.0, 1.43, 1.1, 0.0, -1.43, 1.1],
        molecular_charge: 0.0,
        molecular_multiplicity: 1,
        fragments: None,
        connectivity: None,
        identifiers: None,
    }
}

fn shifted_water(dz: f64) -> Molecule {
    let mut molecule = water();
    for z in molecule.geometry.iter_mut().skip(2).step_by(3) {
        *z += dz;
    }
    molecule
}

fn sp_specification() -> Specification {
    Specification::Singlepoint(SinglepointSpecification {
        program: "psi4".into(),
        driver: SinglepointDriver::Energy,
        method: "b3lyp".into(),
        basis: Some("def2-svp".into()),
        keywords: json!({}),
        protocols: json!({}),
    })
}

fn sp_input(molecule: Molecule, tag: &str) -> RecordAddInput {
    RecordAddInput {
        specification: sp_specification(),
        molecules: vec![MoleculeRef::Inline(Box::new(molecule))],
        input_data: Value::Null,
        extras: None,
        tag: tag.into(),
        priority: PriorityEnum::Normal,
        owner_user: None,
        owner_group: None,
    }
}

fn activation(uuid: &str, tags: &[&str]) -> ManagerActivationBody {
    ManagerActivationBody {
        name_data: ManagerName {
            cluster: "c".into(),
            hostname: "h".into(),
            uuid: uuid.into(),
        },
        manager_version: "1.0".into(),
        username: None,
        programs: BTreeMap::from([("psi4".to_string(), "1.8".to_string())]),
        tags: tags.iter().map(|t| t.to_string()).collect(),
    }
}

fn success_payload(energy: f64) -> ResultPayload {
    ResultPayload::Atomic(AtomicResult {
        success: true,
        return_result: Some(json!(energy)),
        properties: Map::new(),
        provenance: Some(json!({"creator": "test-harness"})),
        stdout: Some("computation finished\n".into()),
        stderr: None,
        error: None,
    })
}

fn failure_payload() -> ResultPayload {
    ResultPayload::Atomic(AtomicResult {
        success: false,
        return_result: None,
        properties: Map::new(),
        provenance: None,
        stdout: None,
        stderr: None,
        error: Some(qcgrid_core::results::ComputeError {
            error_type: "scf_convergence".into(),
            error_message: "did not converge".into(),
        }),
    })
}

async fn fetch_record(state: &AppState, id: i64) -> qcgrid_core::record::Record {
    let includes = RecordIncludes {
        compute_history: true,
        task: true,
        service: true,
        outputs: false,
    };
    state.records.get(&[id], includes, false).await.unwrap().pop().unwrap().unwrap()
}

// ── Scenarios ──────────────────────────────────────────────────

#[tokio::test]
#[ignore]
async fn test_happy_path_atomic() {
    let iso = isolated_state().await;
    let state = &iso.state;

    let (meta, ids) = state
        .records
        .add(vec![sp_input(water(), "t1")], true)
        .await
        .unwrap();
    assert_eq!(meta.inserted_idx, vec![0]);
    assert!(meta.existing_idx.is_empty());
    let record_id = ids[0].unwrap();

    let record = fetch_record(state, record_id).await;
    assert_eq!(record.status, RecordStatus::Waiting);
    let task = record.task.expect("waiting atomic record must have a task");
    assert_eq!(task.tag, "t1");
    assert_eq!(task.function, "qcengine.compute");
    assert_eq!(task.required_programs, vec!["psi4"]);

    state.managers.activate(activation("u1", &["t1"])).await.unwrap();
    let manager_name = "c-h-u1";

    let claimed = state
        .tasks
        .claim(
            manager_name,
            &BTreeMap::from([("psi4".to_string(), "1.8".to_string())]),
            &["t1".to_string()],
            10,
        )
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].record_id, record_id);

    let record = fetch_record(state, record_id).await;
    assert_eq!(record.status, RecordStatus::Running);
    assert_eq!(record.manager_name.as_deref(), Some(manager_name));
    let history = record.compute_history.as_ref().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RecordStatus::Running);
    assert_eq!(history[0].manager_name.as_deref(), Some(manager_name));

    let meta = state
        .tasks
        .return_results(manager_name, vec![(claimed[0].id, success_payload(-76.4))])
        .await
        .unwrap();
    assert_eq!(meta.accepted_ids, vec![claimed[0].id]);
    assert!(meta.rejected_info.is_empty());

    let record = fetch_record(state, record_id).await;
    assert_eq!(record.status, RecordStatus::Complete);
    assert!(record.task.is_none(), "completed records must have no task row");
    let history = record.compute_history.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].status, RecordStatus::Complete);
    assert_eq!(
        record.properties.unwrap()["return_energy"],
        json!(-76.4)
    );

    let manager = state
        .managers
        .get(&[manager_name.to_string()], false)
        .await
        .unwrap()
        .pop()
        .unwrap()
        .unwrap();
    assert_eq!(manager.claimed, 1);
    assert_eq!(manager.successes, 1);
    assert_eq!(manager.failures, 0);

    drop_db(iso).await;
}

#[tokio::test]
#[ignore]
async fn test_manager_death_recycles_tasks() {
    let iso = isolated_state().await;
    let state = &iso.state;

    let (_, ids) = state
        .records
        .add(vec![sp_input(water(), "t1")], true)
        .await
        .unwrap();
    let record_id = ids[0].unwrap();

    state.managers.activate(activation("u1", &["t1"])).await.unwrap();
    let claimed = state
        .tasks
        .claim(
            "c-h-u1",
            &BTreeMap::from([("psi4".to_string(), "1.8".to_string())]),
            &["t1".to_string()],
            10,
        )
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    // what the heartbeat checker does once the manager misses its window
    let cutoff = Utc::now() + chrono::Duration::seconds(1);
    let dead = state
        .managers
        .deactivate(&[], Some(cutoff), "missing heartbeat")
        .await
        .unwrap();
    assert_eq!(dead, vec!["c-h-u1".to_string()]);

    let manager = state
        .managers
        .get(&["c-h-u1".to_string()], false)
        .await
        .unwrap()
        .pop()
        .unwrap()
        .unwrap();
    assert_eq!(manager.status, ManagerStatus::Inactive);

    let record = fetch_record(state, record_id).await;
    assert_eq!(record.status, RecordStatus::Waiting);
    assert_eq!(record.manager_name, None);
    let task = record.task.expect("recycled record must be back in the queue");
    assert!(task.sort_date > task.created_on, "recycled task must be demoted");
    let history = record.compute_history.unwrap();
    assert_eq!(history.last().unwrap().status, RecordStatus::Error);

    // the reaper is idempotent
    let again = state
        .managers
        .deactivate(&[], Some(Utc::now() + chrono::Duration::seconds(1)), "missing heartbeat")
        .await
        .unwrap();
    assert!(again.is_empty());

    drop_db(iso).await;
}

#[tokio::test]
#[ignore]
async fn test_wrong_manager_return_rejected() {
    let iso = isolated_state().await;
    let state = &iso.state;

    let (_, ids) = state
        .records
        .add(vec![sp_input(water(), "t1")], true)
        .await
        .unwrap();
    let record_id = ids[0].unwrap();

    state.managers.activate(activation("u1", &["t1"])).await.unwrap();
    state.managers.activate(activation("u2", &["t1"])).await.unwrap();

    let claimed = state
        .tasks
        .claim(
            "c-h-u1",
            &BTreeMap::from([("psi4".to_string(), "1.8".to_string())]),
            &["t1".to_string()],
            10,
        )
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    let meta = state
        .tasks
        .return_results("c-h-u2", vec![(claimed[0].id, success_payload(-1.0))])
        .await
        .unwrap();
    assert!(meta.accepted_ids.is_empty());
    assert_eq!(meta.rejected_info, vec![(0, TaskRejectReason::WrongManager)]);

    let record = fetch_record(state, record_id).await;
    assert_eq!(record.status, RecordStatus::Running);
    assert_eq!(record.manager_name.as_deref(), Some("c-h-u1"));

    drop_db(iso).await;
}

#[tokio::test]
#[ignore]
async fn test_dedup_on_insert() {
    let iso = isolated_state().await;
    let state = &iso.state;

    let (meta, ids) = state
        .records
        .add(vec![sp_input(water(), "t1")], true)
        .await
        .unwrap();
    assert_eq!(meta.inserted_idx, vec![0]);
    assert!(meta.existing_idx.is_empty());

    let (meta2, ids2) = state
        .records
        .add(vec![sp_input(water(), "t1")], true)
        .await
        .unwrap();
    assert!(meta2.inserted_idx.is_empty());
    assert_eq!(meta2.existing_idx, vec![0]);
    assert_eq!(ids[0], ids2[0]);

    // a different molecule is a different record
    let (meta3, ids3) = state
        .records
        .add(vec![sp_input(shifted_water(0.5), "t1")], true)
        .await
        .unwrap();
    assert_eq!(meta3.inserted_idx, vec![0]);
    assert_ne!(ids3[0], ids[0]);

    // find_existing = false always inserts
    let (meta4, ids4) = state
        .records
        .add(vec![sp_input(water(), "t1")], false)
        .await
        .unwrap();
    assert_eq!(meta4.inserted_idx, vec![0]);
    assert_ne!(ids4[0], ids[0]);

    drop_db(iso).await;
}

#[tokio::test]
#[ignore]
async fn test_reaction_service_iteration() {
    let iso = isolated_state().await;
    let state = &iso.state;

    let specification = Specification::Reaction(ReactionSpecification {
        singlepoint_specification: match sp_specification() {
            Specification::Singlepoint(s) => s,
            _ => unreachable!(),
        },
        keywords: json!({}),
    });
    let input = RecordAddInput {
        specification,
        molecules: vec![
            MoleculeRef::Inline(Box::new(water())),
            MoleculeRef::Inline(Box::new(shifted_water(0.4))),
        ],
        input_data: json!({"stoichiometry": [
            {"molecule_idx": 0, "coefficient": -1.0},
            {"molecule_idx": 1, "coefficient": 1.0},
        ]}),
        extras: None,
        tag: "svc".into(),
        priority: PriorityEnum::Normal,
        owner_user: None,
        owner_group: None,
    };

    let (meta, ids) = state.records.add(vec![input], true).await.unwrap();
    assert_eq!(meta.inserted_idx, vec![0]);
    let service_record_id = ids[0].unwrap();

    let record = fetch_record(state, service_record_id).await;
    assert_eq!(record.status, RecordStatus::Waiting);
    assert!(record.task.is_none(), "service records never get task rows");
    assert!(record.service.is_some());

    // first pass: spawn the two singlepoint children
    let iterated = state.services.iterate_services().await.unwrap();
    assert_eq!(iterated, 1);

    let record = fetch_record(state, service_record_id).await;
    assert_eq!(record.status, RecordStatus::Running);
    let service = record.service.unwrap();
    assert_eq!(service.iteration, 1);

    // children are ordinary atomic tasks, routed by the service's tag
    state.managers.activate(activation("u1", &["svc"])).await.unwrap();
    let claimed = state
        .tasks
        .claim(
            "c-h-u1",
            &BTreeMap::from([("psi4".to_string(), "1.8".to_string())]),
            &["svc".to_string()],
            10,
        )
        .await
        .unwrap();
    assert_eq!(claimed.len(), 2);

    // while children are outstanding the parent must not iterate
    assert_eq!(state.services.iterate_services().await.unwrap(), 0);

    let results: Vec<_> = claimed
        .iter()
        .enumerate()
        .map(|(i, task)| (task.id, success_payload(-76.0 - i as f64)))
        .collect();
    let meta = state.tasks.return_results("c-h-u1", results).await.unwrap();
    assert_eq!(meta.n_accepted(), 2);

    // dependencies cleared by the completions: the parent finishes
    let iterated = state.services.iterate_services().await.unwrap();
    assert_eq!(iterated, 1);

    let record = fetch_record(state, service_record_id).await;
    assert_eq!(record.status, RecordStatus::Complete);
    assert!(record.service.is_none(), "finished services drop their scaffolding");
    let total = record.properties.unwrap()["total_energy"].as_f64().unwrap();
    // -1 * E(child0) + 1 * E(child1), whichever child got which energy
    assert!(total.abs() > 0.5 && total.abs() < 1.5);

    drop_db(iso).await;
}

#[tokio::test]
#[ignore]
async fn test_cancel_while_running() {
    let iso = isolated_state().await;
    let state = &iso.state;

    let (_, ids) = state
        .records
        .add(vec![sp_input(water(), "t1")], true)
        .await
        .unwrap();
    let record_id = ids[0].unwrap();

    state.managers.activate(activation("u1", &["t1"])).await.unwrap();
    let claimed = state
        .tasks
        .claim(
            "c-h-u1",
            &BTreeMap::from([("psi4".to_string(), "1.8".to_string())]),
            &["t1".to_string()],
            10,
        )
        .await
        .unwrap();

    let meta = state.records.cancel(&[record_id]).await.unwrap();
    assert_eq!(meta.updated_idx, vec![0]);

    let record = fetch_record(state, record_id).await;
    assert_eq!(record.status, RecordStatus::Cancelled);
    assert!(record.task.is_none());

    // the manager's eventual return finds no task
    let meta = state
        .tasks
        .return_results("c-h-u1", vec![(claimed[0].id, success_payload(-1.0))])
        .await
        .unwrap();
    assert_eq!(meta.rejected_info, vec![(0, TaskRejectReason::TaskNotFound)]);

    // cancel is terminal: reset does nothing
    let meta = state.records.reset(&[record_id]).await.unwrap();
    assert!(meta.updated_idx.is_empty());
    assert_eq!(meta.errors.len(), 1);

    drop_db(iso).await;
}

#[tokio::test]
#[ignore]
async fn test_error_reset_and_failure_counters() {
    let iso = isolated_state().await;
    let state = &iso.state;

    let (_, ids) = state
        .records
        .add(vec![sp_input(water(), "t1")], true)
        .await
        .unwrap();
    let record_id = ids[0].unwrap();

    state.managers.activate(activation("u1", &["t1"])).await.unwrap();
    let programs = BTreeMap::from([("psi4".to_string(), "1.8".to_string())]);
    let claimed = state
        .tasks
        .claim("c-h-u1", &programs, &["t1".to_string()], 10)
        .await
        .unwrap();

    let meta = state
        .tasks
        .return_results("c-h-u1", vec![(claimed[0].id, failure_payload())])
        .await
        .unwrap();
    assert_eq!(meta.n_accepted(), 1);

    let record = fetch_record(state, record_id).await;
    assert_eq!(record.status, RecordStatus::Error);
    assert!(record.task.is_none());

    let manager = state
        .managers
        .get(&["c-h-u1".to_string()], false)
        .await
        .unwrap()
        .pop()
        .unwrap()
        .unwrap();
    assert_eq!(manager.failures, 1);

    // reset puts it back in the queue at a demoted position
    let meta = state.records.reset(&[record_id]).await.unwrap();
    assert_eq!(meta.updated_idx, vec![0]);
    let record = fetch_record(state, record_id).await;
    assert_eq!(record.status, RecordStatus::Waiting);
    let task = record.task.unwrap();
    assert!(task.sort_date >= task.created_on);

    // and it is claimable again
    let claimed = state
        .tasks
        .claim("c-h-u1", &programs, &["t1".to_string()], 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    drop_db(iso).await;
}

#[tokio::test]
#[ignore]
async fn test_claim_ordering_and_limits() {
    let iso = isolated_state().await;
    let state = &iso.state;

    let inputs = vec![
        RecordAddInput {
            priority: PriorityEnum::Low,
            ..sp_input(shifted_water(0.1), "t1")
        },
        RecordAddInput {
            priority: PriorityEnum::High,
            ..sp_input(shifted_water(0.2), "t1")
        },
        RecordAddInput {
            priority: PriorityEnum::Normal,
            ..sp_input(shifted_water(0.3), "t1")
        },
    ];
    let (_, ids) = state.records.add(inputs, true).await.unwrap();
    let ids: Vec<i64> = ids.into_iter().map(|i| i.unwrap()).collect();

    state.managers.activate(activation("u1", &["*"])).await.unwrap();
    let programs = BTreeMap::from([("psi4".to_string(), "1.8".to_string())]);

    // limit = 0 claims nothing and leaves counters alone
    let none = state
        .tasks
        .claim("c-h-u1", &programs, &["*".to_string()], 0)
        .await
        .unwrap();
    assert!(none.is_empty());
    let manager = state
        .managers
        .get(&["c-h-u1".to_string()], false)
        .await
        .unwrap()
        .pop()
        .unwrap()
        .unwrap();
    assert_eq!(manager.claimed, 0);

    // priority desc, then insertion order
    let claimed = state
        .tasks
        .claim("c-h-u1", &programs, &["*".to_string()], 2)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].record_id, ids[1]); // high
    assert_eq!(claimed[1].record_id, ids[2]); // normal

    // a manager without the required programs sees nothing
    state.managers.activate(activation("u2", &["*"])).await.unwrap();
    let other_programs = BTreeMap::from([("xtb".to_string(), "6.6".to_string())]);
    let claimed = state
        .tasks
        .claim("c-h-u2", &other_programs, &["*".to_string()], 10)
        .await
        .unwrap();
    assert!(claimed.is_empty());

    drop_db(iso).await;
}

#[tokio::test]
#[ignore]
async fn test_tag_matching() {
    let iso = isolated_state().await;
    let state = &iso.state;

    let (_, ids) = state
        .records
        .add(
            vec![
                sp_input(shifted_water(0.1), "special"),
                sp_input(shifted_water(0.2), "*"),
            ],
            true,
        )
        .await
        .unwrap();
    let special_id = ids[0].unwrap();
    let wildcard_id = ids[1].unwrap();

    let programs = BTreeMap::from([("psi4".to_string(), "1.8".to_string())]);

    // a literal-tag manager only sees its own tag, not the '*' task
    state.managers.activate(activation("u1", &["special"])).await.unwrap();
    let claimed = state
        .tasks
        .claim("c-h-u1", &programs, &["special".to_string()], 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].record_id, special_id);

    // a wildcard manager picks up everything that is left
    state.managers.activate(activation("u2", &["*"])).await.unwrap();
    let claimed = state
        .tasks
        .claim("c-h-u2", &programs, &["*".to_string()], 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].record_id, wildcard_id);

    drop_db(iso).await;
}

#[tokio::test]
#[ignore]
async fn test_manager_activation_rules() {
    let iso = isolated_state().await;
    let state = &iso.state;

    state.managers.activate(activation("u1", &["t1"])).await.unwrap();

    // duplicate names are rejected
    let dup = state.managers.activate(activation("u1", &["t1"])).await;
    assert!(matches!(dup, Err(qcgrid_core::QcGridError::Conflict(_))));

    // empty tags / programs are rejected
    let no_tags = state.managers.activate(activation("u2", &[])).await;
    assert!(matches!(no_tags, Err(qcgrid_core::QcGridError::InvalidInput(_))));

    let mut no_programs = activation("u3", &["*"]);
    no_programs.programs.clear();
    let no_programs = state.managers.activate(no_programs).await;
    assert!(matches!(no_programs, Err(qcgrid_core::QcGridError::InvalidInput(_))));

    // claims by unknown managers fail loudly
    let programs = BTreeMap::from([("psi4".to_string(), "1.8".to_string())]);
    let unknown = state
        .tasks
        .claim("c-h-nope", &programs, &["*".to_string()], 10)
        .await;
    assert!(matches!(unknown, Err(qcgrid_core::QcGridError::NotFound(_))));

    // claims by deactivated managers must trigger reactivation
    state
        .managers
        .deactivate(&["c-h-u1".to_string()], None, "shutdown")
        .await
        .unwrap();
    let inactive = state
        .tasks
        .claim("c-h-u1", &programs, &["t1".to_string()], 10)
        .await;
    assert!(matches!(inactive, Err(qcgrid_core::QcGridError::Conflict(_))));

    drop_db(iso).await;
}

#[tokio::test]
#[ignore]
async fn test_heartbeat_appends_manager_log() {
    let iso = isolated_state().await;
    let state = &iso.state;

    state.managers.activate(activation("u1", &["*"])).await.unwrap();

    let update = qcgrid_core::proto::ManagerUpdateBody {
        status: ManagerStatus::Active,
        active_tasks: 3,
        active_cores: 24,
        active_memory: 16.5,
        total_worker_walltime: 120.0,
        total_task_walltime: 95.0,
    };
    state.managers.heartbeat("c-h-u1", update.clone()).await.unwrap();
    state.managers.heartbeat("c-h-u1", update.clone()).await.unwrap();

    let log = state.managers.get_log("c-h-u1").await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].active_tasks, 3);

    // an inactive manager must reactivate, not heartbeat
    state
        .managers
        .deactivate(&["c-h-u1".to_string()], None, "shutdown")
        .await
        .unwrap();
    let refused = state.managers.heartbeat("c-h-u1", update).await;
    assert!(matches!(refused, Err(qcgrid_core::QcGridError::Conflict(_))));

    drop_db(iso).await;
}

#[tokio::test]
#[ignore]
async fn test_soft_delete_and_undelete() {
    let iso = isolated_state().await;
    let state = &iso.state;

    let (_, ids) = state
        .records
        .add(vec![sp_input(water(), "t1")], true)
        .await
        .unwrap();
    let record_id = ids[0].unwrap();

    let meta = state.records.delete(&[record_id], true, false).await.unwrap();
    assert_eq!(meta.deleted_idx, vec![0]);

    let record = fetch_record(state, record_id).await;
    assert_eq!(record.status, RecordStatus::Deleted);
    assert!(record.task.is_none());

    // a deleted record must not alias a new submission
    let (meta, new_ids) = state
        .records
        .add(vec![sp_input(water(), "t1")], true)
        .await
        .unwrap();
    assert_eq!(meta.inserted_idx, vec![0]);
    assert_ne!(new_ids[0].unwrap(), record_id);

    let meta = state.records.undelete(&[record_id]).await.unwrap();
    assert_eq!(meta.updated_idx, vec![0]);
    let record = fetch_record(state, record_id).await;
    assert_eq!(record.status, RecordStatus::Waiting);
    assert!(record.task.is_some(), "undeleted waiting record is claimable again");

    drop_db(iso).await;
}

#[tokio::test]
#[ignore]
async fn test_output_storage_round_trip() {
    let iso = isolated_state().await;
    let state = &iso.state;

    let (_, ids) = state
        .records
        .add(vec![sp_input(water(), "t1")], true)
        .await
        .unwrap();
    let record_id = ids[0].unwrap();

    state.managers.activate(activation("u1", &["t1"])).await.unwrap();
    let programs = BTreeMap::from([("psi4".to_string(), "1.8".to_string())]);
    let claimed = state
        .tasks
        .claim("c-h-u1", &programs, &["t1".to_string()], 10)
        .await
        .unwrap();
    state
        .tasks
        .return_results("c-h-u1", vec![(claimed[0].id, success_payload(-76.4))])
        .await
        .unwrap();

    let includes = RecordIncludes {
        compute_history: true,
        task: false,
        service: false,
        outputs: true,
    };
    let record = state
        .records
        .get(&[record_id], includes, false)
        .await
        .unwrap()
        .pop()
        .unwrap()
        .unwrap();
    let history = record.compute_history.unwrap();
    let outputs = history.last().unwrap().outputs.as_ref().unwrap();
    let stdout = outputs
        .iter()
        .find(|o| o.output_type == OutputType::Stdout)
        .expect("stdout blob stored");
    assert_eq!(stdout.compression_type, CompressionType::Zstd);

    let decompressed =
        qcgrid_core::compression::decompress(&stdout.data, stdout.compression_type).unwrap();
    assert_eq!(decompressed, b"computation finished\n");

    // outputs can also be appended after the fact, in any accepted codec
    state
        .records
        .append_output(
            stdout.history_id,
            OutputType::Stderr,
            b"warning: nothing",
            CompressionType::Lzma,
        )
        .await
        .unwrap();

    drop_db(iso).await;
}

#[tokio::test]
#[ignore]
async fn test_internal_job_queue_semantics() {
    let iso = isolated_state().await;
    let state = &iso.state;
    let jobs = &state.internal_jobs;

    let spec = InternalJobSpec {
        name: "check_manager_heartbeats".into(),
        scheduled_date: Utc::now(),
        function: "managers.check_manager_heartbeats".into(),
        kwargs: json!({}),
        user_name: None,
        unique_name: Some("check_manager_heartbeats".into()),
        after_function: None,
        after_function_kwargs: None,
        serial_group: Some("heartbeats".into()),
    };

    // unique_name dedups over non-terminal rows
    let id1 = jobs.add(spec.clone()).await.unwrap();
    let id2 = jobs.add(spec.clone()).await.unwrap();
    assert_eq!(id1, id2);

    let claimed = jobs.claim_next("host", "runner-1").await.unwrap().unwrap();
    assert_eq!(claimed.id, id1);
    assert_eq!(claimed.status, InternalJobStatus::Running);

    // still non-terminal while running, so the add is still a no-op
    let id3 = jobs.add(spec.clone()).await.unwrap();
    assert_eq!(id3, id1);

    // at most one running job per serial group
    let mut second = spec.clone();
    second.unique_name = Some("another_heartbeat_job".into());
    second.name = "another_heartbeat_job".into();
    jobs.add(second).await.unwrap();
    assert!(jobs.claim_next("host", "runner-2").await.unwrap().is_none());

    jobs.finish(id1, InternalJobStatus::Complete, Some(json!({"deactivated": []})))
        .await
        .unwrap();
    let next = jobs.claim_next("host", "runner-2").await.unwrap();
    assert!(next.is_some(), "finishing frees the serial group");

    // once terminal, the unique name is reusable
    let id4 = jobs.add(spec).await.unwrap();
    assert_ne!(id4, id1);

    drop_db(iso).await;
}

#[tokio::test]
#[ignore]
async fn test_modify_tag_and_priority_only_while_waiting() {
    let iso = isolated_state().await;
    let state = &iso.state;

    let (_, ids) = state
        .records
        .add(vec![sp_input(water(), "t1")], true)
        .await
        .unwrap();
    let record_id = ids[0].unwrap();

    let modification = qcgrid_core::record::RecordModification {
        tag: Some("URGENT".into()),
        delete_tag: false,
        priority: Some(PriorityEnum::High),
    };
    let meta = state.records.modify(&[record_id], modification.clone()).await.unwrap();
    assert_eq!(meta.updated_idx, vec![0]);

    let record = fetch_record(state, record_id).await;
    let task = record.task.unwrap();
    assert_eq!(task.tag, "urgent");
    assert_eq!(task.priority, PriorityEnum::High);

    // not legal once running
    state.managers.activate(activation("u1", &["urgent"])).await.unwrap();
    let programs = BTreeMap::from([("psi4".to_string(), "1.8".to_string())]);
    state
        .tasks
        .claim("c-h-u1", &programs, &["urgent".to_string()], 10)
        .await
        .unwrap();

    let meta = state.records.modify(&[record_id], modification).await.unwrap();
    assert!(meta.updated_idx.is_empty());
    assert_eq!(meta.errors.len(), 1);

    drop_db(iso).await;
}

// ── HTTP surface ───────────────────────────────────────────────

mod http {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use hyper::{Request, StatusCode};
    use qcgrid_server::router::build_router;
    use tower::ServiceExt;

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn test_information_endpoint() {
        let iso = isolated_state().await;
        let app = build_router(iso.state.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/information")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["name"], json!("qcgrid"));
        assert!(body["client_version_lower_limit"].is_string());
        assert!(body["api_limits"]["manager_tasks_claim"].is_number());

        drop_db(iso).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_activate_claim_return_over_http() {
        let iso = isolated_state().await;
        let app = build_router(iso.state.clone());

        // seed a record through the store, then drive the manager API
        let (_, ids) = iso
            .state
            .records
            .add(vec![sp_input(water(), "t1")], true)
            .await
            .unwrap();
        let record_id = ids[0].unwrap();

        let activation_body = json!({
            "name_data": {"cluster": "c", "hostname": "h", "uuid": "u1"},
            "manager_version": "1.0",
            "programs": {"psi4": "1.8"},
            "tags": ["t1"],
        });
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/compute/v1/managers")
                    .header("content-type", "application/json")
                    .body(Body::from(activation_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // duplicate activation conflicts
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/compute/v1/managers")
                    .header("content-type", "application/json")
                    .body(Body::from(activation_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert!(body["msg"].as_str().unwrap().contains("already exists"));

        let claim_body = json!({
            "name_data": {"cluster": "c", "hostname": "h", "uuid": "u1"},
            "programs": {"psi4": "1.8"},
            "tags": ["t1"],
            "limit": 5,
        });
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/compute/v1/tasks/claim")
                    .header("content-type", "application/json")
                    .body(Body::from(claim_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let tasks = body_json(response).await;
        let task_id = tasks[0]["id"].as_i64().unwrap();
        assert_eq!(tasks[0]["record_id"].as_i64().unwrap(), record_id);

        let mut results = Map::new();
        results.insert(
            task_id.to_string(),
            json!({
                "schema_name": "qcschema_output",
                "success": true,
                "return_result": -76.4,
                "stdout": "done",
            }),
        );
        let return_body = json!({
            "name_data": {"cluster": "c", "hostname": "h", "uuid": "u1"},
            "results": results,
        });
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/compute/v1/tasks/return")
                    .header("content-type", "application/json")
                    .body(Body::from(return_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let meta = body_json(response).await;
        assert_eq!(meta["accepted_ids"], json!([task_id]));

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/records/{record_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let record = body_json(response).await;
        assert_eq!(record["status"], json!("complete"));

        drop_db(iso).await;
    }
}
