//! Engine-wide properties.
//!
//! Replay determinism, capacity accounting, lifecycle monotonicity,
//! idempotent finalization and settlement retry, checked over message
//! sequences rather than single handlers.

mod common;

use common::*;
use hpc_core::{BlockContext, EngineParams};
use hpcgrid_keeper::{EngineEvent, Keeper, KeeperError, Msg};
use hpcgrid_settlement::{Account, Escrow, InMemoryEscrow};
use hpcgrid_state::{JobState, SettlementStatus, StateStore};

/// A mixed workload across two clusters.
fn workload() -> Vec<(BlockContext, Msg)> {
    let mut msgs = vec![
        (ctx(10, 1_000), submit_msg("alice", 4, 1_800, "5000uve")),
        // only c2 has eleven nodes
        (ctx(10, 1_000), submit_msg("bob", 11, 3_600, "20000uve")),
        (ctx(11, 1_005), place_msg("provider1", "job-000001", "c1")),
        (ctx(11, 1_005), place_msg("provider2", "job-000002", "c2")),
        (ctx(12, 1_010), report_msg("provider1", "job-000001", JobState::Running, None)),
        (ctx(12, 1_010), submit_msg("carol", 6, 1_800, "5000uve")),
        // c2 is full; the decision points at c1
        (ctx(13, 1_020), place_msg("provider2", "job-000003", "c2")),
        (ctx(13, 1_020), place_msg("provider1", "job-000003", "c1")),
        (ctx(14, 1_030), report_msg("provider2", "job-000002", JobState::Running, None)),
        (ctx(15, 1_900), report_msg("provider2", "job-000002", JobState::Failed, None)),
        (
            ctx(20, 2_810),
            report_msg("provider1", "job-000001", JobState::Completed, Some(node_usage(4, 1_800))),
        ),
    ];
    msgs.push((
        ctx(21, 2_900),
        Msg::CancelJob {
            sender: "carol".to_string(),
            job_id: "job-000003".to_string(),
            reason: None,
        },
    ));
    msgs
}

/// Equal offerings on both clusters, so ties go to `c1`.
fn setup(keeper: &mut Keeper<InMemoryEscrow>) {
    register_cluster(keeper, ctx(1, 100), "c1", "provider1", 10);
    create_offering(keeper, ctx(1, 100), "c1", "provider1", "1000uve");
    register_cluster(keeper, ctx(1, 100), "c2", "provider2", 12);
    create_offering(keeper, ctx(1, 100), "c2", "provider2", "1000uve");
    for who in ["alice", "bob", "carol"] {
        keeper.escrow_mut().deposit(who, 50_000);
    }
}

fn funded_two_clusters(params: &EngineParams) -> Keeper<InMemoryEscrow> {
    let mut keeper = test_keeper(params);
    setup(&mut keeper);
    keeper
}

/// Apply every message, keeping the outcome of each.
fn run(keeper: &mut Keeper<InMemoryEscrow>, msgs: &[(BlockContext, Msg)]) -> Vec<Result<Vec<EngineEvent>, String>> {
    msgs.iter()
        .map(|(at, msg)| keeper.apply(at, msg.clone()).map_err(|e| e.to_string()))
        .collect()
}

/// Capacity held by queued and running jobs matches what clusters report.
fn assert_capacity_consistent(keeper: &Keeper<InMemoryEscrow>) {
    let jobs = keeper.query().jobs().unwrap();
    for cluster in keeper.query().clusters().unwrap() {
        assert!(cluster.capacity_consistent(), "cluster {} over capacity", cluster.id);
        let held: u32 = jobs
            .iter()
            .filter(|j| j.state.holds_capacity() && j.cluster_id.as_deref() == Some(cluster.id.as_str()))
            .map(|j| j.nodes)
            .sum();
        assert_eq!(
            cluster.available_nodes,
            cluster.total_nodes - held,
            "cluster {} available nodes",
            cluster.id
        );
    }
}

#[test]
fn replay_is_deterministic() {
    let params = test_params();
    let msgs = workload();

    let mut a = funded_two_clusters(&params);
    let mut b = funded_two_clusters(&params);
    let out_a = run(&mut a, &msgs);
    let out_b = run(&mut b, &msgs);
    assert_eq!(out_a, out_b);
    assert_eq!(a.process_cycle(&ctx(40, 9_000)).unwrap(), b.process_cycle(&ctx(40, 9_000)).unwrap());

    assert_eq!(a.query().jobs().unwrap(), b.query().jobs().unwrap());
    assert_eq!(a.query().clusters().unwrap(), b.query().clusters().unwrap());
    for job in a.query().jobs().unwrap() {
        assert_eq!(a.query().decisions(&job.id).unwrap(), b.query().decisions(&job.id).unwrap());
        assert_eq!(a.query().audit_trail(&job.id).unwrap(), b.query().audit_trail(&job.id).unwrap());
        assert_eq!(a.query().accounting(&job.id).unwrap(), b.query().accounting(&job.id).unwrap());
        assert_eq!(a.query().reward(&job.id).unwrap(), b.query().reward(&job.id).unwrap());
    }
    for who in ["alice", "bob", "carol", "provider1", "provider2", "treasury"] {
        assert_eq!(balance(&a, who), balance(&b, who), "balance of {who}");
    }
}

#[test]
fn replay_survives_a_reopened_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.redb");
    let params = test_params();
    let msgs = workload();
    let (first, rest) = msgs.split_at(6);

    let mut reference = funded_two_clusters(&params);
    run(&mut reference, &msgs);

    // Half the workload, then reopen the same file and finish.
    let escrow = {
        let store = StateStore::open(&path).unwrap();
        let mut keeper = Keeper::new(store, InMemoryEscrow::new(), &params).unwrap();
        setup(&mut keeper);
        run(&mut keeper, first);
        std::mem::take(keeper.escrow_mut())
    };
    let store = StateStore::open(&path).unwrap();
    let mut reopened = Keeper::new(store, escrow, &params).unwrap();
    run(&mut reopened, rest);

    assert_eq!(reopened.query().jobs().unwrap(), reference.query().jobs().unwrap());
    assert_eq!(reopened.query().clusters().unwrap(), reference.query().clusters().unwrap());
    assert_eq!(balance(&reopened, "alice"), balance(&reference, "alice"));
}

#[test]
fn capacity_matches_held_jobs_after_every_message() {
    let params = test_params();
    let mut keeper = funded_two_clusters(&params);
    for (at, msg) in workload() {
        let _ = keeper.apply(&at, msg);
        assert_capacity_consistent(&keeper);
    }
    keeper.process_cycle(&ctx(40, 9_000)).unwrap();
    assert_capacity_consistent(&keeper);
}

#[test]
fn escrow_conserves_deposits() {
    let params = test_params();
    let mut keeper = funded_two_clusters(&params);
    run(&mut keeper, &workload());
    keeper.process_cycle(&ctx(40, 9_000)).unwrap();

    let holders = ["alice", "bob", "carol", "provider1", "provider2", "treasury"];
    let mut total: u64 = holders.iter().map(|who| balance(&keeper, who)).sum();
    for job in keeper.query().jobs().unwrap() {
        total += keeper.escrow().balance(&Account::escrow(&job.escrow_id));
    }
    assert_eq!(total, 150_000);
}

#[test]
fn lifecycle_never_moves_backwards() {
    let params = test_params();
    let mut keeper = funded_two_clusters(&params);
    run(&mut keeper, &workload()[..5]);
    assert_eq!(keeper.query().job("job-000001").unwrap().state, JobState::Running);

    let err = keeper
        .apply(&ctx(30, 1_100), report_msg("provider1", "job-000001", JobState::Queued, None))
        .unwrap_err();
    assert!(matches!(err, KeeperError::Lifecycle(_)));

    keeper
        .apply(
            &ctx(31, 1_200),
            report_msg("provider1", "job-000001", JobState::Running, Some(node_usage(4, 100))),
        )
        .unwrap();
    // cumulative usage may not shrink
    let err = keeper
        .apply(
            &ctx(32, 1_300),
            report_msg("provider1", "job-000001", JobState::Running, Some(node_usage(4, 50))),
        )
        .unwrap_err();
    assert!(matches!(err, KeeperError::Invalid(_)));

    let history = keeper.query().job("job-000001").unwrap().history;
    let states: Vec<JobState> = history.iter().map(|t| t.to).collect();
    assert_eq!(states, vec![JobState::Queued, JobState::Starting, JobState::Running]);
}

#[test]
fn terminal_report_replay_is_idempotent() {
    let params = test_params();
    let mut keeper = with_cluster(&params, "1000uve");
    keeper.escrow_mut().deposit("alice", 10_000);
    let job_id = submit(&mut keeper, ctx(10, 1_000), "alice", 4, 1_800, "5000uve");
    keeper.apply(&ctx(11, 1_005), place_msg("provider1", &job_id, "c1")).unwrap();
    report(&mut keeper, ctx(12, 1_010), "provider1", &job_id, JobState::Running, None);
    let events = report(&mut keeper, ctx(20, 2_810), "provider1", &job_id, JobState::Completed, None);
    assert_eq!(count_rewards(&events), 1);

    let before = ["alice", "provider1", "treasury"].map(|who| balance(&keeper, who));
    for height in 21..24 {
        let events = report(
            &mut keeper,
            ctx(height, 2_900),
            "provider1",
            &job_id,
            JobState::Completed,
            None,
        );
        assert!(events.is_empty());
    }
    assert!(keeper.process_cycle(&ctx(25, 3_000)).unwrap().is_empty());

    assert_eq!(["alice", "provider1", "treasury"].map(|who| balance(&keeper, who)), before);
    assert_eq!(keeper.query().accounting(&job_id).unwrap().len(), 1);
    assert_eq!(keeper.query().settlement_entries(&job_id).unwrap().len(), 1);
    assert_eq!(keeper.query().cluster("c1").unwrap().available_nodes, 10);
}

#[test]
fn failed_settlement_retries_until_it_lands() {
    let params = test_params();
    let mut keeper = with_cluster(&params, "1000uve");
    keeper.escrow_mut().deposit("alice", 10_000);
    let job_id = submit(&mut keeper, ctx(10, 1_000), "alice", 4, 1_800, "5000uve");
    keeper.apply(&ctx(11, 1_005), place_msg("provider1", &job_id, "c1")).unwrap();
    report(&mut keeper, ctx(12, 1_010), "provider1", &job_id, JobState::Running, None);

    keeper.escrow_mut().fail_transfers_for("provider1");
    let events = report(&mut keeper, ctx(20, 2_810), "provider1", &job_id, JobState::Completed, None);
    assert_eq!(count_rewards(&events), 0);

    // terminal state and final record are kept; escrow is untouched
    let job = keeper.query().job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(matches!(job.settlement, SettlementStatus::PendingRetry { attempts: 1, .. }));
    assert!(keeper.query().final_record(&job_id).unwrap().is_some());
    assert_eq!(keeper.escrow().balance(&Account::escrow(&job.escrow_id)), 5_000);
    assert_eq!(balance(&keeper, "treasury"), 0);
    assert_eq!(keeper.query().cluster("c1").unwrap().available_nodes, 10);

    let events = keeper.process_cycle(&ctx(21, 2_820)).unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::SettlementFailed { attempts: 2, abandoned: false, .. }
    )));

    keeper.escrow_mut().clear_failures();
    let events = keeper.process_cycle(&ctx(22, 2_830)).unwrap();
    assert_eq!(count_rewards(&events), 1);
    assert_eq!(balance(&keeper, "provider1"), 1_950);
    assert_eq!(balance(&keeper, "alice"), 8_000);
    assert_eq!(keeper.query().accounting(&job_id).unwrap().len(), 1);
    assert!(keeper.process_cycle(&ctx(23, 2_840)).unwrap().is_empty());
}

#[test]
fn settlement_is_abandoned_after_retry_limit() {
    let mut params = test_params();
    params.settlement.max_settlement_retries = 2;
    let mut keeper = with_cluster(&params, "1000uve");
    keeper.escrow_mut().deposit("alice", 10_000);
    let job_id = submit(&mut keeper, ctx(10, 1_000), "alice", 4, 1_800, "5000uve");
    keeper.apply(&ctx(11, 1_005), place_msg("provider1", &job_id, "c1")).unwrap();
    keeper.escrow_mut().fail_transfers_for("treasury");
    report(&mut keeper, ctx(12, 1_010), "provider1", &job_id, JobState::Running, None);
    report(&mut keeper, ctx(20, 2_810), "provider1", &job_id, JobState::Completed, None);

    let events = keeper.process_cycle(&ctx(21, 2_820)).unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::SettlementFailed { attempts: 2, abandoned: true, .. }
    )));
    let job = keeper.query().job(&job_id).unwrap();
    assert!(matches!(job.settlement, SettlementStatus::Abandoned { attempts: 2, .. }));

    // abandoned jobs are left for operators
    keeper.escrow_mut().clear_failures();
    assert!(keeper.process_cycle(&ctx(22, 2_830)).unwrap().is_empty());
    assert_eq!(balance(&keeper, "alice"), 5_000);
}

#[test]
fn rejected_messages_leave_state_untouched() {
    let params = test_params();
    let mut keeper = with_cluster(&params, "1000uve");
    keeper.escrow_mut().deposit("alice", 10_000);
    let job_id = submit(&mut keeper, ctx(10, 1_000), "alice", 4, 1_800, "5000uve");
    let before = keeper.query().job(&job_id).unwrap();

    let bad = [
        submit_msg("", 1, 600, "1000uve"),
        submit_msg("alice", 0, 600, "1000uve"),
        submit_msg("alice", 1, 0, "1000uve"),
        submit_msg("alice", 1, 600, "1000atom"),
        submit_msg("alice", 1, 600, "0uve"),
        submit_msg("alice", 1, 600, "-5uve"),
        report_msg("provider1", &job_id, JobState::Running, None),
        Msg::ScheduleJob {
            sender: "mallory".to_string(),
            job_id: job_id.clone(),
        },
    ];
    for msg in bad {
        assert!(keeper.apply(&ctx(11, 1_005), msg).is_err());
    }
    assert_eq!(keeper.query().job(&job_id).unwrap(), before);
    assert_eq!(keeper.query().jobs().unwrap().len(), 1);
    assert_eq!(balance(&keeper, "alice"), 5_000);
}
