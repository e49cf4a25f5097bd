//! End-to-end convergence cycles over a real store.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use lodestar_core::Error;
use lodestar_core::models::{
    ActualLrpFilter, ActualLrpState, ActualLrpUpdate, Task, TaskFilter, TaskState,
};
use lodestar_state::callback::TaskCallbackHandler;
use lodestar_state::hub::{ActualLrpEvent, TaskEvent};
use lodestar_state::convergence::{CallbackDispatch, ConvergenceConfig, EXPIRED_PENDING_REASON};
use lodestar_state::workpool::WorkPool;
use lodestar_test_utils::{
    TestContext, assert_instances_in_state, assert_task_deleted, assert_task_state,
    desired_lrp, instance_key, task_definition, task_guid,
};

macro_rules! both_backends {
    ($($scenario:ident),* $(,)?) => {
        mod sqlite {
            $(
                #[tokio::test]
                async fn $scenario() {
                    super::$scenario(lodestar_test_utils::TestContext::sqlite().await).await;
                }
            )*
        }

        mod kv {
            $(
                #[tokio::test]
                async fn $scenario() {
                    super::$scenario(lodestar_test_utils::TestContext::kv().await).await;
                }
            )*
        }
    };
}

both_backends!(
    missing_instances_are_started,
    second_cycle_is_quiet,
    lost_cell_instances_are_replaced,
    extra_instances_are_stopped,
    orphans_in_stale_domains_survive,
    crashed_instances_follow_the_policy,
    stale_unclaimed_instances_are_offered_again,
    stale_pending_task_is_redispatched_once_per_cycle,
    expired_tasks_are_failed_and_deleted,
    running_task_on_lost_cell_fails,
    completed_callbacks_are_submitted_once,
    cycle_changes_reach_subscribers,
    follower_cycle_changes_nothing,
    task_moved_after_the_snapshot_is_not_redispatched,
);

async fn missing_instances_are_started(ctx: TestContext) {
    ctx.desire("web", 3).await;
    ctx.run_instance("web", 0, "cell-1").await;

    let report = ctx
        .converger()
        .converge_once()
        .await
        .expect("cycle")
        .expect("not skipped");

    assert_eq!(report.lrp_starts, 2);
    assert_eq!(report.lrp_stops, 0);
    assert_eq!(ctx.auction.lrp_starts(), 2);
    assert_eq!(ctx.auction.lrp_stops(), 0);

    let batches = ctx.auction.lrp_batches();
    assert_eq!(batches.len(), 1, "one auction request per cycle");
    assert_eq!(batches[0][0].indices, vec![1, 2]);
    assert_instances_in_state(ctx.store.as_ref(), "web", ActualLrpState::Unclaimed, 2).await;
}

async fn second_cycle_is_quiet(ctx: TestContext) {
    ctx.desire("web", 3).await;
    ctx.run_instance("web", 0, "cell-1").await;
    ctx.store
        .desire_task(&task_guid(), "tasks", &task_definition(None))
        .await
        .expect("task");

    let converger = ctx.converger();
    let first = converger.converge_once().await.expect("cycle").expect("ran");
    assert!(first.total_work() > 0);
    ctx.auction.clear();

    let second = converger.converge_once().await.expect("cycle").expect("ran");
    assert_eq!(second.total_work(), 0, "unexpected work: {second:?}");
    assert_eq!(second.cycle, 2);
    assert_eq!(ctx.auction.lrp_starts(), 0);
    assert_eq!(ctx.auction.task_starts(), 0);
}

async fn lost_cell_instances_are_replaced(ctx: TestContext) {
    ctx.desire("web", 2).await;
    ctx.run_instance("web", 0, "cell-1").await;
    ctx.run_instance("web", 1, "cell-2").await;
    assert!(ctx.cells.remove("cell-2"));

    let report = ctx.converger().converge_once().await.expect("cycle").expect("ran");

    assert_eq!(report.lrp_stops, 1);
    assert_eq!(report.lrp_starts, 1);
    let stops = ctx.auction.stop_batches();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0][0].instance_key, instance_key("web", 1, "cell-2"));
    let starts = ctx.auction.lrp_batches();
    assert_eq!(starts[0][0].indices, vec![1]);

    let group = ctx.store.actual_lrp_group("web", 1).await.expect("group");
    let replacement = group.instance.expect("replacement");
    assert_eq!(replacement.state, ActualLrpState::Unclaimed);
    assert!(replacement.instance_key.is_empty());
}

async fn extra_instances_are_stopped(ctx: TestContext) {
    ctx.desire("web", 1).await;
    ctx.run_instance("web", 0, "cell-1").await;
    ctx.run_instance("web", 1, "cell-1").await;
    ctx.run_instance("retired", 0, "cell-2").await;

    let report = ctx.converger().converge_once().await.expect("cycle").expect("ran");

    assert_eq!(report.lrp_stops, 2);
    assert_eq!(report.lrp_starts, 0);
    assert_eq!(ctx.auction.lrp_stops(), 2);
    assert!(ctx.store.actual_lrp_group("retired", 0).await.is_err());
    assert_instances_in_state(ctx.store.as_ref(), "web", ActualLrpState::Running, 1).await;
}

async fn orphans_in_stale_domains_survive(ctx: TestContext) {
    ctx.store
        .upsert_domain("apps", Duration::from_secs(30))
        .await
        .expect("domain");
    ctx.run_instance("retired", 0, "cell-1").await;
    ctx.advance(Duration::from_secs(60));

    let report = ctx.converger().converge_once().await.expect("cycle").expect("ran");

    assert_eq!(report.lrp_stops, 0);
    assert!(ctx.store.actual_lrp_group("retired", 0).await.is_ok());
}

async fn crashed_instances_follow_the_policy(ctx: TestContext) {
    ctx.desire("web", 2).await;
    for index in 0..2 {
        ctx.run_instance("web", index, "cell-1").await;
    }

    // Index 0 crashes once and restarts right away; index 1 crashes past the
    // immediate restarts and has to wait.
    crash(&ctx, 0, 1).await;
    crash(&ctx, 1, 4).await;

    let converger = ctx.converger();
    let report = converger.converge_once().await.expect("cycle").expect("ran");
    assert_eq!(report.crashed_restarted, 1);
    assert_eq!(report.lrp_starts, 1);
    let restarted = ctx.store.actual_lrp_group("web", 0).await.expect("group");
    assert_eq!(restarted.instance.expect("slot").state, ActualLrpState::Unclaimed);

    ctx.advance(Duration::from_secs(61));
    let report = converger.converge_once().await.expect("cycle").expect("ran");
    assert_eq!(report.crashed_restarted, 1);
}

async fn crash(ctx: &TestContext, index: u32, times: u32) {
    for attempt in 0..times {
        if attempt > 0 {
            ctx.store
                .update_actual_lrp("web", index, false, None, &ActualLrpUpdate::RestartCrashed)
                .await
                .expect("restart");
            ctx.store
                .update_actual_lrp("web", index, false, None, &ActualLrpUpdate::Start {
                    instance_key: instance_key("web", index, "cell-1"),
                    net_info: lodestar_test_utils::net_info(),
                })
                .await
                .expect("start");
        }
        ctx.store
            .update_actual_lrp("web", index, false, None, &ActualLrpUpdate::Crash {
                instance_key: instance_key("web", index, "cell-1"),
                reason: "exit status 1".to_string(),
            })
            .await
            .expect("crash");
    }
}

async fn stale_unclaimed_instances_are_offered_again(ctx: TestContext) {
    ctx.desire("web", 1).await;
    let converger = ctx.converger();
    let report = converger.converge_once().await.expect("cycle").expect("ran");
    assert_eq!(report.lrp_starts, 1);

    ctx.advance(Duration::from_secs(45));
    let report = converger.converge_once().await.expect("cycle").expect("ran");
    assert_eq!(report.stale_refreshed, 1);
    assert_eq!(report.lrp_starts, 1);
    assert_eq!(ctx.auction.lrp_starts(), 2);

    let slot = ctx
        .store
        .actual_lrp_group("web", 0)
        .await
        .expect("group")
        .instance
        .expect("slot");
    assert_eq!(slot.since, lodestar_core::Clock::now(&ctx.clock));
}

async fn stale_pending_task_is_redispatched_once_per_cycle(ctx: TestContext) {
    let guid = task_guid();
    ctx.store
        .desire_task(&guid, "tasks", &task_definition(None))
        .await
        .expect("task");
    let converger = ctx.converger();

    ctx.advance(Duration::from_secs(31));
    let report = converger.converge_once().await.expect("cycle").expect("ran");
    assert_eq!(report.tasks_dispatched, 1);
    assert_eq!(ctx.auction.task_starts(), 1);

    let report = converger.converge_once().await.expect("cycle").expect("ran");
    assert_eq!(report.tasks_dispatched, 0, "kick refreshed the task");

    ctx.advance(Duration::from_secs(31));
    let report = converger.converge_once().await.expect("cycle").expect("ran");
    assert_eq!(report.tasks_dispatched, 1);
    assert_eq!(ctx.auction.task_starts(), 2);
    assert_task_state(ctx.store.as_ref(), &guid, TaskState::Pending).await;
}

async fn expired_tasks_are_failed_and_deleted(ctx: TestContext) {
    let guid = task_guid();
    ctx.store
        .desire_task(&guid, "tasks", &task_definition(None))
        .await
        .expect("task");
    let converger = ctx.converger_with(ConvergenceConfig {
        expire_pending_task_duration: Duration::from_secs(120),
        ..ConvergenceConfig::default()
    });

    ctx.advance(Duration::from_secs(121));
    let report = converger.converge_once().await.expect("cycle").expect("ran");
    assert_eq!(report.tasks_failed, 1);
    let failed = ctx.store.task_by_guid(&guid).await.expect("task");
    assert!(failed.failed);
    assert_eq!(failed.failure_reason, EXPIRED_PENDING_REASON);

    ctx.advance(Duration::from_secs(121));
    let report = converger.converge_once().await.expect("cycle").expect("ran");
    assert_eq!(report.tasks_deleted, 1);
    assert_task_deleted(ctx.store.as_ref(), &guid).await;
}

async fn running_task_on_lost_cell_fails(ctx: TestContext) {
    let guid = task_guid();
    ctx.store
        .desire_task(&guid, "tasks", &task_definition(None))
        .await
        .expect("task");
    ctx.store.start_task(&guid, "cell-2").await.expect("start");
    ctx.cells.remove("cell-2");

    let report = ctx.converger().converge_once().await.expect("cycle").expect("ran");

    assert_eq!(report.tasks_failed, 1);
    assert_task_state(ctx.store.as_ref(), &guid, TaskState::Completed).await;
}

#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl TaskCallbackHandler for RecordingHandler {
    async fn handle(&self, task: Task) {
        self.seen.lock().expect("lock").push(task.guid);
    }
}

async fn completed_callbacks_are_submitted_once(ctx: TestContext) {
    let guid = task_guid();
    ctx.store
        .desire_task(&guid, "tasks", &task_definition(Some("http://callback.invalid/done")))
        .await
        .expect("task");
    ctx.store.start_task(&guid, "cell-1").await.expect("start");
    ctx.store
        .complete_task(&guid, "cell-1", false, "", "ok")
        .await
        .expect("complete");

    let handler = Arc::new(RecordingHandler::default());
    let pool = Arc::new(WorkPool::start("callbacks", 2, 8));
    let converger = ctx.converger().with_callbacks(CallbackDispatch::new(
        Arc::clone(&pool),
        Arc::clone(&handler) as Arc<dyn TaskCallbackHandler>,
    ));

    ctx.advance(Duration::from_secs(31));
    let report = converger.converge_once().await.expect("cycle").expect("ran");
    assert_eq!(report.tasks_resolving, 1);
    let report = converger.converge_once().await.expect("cycle").expect("ran");
    assert_eq!(report.tasks_resolving, 0);

    pool.stop().await;
    assert_eq!(*handler.seen.lock().expect("lock"), vec![guid.clone()]);
    assert_task_state(ctx.store.as_ref(), &guid, TaskState::Resolving).await;
}

async fn cycle_changes_reach_subscribers(ctx: TestContext) {
    let mut actuals = ctx
        .service
        .subscribe_actual(ActualLrpFilter::default())
        .expect("subscribe");
    let mut tasks = ctx
        .service
        .subscribe_tasks(TaskFilter::default())
        .expect("subscribe");

    ctx.desire("web", 2).await;
    ctx.run_instance("web", 2, "cell-1").await;
    let guid = task_guid();
    ctx.store
        .desire_task(&guid, "tasks", &task_definition(None))
        .await
        .expect("task");
    ctx.advance(Duration::from_secs(31 * 60));

    let report = ctx.converger().converge_once().await.expect("cycle").expect("ran");
    assert_eq!((report.lrp_starts, report.lrp_stops, report.tasks_failed), (2, 1, 1));

    let mut created = Vec::new();
    let mut removed = Vec::new();
    while let Some(event) = actuals.try_recv() {
        match event {
            ActualLrpEvent::Created(lrp) => created.push(lrp.key.index),
            ActualLrpEvent::Removed(lrp) => removed.push(lrp.key.index),
            ActualLrpEvent::Changed { .. } => {}
        }
    }
    created.sort_unstable();
    assert_eq!(created, vec![0, 1]);
    assert_eq!(removed, vec![2]);

    match tasks.try_recv() {
        Some(TaskEvent::Changed { before, after }) => {
            assert_eq!(before.state, TaskState::Pending);
            assert_eq!(after.guid, guid);
            assert!(after.failed);
        }
        other => panic!("expected a task change, got {other:?}"),
    }
    assert!(tasks.try_recv().is_none());
}

async fn follower_cycle_changes_nothing(ctx: TestContext) {
    ctx.desire("web", 2).await;
    ctx.run_instance("web", 3, "cell-1").await;
    ctx.service.leadership().release().await.expect("release");

    let converger = ctx.converger();
    let err = converger.converge_once().await.expect_err("not leader");
    assert!(matches!(err, Error::LeadershipLost { .. }), "got {err:?}");

    assert_eq!(ctx.auction.lrp_starts(), 0);
    assert_eq!(ctx.auction.lrp_stops(), 0);
    let actuals = ctx
        .store
        .actual_lrps(&ActualLrpFilter::default())
        .await
        .expect("actuals");
    assert_eq!(actuals.len(), 1, "only the extra instance exists");
    assert_eq!(actuals[0].key.index, 3);
}

async fn task_moved_after_the_snapshot_is_not_redispatched(ctx: TestContext) {
    ctx.desire("web", 1).await;
    let guid = task_guid();
    ctx.store
        .desire_task(&guid, "tasks", &task_definition(None))
        .await
        .expect("task");
    ctx.advance(Duration::from_secs(31));

    let live: std::collections::HashSet<String> = ["cell-1".to_string()].into_iter().collect();
    let snapshot = ctx
        .store
        .convergence_snapshot(&live, lodestar_core::Clock::now(&ctx.clock))
        .await
        .expect("snapshot");
    assert_eq!(snapshot.lrps.missing.len(), 1);
    let seen = snapshot
        .tasks
        .tasks
        .iter()
        .find(|task| task.guid == guid)
        .expect("task in snapshot")
        .clone();
    assert_eq!(seen.state, TaskState::Pending);
    assert_eq!(snapshot.tasks.counts["PENDING"], 1);

    // A cell picks the task up before the cycle acts on what it read.
    ctx.advance(Duration::from_secs(1));
    assert!(ctx.store.start_task(&guid, "cell-1").await.expect("start"));

    assert!(!ctx.store.kick_task(&guid, seen.updated_at).await.expect("kick"));
    assert_task_state(ctx.store.as_ref(), &guid, TaskState::Running).await;
}

/// Writes an instance and then starts a task while snapshots are taken; a
/// snapshot that shows the task running must also show the instance.
#[tokio::test]
async fn sqlite_snapshot_reads_both_halves_at_once() {
    let ctx = TestContext::sqlite().await;
    ctx.desire("web", 1).await;
    let live: std::collections::HashSet<String> = ["cell-1".to_string()].into_iter().collect();

    for round in 0..20 {
        let guid = format!("ordered-{round}");
        let process_guid = format!("extra-{round}");
        ctx.store
            .desire_task(&guid, "tasks", &task_definition(None))
            .await
            .expect("task");

        let writer = {
            let store = Arc::clone(&ctx.store);
            let guid = guid.clone();
            let process_guid = process_guid.clone();
            tokio::spawn(async move {
                store
                    .create_unclaimed_actual_lrp(&lodestar_test_utils::actual_key(&process_guid, 0))
                    .await
                    .expect("create");
                store.start_task(&guid, "cell-1").await.expect("start");
            })
        };
        let reader = {
            let store = Arc::clone(&ctx.store);
            let live = live.clone();
            let now = lodestar_core::Clock::now(&ctx.clock);
            tokio::spawn(async move { store.convergence_snapshot(&live, now).await })
        };

        let snapshot = reader.await.expect("join").expect("snapshot");
        writer.await.expect("join");

        let task_running = snapshot
            .tasks
            .tasks
            .iter()
            .any(|task| task.guid == guid && task.state == TaskState::Running);
        let instance_seen = snapshot.lrps.counts.unclaimed > u64::try_from(round).expect("round");
        assert!(
            !task_running || instance_seen,
            "round {round}: task running without its instance"
        );
    }
}
