//! Record store behaviour shared by the SQL and key-value backends.
//!
//! Every scenario runs once against in-memory SQLite and once against the
//! in-memory key-value backend.

use std::time::Duration;

use lodestar_core::Error;
use lodestar_core::models::{
    ActualLrpFilter, ActualLrpState, ActualLrpUpdate, DesiredLrpFilter, DesiredLrpUpdate,
    TaskFilter, TaskState,
};
use lodestar_test_utils::{
    TestContext, actual_key, assert_task_deleted, assert_task_state, desired_lrp, instance_key,
    net_info, task_definition, task_guid,
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
    desired_lrp_lifecycle,
    stale_tag_is_rejected,
    filters_select_by_domain_and_guid,
    actual_lrp_lifecycle,
    removal_checks_the_incarnation,
    task_lifecycle,
    task_transitions_are_enforced,
    kick_only_touches_unchanged_tasks,
    domains_expire,
    schema_version_is_recorded,
);

async fn desired_lrp_lifecycle(ctx: TestContext) {
    let store = &ctx.store;
    let created = store.desire_lrp(&desired_lrp("web", 2)).await.expect("desire");
    assert_eq!(created.modification_tag.index, 0);
    assert!(!created.modification_tag.epoch.is_empty());

    let err = store.desire_lrp(&desired_lrp("web", 2)).await.unwrap_err();
    assert!(matches!(err, Error::ResourceExists { .. }), "got {err:?}");

    let update = DesiredLrpUpdate {
        instances: Some(5),
        annotation: Some("scaled".to_string()),
        ..DesiredLrpUpdate::default()
    };
    let change = store
        .update_desired_lrp("web", Some(&created.modification_tag), &update)
        .await
        .expect("update");
    assert_eq!(change.before.instances, 2);
    assert_eq!(change.after.instances, 5);
    assert_eq!(change.after.modification_tag.index, 1);
    assert_eq!(change.after.modification_tag.epoch, created.modification_tag.epoch);

    let read = store.desired_lrp_by_process_guid("web").await.expect("read");
    assert_eq!(read.instances, 5);
    assert_eq!(read.annotation, "scaled");

    let removed = store.remove_desired_lrp("web").await.expect("remove");
    assert_eq!(removed.process_guid, "web");
    let err = store.desired_lrp_by_process_guid("web").await.unwrap_err();
    assert!(matches!(err, Error::ResourceNotFound { .. }), "got {err:?}");
    let err = store.remove_desired_lrp("web").await.unwrap_err();
    assert!(matches!(err, Error::ResourceNotFound { .. }), "got {err:?}");
}

async fn stale_tag_is_rejected(ctx: TestContext) {
    let store = &ctx.store;
    let created = store.desire_lrp(&desired_lrp("web", 1)).await.expect("desire");
    let update = DesiredLrpUpdate {
        instances: Some(2),
        ..DesiredLrpUpdate::default()
    };
    store
        .update_desired_lrp("web", Some(&created.modification_tag), &update)
        .await
        .expect("first update");

    let err = store
        .update_desired_lrp("web", Some(&created.modification_tag), &update)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }), "got {err:?}");

    // Without an expected tag the update goes through and still bumps it.
    let change = store
        .update_desired_lrp("web", None, &update)
        .await
        .expect("untagged update");
    assert_eq!(change.after.modification_tag.index, 2);
}

async fn filters_select_by_domain_and_guid(ctx: TestContext) {
    let store = &ctx.store;
    store.desire_lrp(&desired_lrp("web", 1)).await.expect("desire");
    store.desire_lrp(&desired_lrp("worker", 1)).await.expect("desire");
    let other = lodestar_core::models::DesiredLrp::builder("admin", "ops")
        .instances(1)
        .build();
    store.desire_lrp(&other).await.expect("desire");

    let apps = store
        .desired_lrps(&DesiredLrpFilter::domain("apps"))
        .await
        .expect("by domain");
    assert_eq!(apps.len(), 2);

    let infos = store
        .desired_lrp_scheduling_infos(&DesiredLrpFilter::process_guids(["admin", "web"]))
        .await
        .expect("by guid");
    let mut guids: Vec<_> = infos.iter().map(|i| i.key.process_guid.as_str()).collect();
    guids.sort_unstable();
    assert_eq!(guids, ["admin", "web"]);
}

async fn actual_lrp_lifecycle(ctx: TestContext) {
    let store = &ctx.store;
    let key = actual_key("web", 0);
    let created = store.create_unclaimed_actual_lrp(&key).await.expect("create");
    assert_eq!(created.state, ActualLrpState::Unclaimed);

    let err = store.create_unclaimed_actual_lrp(&key).await.unwrap_err();
    assert!(matches!(err, Error::ResourceExists { .. }), "got {err:?}");

    let ik = instance_key("web", 0, "cell-1");
    let claimed = store
        .update_actual_lrp("web", 0, false, None, &ActualLrpUpdate::Claim {
            instance_key: ik.clone(),
        })
        .await
        .expect("claim");
    assert!(claimed.changed());
    assert_eq!(claimed.after.state, ActualLrpState::Claimed);

    let started = store
        .update_actual_lrp("web", 0, false, Some(&claimed.after.modification_tag), &ActualLrpUpdate::Start {
            instance_key: ik.clone(),
            net_info: net_info(),
        })
        .await
        .expect("start");
    assert_eq!(started.after.state, ActualLrpState::Running);
    assert_eq!(started.after.net_info, net_info());

    // A crash report from another incarnation is stale.
    let err = store
        .update_actual_lrp("web", 0, false, None, &ActualLrpUpdate::Crash {
            instance_key: instance_key("web", 0, "cell-2"),
            reason: "oom".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }), "got {err:?}");

    let crashed = store
        .update_actual_lrp("web", 0, false, None, &ActualLrpUpdate::Crash {
            instance_key: ik,
            reason: "oom".to_string(),
        })
        .await
        .expect("crash");
    assert_eq!(crashed.after.crash_count, 1);
    assert_eq!(crashed.after.crash_reason, "oom");

    let on_cell = store
        .actual_lrps(&ActualLrpFilter::cell("cell-1"))
        .await
        .expect("by cell");
    assert!(on_cell.is_empty(), "a crashed instance is no longer placed");

    let group = store.actual_lrp_group("web", 0).await.expect("group");
    assert!(group.instance.is_some());
    assert!(group.evacuating.is_none());
    let err = store.actual_lrp_group("web", 1).await.unwrap_err();
    assert!(matches!(err, Error::ResourceNotFound { .. }), "got {err:?}");
}

async fn removal_checks_the_incarnation(ctx: TestContext) {
    ctx.run_instance("web", 0, "cell-1").await;
    let store = &ctx.store;

    let err = store
        .remove_actual_lrp("web", 0, Some(&instance_key("web", 0, "cell-2")), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CannotBeRemoved { .. }), "got {err:?}");

    let removed = store
        .remove_actual_lrp("web", 0, Some(&instance_key("web", 0, "cell-1")), None)
        .await
        .expect("remove");
    assert_eq!(removed.state, ActualLrpState::Running);

    let err = store.remove_actual_lrp("web", 0, None, None).await.unwrap_err();
    assert!(matches!(err, Error::ResourceNotFound { .. }), "got {err:?}");
}

async fn task_lifecycle(ctx: TestContext) {
    let store = &ctx.store;
    let guid = task_guid();
    let task = store
        .desire_task(&guid, "tasks", &task_definition(None))
        .await
        .expect("desire");
    assert_eq!(task.state, TaskState::Pending);

    let err = store
        .desire_task(&guid, "tasks", &task_definition(None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ResourceExists { .. }), "got {err:?}");

    assert!(store.start_task(&guid, "cell-1").await.expect("start"));
    assert!(!store.start_task(&guid, "cell-1").await.expect("restart on same cell"));
    let running = store
        .tasks(&TaskFilter {
            cell_id: Some("cell-1".to_string()),
            ..TaskFilter::default()
        })
        .await
        .expect("by cell");
    assert_eq!(running.len(), 1);

    let completed = store
        .complete_task(&guid, "cell-1", false, "", "42")
        .await
        .expect("complete");
    assert_eq!(completed.state, TaskState::Completed);
    assert_eq!(completed.result, "42");
    assert!(completed.first_completed_at.is_some());

    store.resolving_task(&guid).await.expect("resolving");
    assert_task_state(store.as_ref(), &guid, TaskState::Resolving).await;
    store.demote_to_completed(&guid).await.expect("demote");
    assert_task_state(store.as_ref(), &guid, TaskState::Completed).await;

    store.resolving_task(&guid).await.expect("resolving");
    store.delete_task(&guid).await.expect("delete");
    assert_task_deleted(store.as_ref(), &guid).await;
}

async fn task_transitions_are_enforced(ctx: TestContext) {
    let store = &ctx.store;
    let guid = task_guid();
    store
        .desire_task(&guid, "tasks", &task_definition(None))
        .await
        .expect("desire");

    let err = store.delete_task(&guid).await.unwrap_err();
    assert!(matches!(err, Error::BadRequest { .. }), "got {err:?}");

    store.start_task(&guid, "cell-1").await.expect("start");
    let err = store.start_task(&guid, "cell-2").await.unwrap_err();
    assert!(matches!(err, Error::BadRequest { .. }), "got {err:?}");

    let err = store
        .complete_task(&guid, "cell-2", false, "", "")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadRequest { .. }), "got {err:?}");

    let cancelled = store.cancel_task(&guid).await.expect("cancel");
    assert!(cancelled.failed);
    assert_eq!(cancelled.failure_reason, lodestar_core::models::CANCELLED_REASON);
}

async fn kick_only_touches_unchanged_tasks(ctx: TestContext) {
    let store = &ctx.store;
    let guid = task_guid();
    let task = store
        .desire_task(&guid, "tasks", &task_definition(None))
        .await
        .expect("desire");

    ctx.advance(Duration::from_secs(10));
    assert!(store.kick_task(&guid, task.updated_at).await.expect("kick"));
    let kicked = store.task_by_guid(&guid).await.expect("read");
    assert!(kicked.updated_at > task.updated_at);
    assert_eq!(kicked.created_at, task.created_at);

    // The snapshot timestamp is now stale.
    assert!(!store.kick_task(&guid, task.updated_at).await.expect("second kick"));
}

async fn domains_expire(ctx: TestContext) {
    let store = &ctx.store;
    store
        .upsert_domain("apps", Duration::from_secs(60))
        .await
        .expect("upsert");
    store
        .upsert_domain("tasks", Duration::from_secs(300))
        .await
        .expect("upsert");
    let mut fresh = store.fresh_domains().await.expect("fresh");
    fresh.sort();
    assert_eq!(fresh, ["apps", "tasks"]);

    ctx.advance(Duration::from_secs(120));
    assert_eq!(store.fresh_domains().await.expect("fresh"), ["tasks"]);

    store
        .upsert_domain("apps", Duration::from_secs(60))
        .await
        .expect("refresh");
    assert_eq!(store.fresh_domains().await.expect("fresh").len(), 2);
}

async fn schema_version_is_recorded(ctx: TestContext) {
    assert!(ctx.store.schema_version().await.expect("version") >= 1);
}
