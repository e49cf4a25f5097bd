//! Key rotation through the encryptor.

use std::sync::Arc;
use std::time::Duration;

use lodestar_core::format::Encoder;
use lodestar_core::models::{ActualLrpNetInfo, ActualLrpUpdate, TaskDefinition};
use lodestar_core::{Clock, ManualClock};
use lodestar_state::encryptor::Encryptor;
use lodestar_state::store::Store;
use lodestar_state::store::kv::KvStore;
use lodestar_state::store::sql::SqlStore;
use lodestar_test_utils::{
    RecordingKeyValue, actual_key, desired_lrp, instance_key, net_info, sqlite_store_with,
    task_definition, test_encoder_with,
};

/// Opens a view of the same records through another encoder.
type Reopen = Box<dyn Fn(Encoder) -> Arc<dyn Store>>;

async fn seed(store: &dyn Store) {
    store
        .desire_lrp(&desired_lrp("web", 2))
        .await
        .expect("desire");
    store
        .create_unclaimed_actual_lrp(&actual_key("web", 0))
        .await
        .expect("unclaimed");
    store
        .create_unclaimed_actual_lrp(&actual_key("web", 1))
        .await
        .expect("create");
    store
        .update_actual_lrp("web", 1, false, None, &ActualLrpUpdate::Start {
            instance_key: instance_key("web", 1, "cell-1"),
            net_info: net_info(),
        })
        .await
        .expect("start");
    store
        .evacuate_actual_lrp(
            &actual_key("web", 1),
            &instance_key("web", 1, "cell-1"),
            &net_info(),
            Duration::from_secs(600),
        )
        .await
        .expect("evacuate");
    store
        .desire_task("task-full", "tasks", &task_definition(Some("http://cb.invalid")))
        .await
        .expect("task");
    store
        .desire_task("task-empty", "tasks", &TaskDefinition::default())
        .await
        .expect("empty task");
}

async fn rotate(reopen: Reopen) {
    let old = reopen(test_encoder_with("old", &[]));
    seed(old.as_ref()).await;

    // Records written under "old" are unreadable with only the new key.
    let new_only = reopen(test_encoder_with("new", &[]));
    assert!(new_only.desired_lrp_by_process_guid("web").await.is_err());

    let rotating = reopen(test_encoder_with("new", &["old"]));
    let report = Encryptor::new(Arc::clone(&rotating), "new")
        .run()
        .await
        .expect("rotate")
        .expect("rotation ran");
    assert!(report.rewritten >= 5, "report: {report:?}");
    assert_eq!(report.skipped, 0);
    assert_eq!(
        rotating.encryption_key_label().await.expect("label").as_deref(),
        Some("new")
    );
    assert!(
        Encryptor::new(Arc::clone(&rotating), "new")
            .run()
            .await
            .expect("second run")
            .is_none(),
        "already on the active key"
    );

    let lrp = new_only.desired_lrp_by_process_guid("web").await.expect("desired");
    assert_eq!(lrp.instances, 2);

    let unclaimed = new_only.actual_lrp_group("web", 0).await.expect("group 0");
    assert_eq!(
        unclaimed.instance.expect("slot").net_info,
        ActualLrpNetInfo::default()
    );

    let running = new_only.actual_lrp_group("web", 1).await.expect("group 1");
    assert_eq!(running.instance.expect("slot").net_info, net_info());
    assert_eq!(running.evacuating.expect("evacuating").net_info, net_info());

    let full = new_only.task_by_guid("task-full").await.expect("task");
    assert_eq!(full.definition, task_definition(Some("http://cb.invalid")));
    let empty = new_only.task_by_guid("task-empty").await.expect("empty task");
    assert_eq!(empty.definition, TaskDefinition::default());
}

#[tokio::test]
async fn rotation_rewrites_sqlite_records() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    let first = sqlite_store_with(test_encoder_with("old", &[]), Arc::clone(&clock)).await;
    let pool = first.pool().clone();
    let dialect = first.dialect();

    rotate(Box::new(move |encoder| {
        Arc::new(SqlStore::new(pool.clone(), dialect, encoder, Arc::clone(&clock))) as Arc<dyn Store>
    }))
    .await;
}

#[tokio::test]
async fn rotation_rewrites_kv_records() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    let backend = RecordingKeyValue::new();

    rotate(Box::new(move |encoder| {
        Arc::new(KvStore::new(backend.clone(), encoder, Arc::clone(&clock))) as Arc<dyn Store>
    }))
    .await;
}
