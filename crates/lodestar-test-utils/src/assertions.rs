//! Custom assertion helpers for integration tests.

use lodestar_core::models::{ActualLrpFilter, ActualLrpState, TaskState};
use lodestar_state::store::Store;

/// Asserts the number of primary instances of `process_guid` in `state`.
///
/// # Panics
///
/// Panics if the count differs.
pub async fn assert_instances_in_state(
    store: &dyn Store,
    process_guid: &str,
    state: ActualLrpState,
    expected: usize,
) {
    let filter = ActualLrpFilter {
        evacuating: Some(false),
        ..ActualLrpFilter::process(process_guid)
    };
    let actual = store.actual_lrps(&filter).await.expect("actual lrps");
    let matching = actual.iter().filter(|lrp| lrp.state == state).count();
    assert_eq!(
        matching, expected,
        "Expected {expected} {state} instances of {process_guid}, found {matching} in {actual:?}"
    );
}

/// Asserts a task's state.
///
/// # Panics
///
/// Panics if the task is missing or in another state.
pub async fn assert_task_state(store: &dyn Store, guid: &str, expected: TaskState) {
    let task = store.task_by_guid(guid).await.expect("task");
    assert_eq!(
        task.state, expected,
        "Expected task {guid} to be {expected}, but it was {}",
        task.state
    );
}

/// Asserts that a task no longer exists.
///
/// # Panics
///
/// Panics if the task is still stored.
pub async fn assert_task_deleted(store: &dyn Store, guid: &str) {
    let result = store.task_by_guid(guid).await;
    assert!(
        matches!(result, Err(lodestar_core::Error::ResourceNotFound { .. })),
        "Expected task {guid} to be deleted, got {result:?}"
    );
}
