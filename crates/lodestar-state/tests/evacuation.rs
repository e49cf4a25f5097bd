//! Evacuating slots during a cell drain.

use std::time::Duration;

use lodestar_core::Error;
use lodestar_core::models::{ActualLrpFilter, ActualLrpNetInfo, ActualLrpState};
use lodestar_state::store::EvacuationOutcome;
use lodestar_test_utils::{TestContext, actual_key, instance_key, net_info};

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
    evacuation_upserts_the_slot,
    removal_checks_the_incarnation,
    removing_a_missing_slot_succeeds,
    expired_slots_are_replaced_and_removable,
    empty_net_info_is_rejected,
    convergence_removes_expired_slots,
);

const TTL: Duration = Duration::from_secs(60);

async fn evacuation_upserts_the_slot(ctx: TestContext) {
    let key = actual_key("web", 0);
    let ik = instance_key("web", 0, "cell-1");

    let created = ctx
        .store
        .evacuate_actual_lrp(&key, &ik, &net_info(), TTL)
        .await
        .expect("evacuate");
    let EvacuationOutcome::Created(record) = created else {
        panic!("expected a new record, got {created:?}");
    };
    assert!(record.evacuating);
    assert_eq!(record.state, ActualLrpState::Running);
    assert_eq!(record.modification_tag.index, 0);

    let same = ctx
        .store
        .evacuate_actual_lrp(&key, &ik, &net_info(), TTL)
        .await
        .expect("evacuate again");
    assert!(matches!(same, EvacuationOutcome::Unchanged(_)), "got {same:?}");

    let moved = ActualLrpNetInfo::new("10.0.0.9", net_info().ports);
    let updated = ctx
        .store
        .evacuate_actual_lrp(&key, &ik, &moved, TTL)
        .await
        .expect("evacuate with new address");
    let EvacuationOutcome::Updated { after, .. } = updated else {
        panic!("expected an update, got {updated:?}");
    };
    assert_eq!(after.modification_tag.index, 1);
    assert_eq!(after.net_info.address, "10.0.0.9");

    let evacuating = ctx
        .store
        .actual_lrps(&ActualLrpFilter {
            evacuating: Some(true),
            ..ActualLrpFilter::default()
        })
        .await
        .expect("evacuating");
    assert_eq!(evacuating.len(), 1);
}

async fn removal_checks_the_incarnation(ctx: TestContext) {
    let key = actual_key("web", 0);
    ctx.store
        .evacuate_actual_lrp(&key, &instance_key("web", 0, "cell-1"), &net_info(), TTL)
        .await
        .expect("evacuate");

    let err = ctx
        .store
        .remove_evacuating_actual_lrp(&key, &instance_key("web", 0, "cell-2"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CannotBeRemoved { .. }), "got {err:?}");

    let removed = ctx
        .store
        .remove_evacuating_actual_lrp(&key, &instance_key("web", 0, "cell-1"))
        .await
        .expect("remove");
    assert!(removed.is_some());
}

async fn removing_a_missing_slot_succeeds(ctx: TestContext) {
    let removed = ctx
        .store
        .remove_evacuating_actual_lrp(&actual_key("web", 0), &instance_key("web", 0, "cell-1"))
        .await
        .expect("remove");
    assert!(removed.is_none());
}

async fn expired_slots_are_replaced_and_removable(ctx: TestContext) {
    let key = actual_key("web", 0);
    ctx.store
        .evacuate_actual_lrp(&key, &instance_key("web", 0, "cell-1"), &net_info(), TTL)
        .await
        .expect("evacuate");
    ctx.advance(TTL + Duration::from_secs(1));

    // A new incarnation can take over an expired slot.
    let outcome = ctx
        .store
        .evacuate_actual_lrp(&key, &instance_key("web", 0, "cell-2"), &net_info(), TTL)
        .await
        .expect("evacuate over expired");
    assert!(matches!(outcome, EvacuationOutcome::Created(_)), "got {outcome:?}");

    ctx.advance(TTL + Duration::from_secs(1));
    let removed = ctx
        .store
        .remove_evacuating_actual_lrp(&key, &instance_key("web", 0, "cell-3"))
        .await
        .expect("expired slots ignore the incarnation");
    assert!(removed.is_some());
}

async fn empty_net_info_is_rejected(ctx: TestContext) {
    let err = ctx
        .store
        .evacuate_actual_lrp(
            &actual_key("web", 0),
            &instance_key("web", 0, "cell-1"),
            &ActualLrpNetInfo::default(),
            TTL,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadRequest { .. }), "got {err:?}");
}

async fn convergence_removes_expired_slots(ctx: TestContext) {
    ctx.desire("web", 1).await;
    ctx.run_instance("web", 0, "cell-1").await;
    ctx.store
        .evacuate_actual_lrp(&actual_key("web", 0), &instance_key("web", 0, "cell-2"), &net_info(), TTL)
        .await
        .expect("evacuate");

    let converger = ctx.converger();
    let report = converger.converge_once().await.expect("cycle").expect("ran");
    assert_eq!(report.evacuating_removed, 0);

    ctx.advance(TTL + Duration::from_secs(1));
    let report = converger.converge_once().await.expect("cycle").expect("ran");
    assert_eq!(report.evacuating_removed, 1);
    assert_eq!(report.lrp_starts, 0, "evacuating slots never count as instances");
    let group = ctx.store.actual_lrp_group("web", 0).await.expect("group");
    assert!(group.evacuating.is_none());
}
