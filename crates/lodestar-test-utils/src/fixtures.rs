//! Pre-built test fixtures for common test scenarios.
//!
//! Provides stores wired to a manual clock and factory functions that create
//! records with sensible defaults.

use std::sync::Arc;
use std::time::Duration;

use lodestar_core::encryption::{Cryptor, Key, KeyManager};
use lodestar_core::format::Encoder;
use lodestar_core::models::{
    ActualLrpInstanceKey, ActualLrpKey, ActualLrpNetInfo, CellPresence, DesiredLrp,
    PortMapping, TaskDefinition,
};
use lodestar_core::{Clock, ManualClock};
use lodestar_state::auction::InMemoryAuctionClient;
use lodestar_state::cells::InMemoryCells;
use lodestar_state::convergence::{ConvergenceConfig, Converger};
use lodestar_state::leader::memory::InMemoryLeaderElector;
use lodestar_state::leader::{LeadershipConfig, LeadershipCoordinator};
use lodestar_state::service::StateService;
use lodestar_state::store::kv::KvStore;
use lodestar_state::store::sql::SqlStore;
use lodestar_state::store::{RetryPolicy, Store};

use crate::storage::RecordingKeyValue;

/// Label of the key used by [`test_encoder`].
pub const TEST_KEY_LABEL: &str = "test";

/// Domain used by the factories.
pub const TEST_DOMAIN: &str = "apps";

/// Returns an encoder with one key labelled [`TEST_KEY_LABEL`].
pub fn test_encoder() -> Encoder {
    test_encoder_with(TEST_KEY_LABEL, &[])
}

/// Returns an encoder writing under `active` that can also read `extra`.
pub fn test_encoder_with(active: &str, extra: &[&str]) -> Encoder {
    let key = Key::new(active, &format!("{active} passphrase")).expect("key");
    let decryption = extra
        .iter()
        .map(|label| Key::new(*label, &format!("{label} passphrase")).expect("key"));
    Encoder::new(Cryptor::new(KeyManager::new(key, decryption).expect("key manager")))
}

/// A retry policy that gives up quickly.
pub fn fast_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff: Duration::from_millis(5),
        operation_timeout: Duration::from_secs(5),
    }
}

/// Opens a schema-initialised in-memory SQLite store.
pub async fn sqlite_store(clock: Arc<dyn Clock>) -> SqlStore {
    sqlite_store_with(test_encoder(), clock).await
}

/// Opens a schema-initialised in-memory SQLite store with `encoder`.
pub async fn sqlite_store_with(encoder: Encoder, clock: Arc<dyn Clock>) -> SqlStore {
    let store = SqlStore::connect("sqlite::memory:", 1, encoder, clock)
        .await
        .expect("connect sqlite")
        .with_retry_policy(fast_retry_policy());
    store.ensure_schema().await.expect("schema");
    store
}

/// Creates a key-value store over a fresh [`RecordingKeyValue`].
pub fn kv_store(clock: Arc<dyn Clock>) -> KvStore<RecordingKeyValue> {
    KvStore::new(RecordingKeyValue::new(), test_encoder(), clock)
        .with_retry_policy(fast_retry_policy())
}

/// Lock key the test contexts lead under.
pub const TEST_LOCK_KEY: &str = "lodestar";

/// Test context with a store and fake collaborators sharing one clock.
///
/// The context's service already holds leadership.
pub struct TestContext {
    /// Store under test.
    pub store: Arc<dyn Store>,
    /// Leader-gated front end over `store`, publishing to its hubs.
    pub service: Arc<StateService>,
    /// Clock shared by the store and the converger.
    pub clock: ManualClock,
    /// Records every auction request.
    pub auction: InMemoryAuctionClient,
    /// Live cells; `cell-1` and `cell-2` at creation.
    pub cells: InMemoryCells,
}

impl TestContext {
    /// Creates a context over an in-memory key-value store.
    pub async fn kv() -> Self {
        let clock = ManualClock::default();
        let store = Arc::new(kv_store(Arc::new(clock.clone())));
        Self::with_store(store, clock).await
    }

    /// Creates a context over an in-memory SQLite store.
    pub async fn sqlite() -> Self {
        let clock = ManualClock::default();
        let store = Arc::new(sqlite_store(Arc::new(clock.clone())).await);
        Self::with_store(store, clock).await
    }

    async fn with_store(store: Arc<dyn Store>, clock: ManualClock) -> Self {
        let leadership = Arc::new(LeadershipCoordinator::new(
            Arc::new(InMemoryLeaderElector::new(Duration::from_secs(15))),
            LeadershipConfig::new(TEST_LOCK_KEY, "test-server")
                .with_retry_interval(Duration::from_millis(10)),
        ));
        leadership.acquire().await.expect("acquire leadership");
        let service = Arc::new(StateService::new(Arc::clone(&store), leadership, 1024));

        let cells = InMemoryCells::new();
        cells.register(CellPresence::new("cell-1", "10.0.0.1:1800"));
        cells.register(CellPresence::new("cell-2", "10.0.0.2:1800"));
        Self {
            store,
            service,
            clock,
            auction: InMemoryAuctionClient::new(),
            cells,
        }
    }

    /// Builds a converger with the default configuration.
    pub fn converger(&self) -> Converger {
        self.converger_with(ConvergenceConfig::default())
    }

    /// Builds a converger with `config`.
    pub fn converger_with(&self, config: ConvergenceConfig) -> Converger {
        Converger::new(
            &self.service,
            Arc::new(self.auction.clone()),
            Arc::new(self.cells.clone()),
            Arc::new(self.clock.clone()),
            config,
        )
    }

    /// Moves the shared clock forward.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Creates a desired LRP and marks its domain fresh for an hour.
    pub async fn desire(&self, process_guid: &str, instances: u32) -> DesiredLrp {
        self.store
            .upsert_domain(TEST_DOMAIN, Duration::from_secs(3600))
            .await
            .expect("upsert domain");
        self.store
            .desire_lrp(&desired_lrp(process_guid, instances))
            .await
            .expect("desire lrp")
    }

    /// Creates, claims and starts instance `index` on `cell_id`.
    pub async fn run_instance(&self, process_guid: &str, index: u32, cell_id: &str) {
        use lodestar_core::models::ActualLrpUpdate;

        let key = actual_key(process_guid, index);
        self.store
            .create_unclaimed_actual_lrp(&key)
            .await
            .expect("create actual");
        let update = ActualLrpUpdate::Start {
            instance_key: instance_key(process_guid, index, cell_id),
            net_info: net_info(),
        };
        self.store
            .update_actual_lrp(process_guid, index, false, None, &update)
            .await
            .expect("start actual");
    }
}

/// A desired LRP in [`TEST_DOMAIN`].
pub fn desired_lrp(process_guid: &str, instances: u32) -> DesiredLrp {
    DesiredLrp::builder(process_guid, TEST_DOMAIN)
        .instances(instances)
        .log_guid(format!("log-{process_guid}"))
        .build()
}

/// A task definition with an optional callback URL.
pub fn task_definition(callback_url: Option<&str>) -> TaskDefinition {
    TaskDefinition {
        action: serde_json::json!({ "run": { "path": "/bin/true" } }),
        memory_mb: 256,
        disk_mb: 512,
        rootfs: "preloaded:cflinuxfs4".to_string(),
        completion_callback_url: callback_url.map(str::to_string),
        ..TaskDefinition::default()
    }
}

/// Returns a unique task guid.
pub fn task_guid() -> String {
    format!("task-{}", uuid::Uuid::new_v4().as_simple())
}

/// The key of instance `index` in [`TEST_DOMAIN`].
pub fn actual_key(process_guid: &str, index: u32) -> ActualLrpKey {
    ActualLrpKey::new(process_guid, index, TEST_DOMAIN)
}

/// A deterministic incarnation of instance `index` on `cell_id`.
pub fn instance_key(process_guid: &str, index: u32, cell_id: &str) -> ActualLrpInstanceKey {
    ActualLrpInstanceKey::new(format!("{process_guid}-{index}-{cell_id}"), cell_id)
}

/// Non-empty network info.
pub fn net_info() -> ActualLrpNetInfo {
    ActualLrpNetInfo::new(
        "10.0.0.4",
        vec![PortMapping {
            container_port: 8080,
            host_port: 61000,
        }],
    )
}
