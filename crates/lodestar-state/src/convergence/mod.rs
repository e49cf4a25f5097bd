//! The convergence engine.
//!
//! A [`Converger`] periodically compares desired and actual state across the
//! whole cluster and emits the work that closes the gap: start requests for
//! missing instances, stops for orphans, restarts for crashed instances and
//! expiry for stale tasks.
//!
//! ## Design Principles
//!
//! - **Single flight**: A cycle never overlaps another; a timer tick or
//!   trigger that arrives mid-cycle is dropped
//! - **Snapshot, then act**: Each cycle reads one snapshot, plans from it and
//!   applies every mutation through the tag-checked store path
//! - **Skip, don't stop**: A conflicting mutation means someone else already
//!   moved the record; it is counted and skipped. Only an unrecoverable store
//!   error or lost leadership aborts the cycle
//! - **Leader only**: Leadership is checked before the snapshot, before every
//!   mutation and before work is handed to the auctioneer
//! - **Published like any write**: Every mutation a cycle makes reaches the
//!   same hubs as client writes
//! - **One batch per kind**: Start work is sent to the auctioneer as one LRP
//!   batch and one task batch per cycle

pub mod crash;
mod lrp;
mod task;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use lodestar_core::clock::before;
use lodestar_core::models::Task;
use lodestar_core::observability::convergence_span;
use lodestar_core::{Clock, Error};

use crate::Result;
use crate::auction::AuctionClient;
use crate::callback::TaskCallbackHandler;
use crate::cells::CellPresenceSource;
use crate::hub::StateHubs;
use crate::leader::LeadershipCoordinator;
use crate::metrics::StateMetrics;
use crate::service::StateService;
use crate::store::{LrpCounts, Store};
use crate::workpool::WorkPool;

pub use crash::{CrashDecision, CrashRestartPolicy};
pub use task::{EXPIRED_PENDING_REASON, MISSING_CELL_REASON};

/// Timing and fan-out of the convergence loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceConfig {
    /// Pause between cycles.
    pub interval: Duration,
    /// Concurrent store calls per cycle.
    pub workers: usize,
    /// Age at which pending tasks are re-dispatched, completed tasks have
    /// their callback retried and resolving tasks are demoted.
    pub kick_task_duration: Duration,
    /// Age at which a pending task is failed.
    pub expire_pending_task_duration: Duration,
    /// Age at which a completed or resolving task is deleted.
    pub expire_completed_task_duration: Duration,
    /// Age at which an unclaimed instance is offered for placement again.
    pub stale_unclaimed_duration: Duration,
    /// Restart schedule for crashed instances.
    pub crash_policy: CrashRestartPolicy,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            workers: 20,
            kick_task_duration: Duration::from_secs(30),
            expire_pending_task_duration: Duration::from_secs(30 * 60),
            expire_completed_task_duration: Duration::from_secs(2 * 60),
            stale_unclaimed_duration: Duration::from_secs(30),
            crash_policy: CrashRestartPolicy::default(),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergenceReport {
    /// Cycle number, starting at 1.
    pub cycle: u64,
    /// LRP instances sent to the auctioneer.
    pub lrp_starts: usize,
    /// Actual LRPs removed as orphans or because their cell vanished.
    pub lrp_stops: usize,
    /// Crashed instances reset for another placement.
    pub crashed_restarted: usize,
    /// Crashed instances past the restart budget.
    pub crashed_exhausted: usize,
    /// Unclaimed instances refreshed and offered again.
    pub stale_refreshed: usize,
    /// Expired evacuating instances removed.
    pub evacuating_removed: usize,
    /// Pending tasks sent to the auctioneer again.
    pub tasks_dispatched: usize,
    /// Tasks failed for expiry or a vanished cell.
    pub tasks_failed: usize,
    /// Tasks deleted after expiry.
    pub tasks_deleted: usize,
    /// Completed tasks handed to the callback pool.
    pub tasks_resolving: usize,
    /// Resolving tasks returned to completed.
    pub tasks_demoted: usize,
    /// Mutations skipped because the record moved on.
    pub conflicts: usize,
    /// Mutations that failed for another reason.
    pub errors: usize,
    /// Actual LRP gauges at snapshot time.
    pub lrp_counts: LrpCounts,
    /// Task gauges at snapshot time.
    pub task_counts: BTreeMap<&'static str, u64>,
}

impl ConvergenceReport {
    /// Returns the total corrective work emitted.
    #[must_use]
    pub const fn total_work(&self) -> usize {
        self.lrp_starts
            + self.lrp_stops
            + self.crashed_restarted
            + self.stale_refreshed
            + self.evacuating_removed
            + self.tasks_dispatched
            + self.tasks_failed
            + self.tasks_deleted
            + self.tasks_resolving
            + self.tasks_demoted
    }

    fn record_skip(&mut self, skipped: &Skipped) {
        match skipped {
            Skipped::Conflict => self.conflicts += 1,
            Skipped::Failed => self.errors += 1,
        }
    }

    fn record_metrics(&self, metrics: StateMetrics) {
        metrics.record_work("lrp_start", self.lrp_starts);
        metrics.record_work("lrp_stop", self.lrp_stops);
        metrics.record_work("crash_restart", self.crashed_restarted);
        metrics.record_work("stale_refresh", self.stale_refreshed);
        metrics.record_work("evacuating_removed", self.evacuating_removed);
        metrics.record_work("task_dispatch", self.tasks_dispatched);
        metrics.record_work("task_fail", self.tasks_failed);
        metrics.record_work("task_delete", self.tasks_deleted);
        metrics.record_work("task_resolve", self.tasks_resolving);
        metrics.record_work("task_demote", self.tasks_demoted);
        metrics.record_conflicts(self.conflicts);

        metrics.set_lrp_instances("UNCLAIMED", self.lrp_counts.unclaimed);
        metrics.set_lrp_instances("CLAIMED", self.lrp_counts.claimed);
        metrics.set_lrp_instances("RUNNING", self.lrp_counts.running);
        metrics.set_lrp_instances("CRASHED", self.lrp_counts.crashed);
        for (state, count) in &self.task_counts {
            metrics.set_tasks(state, *count);
        }
    }
}

/// Where completed tasks with a callback URL are sent.
#[derive(Clone)]
pub struct CallbackDispatch {
    pool: Arc<WorkPool>,
    handler: Arc<dyn TaskCallbackHandler>,
}

impl std::fmt::Debug for CallbackDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackDispatch")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl CallbackDispatch {
    /// Runs `handler` for each submitted task on `pool`.
    #[must_use]
    pub fn new(pool: Arc<WorkPool>, handler: Arc<dyn TaskCallbackHandler>) -> Self {
        Self { pool, handler }
    }

    /// Queues one callback, waiting while the pool is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unrecoverable`] if the pool has stopped.
    pub async fn submit(&self, task: Task) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        self.pool
            .submit(async move { handler.handle(task).await })
            .await
    }
}

/// Shared collaborators of one cycle.
struct CycleContext<'a> {
    store: &'a dyn Store,
    leadership: &'a LeadershipCoordinator,
    hubs: &'a StateHubs,
    config: &'a ConvergenceConfig,
}

/// Outcome of one corrective mutation that did not abort the cycle.
enum Skipped {
    Conflict,
    Failed,
}

impl CycleContext<'_> {
    /// Fails with `LeadershipLost` once this instance no longer leads.
    fn ensure_leader(&self) -> Result<()> {
        self.leadership.ensure_leader()
    }

    /// Sorts a mutation error into skipped or fatal.
    fn skip(&self, operation: &'static str, subject: &str, err: Error) -> Result<Skipped> {
        match err {
            Error::Conflict { .. }
            | Error::ResourceNotFound { .. }
            | Error::ResourceExists { .. }
            | Error::CannotBeRemoved { .. } => {
                tracing::debug!(operation, subject, error = %err, "record moved on, skipping");
                Ok(Skipped::Conflict)
            }
            err if err.is_fatal() => Err(err),
            err => {
                tracing::warn!(operation, subject, error = %err, "convergence mutation failed");
                Ok(Skipped::Failed)
            }
        }
    }
}

/// Runs convergence cycles against a store.
pub struct Converger {
    store: Arc<dyn Store>,
    leadership: Arc<LeadershipCoordinator>,
    hubs: Arc<StateHubs>,
    auction: Arc<dyn AuctionClient>,
    cells: Arc<dyn CellPresenceSource>,
    callbacks: Option<CallbackDispatch>,
    clock: Arc<dyn Clock>,
    config: ConvergenceConfig,
    metrics: StateMetrics,
    running: AtomicBool,
    cycles: AtomicU64,
    trigger: Notify,
}

impl std::fmt::Debug for Converger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converger")
            .field("backend", &self.store.backend())
            .field("leadership", &self.leadership.state())
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::Acquire))
            .field("cycles", &self.cycles.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// Resets the single-flight flag when a cycle ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Converger {
    /// Creates a converger without a callback pool.
    ///
    /// The converger writes through `service`'s store, publishes to its hubs
    /// and runs only while its leadership is held.
    #[must_use]
    pub fn new(
        service: &StateService,
        auction: Arc<dyn AuctionClient>,
        cells: Arc<dyn CellPresenceSource>,
        clock: Arc<dyn Clock>,
        config: ConvergenceConfig,
    ) -> Self {
        Self {
            store: Arc::clone(service.store()),
            leadership: Arc::clone(service.leadership()),
            hubs: Arc::clone(service.hubs()),
            auction,
            cells,
            callbacks: None,
            clock,
            config,
            metrics: StateMetrics::new(),
            running: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            trigger: Notify::new(),
        }
    }

    /// Sends completed tasks with a callback URL to `callbacks`.
    ///
    /// Without one such tasks stay completed until they expire.
    #[must_use]
    pub fn with_callbacks(mut self, callbacks: CallbackDispatch) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ConvergenceConfig {
        &self.config
    }

    /// Returns true while a cycle runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Returns the number of cycles started so far.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Acquire)
    }

    /// Asks the background loop for a cycle now.
    ///
    /// Returns false if a cycle is already running; the request is dropped.
    pub fn trigger(&self) -> bool {
        if self.is_running() {
            return false;
        }
        self.trigger.notify_one();
        true
    }

    /// Runs one cycle unless one is already running.
    ///
    /// Returns `Ok(None)` when the call was dropped because a cycle was in
    /// flight.
    ///
    /// # Errors
    ///
    /// Returns the error that aborted the cycle: `LeadershipLost` when this
    /// instance does not lead, a failed snapshot read, a failed cell lookup
    /// or an unrecoverable store error.
    pub async fn converge_once(&self) -> Result<Option<ConvergenceReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("convergence already running, dropping request");
            return Ok(None);
        }
        let _running = RunningGuard(&self.running);

        let cycle = self.cycles.fetch_add(1, Ordering::AcqRel) + 1;
        let metrics = self.metrics;
        let started = Instant::now();

        let result = self
            .run_cycle(cycle)
            .instrument(convergence_span(cycle))
            .await;

        let elapsed = started.elapsed();
        match result {
            Ok(report) => {
                metrics.record_cycle("ok", elapsed);
                report.record_metrics(metrics);
                tracing::info!(
                    cycle,
                    duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    lrp_starts = report.lrp_starts,
                    lrp_stops = report.lrp_stops,
                    crashed_restarted = report.crashed_restarted,
                    crashed_exhausted = report.crashed_exhausted,
                    stale_refreshed = report.stale_refreshed,
                    evacuating_removed = report.evacuating_removed,
                    tasks_dispatched = report.tasks_dispatched,
                    tasks_failed = report.tasks_failed,
                    tasks_deleted = report.tasks_deleted,
                    tasks_resolving = report.tasks_resolving,
                    tasks_demoted = report.tasks_demoted,
                    conflicts = report.conflicts,
                    errors = report.errors,
                    "convergence cycle completed"
                );
                Ok(Some(report))
            }
            Err(e) => {
                metrics.record_cycle("aborted", elapsed);
                tracing::error!(cycle, error = %e, "convergence cycle aborted");
                Err(e)
            }
        }
    }

    async fn run_cycle(&self, cycle: u64) -> Result<ConvergenceReport> {
        let ctx = CycleContext {
            store: self.store.as_ref(),
            leadership: self.leadership.as_ref(),
            hubs: self.hubs.as_ref(),
            config: &self.config,
        };
        ctx.ensure_leader()?;

        let now = self.clock.now();
        let live_cells = self.cells.cell_ids().await?;
        let snapshot = self
            .store
            .convergence_snapshot(&live_cells, before(now, self.config.stale_unclaimed_duration))
            .await?;
        let mut report = ConvergenceReport {
            cycle,
            ..ConvergenceReport::default()
        };

        let lrp_work = lrp::converge(&ctx, snapshot.lrps, now, &mut report).await?;
        let task_work = task::converge(
            &ctx,
            snapshot.tasks,
            &live_cells,
            now,
            self.callbacks.is_some(),
            &mut report,
        )
        .await?;

        // A deposed leader must not hand out work its successor also plans.
        ctx.ensure_leader()?;

        // Auctioneer failures are logged; the next cycle re-derives the work.
        if let Err(e) = self.auction.request_lrp_auctions(lrp_work.starts).await {
            tracing::warn!(error = %e, "failed to request lrp auctions");
        }
        if let Err(e) = self.auction.acknowledge_lrp_stops(lrp_work.stops).await {
            tracing::warn!(error = %e, "failed to acknowledge lrp stops");
        }
        if let Err(e) = self.auction.request_task_auctions(task_work.dispatch).await {
            tracing::warn!(error = %e, "failed to request task auctions");
        }

        if let Some(callbacks) = &self.callbacks {
            for task in task_work.callbacks {
                let guid = task.guid.clone();
                if let Err(e) = callbacks.submit(task).await {
                    tracing::warn!(task_guid = %guid, error = %e, "failed to queue task callback");
                }
            }
        }

        Ok(report)
    }

    /// Spawns the background loop.
    ///
    /// The loop runs a cycle every interval and whenever
    /// [`trigger`](Self::trigger) is called, until the handle is stopped or
    /// leadership is lost.
    #[must_use]
    pub fn start(self: &Arc<Self>) -> ConvergerHandle {
        let (shutdown, mut stopped) = watch::channel(false);
        let converger = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(converger.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(
                interval_secs = converger.config.interval.as_secs(),
                workers = converger.config.workers,
                "convergence loop started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = converger.trigger.notified() => {
                        tracing::info!("convergence triggered");
                    }
                    _ = stopped.changed() => break,
                    () = converger.leadership.wait_lost() => {
                        tracing::warn!("leadership lost, stopping convergence");
                        break;
                    }
                }
                // Errors are logged by the cycle itself.
                let _ = converger.converge_once().await;
            }

            tracing::info!("convergence loop stopped");
        });

        ConvergerHandle { shutdown, task }
    }
}

/// Stops a running convergence loop.
#[derive(Debug)]
pub struct ConvergerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConvergerHandle {
    /// Returns true once the loop has exited, by [`stop`](Self::stop) or
    /// because leadership was lost.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the loop and waits for an in-flight cycle to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "convergence loop ended abnormally");
        }
    }
}
