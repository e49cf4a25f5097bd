//! Change notification hubs.
//!
//! A [`Hub`] fans record changes out to subscribers. Publishing never
//! blocks: each subscriber owns a bounded queue and is disconnected as soon
//! as that queue overflows. A disconnected subscriber drains what was
//! already queued and then sees the end of its stream.

use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};

use lodestar_core::Error;
use lodestar_core::models::{
    ActualLrp, ActualLrpFilter, DesiredLrp, DesiredLrpFilter, Task, TaskFilter,
};

use crate::Result;
use crate::metrics::StateMetrics;

/// Default queue depth per subscriber.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

/// An event that can be routed by a filter.
pub trait HubEvent: Clone + Send + 'static {
    /// Selection criteria chosen at subscription.
    type Filter: Send + 'static;

    /// Family name for logs and metrics.
    const FAMILY: &'static str;

    /// Returns true if a subscriber with `filter` should receive the event.
    fn matches(&self, filter: &Self::Filter) -> bool;
}

/// A change to a desired LRP.
#[derive(Debug, Clone, PartialEq)]
pub enum DesiredLrpEvent {
    /// A desired LRP was created.
    Created(DesiredLrp),
    /// A desired LRP was updated.
    Changed {
        /// Before the update.
        before: DesiredLrp,
        /// After the update.
        after: DesiredLrp,
    },
    /// A desired LRP was removed.
    Removed(DesiredLrp),
}

impl DesiredLrpEvent {
    /// Returns the record the event is about, as it is now.
    #[must_use]
    pub fn lrp(&self) -> &DesiredLrp {
        match self {
            Self::Created(lrp) | Self::Removed(lrp) | Self::Changed { after: lrp, .. } => lrp,
        }
    }
}

impl HubEvent for DesiredLrpEvent {
    type Filter = DesiredLrpFilter;
    const FAMILY: &'static str = "desired";

    fn matches(&self, filter: &DesiredLrpFilter) -> bool {
        let lrp = self.lrp();
        filter.matches(&lrp.process_guid, &lrp.domain)
    }
}

/// A change to an actual LRP slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActualLrpEvent {
    /// A slot was filled.
    Created(ActualLrp),
    /// A slot was updated.
    Changed {
        /// Before the update.
        before: ActualLrp,
        /// After the update.
        after: ActualLrp,
    },
    /// A slot was emptied.
    Removed(ActualLrp),
}

impl ActualLrpEvent {
    /// Returns the record the event is about, as it is now.
    #[must_use]
    pub fn lrp(&self) -> &ActualLrp {
        match self {
            Self::Created(lrp) | Self::Removed(lrp) | Self::Changed { after: lrp, .. } => lrp,
        }
    }
}

impl HubEvent for ActualLrpEvent {
    type Filter = ActualLrpFilter;
    const FAMILY: &'static str = "actual";

    fn matches(&self, filter: &ActualLrpFilter) -> bool {
        match self {
            // A change that moves a slot across a filter boundary (a new
            // cell, say) is visible from either side.
            Self::Changed { before, after } => filter.matches(before) || filter.matches(after),
            Self::Created(lrp) | Self::Removed(lrp) => filter.matches(lrp),
        }
    }
}

/// A change to a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// A task was desired.
    Created(Task),
    /// A task moved between states.
    Changed {
        /// Before the transition.
        before: Task,
        /// After the transition.
        after: Task,
    },
    /// A task was deleted.
    Removed(Task),
}

impl TaskEvent {
    /// Returns the record the event is about, as it is now.
    #[must_use]
    pub fn task(&self) -> &Task {
        match self {
            Self::Created(task) | Self::Removed(task) | Self::Changed { after: task, .. } => task,
        }
    }
}

impl HubEvent for TaskEvent {
    type Filter = TaskFilter;
    const FAMILY: &'static str = "task";

    fn matches(&self, filter: &TaskFilter) -> bool {
        match self {
            Self::Changed { before, after } => filter.matches(before) || filter.matches(after),
            Self::Created(task) | Self::Removed(task) => filter.matches(task),
        }
    }
}

struct Subscriber<E: HubEvent> {
    id: u64,
    filter: E::Filter,
    sender: mpsc::Sender<E>,
}

struct HubState<E: HubEvent> {
    subscribers: Vec<Subscriber<E>>,
    next_id: u64,
    closed: bool,
}

/// Fan-out of one event family.
pub struct Hub<E: HubEvent> {
    state: Mutex<HubState<E>>,
    buffer: usize,
}

impl<E: HubEvent> std::fmt::Debug for Hub<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("family", &E::FAMILY)
            .field("buffer", &self.buffer)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<E: HubEvent> Default for Hub<E> {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

/// The receiving end of a subscription.
#[derive(Debug)]
pub struct Subscription<E> {
    id: u64,
    receiver: mpsc::Receiver<E>,
}

impl<E> Subscription<E> {
    /// Returns the subscriber id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the subscriber was disconnected and its queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<E> {
        self.receiver.recv().await
    }

    /// Returns the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        self.receiver.try_recv().ok()
    }
}

impl<E: HubEvent> Hub<E> {
    /// Creates a hub with `buffer` queued events per subscriber.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            state: Mutex::new(HubState {
                subscribers: Vec::new(),
                next_id: 0,
                closed: false,
            }),
            buffer: buffer.max(1),
        }
    }

    /// Registers a subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unrecoverable`] if the hub is closed.
    pub fn subscribe(&self, filter: E::Filter) -> Result<Subscription<E>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(Error::unrecoverable(format!("{} hub is closed", E::FAMILY)));
        }
        let id = state.next_id;
        state.next_id += 1;
        let (sender, receiver) = mpsc::channel(self.buffer);
        state.subscribers.push(Subscriber { id, filter, sender });
        drop(state);

        tracing::debug!(hub = E::FAMILY, subscriber = id, "subscriber registered");
        Ok(Subscription { id, receiver })
    }

    /// Delivers `event` to every matching subscriber without waiting.
    pub fn publish(&self, event: &E) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return;
        }
        state.subscribers.retain(|subscriber| {
            if !event.matches(&subscriber.filter) {
                return !subscriber.sender.is_closed();
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        hub = E::FAMILY,
                        subscriber = subscriber.id,
                        "subscriber queue overflowed, disconnecting"
                    );
                    StateMetrics::new().record_hub_disconnect(E::FAMILY);
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Disconnects every subscriber; later publishes are ignored and later
    /// subscribes fail.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        let dropped = state.subscribers.len();
        state.subscribers.clear();
        drop(state);
        tracing::info!(hub = E::FAMILY, dropped, "hub closed");
    }

    /// Returns true once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Returns the number of connected subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }
}

/// The hubs of every record family, shared by the request path and the
/// convergence loop.
#[derive(Debug)]
pub struct StateHubs {
    desired: Hub<DesiredLrpEvent>,
    actual: Hub<ActualLrpEvent>,
    tasks: Hub<TaskEvent>,
}

impl Default for StateHubs {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl StateHubs {
    /// Creates the hubs with `buffer` queued events per subscriber.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            desired: Hub::new(buffer),
            actual: Hub::new(buffer),
            tasks: Hub::new(buffer),
        }
    }

    /// Desired LRP changes.
    #[must_use]
    pub const fn desired(&self) -> &Hub<DesiredLrpEvent> {
        &self.desired
    }

    /// Actual LRP changes.
    #[must_use]
    pub const fn actual(&self) -> &Hub<ActualLrpEvent> {
        &self.actual
    }

    /// Task changes.
    #[must_use]
    pub const fn tasks(&self) -> &Hub<TaskEvent> {
        &self.tasks
    }

    /// Closes every hub.
    pub fn close(&self) {
        self.desired.close();
        self.actual.close();
        self.tasks.close();
    }
}
