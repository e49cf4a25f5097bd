//! Task completion callbacks.
//!
//! When a task with a callback URL completes, convergence moves it to
//! `Resolving` and hands it to a [`TaskCallbackHandler`] on the callback
//! work pool. A delivered callback deletes the task. An undelivered one
//! leaves it `Resolving`; convergence demotes it back to `Completed` once
//! the kick threshold passes so the callback is tried again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;

use lodestar_core::models::Task;

use crate::metrics::StateMetrics;
use crate::store::Store;

/// Attempts per callback when the receiver reports it is unavailable.
pub const MAX_CALLBACK_ATTEMPTS: u32 = 3;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Delivers a completed task to whoever asked to be told.
#[async_trait]
pub trait TaskCallbackHandler: Send + Sync {
    /// Delivers `task`. Called once per resolution.
    async fn handle(&self, task: Task);
}

/// The body posted to a callback URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    /// Task identifier.
    pub task_guid: String,
    /// Whether the task failed.
    pub failed: bool,
    /// Why the task failed.
    pub failure_reason: String,
    /// Captured output.
    pub result: String,
    /// Annotation from the task definition.
    pub annotation: String,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
}

impl From<&Task> for TaskResponse {
    fn from(task: &Task) -> Self {
        Self {
            task_guid: task.guid.clone(),
            failed: task.failed,
            failure_reason: task.failure_reason.clone(),
            result: task.result.clone(),
            annotation: task.definition.annotation.clone(),
            created_at: task.created_at,
        }
    }
}

/// Posts the task response as JSON and deletes the task on success.
#[derive(Clone)]
pub struct HttpCallbackHandler {
    store: Arc<dyn Store>,
    client: reqwest::Client,
    retry_delay: Duration,
}

impl std::fmt::Debug for HttpCallbackHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCallbackHandler")
            .field("backend", &self.store.backend())
            .finish_non_exhaustive()
    }
}

impl HttpCallbackHandler {
    /// Creates a handler that deletes delivered tasks from `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            store,
            client,
            retry_delay: RETRY_DELAY,
        }
    }

    /// Overrides the pause between unavailable responses.
    #[must_use]
    pub const fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    async fn deliver(&self, url: &str, body: &TaskResponse) -> Option<StatusCode> {
        for attempt in 1..=MAX_CALLBACK_ATTEMPTS {
            let response = match self.client.post(url).json(body).send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(task_guid = %body.task_guid, error = %e, "callback request failed");
                    return None;
                }
            };
            let status = response.status();
            let unavailable = matches!(
                status,
                StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
            );
            if !unavailable || attempt == MAX_CALLBACK_ATTEMPTS {
                return Some(status);
            }
            tracing::debug!(task_guid = %body.task_guid, %status, attempt, "callback receiver unavailable, retrying");
            tokio::time::sleep(self.retry_delay).await;
        }
        None
    }
}

#[async_trait]
impl TaskCallbackHandler for HttpCallbackHandler {
    async fn handle(&self, task: Task) {
        let metrics = StateMetrics::new();
        let Some(url) = task
            .definition
            .completion_callback_url
            .as_deref()
            .filter(|url| !url.is_empty())
        else {
            return;
        };

        let body = TaskResponse::from(&task);
        match self.deliver(url, &body).await {
            Some(status) if status.is_success() => {
                metrics.record_callback("delivered");
                if let Err(e) = self.store.delete_task(&task.guid).await {
                    tracing::warn!(task_guid = %task.guid, error = %e, "failed to delete resolved task");
                }
            }
            Some(status) => {
                metrics.record_callback("failed");
                tracing::warn!(task_guid = %task.guid, %status, "callback rejected");
            }
            None => metrics.record_callback("failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::Router;
    use axum::routing::post;
    use lodestar_core::SystemClock;
    use lodestar_core::encryption::{Cryptor, Key, KeyManager};
    use lodestar_core::format::Encoder;
    use lodestar_core::models::TaskDefinition;

    use crate::store::kv::{KvStore, MemoryKeyValue};

    fn handler() -> HttpCallbackHandler {
        let key = Key::new("test", "callback tests").expect("key");
        let encoder = Encoder::new(Cryptor::new(KeyManager::new(key, []).expect("keys")));
        let store = KvStore::new(MemoryKeyValue::default(), encoder, Arc::new(SystemClock));
        HttpCallbackHandler::new(Arc::new(store)).with_retry_delay(Duration::from_millis(1))
    }

    fn task() -> Task {
        Task::new("t1", "d", TaskDefinition::default(), Utc::now())
    }

    async fn spawn_server(statuses: Vec<StatusCode>) -> (String, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let statuses = Arc::new(statuses);
        let app = Router::new().route(
            "/done",
            post(move || {
                let counter = Arc::clone(&counter);
                let statuses = Arc::clone(&statuses);
                async move {
                    let call = counter.fetch_add(1, Ordering::SeqCst) as usize;
                    statuses[call.min(statuses.len() - 1)]
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}/done"), calls)
    }

    #[test]
    fn response_carries_task_outcome() {
        let mut task = task();
        task.failed = true;
        task.failure_reason = "boom".to_string();

        let body = serde_json::to_value(TaskResponse::from(&task)).expect("serialize");
        assert_eq!(body["taskGuid"], "t1");
        assert_eq!(body["failed"], true);
        assert_eq!(body["failureReason"], "boom");
    }

    #[tokio::test]
    async fn unavailable_receivers_are_retried() {
        let (url, calls) = spawn_server(vec![
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
            StatusCode::OK,
        ])
        .await;
        let handler = handler();
        let body = TaskResponse::from(&task());

        let status = handler.deliver(&url, &body).await;

        assert_eq!(status, Some(StatusCode::OK));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_stop_after_the_attempt_budget() {
        let (url, calls) = spawn_server(vec![StatusCode::SERVICE_UNAVAILABLE]).await;
        let handler = handler();
        let body = TaskResponse::from(&task());

        let status = handler.deliver(&url, &body).await;

        assert_eq!(status, Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_CALLBACK_ATTEMPTS);
    }
}
