//! Client for the auctioneer that places work on cells.
//!
//! Convergence hands each cycle's start work to the auctioneer in one batch
//! per kind and reports the instances it stopped in one acknowledgement
//! batch. Failures are logged by the caller and never retried inline; the
//! next cycle re-derives the same work from the store.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use lodestar_core::Error;
use lodestar_core::models::{ActualLrpInstanceKey, ActualLrpKey, DesiredLrpSchedulingInfo, Task};

use crate::Result;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Instances of one desired LRP that need placing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LrpStartRequest {
    /// What to place.
    pub scheduling_info: DesiredLrpSchedulingInfo,
    /// Which indices to place.
    pub indices: Vec<u32>,
}

impl LrpStartRequest {
    /// Creates a request for `indices` of `scheduling_info`.
    #[must_use]
    pub fn new(scheduling_info: DesiredLrpSchedulingInfo, indices: Vec<u32>) -> Self {
        Self {
            scheduling_info,
            indices,
        }
    }
}

/// An instance convergence stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LrpStop {
    /// Slot identity.
    pub key: ActualLrpKey,
    /// The incarnation that was stopped; empty if it was never claimed.
    pub instance_key: ActualLrpInstanceKey,
}

/// The auctioneer seam.
#[async_trait]
pub trait AuctionClient: Send + Sync {
    /// Requests placement of LRP instances.
    async fn request_lrp_auctions(&self, batch: Vec<LrpStartRequest>) -> Result<()>;

    /// Requests placement of tasks.
    async fn request_task_auctions(&self, batch: Vec<Task>) -> Result<()>;

    /// Reports instances that were stopped.
    async fn acknowledge_lrp_stops(&self, batch: Vec<LrpStop>) -> Result<()>;
}

/// Posts batches as JSON to an auctioneer.
#[derive(Debug, Clone)]
pub struct HttpAuctionClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAuctionClient {
    /// Creates a client targeting `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, batch: &[T]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let response = self
            .client
            .post(self.url(path))
            .json(batch)
            .send()
            .await
            .map_err(|e| Error::unknown_with_source(format!("auction request to {path} failed"), e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::unknown(format!(
            "auction request to {path} rejected ({status}): {body}"
        )))
    }
}

#[async_trait]
impl AuctionClient for HttpAuctionClient {
    async fn request_lrp_auctions(&self, batch: Vec<LrpStartRequest>) -> Result<()> {
        self.post("/v1/lrps", &batch).await
    }

    async fn request_task_auctions(&self, batch: Vec<Task>) -> Result<()> {
        self.post("/v1/tasks", &batch).await
    }

    async fn acknowledge_lrp_stops(&self, batch: Vec<LrpStop>) -> Result<()> {
        self.post("/v1/lrps/stops", &batch).await
    }
}

#[derive(Debug, Default)]
struct Recorded {
    lrp_batches: Vec<Vec<LrpStartRequest>>,
    task_batches: Vec<Vec<Task>>,
    stop_batches: Vec<Vec<LrpStop>>,
}

/// Records every batch it receives.
///
/// Empty batches are not recorded. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAuctionClient {
    recorded: Arc<Mutex<Recorded>>,
}

impl InMemoryAuctionClient {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Recorded) -> R) -> R {
        let mut recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut recorded)
    }

    /// Returns every LRP batch received.
    #[must_use]
    pub fn lrp_batches(&self) -> Vec<Vec<LrpStartRequest>> {
        self.with(|r| r.lrp_batches.clone())
    }

    /// Returns every task batch received.
    #[must_use]
    pub fn task_batches(&self) -> Vec<Vec<Task>> {
        self.with(|r| r.task_batches.clone())
    }

    /// Returns every stop batch received.
    #[must_use]
    pub fn stop_batches(&self) -> Vec<Vec<LrpStop>> {
        self.with(|r| r.stop_batches.clone())
    }

    /// Returns the total number of LRP instances requested.
    #[must_use]
    pub fn lrp_starts(&self) -> usize {
        self.with(|r| {
            r.lrp_batches
                .iter()
                .flatten()
                .map(|request| request.indices.len())
                .sum()
        })
    }

    /// Returns the total number of tasks requested.
    #[must_use]
    pub fn task_starts(&self) -> usize {
        self.with(|r| r.task_batches.iter().map(Vec::len).sum())
    }

    /// Returns the total number of stops acknowledged.
    #[must_use]
    pub fn lrp_stops(&self) -> usize {
        self.with(|r| r.stop_batches.iter().map(Vec::len).sum())
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        self.with(|r| *r = Recorded::default());
    }
}

#[async_trait]
impl AuctionClient for InMemoryAuctionClient {
    async fn request_lrp_auctions(&self, batch: Vec<LrpStartRequest>) -> Result<()> {
        if !batch.is_empty() {
            self.with(|r| r.lrp_batches.push(batch));
        }
        Ok(())
    }

    async fn request_task_auctions(&self, batch: Vec<Task>) -> Result<()> {
        if !batch.is_empty() {
            self.with(|r| r.task_batches.push(batch));
        }
        Ok(())
    }

    async fn acknowledge_lrp_stops(&self, batch: Vec<LrpStop>) -> Result<()> {
        if !batch.is_empty() {
            self.with(|r| r.stop_batches.push(batch));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use lodestar_core::models::DesiredLrp;

    async fn spawn_server(status: StatusCode) -> (String, Arc<Mutex<Vec<serde_json::Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let app = Router::new().route(
            "/v1/lrps",
            post(move |axum::Json(body): axum::Json<serde_json::Value>| {
                let captured = Arc::clone(&captured);
                async move {
                    captured.lock().expect("lock").push(body);
                    status
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

        (format!("http://{addr}"), seen)
    }

    fn request() -> LrpStartRequest {
        let info = DesiredLrp::builder("web", "apps").instances(2).build().scheduling_info();
        LrpStartRequest::new(info, vec![0, 1])
    }

    #[tokio::test]
    async fn posts_lrp_batches_as_json() {
        let (url, seen) = spawn_server(StatusCode::ACCEPTED).await;
        let client = HttpAuctionClient::new(format!("{url}/"));

        client
            .request_lrp_auctions(vec![request()])
            .await
            .expect("auction request");

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][0]["indices"], serde_json::json!([0, 1]));
        assert_eq!(seen[0][0]["schedulingInfo"]["key"]["processGuid"], "web");
    }

    #[tokio::test]
    async fn rejected_batches_are_errors() {
        let (url, _) = spawn_server(StatusCode::SERVICE_UNAVAILABLE).await;
        let client = HttpAuctionClient::new(url);

        let err = client
            .request_lrp_auctions(vec![request()])
            .await
            .expect_err("rejected");
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn empty_batches_are_not_sent() {
        let client = HttpAuctionClient::new("http://127.0.0.1:1");
        client
            .acknowledge_lrp_stops(Vec::new())
            .await
            .expect("empty batch is a no-op");
    }

    #[tokio::test]
    async fn in_memory_client_counts_work() {
        let client = InMemoryAuctionClient::new();
        client.request_lrp_auctions(vec![request()]).await.expect("record");
        client.request_task_auctions(Vec::new()).await.expect("record");

        assert_eq!(client.lrp_starts(), 2);
        assert_eq!(client.task_starts(), 0);
        assert!(client.task_batches().is_empty());

        client.clear();
        assert!(client.lrp_batches().is_empty());
    }
}
