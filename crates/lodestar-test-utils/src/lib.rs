//! Shared test utilities for Lodestar integration tests.
//!
//! This crate provides:
//! - [`TestContext`]: a store, leading service, clock, auctioneer and cell
//!   set wired together
//! - [`RecordingKeyValue`]: in-memory key-value backend with operation
//!   recording and failure injection
//! - Factory functions for desired LRPs, tasks and instance keys
//! - Assertion helpers for store state
//!
//! # Example
//!
//! ```rust,ignore
//! use lodestar_test_utils::{TestContext, desired_lrp};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let ctx = TestContext::kv().await;
//!     ctx.store.desire_lrp(&desired_lrp("web", 3)).await.unwrap();
//!     let report = ctx.converger().converge_once().await.unwrap();
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod storage;

pub use assertions::*;
pub use fixtures::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("lodestar=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
