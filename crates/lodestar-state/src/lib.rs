//! # lodestar-state
//!
//! The cluster state server: a durable record store for desired and actual
//! long-running processes and one-off tasks, plus the background machinery
//! that keeps the actual world matching the desired one.
//!
//! ## Components
//!
//! - **Record store** ([`store`]): one [`Store`](store::Store) trait with a
//!   relational and a key-value implementation
//! - **Convergence** ([`convergence`]): a periodic, single-flight pass that
//!   emits start and stop work to the auctioneer
//! - **Leadership** ([`leader`]): a renewed lease that gates serving and
//!   convergence to one instance
//! - **Change hubs** ([`hub`]): non-blocking fan-out of record changes to
//!   subscribers
//! - **Task callbacks** ([`workpool`], [`callback`]): bounded delivery of
//!   completion callbacks
//! - **Service** ([`service`]): leader-gated mutations that publish to the
//!   hubs
//! - **Key rotation** ([`encryptor`]): re-seals stored blobs when the active
//!   key changes
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use lodestar_core::encryption::{Cryptor, Key, KeyManager};
//! use lodestar_core::format::Encoder;
//! use lodestar_core::models::DesiredLrp;
//! use lodestar_core::SystemClock;
//! use lodestar_state::store::Store;
//! use lodestar_state::store::sql::SqlStore;
//!
//! # async fn run() -> lodestar_state::Result<()> {
//! let key = Key::new("primary", "correct horse battery staple")?;
//! let encoder = Encoder::new(Cryptor::new(KeyManager::new(key, [])?));
//! let store = SqlStore::connect("sqlite::memory:", 1, encoder, Arc::new(SystemClock)).await?;
//! store.ensure_schema().await?;
//!
//! let lrp = store
//!     .desire_lrp(&DesiredLrp::builder("web", "apps").instances(3).build())
//!     .await?;
//! assert_eq!(lrp.modification_tag.index, 0);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod auction;
pub mod callback;
pub mod cells;
pub mod config;
pub mod convergence;
pub mod encryptor;
pub mod hub;
pub mod leader;
pub mod metrics;
pub mod service;
pub mod store;
pub mod workpool;

pub use lodestar_core::{Error, Result};
