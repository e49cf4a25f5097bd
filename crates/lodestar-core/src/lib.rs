//! # lodestar-core
//!
//! Shared primitives for the Lodestar cluster state store.
//!
//! This crate holds everything the storage and convergence layers agree on:
//!
//! - **Error taxonomy**: One error enum with stable kinds for every failure a
//!   store or coordinator can report
//! - **Data model**: Desired and actual long-running processes, tasks, domains
//!   and the modification tags that order writes to them
//! - **Encoding**: The versioned blob envelope and the key ring used for
//!   encryption at rest
//! - **Time**: A [`Clock`](clock::Clock) seam so convergence thresholds can be
//!   tested deterministically
//!
//! ## Example
//!
//! ```rust
//! use lodestar_core::models::{DesiredLrp, ModificationTag};
//!
//! let lrp = DesiredLrp::builder("web-1", "apps").instances(3).build();
//! assert_eq!(lrp.instances, 3);
//!
//! let mut tag = ModificationTag::fresh();
//! tag.increment();
//! assert_eq!(tag.index, 1);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod encryption;
pub mod error;
pub mod format;
pub mod models;
pub mod observability;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, ErrorKind, Result};
