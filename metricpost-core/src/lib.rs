//! # metricpost-core
//!
//! Core library for metricpost - batched, retrying delivery of application
//! events to a remote ingestion endpoint.
//!
//! This library provides:
//! - Event normalization and an in-memory queue
//! - Size, timer and lifecycle flush triggers
//! - Asynchronous delivery with exponential backoff and a failed-batch archive
//! - Synchronous best-effort delivery for process teardown
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Example
//!
//! ```rust,no_run
//! use metricpost_core::{Config, Publisher};
//!
//! # async fn run() -> metricpost_core::Result<()> {
//! let config = Config::load()?;
//! let publisher = Publisher::with_http(config.publisher)?;
//!
//! publisher.track("PageView", None, Some("home"), None, None);
//! publisher.shutdown();
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::{Config, PublisherConfig};
pub use error::{Error, Result};
pub use publish::{FlushOutcome, LifecycleSignal, PublishStats, Publisher};

// Public modules
pub mod config;
pub mod error;
pub mod logging;
pub mod publish;
