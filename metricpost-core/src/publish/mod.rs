//! Event batching and delivery
//!
//! This module turns `track` calls into batched POST requests against an
//! ingestion endpoint.
//!
//! ## Architecture
//!
//! ```text
//! track() -> Normalizer -> queue -> (size | timer | lifecycle | manual)
//!         -> async transport -> ok: done
//!                            -> error: backoff retries -> archive
//! ```
//!
//! - Analytics never blocks or fails the host: `track` only does bookkeeping
//!   and delivery errors are logged, counted and archived
//! - Teardown uses a synchronous best-effort path with no retries
//! - Everything outside the process goes through the [`Environment`] trait
//!
//! ## Usage
//!
//! ```rust,no_run
//! use metricpost_core::publish::{LifecycleSignal, Publisher};
//! use metricpost_core::PublisherConfig;
//!
//! # async fn run() -> metricpost_core::Result<()> {
//! let publisher =
//!     Publisher::with_http(PublisherConfig::for_endpoint("https://ingest.example.com/events"))?;
//!
//! publisher.track("Click", None, Some("btn-1"), Some(r#"{"row": 2}"#.into()), None);
//! publisher.flush().await;
//!
//! publisher.handle_signal(LifecycleSignal::Unload);
//! # Ok(())
//! # }
//! ```

mod archive;
mod client;
mod events;
mod publisher;
mod retry;
mod session;
pub mod testing;

pub use archive::{FailedBatch, FailedBatchArchive};
pub use client::{Environment, HttpEnvironment};
pub use events::{AttributeInput, EventBatch, EventRecord, Normalizer, RESERVED_KEYS};
pub use publisher::{FlushOutcome, LifecycleSignal, PublishStats, Publisher};
pub use retry::{DeliveryState, RetryDecision, RetryPolicy};
pub use session::generate_session_id;
