//! Blue Banded Bee — Job and Task Execution Core.
//!
//! The durable job queue, concurrent worker pool, URL discovery/enqueue
//! pipeline, and per-URL warming fetcher that translate "warm this site"
//! into a series of HTTP GETs whose outcomes are persisted and reported.
//! The HTTP API, authentication, recurring scheduler, and dashboard that
//! would sit in front of this crate are external collaborators (out of
//! scope — see `SPEC_FULL.md` §1).

pub mod adaptive;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod imurl;
pub mod job_manager;
pub mod recovery;
pub mod robots;
pub mod sitemap;
pub mod store;
pub mod worker_pool;

pub use config::Config;
pub use error::{Classify, FailureKind};
pub use job_manager::{CreateJobOptions, JobManager};
pub use store::Store;
pub use worker_pool::WorkerPool;
