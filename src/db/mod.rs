//! High-level store API and job runner.
//!
//! This module provides the user-facing surface of contentdb: repository,
//! content and version operations on [`ContentStore`], and [`TaskRunner`]
//! for running them as serialized, retried jobs.

mod api;
mod error;
mod tasks;

pub use api::{ContentStore, RepositoryInfo, RepositoryUpdate, StoreConfig, VersionDetail};
pub use error::{ApiStatus, StoreError, StoreResult};
pub use tasks::{Job, JobOutcome, JobResult, TaskRunner};
