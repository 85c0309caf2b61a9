//! Durable job queue for AI-assisted content generation.
//!
//! Producers enqueue jobs with [`JobStore::create`]; workers built with
//! [`WorkerBuilder`] claim them, keep their lease alive while a handler runs
//! and persist the [`JobResult`] the handler returns. [`MemoryStore`] keeps
//! everything in process; with the `postgres` feature [`PostgresStore`] does
//! the same on a shared table so any number of workers can compete for jobs.
pub use kairan_core::{
    IdempotencyScope, Job, JobData, JobFailure, JobFilter, JobHandler, JobId, JobResult,
    JobStatus, JobStore, ListJobsOptions, MemoryStore, NewJob, Page, QueueOptions, QueueStats,
    RequestType, SortField, SortOrder, StoreBackEnd, Task, UserId, Worker, WorkerBuilder,
    WorkerContext,
};
pub use kairan_core::{Error, ErrorKind};
pub use kairan_core::{backend, clock, utils, worker};

#[cfg(feature = "rt-tokio")]
pub use kairan_core::TokioSpawner;

pub mod config;

#[cfg(feature = "postgres")]
pub use kairan_sqlx::{
    Listener, MIGRATOR, NOTIFY_CHANNEL_NAME, PostgresStore, Subscribe, WorkerWithListenerExt,
};
