//! Core contract of the kairan job queue.
//!
//! - [`job`]: the job record and its status state machine.
//! - [`store`]: the [`JobStore`] trait every backend implements: create with
//!   idempotency, atomic claim, lease renewal, guarded outcomes,
//!   introspection and supervisor operations.
//! - [`memory`]: an in-process store with the same guarantees.
//! - [`worker`]: a polling worker that claims jobs, renews their leases
//!   while handlers run and records the outcome handlers return.
//!
//! Handlers state their outcome explicitly. A failure is recorded, not
//! retried; a crash is recovered by lease expiry and re-claim.
pub mod backend;
pub mod clock;
pub mod error;
pub mod job;
pub mod memory;
pub mod query;
pub mod store;
pub mod utils;
pub mod worker;

#[cfg(feature = "rt-tokio")]
mod tokio_spawner;
#[cfg(feature = "rt-tokio")]
pub use tokio_spawner::TokioSpawner;

pub use backend::{BackEndContext, BackEndPoller, ClaimedJob, StoreBackEnd, Task};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, ErrorKind};
pub use job::{Job, JobId, JobStatus, NewJob, RequestType, UserId};
pub use memory::MemoryStore;
pub use query::{JobFilter, ListJobsOptions, Page, QueueStats, SortField, SortOrder};
pub use store::{IdempotencyScope, JobStore, QueueOptions};
pub use worker::{Worker, WorkerBuilder};

/// Failure reason plus optional partial output for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub message: String,
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
/// Outcome a handler wants to persist.
///
/// There is no "retry" outcome: a failure stays failed until an operator
/// resets it, and a handler that never returns is recovered by lease expiry.
pub enum JobResult {
    /// Store `result` and mark the job completed.
    Complete(serde_json::Value),
    /// Mark the job failed with a reason.
    Fail(JobFailure),
}

impl JobResult {
    pub fn complete(result: impl Into<serde_json::Value>) -> Self {
        JobResult::Complete(result.into())
    }

    pub fn fail(message: impl Into<String>) -> Self {
        JobResult::Fail(JobFailure {
            message: message.into(),
            result: None,
        })
    }

    /// Fail but keep what was produced so far.
    pub fn fail_with(message: impl Into<String>, partial: impl Into<serde_json::Value>) -> Self {
        JobResult::Fail(JobFailure {
            message: message.into(),
            result: Some(partial.into()),
        })
    }
}

/// Trait implemented by functions that process a job.
///
/// The `M` type parameter determines which combination of [`JobData`] and
/// [`WorkerContext`] the handler expects. The associated [`Data`] type
/// specifies the payload that the job carries.
///
/// [`Data`]: JobHandler::Data
pub trait JobHandler<M>: Send + Sync + Clone + 'static {
    /// The job data type handled by this function.
    type Data: Send + 'static;
    /// Type of the shared context provided to the handler.
    type Context: Send + 'static;

    /// Future returned by the handler.
    type Future: Future<Output = JobResult> + Send;

    /// Invoke the handler with the job data and worker context.
    fn call(self, data: Self::Data, context: Self::Context) -> Self::Future;
}

/// Explicitly opt in to receive the claimed task.
pub struct JobData<T>(pub T);

/// Explicitly opt in to receive shared context (AI client, content
/// repositories, config). Cloned per job.
pub struct WorkerContext<S>(pub S);

impl<F, Fut> JobHandler<()> for F
where
    F: FnOnce() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send,
{
    type Data = ();
    type Context = ();
    type Future = Fut;

    fn call(self, _data: Self::Data, _context: Self::Context) -> Self::Future {
        self()
    }
}

impl<F, Fut, T> JobHandler<JobData<T>> for F
where
    T: Send + 'static,
    F: FnOnce(JobData<T>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send,
{
    type Data = T;
    type Context = ();
    type Future = Fut;

    fn call(self, data: Self::Data, _context: Self::Context) -> Self::Future {
        self(JobData(data))
    }
}

impl<F, Fut, S> JobHandler<WorkerContext<S>> for F
where
    S: Send + 'static,
    F: FnOnce(WorkerContext<S>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send,
{
    type Data = ();
    type Context = S;
    type Future = Fut;

    fn call(self, _data: Self::Data, context: Self::Context) -> Self::Future {
        self(WorkerContext(context))
    }
}

impl<F, Fut, T, S> JobHandler<(JobData<T>, WorkerContext<S>)> for F
where
    T: Send + 'static,
    S: Send + 'static,
    F: FnOnce(JobData<T>, WorkerContext<S>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send,
{
    type Data = T;
    type Context = S;
    type Future = Fut;

    fn call(self, data: Self::Data, context: Self::Context) -> Self::Future {
        self(JobData(data), WorkerContext(context))
    }
}
