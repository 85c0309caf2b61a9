//! The job store contract: every operation producers, workers and
//! operators perform against the queue.
//!
//! Each mutating operation is a single conditional update on one job. A
//! guard that does not hold (wrong status, wrong owner, unknown id) is
//! reported as `None`/`false`, never as an error, so callers can tell
//! "the queue said no" apart from "the store is down".
use serde::{Deserialize, Serialize};

use crate::job::{DEFAULT_MAX_ATTEMPTS, JobStatus};

/// Which existing jobs block a resubmission with the same idempotency key.
///
/// The default keeps a completed job's key taken, so resubmitting returns
/// the stored result instead of paying for the generation again. Choose
/// [`UnresolvedOnly`](Self::UnresolvedOnly) when a resubmission after
/// completion must create a new job, as in a regenerate-on-demand flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyScope {
    /// Pending, processing and completed jobs block; failed, cancelled and
    /// dead-lettered jobs allow a new submission.
    #[default]
    UnresolvedOrCompleted,
    /// Only pending and processing jobs block.
    UnresolvedOnly,
}

impl IdempotencyScope {
    pub const fn blocking_statuses(self) -> &'static [JobStatus] {
        match self {
            IdempotencyScope::UnresolvedOrCompleted => &[
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Completed,
            ],
            IdempotencyScope::UnresolvedOnly => &[JobStatus::Pending, JobStatus::Processing],
        }
    }

    pub fn blocks(self, status: JobStatus) -> bool {
        self.blocking_statuses().contains(&status)
    }
}

/// Producer-side defaults applied by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub default_max_attempts: u16,
    pub idempotency_scope: IdempotencyScope,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            idempotency_scope: IdempotencyScope::default(),
        }
    }
}

/// Message written to dead-lettered jobs that carry no failure reason.
pub const EXHAUSTED_MESSAGE: &str = "retry budget exhausted";

/// Message written to jobs withdrawn through [`JobStore::cancel`].
pub const CANCELLED_MESSAGE: &str = "cancelled before processing";

mod tmp {
    use crate::job::{Job, JobId, NewJob, RequestType, UserId};
    use crate::query::{ListJobsOptions, Page, QueueStats};

    /// Durable job storage with atomic claim and guarded outcomes.
    #[trait_variant::make(JobStore: Send)]
    pub trait LocalJobStore {
        type Error: std::error::Error + From<crate::Error> + Into<crate::Error> + Send + Sync + 'static;

        /// Insert a `pending` job, or return the existing job when the
        /// idempotency key is already held by a blocking job.
        async fn create(&self, job: NewJob) -> Result<Job, Self::Error>;

        async fn find_by_idempotency_key(
            &self,
            user_id: Option<UserId>,
            request_type: RequestType,
            key: &str,
        ) -> Result<Option<Job>, Self::Error>;

        /// Atomically take ownership of the oldest claimable job whose
        /// request type is in `request_types`. Jobs of other types are left
        /// untouched. Oldest means smallest `created_at`, ties broken by
        /// `id`. A zero `lease` is rejected as invalid input.
        async fn claim_next(
            &self,
            worker_id: &str,
            lease: std::time::Duration,
            request_types: &[RequestType],
        ) -> Result<Option<Job>, Self::Error>;

        /// Push the lease forward; `false` once `worker_id` no longer owns the job.
        /// A zero `lease` is rejected as invalid input.
        async fn extend_lease(
            &self,
            job_id: JobId,
            worker_id: &str,
            lease: std::time::Duration,
        ) -> Result<bool, Self::Error>;

        async fn complete(
            &self,
            job_id: JobId,
            worker_id: &str,
            result: serde_json::Value,
        ) -> Result<Option<Job>, Self::Error>;

        async fn fail(
            &self,
            job_id: JobId,
            worker_id: &str,
            error_message: &str,
            result: Option<serde_json::Value>,
        ) -> Result<Option<Job>, Self::Error>;

        /// Manual retry of a `failed` job. Attempts are kept.
        async fn reset_to_pending(&self, job_id: JobId) -> Result<Option<Job>, Self::Error>;

        /// Withdraw a job that no worker has claimed yet.
        async fn cancel(&self, job_id: JobId) -> Result<Option<Job>, Self::Error>;

        async fn get(&self, job_id: JobId) -> Result<Option<Job>, Self::Error>;

        async fn list(&self, options: &ListJobsOptions) -> Result<Page<Job>, Self::Error>;

        async fn stats(&self) -> Result<QueueStats, Self::Error>;

        /// Park every exhausted job that is stranded in `pending`,
        /// lease-expired `processing` or `failed`.
        async fn dead_letter_exhausted(&self) -> Result<Vec<Job>, Self::Error>;

        /// Delete terminal jobs resolved before `before`.
        async fn purge_terminal(
            &self,
            before: chrono::DateTime<chrono::Utc>,
        ) -> Result<u64, Self::Error>;
    }
}

pub use tmp::{JobStore, LocalJobStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scope_lets_failed_and_cancelled_jobs_resubmit() {
        let scope = IdempotencyScope::default();
        assert!(scope.blocks(JobStatus::Pending));
        assert!(scope.blocks(JobStatus::Processing));
        assert!(scope.blocks(JobStatus::Completed));
        assert!(!scope.blocks(JobStatus::Failed));
        assert!(!scope.blocks(JobStatus::Cancelled));
        assert!(!scope.blocks(JobStatus::DeadLetter));
    }

    #[test]
    fn unresolved_scope_releases_completed_keys() {
        assert!(!IdempotencyScope::UnresolvedOnly.blocks(JobStatus::Completed));
        assert!(IdempotencyScope::UnresolvedOnly.blocks(JobStatus::Processing));
    }
}
