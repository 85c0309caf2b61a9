//! In-process [`JobStore`] for tests and single-process tools.
//!
//! All jobs live behind one mutex, so every operation observes and mutates
//! the table atomically, the same guarantee a single conditional `UPDATE`
//! gives in PostgreSQL. Lease arithmetic uses an injectable [`Clock`].
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::job::{Job, JobId, JobStatus, NewJob, RequestType, UserId};
use crate::query::{ListJobsOptions, Page, QueueStats, SortField, SortOrder};
use crate::store::{CANCELLED_MESSAGE, EXHAUSTED_MESSAGE, JobStore, QueueOptions};
use crate::Error;

#[derive(Clone)]
pub struct MemoryStore {
    jobs: Arc<parking_lot::Mutex<Vec<Job>>>,
    clock: Arc<dyn Clock>,
    options: QueueOptions,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("jobs", &self.jobs.lock().len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock<C: Clock>(clock: C) -> Self {
        Self {
            jobs: Arc::default(),
            clock: Arc::new(clock),
            options: QueueOptions::default(),
        }
    }

    pub fn options(self, options: QueueOptions) -> Self {
        Self { options, ..self }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Apply `update` to the job with `id` if `guard` accepts it.
    fn update_where<G, U>(&self, id: JobId, guard: G, update: U) -> Option<Job>
    where
        G: FnOnce(&Job) -> bool,
        U: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.lock();
        let job = jobs.iter_mut().find(|job| job.id == id)?;
        if !guard(job) {
            return None;
        }
        let before = job.status;
        update(job);
        debug_assert!(
            before.can_transition_to(job.status) || before == job.status,
            "illegal transition {before} -> {}",
            job.status
        );
        Some(job.clone())
    }

    fn find_blocking(
        &self,
        jobs: &[Job],
        user_id: Option<UserId>,
        request_type: RequestType,
        key: &str,
    ) -> Option<Job> {
        let scope = self.options.idempotency_scope;
        jobs.iter()
            .filter(|job| {
                job.user_id == user_id
                    && job.request_type == request_type
                    && job.idempotency_key() == Some(key)
                    && scope.blocks(job.status)
            })
            .max_by_key(|job| job.created_at)
            .cloned()
    }
}

fn lease_deadline(now: DateTime<Utc>, lease: std::time::Duration) -> Result<DateTime<Utc>, Error> {
    if lease.is_zero() {
        return Err(Error::invalid_input("lease must be longer than zero"));
    }
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .ok_or_else(|| Error::invalid_input(format!("lease of {lease:?} is out of range")))
}

fn release_ownership(job: &mut Job) {
    job.locked_at = None;
    job.locked_by = None;
    job.lease_expires_at = None;
}

impl JobStore for MemoryStore {
    type Error = Error;

    async fn create(&self, new_job: NewJob) -> Result<Job, Self::Error> {
        let max_attempts = new_job.resolve_max_attempts(self.options.default_max_attempts)?;
        let now = self.now();
        let mut jobs = self.jobs.lock();

        if let Some(key) = new_job.idempotency_key() {
            if let Some(existing) =
                self.find_blocking(&jobs, new_job.user_id, new_job.request_type, key)
            {
                tracing::debug!(job_id = %existing.id, key, "deduplicated job submission");
                return Ok(existing);
            }
        }

        let job = Job {
            id: JobId::new_v4(),
            user_id: new_job.user_id,
            request_type: new_job.request_type,
            input_data: serde_json::Value::Object(new_job.input_data),
            status: JobStatus::Pending,
            result: None,
            error_message: None,
            attempts: 0,
            max_attempts,
            locked_at: None,
            locked_by: None,
            lease_expires_at: None,
            created_at: now,
            processed_at: None,
        };
        jobs.push(job.clone());
        Ok(job)
    }

    async fn find_by_idempotency_key(
        &self,
        user_id: Option<UserId>,
        request_type: RequestType,
        key: &str,
    ) -> Result<Option<Job>, Self::Error> {
        let jobs = self.jobs.lock();
        Ok(self.find_blocking(&jobs, user_id, request_type, key))
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        lease: std::time::Duration,
        request_types: &[RequestType],
    ) -> Result<Option<Job>, Self::Error> {
        let now = self.now();
        let expires = lease_deadline(now, lease)?;
        let mut jobs = self.jobs.lock();

        // Same order as the SQL claim: `created_at`, then `id`.
        let Some(job) = jobs
            .iter_mut()
            .filter(|job| request_types.contains(&job.request_type) && job.is_claimable(now))
            .min_by_key(|job| (job.created_at, job.id))
        else {
            return Ok(None);
        };

        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.locked_by = Some(worker_id.to_owned());
        job.locked_at = Some(now);
        job.lease_expires_at = Some(expires);
        job.error_message = None;
        tracing::debug!(job_id = %job.id, worker_id, attempt = job.attempts, "claimed job");
        Ok(Some(job.clone()))
    }

    async fn extend_lease(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: std::time::Duration,
    ) -> Result<bool, Self::Error> {
        let expires = lease_deadline(self.now(), lease)?;
        let extended = self.update_where(
            job_id,
            |job| job.is_owned_by(worker_id),
            |job| job.lease_expires_at = Some(expires),
        );
        Ok(extended.is_some())
    }

    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Option<Job>, Self::Error> {
        let now = self.now();
        Ok(self.update_where(
            job_id,
            |job| job.is_owned_by(worker_id),
            |job| {
                job.status = JobStatus::Completed;
                job.result = Some(result);
                job.processed_at = Some(now);
                release_ownership(job);
            },
        ))
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        error_message: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Option<Job>, Self::Error> {
        let now = self.now();
        Ok(self.update_where(
            job_id,
            |job| job.is_owned_by(worker_id),
            |job| {
                job.status = JobStatus::Failed;
                job.error_message = Some(error_message.to_owned());
                job.result = result;
                job.processed_at = Some(now);
                release_ownership(job);
            },
        ))
    }

    async fn reset_to_pending(&self, job_id: JobId) -> Result<Option<Job>, Self::Error> {
        Ok(self.update_where(
            job_id,
            |job| job.status == JobStatus::Failed,
            |job| {
                job.status = JobStatus::Pending;
                job.error_message = None;
                job.processed_at = None;
                release_ownership(job);
            },
        ))
    }

    async fn cancel(&self, job_id: JobId) -> Result<Option<Job>, Self::Error> {
        let now = self.now();
        Ok(self.update_where(
            job_id,
            |job| job.status == JobStatus::Pending,
            |job| {
                job.status = JobStatus::Cancelled;
                job.error_message = Some(CANCELLED_MESSAGE.to_owned());
                job.processed_at = Some(now);
                release_ownership(job);
            },
        ))
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, Self::Error> {
        Ok(self.jobs.lock().iter().find(|job| job.id == job_id).cloned())
    }

    async fn list(&self, options: &ListJobsOptions) -> Result<Page<Job>, Self::Error> {
        let mut matching: Vec<Job> = self
            .jobs
            .lock()
            .iter()
            .filter(|job| options.filter.matches(job))
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            let ordering = match options.sort {
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::ProcessedAt => a.processed_at.cmp(&b.processed_at),
                SortField::Attempts => a.attempts.cmp(&b.attempts),
            }
            .then_with(|| a.id.cmp(&b.id));
            match options.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = matching.len() as u64;
        let offset = usize::try_from(options.offset()).unwrap_or(usize::MAX);
        let items = matching
            .into_iter()
            .skip(offset)
            .take(options.page_size() as usize)
            .collect();
        Ok(Page::new(items, total, options))
    }

    async fn stats(&self) -> Result<QueueStats, Self::Error> {
        Ok(self.jobs.lock().iter().map(|job| (job.status, 1)).collect())
    }

    async fn dead_letter_exhausted(&self) -> Result<Vec<Job>, Self::Error> {
        let now = self.now();
        let mut jobs = self.jobs.lock();
        let mut moved = Vec::new();
        for job in jobs.iter_mut() {
            let stranded = job.status == JobStatus::Pending
                || job.status == JobStatus::Failed
                || job.lease_expired(now);
            if !(job.is_exhausted() && stranded) {
                continue;
            }
            job.status = JobStatus::DeadLetter;
            job.error_message
                .get_or_insert_with(|| EXHAUSTED_MESSAGE.to_owned());
            job.processed_at.get_or_insert(now);
            release_ownership(job);
            moved.push(job.clone());
        }
        Ok(moved)
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<u64, Self::Error> {
        let mut jobs = self.jobs.lock();
        let len = jobs.len();
        jobs.retain(|job| {
            !(job.status.is_terminal() && job.processed_at.is_some_and(|at| at < before))
        });
        Ok((len - jobs.len()) as u64)
    }
}
