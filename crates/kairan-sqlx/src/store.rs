//! [`JobStore`] on PostgreSQL.
//!
//! Claims, renewals and outcomes are single guarded `UPDATE`s. Creation
//! runs in a transaction so the idempotency lookup, the insert and the
//! wake-up `NOTIFY` commit together.
use chrono::{DateTime, Utc};
use kairan_core::store::{CANCELLED_MESSAGE, EXHAUSTED_MESSAGE};
use kairan_core::{
    ErrorKind, Job, JobId, JobStatus, JobStore, ListJobsOptions, NewJob, Page, QueueOptions, QueueStats,
    RequestType, StoreBackEnd, UserId,
};
use sqlx::postgres::types::PgInterval;

use crate::listener::{ChannelData, Listener};
use crate::queries::{self, JobRow, PgJobStatus};
use crate::{Error, NOTIFY_CHANNEL_NAME};

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: sqlx::PgPool,
    options: QueueOptions,
}

impl PostgresStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            options: QueueOptions::default(),
        }
    }

    pub fn options(self, options: QueueOptions) -> Self {
        Self { options, ..self }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<(), Error> {
        crate::MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Open a dedicated connection listening for new-job notifications.
    pub async fn listener(&self) -> Result<Listener, Error> {
        Listener::connect(&self.pool).await
    }

    /// Worker-side adapter claiming jobs of `request_types` from this store
    /// as `worker_id`.
    pub fn backend<T, I>(
        &self,
        worker_id: impl Into<std::sync::Arc<str>>,
        request_types: I,
    ) -> StoreBackEnd<Self, T>
    where
        I: IntoIterator<Item = RequestType>,
    {
        StoreBackEnd::new(self.clone(), worker_id, request_types)
    }
}

fn lease_interval(lease: std::time::Duration) -> Result<PgInterval, Error> {
    if lease.is_zero() {
        return Err(kairan_core::Error::invalid_input("lease must be longer than zero").into());
    }
    PgInterval::try_from(lease)
        .map_err(|error| kairan_core::Error::new(ErrorKind::InvalidInput, error).into())
}

fn idempotency_lock_key(user_id: Option<UserId>, request_type: RequestType, key: &str) -> String {
    match user_id {
        Some(user_id) => format!("{user_id}:{request_type}:{key}"),
        None => format!("-:{request_type}:{key}"),
    }
}

fn into_job(row: Option<JobRow>) -> Result<Option<Job>, Error> {
    Ok(row.map(Job::try_from).transpose()?)
}

async fn notify(conn: &mut sqlx::PgConnection, job: &Job) -> Result<(), Error> {
    let payload = serde_json::to_string(&ChannelData {
        job_id: job.id,
        request_type: job.request_type,
    })?;
    queries::AddJobNotify::builder()
        .channel_name(NOTIFY_CHANNEL_NAME)
        .payload(&payload)
        .build()
        .query()
        .execute(conn)
        .await?;
    Ok(())
}

impl JobStore for PostgresStore {
    type Error = Error;

    async fn create(&self, new_job: NewJob) -> Result<Job, Self::Error> {
        let max_attempts = new_job.resolve_max_attempts(self.options.default_max_attempts)?;
        let mut tx = self.pool.begin().await?;

        if let Some(key) = new_job.idempotency_key() {
            let lock_key = idempotency_lock_key(new_job.user_id, new_job.request_type, key);
            queries::AcquireIdempotencyLock::builder()
                .lock_key(&lock_key)
                .build()
                .query()
                .execute(&mut *tx)
                .await?;

            let existing = queries::FindByIdempotencyKey::builder()
                .user_id(new_job.user_id)
                .request_type(new_job.request_type.as_str())
                .key(key)
                .statuses(
                    self.options
                        .idempotency_scope
                        .blocking_statuses()
                        .iter()
                        .copied()
                        .map(PgJobStatus::from)
                        .collect(),
                )
                .build()
                .query_as()
                .fetch_optional(&mut *tx)
                .await?;

            if let Some(row) = existing {
                tx.commit().await?;
                let job = Job::try_from(row)?;
                tracing::debug!(job_id = %job.id, key, "deduplicated job submission");
                return Ok(job);
            }
        }

        let input_data = serde_json::Value::Object(new_job.input_data);
        let row = queries::InsertJob::builder()
            .user_id(new_job.user_id)
            .request_type(new_job.request_type.as_str())
            .input_data(&input_data)
            .max_attempts(max_attempts)
            .build()
            .query_as()
            .fetch_one(&mut *tx)
            .await?;
        let job = Job::try_from(row)?;
        notify(&mut tx, &job).await?;
        tx.commit().await?;

        tracing::debug!(job_id = %job.id, request_type = %job.request_type, "enqueued job");
        Ok(job)
    }

    async fn find_by_idempotency_key(
        &self,
        user_id: Option<UserId>,
        request_type: RequestType,
        key: &str,
    ) -> Result<Option<Job>, Self::Error> {
        let row = queries::FindByIdempotencyKey::builder()
            .user_id(user_id)
            .request_type(request_type.as_str())
            .key(key)
            .statuses(
                self.options
                    .idempotency_scope
                    .blocking_statuses()
                    .iter()
                    .copied()
                    .map(PgJobStatus::from)
                    .collect(),
            )
            .build()
            .query_as()
            .fetch_optional(&self.pool)
            .await?;
        into_job(row)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        lease: std::time::Duration,
        request_types: &[RequestType],
    ) -> Result<Option<Job>, Self::Error> {
        let row = queries::ClaimNextJob::builder()
            .worker_id(worker_id)
            .lease(lease_interval(lease)?)
            .request_types(request_types.iter().map(|kind| kind.as_str()).collect())
            .build()
            .query_as()
            .fetch_optional(&self.pool)
            .await?;
        let job = into_job(row)?;
        if let Some(job) = &job {
            tracing::debug!(job_id = %job.id, worker_id, attempt = job.attempts, "claimed job");
        }
        Ok(job)
    }

    async fn extend_lease(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: std::time::Duration,
    ) -> Result<bool, Self::Error> {
        let res = queries::ExtendLease::builder()
            .id(job_id)
            .worker_id(worker_id)
            .lease(lease_interval(lease)?)
            .build()
            .query()
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Option<Job>, Self::Error> {
        let row = queries::CompleteJob::builder()
            .id(job_id)
            .worker_id(worker_id)
            .result(&result)
            .build()
            .query_as()
            .fetch_optional(&self.pool)
            .await?;
        into_job(row)
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        error_message: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Option<Job>, Self::Error> {
        let row = queries::FailJob::builder()
            .id(job_id)
            .worker_id(worker_id)
            .error_message(error_message)
            .result(result.as_ref())
            .build()
            .query_as()
            .fetch_optional(&self.pool)
            .await?;
        into_job(row)
    }

    async fn reset_to_pending(&self, job_id: JobId) -> Result<Option<Job>, Self::Error> {
        let mut tx = self.pool.begin().await?;
        let row = queries::ResetToPending::builder()
            .id(job_id)
            .build()
            .query_as()
            .fetch_optional(&mut *tx)
            .await?;
        let job = into_job(row)?;
        if let Some(job) = &job {
            notify(&mut tx, job).await?;
        }
        tx.commit().await?;
        Ok(job)
    }

    async fn cancel(&self, job_id: JobId) -> Result<Option<Job>, Self::Error> {
        let row = queries::CancelJob::builder()
            .id(job_id)
            .message(CANCELLED_MESSAGE)
            .build()
            .query_as()
            .fetch_optional(&self.pool)
            .await?;
        into_job(row)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, Self::Error> {
        let row = queries::GetJob::builder()
            .id(job_id)
            .build()
            .query_as()
            .fetch_optional(&self.pool)
            .await?;
        into_job(row)
    }

    async fn list(&self, options: &ListJobsOptions) -> Result<Page<Job>, Self::Error> {
        let list = queries::ListJobs::builder().options(options).build();

        let mut count = list.count();
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut page = list.page();
        let items = page
            .build_query_as::<JobRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page::new(
            items,
            u64::try_from(total).unwrap_or_default(),
            options,
        ))
    }

    async fn stats(&self) -> Result<QueueStats, Self::Error> {
        let rows = queries::AggregateStats::query_as()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(status, count)| {
                (JobStatus::from(status), u64::try_from(count).unwrap_or_default())
            })
            .collect())
    }

    async fn dead_letter_exhausted(&self) -> Result<Vec<Job>, Self::Error> {
        let jobs = queries::DeadLetterExhausted::builder()
            .default_message(EXHAUSTED_MESSAGE)
            .build()
            .query_as()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        if !jobs.is_empty() {
            tracing::info!(count = jobs.len(), "moved exhausted jobs to dead letter");
        }
        Ok(jobs)
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<u64, Self::Error> {
        let res = queries::PurgeTerminal::builder()
            .before(before)
            .build()
            .query()
            .execute(&self.pool)
            .await?;
        tracing::info!(count = res.rows_affected(), %before, "purged terminal jobs");
        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_separates_users_and_request_types() {
        let user = UserId::new_v4();
        let anonymous = idempotency_lock_key(None, RequestType::PageDraft, "k");
        let owned = idempotency_lock_key(Some(user), RequestType::PageDraft, "k");
        let other_type = idempotency_lock_key(Some(user), RequestType::PostGeneration, "k");
        assert_eq!(anonymous, "-:page_draft:k");
        assert_ne!(owned, anonymous);
        assert_ne!(owned, other_type);
    }

    #[test]
    fn lease_converts_to_interval() {
        let interval = lease_interval(std::time::Duration::from_secs(30)).unwrap();
        assert_eq!(interval.microseconds, 30_000_000);
    }

    #[test]
    fn zero_lease_is_invalid_input() {
        let error = lease_interval(std::time::Duration::ZERO).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn oversized_lease_is_invalid_input() {
        let error = lease_interval(std::time::Duration::MAX).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidInput);
    }
}
