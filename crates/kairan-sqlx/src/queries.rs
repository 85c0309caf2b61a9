//! SQL statements against `kairan_jobs`.
//!
//! Each statement is a struct whose fields are its bind parameters, built
//! with `Statement::builder()...build()` and turned into a sqlx query with
//! `query()`/`query_as()`. Mutations are single statements so the row lock
//! taken by the `UPDATE` is the only synchronization they need.
use chrono::{DateTime, Utc};
use kairan_core::{
    ErrorKind, Job, JobFilter, JobStatus, ListJobsOptions, RequestType, SortField, SortOrder,
};
use sqlx::postgres::{PgArguments, types::PgInterval};
use sqlx::query::{Query, QueryAs};
use sqlx::{Postgres, QueryBuilder};
use typed_builder::TypedBuilder;
use uuid::Uuid;

macro_rules! job_columns {
    () => {
        "id, user_id, request_type, input_data, status, result, error_message, attempts, \
         max_attempts, locked_at, locked_by, lease_expires_at, created_at, processed_at"
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "kairan_job_status", rename_all = "snake_case")]
pub enum PgJobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    DeadLetter,
}

impl From<JobStatus> for PgJobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Pending => PgJobStatus::Pending,
            JobStatus::Processing => PgJobStatus::Processing,
            JobStatus::Completed => PgJobStatus::Completed,
            JobStatus::Failed => PgJobStatus::Failed,
            JobStatus::Cancelled => PgJobStatus::Cancelled,
            JobStatus::DeadLetter => PgJobStatus::DeadLetter,
        }
    }
}

impl From<PgJobStatus> for JobStatus {
    fn from(value: PgJobStatus) -> Self {
        match value {
            PgJobStatus::Pending => JobStatus::Pending,
            PgJobStatus::Processing => JobStatus::Processing,
            PgJobStatus::Completed => JobStatus::Completed,
            PgJobStatus::Failed => JobStatus::Failed,
            PgJobStatus::Cancelled => JobStatus::Cancelled,
            PgJobStatus::DeadLetter => JobStatus::DeadLetter,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub request_type: String,
    pub input_data: serde_json::Value,
    pub status: PgJobStatus,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = kairan_core::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let request_type = row
            .request_type
            .parse::<RequestType>()
            .map_err(|error| kairan_core::Error::new(ErrorKind::Decode, error))?;
        Ok(Job {
            id: row.id,
            user_id: row.user_id,
            request_type,
            input_data: row.input_data,
            status: row.status.into(),
            result: row.result,
            error_message: row.error_message,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            locked_at: row.locked_at,
            locked_by: row.locked_by,
            lease_expires_at: row.lease_expires_at,
            created_at: row.created_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(Debug, TypedBuilder)]
pub struct InsertJob<'a> {
    user_id: Option<Uuid>,
    request_type: &'a str,
    input_data: &'a serde_json::Value,
    max_attempts: i32,
}

impl<'a> InsertJob<'a> {
    pub const QUERY: &'static str = concat!(
        "INSERT INTO kairan_jobs (user_id, request_type, input_data, max_attempts) \
         VALUES ($1, $2, $3, $4) \
         RETURNING ",
        job_columns!()
    );

    pub fn query_as(self) -> QueryAs<'a, Postgres, JobRow, PgArguments> {
        sqlx::query_as(Self::QUERY)
            .bind(self.user_id)
            .bind(self.request_type)
            .bind(self.input_data)
            .bind(self.max_attempts)
    }
}

/// Serialize creators of the same `(user, request type, key)` until commit.
#[derive(Debug, TypedBuilder)]
pub struct AcquireIdempotencyLock<'a> {
    lock_key: &'a str,
}

impl<'a> AcquireIdempotencyLock<'a> {
    pub const QUERY: &'static str = "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))";

    pub fn query(self) -> Query<'a, Postgres, PgArguments> {
        sqlx::query(Self::QUERY).bind(self.lock_key)
    }
}

#[derive(Debug, TypedBuilder)]
pub struct FindByIdempotencyKey<'a> {
    user_id: Option<Uuid>,
    request_type: &'a str,
    key: &'a str,
    statuses: Vec<PgJobStatus>,
}

impl<'a> FindByIdempotencyKey<'a> {
    pub const QUERY: &'static str = concat!(
        "SELECT ",
        job_columns!(),
        " FROM kairan_jobs \
         WHERE user_id IS NOT DISTINCT FROM $1 \
           AND request_type = $2 \
           AND input_data ->> 'idempotencyKey' = $3 \
           AND status = ANY($4) \
         ORDER BY created_at DESC \
         LIMIT 1"
    );

    pub fn query_as(self) -> QueryAs<'a, Postgres, JobRow, PgArguments> {
        sqlx::query_as(Self::QUERY)
            .bind(self.user_id)
            .bind(self.request_type)
            .bind(self.key)
            .bind(self.statuses)
    }
}

/// Take the oldest claimable job. `SKIP LOCKED` lets concurrent claimants
/// move past a row another transaction is about to take.
#[derive(Debug, TypedBuilder)]
pub struct ClaimNextJob<'a> {
    worker_id: &'a str,
    lease: PgInterval,
    request_types: Vec<&'static str>,
}

impl<'a> ClaimNextJob<'a> {
    pub const QUERY: &'static str = concat!(
        "UPDATE kairan_jobs \
         SET status = 'processing', \
             attempts = attempts + 1, \
             locked_by = $1, \
             locked_at = now(), \
             lease_expires_at = now() + $2, \
             error_message = NULL \
         WHERE id = ( \
             SELECT id FROM kairan_jobs \
             WHERE attempts < max_attempts \
               AND request_type = ANY($3) \
               AND (status = 'pending' \
                    OR (status = 'processing' AND lease_expires_at < now())) \
             ORDER BY created_at, id \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED \
         ) \
         RETURNING ",
        job_columns!()
    );

    pub fn query_as(self) -> QueryAs<'a, Postgres, JobRow, PgArguments> {
        sqlx::query_as(Self::QUERY)
            .bind(self.worker_id)
            .bind(self.lease)
            .bind(self.request_types)
    }
}

#[derive(Debug, TypedBuilder)]
pub struct ExtendLease<'a> {
    id: Uuid,
    worker_id: &'a str,
    lease: PgInterval,
}

impl<'a> ExtendLease<'a> {
    pub const QUERY: &'static str = "UPDATE kairan_jobs \
         SET lease_expires_at = now() + $3 \
         WHERE id = $1 AND status = 'processing' AND locked_by = $2";

    pub fn query(self) -> Query<'a, Postgres, PgArguments> {
        sqlx::query(Self::QUERY)
            .bind(self.id)
            .bind(self.worker_id)
            .bind(self.lease)
    }
}

#[derive(Debug, TypedBuilder)]
pub struct CompleteJob<'a> {
    id: Uuid,
    worker_id: &'a str,
    result: &'a serde_json::Value,
}

impl<'a> CompleteJob<'a> {
    pub const QUERY: &'static str = concat!(
        "UPDATE kairan_jobs \
         SET status = 'completed', \
             result = $3, \
             processed_at = now(), \
             locked_by = NULL, \
             locked_at = NULL, \
             lease_expires_at = NULL \
         WHERE id = $1 AND status = 'processing' AND locked_by = $2 \
         RETURNING ",
        job_columns!()
    );

    pub fn query_as(self) -> QueryAs<'a, Postgres, JobRow, PgArguments> {
        sqlx::query_as(Self::QUERY)
            .bind(self.id)
            .bind(self.worker_id)
            .bind(self.result)
    }
}

#[derive(Debug, TypedBuilder)]
pub struct FailJob<'a> {
    id: Uuid,
    worker_id: &'a str,
    error_message: &'a str,
    result: Option<&'a serde_json::Value>,
}

impl<'a> FailJob<'a> {
    pub const QUERY: &'static str = concat!(
        "UPDATE kairan_jobs \
         SET status = 'failed', \
             error_message = $3, \
             result = $4, \
             processed_at = now(), \
             locked_by = NULL, \
             locked_at = NULL, \
             lease_expires_at = NULL \
         WHERE id = $1 AND status = 'processing' AND locked_by = $2 \
         RETURNING ",
        job_columns!()
    );

    pub fn query_as(self) -> QueryAs<'a, Postgres, JobRow, PgArguments> {
        sqlx::query_as(Self::QUERY)
            .bind(self.id)
            .bind(self.worker_id)
            .bind(self.error_message)
            .bind(self.result)
    }
}

#[derive(Debug, TypedBuilder)]
pub struct ResetToPending {
    id: Uuid,
}

impl ResetToPending {
    pub const QUERY: &'static str = concat!(
        "UPDATE kairan_jobs \
         SET status = 'pending', \
             error_message = NULL, \
             processed_at = NULL, \
             locked_by = NULL, \
             locked_at = NULL, \
             lease_expires_at = NULL \
         WHERE id = $1 AND status = 'failed' \
         RETURNING ",
        job_columns!()
    );

    pub fn query_as(self) -> QueryAs<'static, Postgres, JobRow, PgArguments> {
        sqlx::query_as(Self::QUERY).bind(self.id)
    }
}

#[derive(Debug, TypedBuilder)]
pub struct CancelJob<'a> {
    id: Uuid,
    message: &'a str,
}

impl<'a> CancelJob<'a> {
    pub const QUERY: &'static str = concat!(
        "UPDATE kairan_jobs \
         SET status = 'cancelled', \
             error_message = $2, \
             processed_at = now() \
         WHERE id = $1 AND status = 'pending' \
         RETURNING ",
        job_columns!()
    );

    pub fn query_as(self) -> QueryAs<'a, Postgres, JobRow, PgArguments> {
        sqlx::query_as(Self::QUERY).bind(self.id).bind(self.message)
    }
}

#[derive(Debug, TypedBuilder)]
pub struct GetJob {
    id: Uuid,
}

impl GetJob {
    pub const QUERY: &'static str =
        concat!("SELECT ", job_columns!(), " FROM kairan_jobs WHERE id = $1");

    pub fn query_as(self) -> QueryAs<'static, Postgres, JobRow, PgArguments> {
        sqlx::query_as(Self::QUERY).bind(self.id)
    }
}

/// Filtered, sorted, offset-paginated listing. Built dynamically because
/// every filter is optional.
#[derive(Debug, TypedBuilder)]
pub struct ListJobs<'a> {
    options: &'a ListJobsOptions,
}

impl ListJobs<'_> {
    pub fn count(&self) -> QueryBuilder<'static, Postgres> {
        let mut builder = QueryBuilder::new("SELECT count(*) FROM kairan_jobs");
        push_filter(&mut builder, &self.options.filter);
        builder
    }

    pub fn page(&self) -> QueryBuilder<'static, Postgres> {
        let mut builder = QueryBuilder::new(concat!("SELECT ", job_columns!(), " FROM kairan_jobs"));
        push_filter(&mut builder, &self.options.filter);

        let column = match self.options.sort {
            SortField::CreatedAt => "created_at",
            SortField::ProcessedAt => "processed_at",
            SortField::Attempts => "attempts",
        };
        // NULLs sort as the smallest value in both directions.
        let direction = match self.options.order {
            SortOrder::Asc => "ASC NULLS FIRST",
            SortOrder::Desc => "DESC NULLS LAST",
        };
        let id_direction = match self.options.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        builder
            .push(" ORDER BY ")
            .push(column)
            .push(" ")
            .push(direction)
            .push(", id ")
            .push(id_direction);

        builder
            .push(" LIMIT ")
            .push_bind(i64::from(self.options.page_size()))
            .push(" OFFSET ")
            .push_bind(i64::try_from(self.options.offset()).unwrap_or(i64::MAX));
        builder
    }
}

fn push_filter(builder: &mut QueryBuilder<'static, Postgres>, filter: &JobFilter) {
    builder.push(" WHERE TRUE");
    if let Some(status) = filter.status {
        builder
            .push(" AND status = ")
            .push_bind(PgJobStatus::from(status));
    }
    if let Some(request_type) = filter.request_type {
        builder
            .push(" AND request_type = ")
            .push_bind(request_type.as_str());
    }
    if let Some(user_id) = filter.user_id {
        builder.push(" AND user_id = ").push_bind(user_id);
    }
}

pub struct AggregateStats;

impl AggregateStats {
    pub const QUERY: &'static str =
        "SELECT status, count(*) FROM kairan_jobs GROUP BY status";

    pub fn query_as() -> QueryAs<'static, Postgres, (PgJobStatus, i64), PgArguments> {
        sqlx::query_as(Self::QUERY)
    }
}

/// Park exhausted jobs nobody will ever claim again.
#[derive(Debug, TypedBuilder)]
pub struct DeadLetterExhausted<'a> {
    default_message: &'a str,
}

impl<'a> DeadLetterExhausted<'a> {
    pub const QUERY: &'static str = concat!(
        "UPDATE kairan_jobs \
         SET status = 'dead_letter', \
             error_message = COALESCE(error_message, $1), \
             processed_at = COALESCE(processed_at, now()), \
             locked_by = NULL, \
             locked_at = NULL, \
             lease_expires_at = NULL \
         WHERE attempts >= max_attempts \
           AND (status IN ('pending', 'failed') \
                OR (status = 'processing' AND lease_expires_at < now())) \
         RETURNING ",
        job_columns!()
    );

    pub fn query_as(self) -> QueryAs<'a, Postgres, JobRow, PgArguments> {
        sqlx::query_as(Self::QUERY).bind(self.default_message)
    }
}

#[derive(Debug, TypedBuilder)]
pub struct PurgeTerminal {
    before: DateTime<Utc>,
}

impl PurgeTerminal {
    pub const QUERY: &'static str = "DELETE FROM kairan_jobs \
         WHERE status IN ('completed', 'cancelled', 'dead_letter') \
           AND processed_at < $1";

    pub fn query(self) -> Query<'static, Postgres, PgArguments> {
        sqlx::query(Self::QUERY).bind(self.before)
    }
}

#[derive(Debug, TypedBuilder)]
pub struct AddJobNotify<'a> {
    channel_name: &'a str,
    payload: &'a str,
}

impl<'a> AddJobNotify<'a> {
    pub const QUERY: &'static str = "SELECT pg_notify($1, $2)";

    pub fn query(self) -> Query<'a, Postgres, PgArguments> {
        sqlx::query(Self::QUERY)
            .bind(self.channel_name)
            .bind(self.payload)
    }
}
