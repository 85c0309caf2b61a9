//! Worker-facing traits: claim jobs, keep leases alive, persist outcomes.
//!
//! The worker drives; the backend stores.
//! - The backend owns lease cadence (it knows the lease it asked for).
//! - Finalization methods consume the context, so a claimed job is
//!   resolved at most once by construction.
//! - Polling yields per-job results so one bad row does not block others.
//! - Errors convert into [`crate::Error`] so the worker can tell a lost lease
//!   or an undecodable payload apart from an unreachable store.
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};

use crate::job::{JobId, RequestType, UserId};
use crate::store::JobStore;
use crate::utils::Ticker;
use crate::{Error, JobFailure};

mod tmp {
    use crate::JobFailure;
    use crate::job::JobId;

    /// What the lease keeper tells the worker while a handler runs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub enum Heartbeat {
        /// Stop renewing but let the handler finish.
        Continue,
        /// Ownership is gone. Drop the handler without finalizing.
        Stop,
    }

    /// Per-job authority to renew the lease and record the outcome.
    #[trait_variant::make(BackEndContext: Send)]
    pub trait LocalBackEndContext {
        type Error: std::error::Error + Into<crate::Error> + Send;

        /// Renew the lease until ownership is lost. Runs for as long as
        /// the handler does; the worker drops it when the handler ends.
        async fn heartbeat(&mut self) -> Heartbeat;
        /// Fails with [`ErrorKind::LostLease`](crate::ErrorKind::LostLease)
        /// when another worker owns the job by now.
        async fn complete(self, result: serde_json::Value) -> Result<(), Self::Error>;
        async fn fail(self, failure: JobFailure) -> Result<(), Self::Error>;
    }

    /// A claimed job: decoded payload plus the context that owns it.
    pub struct ClaimedJob<Data, Context> {
        id: JobId,
        data: Data,
        context: Context,
    }

    impl<Data, Context> ClaimedJob<Data, Context> {
        pub fn from_parts(id: JobId, data: Data, context: Context) -> Self {
            Self { id, data, context }
        }

        pub fn id(&self) -> JobId {
            self.id
        }

        /// Separate payload and context for handler and bookkeeping.
        pub fn split_parts(self) -> (Data, Context) {
            (self.data, self.context)
        }
    }

    #[trait_variant::make(BackEndPoller: Send)]
    pub trait LocalBackEndPoller {
        type Error: std::error::Error + Into<crate::Error> + Send;
        type Data: Send + 'static;
        type Context: BackEndContext + Send + 'static;

        /// Claim up to `batch_size` jobs. Fewer (or none) is normal.
        async fn poll_job(
            &mut self,
            batch_size: usize,
        ) -> Vec<Result<ClaimedJob<Self::Data, Self::Context>, Self::Error>>;
    }
}

pub use tmp::{BackEndContext, BackEndPoller, ClaimedJob, Heartbeat};

/// What a handler receives: job metadata plus the decoded `input_data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task<T> {
    pub id: JobId,
    pub request_type: RequestType,
    pub user_id: Option<UserId>,
    /// 1-based; equals the job's `attempts` after this claim.
    pub attempt: i32,
    pub max_attempts: i32,
    pub input: T,
}

/// Adapts any [`JobStore`] into a [`BackEndPoller`] for one worker identity.
///
/// The backend only claims jobs of the request types it was built for, so
/// a worker whose handler reads one payload shape never touches jobs meant
/// for another.
pub struct StoreBackEnd<S, T> {
    store: S,
    worker_id: Arc<str>,
    request_types: Arc<[RequestType]>,
    lease: std::time::Duration,
    marker: std::marker::PhantomData<fn() -> T>,
}

impl<S: Clone, T> Clone for StoreBackEnd<S, T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            worker_id: self.worker_id.clone(),
            request_types: self.request_types.clone(),
            lease: self.lease,
            marker: std::marker::PhantomData,
        }
    }
}

impl<S: std::fmt::Debug, T> std::fmt::Debug for StoreBackEnd<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreBackEnd")
            .field("store", &self.store)
            .field("worker_id", &self.worker_id)
            .field("request_types", &self.request_types)
            .field("lease", &self.lease)
            .finish()
    }
}

impl<S, T> StoreBackEnd<S, T> {
    pub const DEFAULT_LEASE: std::time::Duration = std::time::Duration::from_secs(30);

    /// Claim jobs of `request_types` from `store` as `worker_id`.
    pub fn new<I>(store: S, worker_id: impl Into<Arc<str>>, request_types: I) -> Self
    where
        I: IntoIterator<Item = RequestType>,
    {
        let mut request_types: Vec<_> = request_types.into_iter().collect();
        request_types.sort_unstable();
        request_types.dedup();
        if request_types.is_empty() {
            tracing::warn!("backend built without request types; it will never claim a job");
        }
        Self {
            store,
            worker_id: worker_id.into(),
            request_types: request_types.into(),
            lease: Self::DEFAULT_LEASE,
            marker: std::marker::PhantomData,
        }
    }

    /// Lease requested on every claim and renewal. Must be non-zero.
    pub fn lease(self, lease: std::time::Duration) -> Result<Self, Error> {
        if lease.is_zero() {
            return Err(Error::invalid_input("lease must be longer than zero"));
        }
        Ok(Self { lease, ..self })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn request_types(&self) -> &[RequestType] {
        &self.request_types
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S, T> BackEndPoller for StoreBackEnd<S, T>
where
    S: JobStore + Clone + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
{
    type Error = S::Error;
    type Data = Task<T>;
    type Context = StoreContext<S>;

    async fn poll_job(
        &mut self,
        batch_size: usize,
    ) -> Vec<Result<ClaimedJob<Self::Data, Self::Context>, Self::Error>> {
        let mut claimed = Vec::with_capacity(batch_size);
        // One atomic claim per slot keeps FIFO and avoids locking a batch.
        for _ in 0..batch_size {
            let job = match self
                .store
                .claim_next(&self.worker_id, self.lease, &self.request_types)
                .await
            {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(error) => {
                    claimed.push(Err(error));
                    break;
                }
            };

            // The request type matched, so a payload that does not decode is
            // malformed and would fail on every attempt.
            let input = match serde_json::from_value::<T>(job.input_data) {
                Ok(input) => input,
                Err(error) => {
                    let message = format!("cannot decode input for {}: {error}", job.request_type);
                    let _ = self
                        .store
                        .fail(job.id, &self.worker_id, &message, None)
                        .await
                        .inspect_err(|error| {
                            tracing::error!(error = %error, job_id = %job.id, "Failed to fail undecodable job")
                        });
                    claimed.push(Err(S::Error::from(Error::decode(error))));
                    continue;
                }
            };

            let task = Task {
                id: job.id,
                request_type: job.request_type,
                user_id: job.user_id,
                attempt: job.attempts,
                max_attempts: job.max_attempts,
                input,
            };
            let context = StoreContext {
                job_id: job.id,
                store: self.store.clone(),
                worker_id: self.worker_id.clone(),
                lease: self.lease,
            };
            claimed.push(Ok(ClaimedJob::from_parts(job.id, task, context)));
        }
        claimed
    }
}

/// Lease and outcome authority over one claimed job.
#[derive(Debug)]
pub struct StoreContext<S> {
    job_id: JobId,
    store: S,
    worker_id: Arc<str>,
    lease: std::time::Duration,
}

impl<S> StoreContext<S> {
    /// Shortest renewal period, for leases too short to split in three.
    pub const MIN_RENEW_PERIOD: std::time::Duration = std::time::Duration::from_millis(1);

    /// Renewal period: a third of the lease.
    pub fn renew_every(&self) -> std::time::Duration {
        (self.lease / 3).max(Self::MIN_RENEW_PERIOD)
    }
}

impl<S> BackEndContext for StoreContext<S>
where
    S: JobStore + Send + Sync + 'static,
{
    type Error = S::Error;

    async fn heartbeat(&mut self) -> Heartbeat {
        use futures::StreamExt as _;

        let mut ticker = Ticker::new(self.renew_every());
        while ticker.next().await.is_some() {
            match self
                .store
                .extend_lease(self.job_id, &self.worker_id, self.lease)
                .await
            {
                Ok(true) => tracing::trace!(job_id = %self.job_id, "extended lease"),
                Ok(false) => {
                    tracing::warn!(job_id = %self.job_id, worker_id = %self.worker_id, "lease lost; abandoning job");
                    return Heartbeat::Stop;
                }
                // The lease may still hold; try again next period.
                Err(error) => {
                    tracing::warn!(error = %error, job_id = %self.job_id, "Failed to extend lease");
                }
            }
        }
        Heartbeat::Continue
    }

    async fn complete(self, result: serde_json::Value) -> Result<(), Self::Error> {
        match self.store.complete(self.job_id, &self.worker_id, result).await? {
            Some(_) => Ok(()),
            None => Err(Error::lost_lease(self.job_id).into()),
        }
    }

    async fn fail(self, failure: JobFailure) -> Result<(), Self::Error> {
        let JobFailure { message, result } = failure;
        match self
            .store
            .fail(self.job_id, &self.worker_id, &message, result)
            .await?
        {
            Some(_) => Ok(()),
            None => Err(Error::lost_lease(self.job_id).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, MemoryStore};

    #[test]
    fn zero_lease_is_rejected() {
        let backend = StoreBackEnd::<_, serde_json::Value>::new(
            MemoryStore::new(),
            "worker-a",
            [RequestType::PageDraft],
        );
        let error = backend.lease(std::time::Duration::ZERO).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn request_types_are_deduplicated() {
        let backend = StoreBackEnd::<_, serde_json::Value>::new(
            MemoryStore::new(),
            "worker-a",
            [
                RequestType::PageDraft,
                RequestType::ContentSummary,
                RequestType::PageDraft,
            ],
        );
        assert_eq!(
            backend.request_types(),
            &[RequestType::ContentSummary, RequestType::PageDraft]
        );
    }

    #[test]
    fn renewal_runs_three_times_per_lease() {
        let context = StoreContext {
            job_id: JobId::new_v4(),
            store: MemoryStore::new(),
            worker_id: Arc::from("worker-a"),
            lease: std::time::Duration::from_secs(30),
        };
        assert_eq!(context.renew_every(), std::time::Duration::from_secs(10));

        let tiny = StoreContext {
            lease: std::time::Duration::from_nanos(2),
            ..context
        };
        assert_eq!(tiny.renew_every(), StoreContext::<MemoryStore>::MIN_RENEW_PERIOD);
    }
}
