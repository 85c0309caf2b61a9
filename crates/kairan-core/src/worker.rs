//! Polling worker.
//!
//! On every tick the worker claims as many jobs as it has free slots and runs
//! each one next to its lease keeper. Whichever finishes first decides what
//! happens: the handler's [`JobResult`] is written back, or a lost lease drops
//! the handler with nothing written. Jobs run inline or on a runtime,
//! depending on the [`JobSpawner`].
use std::marker::PhantomData;

use futures::stream::FuturesUnordered;
use futures::{FutureExt as _, Stream, StreamExt as _};
use tracing::Instrument as _;

use crate::backend::{BackEndContext, BackEndPoller, ClaimedJob, Heartbeat};
use crate::utils::Ticker;
use crate::{Error, ErrorKind, JobHandler, JobResult};

/// How job futures are executed (inline, Tokio, etc.).
pub trait JobSpawner {
    type JobHandle<Fut>: Future<Output = ()> + Send + 'static
    where
        Fut: Future<Output = ()> + Send + 'static;
    fn spawn<Fut>(fut: Fut) -> Self::JobHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static;
}

/// Runs jobs on the worker's own task.
pub struct InlineSpawner;

impl JobSpawner for InlineSpawner {
    type JobHandle<Fut>
        = Fut
    where
        Fut: Future<Output = ()> + Send + 'static;
    fn spawn<Fut>(fut: Fut) -> Self::JobHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        fut
    }
}

/// Stream that wakes the worker to claim.
pub trait TickStream: Stream<Item = ()> + Send {}

impl<St> TickStream for St where St: Stream<Item = ()> + Send {}

/// A worker id unique to this process: `worker-<pid>-<random>`.
pub fn generate_worker_id() -> String {
    format!(
        "worker-{}-{}",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Claims jobs from `Poller` whenever `Tick` yields and runs them with `F`,
/// at most `slots` at a time. Stops claiming when the tick stream ends or
/// `Shutdown` resolves, then waits for running jobs.
pub struct Worker<Tick, Poller, F, M, Sp, Shutdown = std::future::Pending<()>>
where
    F: JobHandler<M>,
{
    tick: Tick,
    poller: Poller,
    runner: Runner<F, M>,
    slots: usize,
    shutdown: Shutdown,
    spawner: PhantomData<fn() -> Sp>,
}

impl<Tick, Poller, F, M, Sp, Shutdown> Worker<Tick, Poller, F, M, Sp, Shutdown>
where
    Tick: TickStream,
    F: JobHandler<M>,
    F::Context: Clone,
    M: 'static,
    Poller: BackEndPoller<Data = F::Data> + 'static,
    Sp: JobSpawner,
    Shutdown: Future<Output = ()> + Send,
{
    /// Replace the tick stream (merge in NOTIFY wake-ups, throttle, ...).
    pub fn modify_stream<ModFn, Tick2>(
        self,
        func: ModFn,
    ) -> Worker<Tick2, Poller, F, M, Sp, Shutdown>
    where
        ModFn: FnOnce(Tick) -> Tick2,
        Tick2: TickStream,
    {
        Worker {
            tick: func(self.tick),
            poller: self.poller,
            runner: self.runner,
            slots: self.slots,
            shutdown: self.shutdown,
            spawner: PhantomData,
        }
    }

    /// Stop claiming once `signal` resolves. Running jobs finish first.
    pub fn with_graceful_shutdown<Signal>(
        self,
        signal: Signal,
    ) -> Worker<Tick, Poller, F, M, Sp, Signal>
    where
        Signal: Future<Output = ()> + Send,
    {
        Worker {
            tick: self.tick,
            poller: self.poller,
            runner: self.runner,
            slots: self.slots,
            shutdown: signal,
            spawner: PhantomData,
        }
    }

    pub fn run(self) -> impl Future<Output = ()> + Send {
        self.drive()
    }

    async fn drive(self) {
        let Self {
            tick,
            mut poller,
            runner,
            slots,
            shutdown,
            spawner: _,
        } = self;
        let tick = tick.fuse();
        let shutdown = shutdown.fuse();
        futures::pin_mut!(tick, shutdown);
        let mut running = FuturesUnordered::new();

        loop {
            futures::select! {
                wake = tick.next() => {
                    if wake.is_none() {
                        tracing::debug!("tick stream ended");
                        break;
                    }
                    // Claim only what can start now; the rest stays
                    // available to other workers.
                    let free = slots.saturating_sub(running.len());
                    if free == 0 {
                        tracing::trace!(running = running.len(), "all slots busy");
                        continue;
                    }
                    for claimed in poller.poll_job(free).await {
                        match claimed {
                            Ok(job) => {
                                let span = tracing::info_span!("job", job_id = %job.id());
                                let run = runner.clone().run(job).instrument(span);
                                running.push(Sp::spawn(run));
                            }
                            Err(error) => report_claim_error(error.into()),
                        }
                    }
                },
                _ = running.next() => {},
                _ = shutdown => {
                    tracing::info!(running = running.len(), "shutdown requested; draining running jobs");
                    break;
                },
            }
        }

        while running.next().await.is_some() {}
    }
}

fn report_claim_error(error: Error) {
    match error.kind() {
        // The backend already recorded the job as failed.
        ErrorKind::Decode => {
            tracing::warn!(error = %error, "claimed job had undecodable input")
        }
        ErrorKind::InvalidInput => {
            tracing::error!(error = %error, "store rejected the claim request")
        }
        _ => tracing::error!(error = %error, "claim failed; retrying on the next tick"),
    }
}

/// Handler plus the shared context handed to every job.
struct Runner<F, M>
where
    F: JobHandler<M>,
{
    handler: F,
    context: F::Context,
    marker: PhantomData<fn() -> M>,
}

impl<F, M> Clone for Runner<F, M>
where
    F: JobHandler<M>,
    F::Context: Clone,
{
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            context: self.context.clone(),
            marker: PhantomData,
        }
    }
}

impl<F, M> Runner<F, M>
where
    F: JobHandler<M>,
{
    async fn run<Ctx>(self, job: ClaimedJob<F::Data, Ctx>)
    where
        Ctx: BackEndContext,
    {
        let (data, mut lease) = job.split_parts();
        let outcome = {
            let keeper = lease.heartbeat().fuse();
            let work = self.handler.call(data, self.context).fuse();
            futures::pin_mut!(keeper, work);
            futures::select! {
                result = work => Some(result),
                beat = keeper => match beat {
                    Heartbeat::Continue => Some(work.await),
                    Heartbeat::Stop => None,
                },
            }
        };

        // Another worker owns the job now; anything written would clobber it.
        let Some(result) = outcome else {
            tracing::warn!("lease lost while the handler ran; outcome dropped");
            return;
        };

        let recorded: Result<(), Error> = match result {
            JobResult::Complete(value) => lease.complete(value).await.map_err(Into::into),
            JobResult::Fail(failure) => {
                tracing::info!(reason = %failure.message, "handler reported failure");
                lease.fail(failure).await.map_err(Into::into)
            }
        };
        match recorded {
            Ok(()) => tracing::debug!("outcome recorded"),
            Err(error) if error.kind() == ErrorKind::LostLease => {
                tracing::warn!(error = %error, "outcome rejected; the job was reclaimed")
            }
            Err(error) => {
                tracing::error!(error = %error, "cannot record outcome; job returns once its lease expires")
            }
        }
    }
}

/// Typestate builder: `handler`, `context` and `job_spawner` each fill one
/// slot, and `build` is only available once handler and context agree.
pub struct WorkerBuilder<Tick = (), Handler = (), M = (), Ctx = (), Sp = InlineSpawner> {
    tick: Tick,
    slots: usize,
    handler: Handler,
    context: Ctx,
    marker: PhantomData<fn() -> (M, Sp)>,
}

impl WorkerBuilder {
    pub const DEFAULT_CONCURRENCY: usize = 4;

    /// Claim every `interval`.
    pub fn new(interval: std::time::Duration) -> WorkerBuilder<Ticker> {
        Self::new_with_tick(Ticker::new(interval))
    }

    /// Claim whenever `tick` yields.
    pub fn new_with_tick<Tick>(tick: Tick) -> WorkerBuilder<Tick> {
        WorkerBuilder::from_parts(tick, Self::DEFAULT_CONCURRENCY, (), ())
    }
}

impl<Tick, Handler, M, Ctx, Sp> WorkerBuilder<Tick, Handler, M, Ctx, Sp> {
    fn from_parts(tick: Tick, slots: usize, handler: Handler, context: Ctx) -> Self {
        Self {
            tick,
            slots,
            handler,
            context,
            marker: PhantomData,
        }
    }

    fn into_parts(self) -> (Tick, usize, Handler, Ctx) {
        (self.tick, self.slots, self.handler, self.context)
    }

    /// Most jobs one worker runs at once. Zero is raised to one.
    pub fn concurrent(self, slots: usize) -> Self {
        Self {
            slots: slots.max(1),
            ..self
        }
    }

    /// Choose how to spawn jobs (inline, Tokio, ...).
    pub fn job_spawner<Sp2>(self, _spawner: Sp2) -> WorkerBuilder<Tick, Handler, M, Ctx, Sp2>
    where
        Sp2: JobSpawner,
    {
        let (tick, slots, handler, context) = self.into_parts();
        WorkerBuilder::from_parts(tick, slots, handler, context)
    }
}

impl<Tick, Ctx, Sp> WorkerBuilder<Tick, (), (), Ctx, Sp> {
    pub fn handler<F, M>(self, handler: F) -> WorkerBuilder<Tick, F, M, Ctx, Sp>
    where
        F: JobHandler<M>,
    {
        let (tick, slots, (), context) = self.into_parts();
        WorkerBuilder::from_parts(tick, slots, handler, context)
    }
}

impl<Tick, Handler, M, Sp> WorkerBuilder<Tick, Handler, M, (), Sp> {
    /// Shared context cloned into every job.
    pub fn context<Ctx>(self, context: Ctx) -> WorkerBuilder<Tick, Handler, M, Ctx, Sp>
    where
        Ctx: Clone + Send,
    {
        let (tick, slots, handler, ()) = self.into_parts();
        WorkerBuilder::from_parts(tick, slots, handler, context)
    }
}

impl<Tick, Handler, M, Sp> WorkerBuilder<Tick, Handler, M, Handler::Context, Sp>
where
    Tick: TickStream,
    Handler: JobHandler<M>,
    Sp: JobSpawner,
{
    /// Attach the backend whose claimed data the handler reads.
    pub fn build<Poller>(self, poller: Poller) -> Worker<Tick, Poller, Handler, M, Sp>
    where
        Poller: BackEndPoller<Data = Handler::Data>,
    {
        let (tick, slots, handler, context) = self.into_parts();
        Worker {
            tick,
            poller,
            runner: Runner {
                handler,
                context,
                marker: PhantomData,
            },
            slots,
            shutdown: std::future::pending(),
            spawner: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_worker_ids_are_unique() {
        let a = generate_worker_id();
        let b = generate_worker_id();
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("worker-{}-", std::process::id())));
    }

    #[test]
    fn zero_concurrency_is_raised_to_one() {
        let builder = WorkerBuilder::new_with_tick(futures::stream::empty::<()>()).concurrent(0);
        assert_eq!(builder.slots, 1);
    }
}
