//! `LISTEN`-based wake-ups for workers.
//!
//! Every insert and manual reset sends a `NOTIFY` on
//! [`NOTIFY_CHANNEL_NAME`](crate::NOTIFY_CHANNEL_NAME). A [`Listener`] owns
//! one connection and fans notifications out to [`Subscribe`] streams, which
//! a worker merges into its tick stream so it polls right away instead of
//! waiting for the next interval. Notifications are hints: polling alone is
//! still correct when one is lost.
use futures::{FutureExt as _, Stream, StreamExt as _, TryStreamExt as _};
use kairan_core::{
    JobHandler, JobId, RequestType, Worker,
    backend::BackEndPoller,
    utils::{Throttle, Ticker},
    worker::{JobSpawner, TickStream},
};
use pin_project_lite::pin_project;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Payload of a new-job notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelData {
    pub job_id: JobId,
    pub request_type: RequestType,
}

#[derive(Debug)]
pub struct Listener {
    inner: sqlx::postgres::PgListener,
    publishers: Vec<Publisher>,
}

impl Listener {
    pub async fn connect(pool: &sqlx::PgPool) -> Result<Self, Error> {
        let mut listener = sqlx::postgres::PgListener::connect_with(pool).await?;
        listener.listen(crate::NOTIFY_CHANNEL_NAME).await?;

        Ok(Self {
            inner: listener,
            publishers: Vec::new(),
        })
    }

    /// Forward notifications until `signal` resolves or the connection
    /// stream ends.
    pub async fn listen_until<Signal>(self, signal: Signal) -> Result<(), Error>
    where
        Signal: std::future::Future,
    {
        let mut stream = self.inner.into_stream().fuse();
        let mut publishers = self.publishers;
        let signal = signal.fuse();
        futures::pin_mut!(signal);

        loop {
            futures::select! {
                _ = &mut signal => {
                    break;
                }
                msg = stream.try_next() => {
                    match msg {
                        Ok(Some(notification)) => {
                            let data = serde_json::from_str::<ChannelData>(notification.payload())
                                .inspect_err(|error| tracing::error!(error = %error, "Cannot deserialize job notify message"));
                            let Ok(data) = data else {
                                continue;
                            };
                            tracing::trace!(job_id = %data.job_id, request_type = %data.request_type, "job notification");
                            publish(&mut publishers, data.request_type);
                        }
                        Ok(None) => {
                            break;
                        }
                        Err(error) => {
                            tracing::error!(error = %error, "Error happen when receive message from channel");
                        }
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn listen(self) -> Result<(), Error> {
        self.listen_until(std::future::pending::<()>()).await
    }

    /// Wake on every new job.
    pub fn subscribe(&mut self) -> Subscribe {
        self.add_publisher(None)
    }

    /// Wake only for jobs of the given request types.
    pub fn subscribe_to<I>(&mut self, request_types: I) -> Subscribe
    where
        I: IntoIterator<Item = RequestType>,
    {
        self.add_publisher(Some(request_types.into_iter().collect()))
    }

    fn add_publisher(&mut self, request_types: Option<Vec<RequestType>>) -> Subscribe {
        // Zero buffer leaves the sender's single slot: a pending wake-up
        // already covers every job behind it.
        let (tx, rx) = futures::channel::mpsc::channel(0);
        self.publishers.push(Publisher {
            request_types,
            sender: tx,
        });
        Subscribe { receiver: rx }
    }
}

fn publish(publishers: &mut Vec<Publisher>, request_type: RequestType) {
    publishers.retain_mut(|publisher| {
        if !publisher.wants(request_type) {
            return true;
        }
        match publisher.sender.try_send(()) {
            Ok(()) => true,
            Err(error) if error.is_full() => true,
            Err(_) => {
                tracing::debug!("subscriber dropped; removing it");
                false
            }
        }
    });
}

#[derive(Debug)]
struct Publisher {
    request_types: Option<Vec<RequestType>>,
    sender: futures::channel::mpsc::Sender<()>,
}

impl Publisher {
    fn wants(&self, request_type: RequestType) -> bool {
        self.request_types
            .as_ref()
            .is_none_or(|types| types.contains(&request_type))
    }
}

pin_project! {
    #[derive(Debug)]
    pub struct Subscribe {
        #[pin]
        receiver: futures::channel::mpsc::Receiver<()>,
    }
}

impl Stream for Subscribe {
    type Item = ();
    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.project();
        this.receiver.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.receiver.size_hint()
    }
}

type ThrottleTick<Tick> = Throttle<futures::stream::Select<Tick, Subscribe>, Ticker>;

/// Merge listener wake-ups into a worker's tick stream.
pub trait WorkerWithListenerExt<Tick, Poller, F, M, Sp>
where
    Tick: TickStream,
    F: JobHandler<M>,
    F::Context: Clone,
    M: 'static,
    Poller: BackEndPoller<Data = F::Data> + 'static,
    Sp: JobSpawner,
{
    fn subscribe(
        self,
        listener: &mut Listener,
    ) -> Worker<futures::stream::Select<Tick, Subscribe>, Poller, F, M, Sp>;

    /// Like [`subscribe`](Self::subscribe) but pass at most `count` wake-ups
    /// per `duration`, so a burst of inserts does not turn into a burst of
    /// claim queries.
    fn subscribe_with_throttle(
        self,
        listener: &mut Listener,
        duration: std::time::Duration,
        count: usize,
    ) -> Worker<ThrottleTick<Tick>, Poller, F, M, Sp>;
}

impl<Tick, Poller, F, M, Sp> WorkerWithListenerExt<Tick, Poller, F, M, Sp>
    for Worker<Tick, Poller, F, M, Sp>
where
    Tick: TickStream,
    F: JobHandler<M>,
    F::Context: Clone,
    M: 'static,
    Poller: BackEndPoller<Data = F::Data> + 'static,
    Sp: JobSpawner,
{
    fn subscribe(
        self,
        listener: &mut Listener,
    ) -> Worker<futures::stream::Select<Tick, Subscribe>, Poller, F, M, Sp> {
        let subscribe = listener.subscribe();
        self.modify_stream(|tick| futures::stream::select(tick, subscribe))
    }

    fn subscribe_with_throttle(
        self,
        listener: &mut Listener,
        duration: std::time::Duration,
        count: usize,
    ) -> Worker<ThrottleTick<Tick>, Poller, F, M, Sp> {
        let subscribe = listener.subscribe();
        self.modify_stream(|tick| {
            let st = futures::stream::select(tick, subscribe);
            Throttle::new(st, duration, count)
        })
    }
}
