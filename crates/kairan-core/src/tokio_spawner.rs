//! Run each claimed job as its own Tokio task.
//!
//! A panicking handler is logged and swallowed. Its job stays `processing`
//! until the lease runs out and another claim picks it up.
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;

use crate::worker::JobSpawner;

pub struct TokioSpawner;

pin_project! {
    /// Resolves when the task ends, whether it returned or panicked.
    pub struct TokioJoinHandle {
        #[pin]
        handle: tokio::task::JoinHandle<()>,
    }
}

impl Future for TokioJoinHandle {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Err(error) = std::task::ready!(this.handle.poll(cx)) {
            if error.is_panic() {
                tracing::error!(error = %error, "job handler panicked; job will be reclaimed after its lease expires");
            } else {
                tracing::warn!(error = %error, "job task was cancelled");
            }
        }
        Poll::Ready(())
    }
}

impl JobSpawner for TokioSpawner {
    type JobHandle<Fut>
        = TokioJoinHandle
    where
        Fut: Future<Output = ()> + Send + 'static;

    fn spawn<Fut>(fut: Fut) -> Self::JobHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        TokioJoinHandle {
            handle: tokio::spawn(fut),
        }
    }
}
