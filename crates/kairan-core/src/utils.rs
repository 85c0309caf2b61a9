//! Time-driven streams used by the worker.
//!
//! `Ticker` wakes the poll loop and the lease keeper. `Throttle` caps how
//! many wake-ups pass per window and drops the rest; a dropped wake-up costs
//! nothing because the next tick polls the queue anyway.
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use pin_project_lite::pin_project;

pin_project! {
    /// Yields `()` once per period, forever.
    ///
    /// The delay is re-armed when it fires, not when the consumer gets
    /// around to polling, so a stalled consumer sees one tick, not a burst.
    pub struct Ticker {
        #[pin]
        delay: futures_timer::Delay,
        period: std::time::Duration,
    }
}

impl Ticker {
    pub fn new(period: std::time::Duration) -> Self {
        Self {
            delay: futures_timer::Delay::new(period),
            period,
        }
    }

    pub fn period(&self) -> std::time::Duration {
        self.period
    }
}

impl Stream for Ticker {
    type Item = ();

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        std::task::ready!(this.delay.as_mut().poll(cx));
        this.delay.reset(*this.period);
        Poll::Ready(Some(()))
    }
}

pin_project! {
    /// Forward at most `limit` items between two ticks of `window`.
    pub struct Throttle<St, Tick> {
        #[pin]
        inner: St,
        #[pin]
        window: Tick,
        limit: usize,
        passed: usize,
    }
}

impl<St> Throttle<St, Ticker> {
    pub fn new(stream: St, window: std::time::Duration, limit: usize) -> Self {
        Throttle::with_window(stream, Ticker::new(window), limit)
    }
}

impl<St, Tick> Throttle<St, Tick> {
    /// Use `window` as the stream that opens each new window.
    pub fn with_window(stream: St, window: Tick, limit: usize) -> Self {
        Throttle {
            inner: stream,
            window,
            limit,
            passed: 0,
        }
    }
}

impl<St, Tick> Stream for Throttle<St, Tick>
where
    St: Stream,
    Tick: Stream,
{
    type Item = St::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        // Polling the window registers the waker, so a throttled consumer is
        // woken when the next window opens.
        match this.window.as_mut().poll_next(cx) {
            Poll::Ready(Some(_)) => *this.passed = 0,
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => {}
        }

        loop {
            match std::task::ready!(this.inner.as_mut().poll_next(cx)) {
                Some(item) if *this.passed < *this.limit => {
                    *this.passed += 1;
                    return Poll::Ready(Some(item));
                }
                // Over the limit: drop and keep draining so the inner waker
                // stays registered.
                Some(_) => continue,
                None => return Poll::Ready(None),
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.inner.size_hint().1)
    }
}

pub trait ThrottleExt: Stream {
    /// Forward at most `limit` items per `window`; drop the excess.
    fn throttle(self, window: std::time::Duration, limit: usize) -> Throttle<Self, Ticker>
    where
        Self: Sized,
    {
        Throttle::new(self, window, limit)
    }
}

impl<St: Stream> ThrottleExt for St {}
