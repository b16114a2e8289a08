//! Timing utilities for the worker poll loop.

use futures::Stream;
use pin_project_lite::pin_project;

pin_project! {
    /// Fixed-period stream that drives queue polling.
    ///
    /// The first poll yields immediately so a freshly started worker drains
    /// the queue without waiting out a full period; the timer is reset on
    /// every ready poll to reduce drift when the consumer stalls briefly.
    pub(crate) struct Ticker {
        #[pin]
        delay: futures_timer::Delay,
        period: std::time::Duration,
        primed: bool,
    }
}

impl Ticker {
    pub(crate) fn new(period: std::time::Duration) -> Self {
        Self {
            delay: futures_timer::Delay::new(period),
            period,
            primed: false,
        }
    }
}

impl Stream for Ticker {
    type Item = ();

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let mut this = self.project();
        if !*this.primed {
            *this.primed = true;
            this.delay.reset(*this.period);
            return std::task::Poll::Ready(Some(()));
        }

        let poll = this.delay.as_mut().poll(cx);
        if poll.is_ready() {
            this.delay.reset(*this.period);
        }
        poll.map(Some)
    }
}
