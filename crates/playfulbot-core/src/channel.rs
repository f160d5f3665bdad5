//! Ordered single-writer async channel with explicit completion and failure.
//!
//! Bridges push-style producers (stream callbacks, server handlers) into a
//! pull-style [`Stream`] of `Result<T, E>`: every pushed value is yielded in
//! push order, then the stream ends on [`ChannelWriter::complete`] or yields
//! one final `Err` on [`ChannelWriter::fail`]. Both consume the writer, so
//! nothing can be pushed after termination. Dropping the writer completes.

use std::future::poll_fn;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

enum Event<T, E> {
    Value(T),
    Failed(E),
}

/// Create a connected writer/reader pair.
pub fn async_channel<T, E>() -> (ChannelWriter<T, E>, ChannelReader<T, E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelWriter { tx }, ChannelReader { rx, done: false })
}

pub struct ChannelWriter<T, E> {
    tx: mpsc::UnboundedSender<Event<T, E>>,
}

impl<T, E> ChannelWriter<T, E> {
    /// Enqueue a value. Returns `false` if the reader is gone.
    pub fn push(&self, value: T) -> bool {
        self.tx.send(Event::Value(value)).is_ok()
    }

    /// Signal that no further values follow.
    pub fn complete(self) {}

    /// Terminate abnormally; the reader yields `error` after every pending value.
    pub fn fail(self, error: E) {
        let _ = self.tx.send(Event::Failed(error));
    }

    /// Whether the reader has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct ChannelReader<T, E> {
    rx: mpsc::UnboundedReceiver<Event<T, E>>,
    done: bool,
}

impl<T, E> ChannelReader<T, E> {
    /// Wait for the next value; `None` once the channel completed or failed.
    pub async fn recv(&mut self) -> Option<Result<T, E>> {
        poll_fn(|cx| self.poll_event(cx)).await
    }

    pub fn is_terminated(&self) -> bool {
        self.done
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<T, E>>> {
        if self.done {
            return Poll::Ready(None);
        }
        match ready!(self.rx.poll_recv(cx)) {
            Some(Event::Value(value)) => Poll::Ready(Some(Ok(value))),
            Some(Event::Failed(error)) => {
                self.done = true;
                self.rx.close();
                Poll::Ready(Some(Err(error)))
            }
            None => {
                self.done = true;
                Poll::Ready(None)
            }
        }
    }
}

impl<T, E> Stream for ChannelReader<T, E> {
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_event(cx)
    }
}
