//! Suspendable streaming response body.
//!
//! [`ByteQueueBody`] implements `hyper::body::Body` over a shared byte
//! queue. The producing side ([`BodyWriter`]) pushes bytes as they arrive
//! from upstream; the consuming side is hyper polling the response. When the
//! queue is empty and the transfer is still in flight the poll parks
//! (the response is suspended); a subsequent push wakes it. Aborting
//! surfaces an error frame which tears the connection down.
//!
//! The writer can also wait for the consumer to drain the queue below a
//! watermark, which is how the file server paces its upstream windows.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::task::AtomicWaker;
use hyper::body::{Body, Frame, SizeHint};
use tokio::sync::Notify;

/// Largest frame handed to hyper in one poll.
const MAX_FRAME: usize = 64 * 1024;

#[derive(Default)]
struct QueueState {
    chunks: std::collections::VecDeque<Bytes>,
    buffered: usize,
    finished: bool,
    aborted: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    /// Wakes the hyper poll when data, completion or abort arrives.
    waker: AtomicWaker,
    /// Signalled every time the consumer takes data off the queue.
    drained: Notify,
    /// Set when the body has been dropped (client went away).
    closed: AtomicBool,
}

/// Producer half: feeds bytes into the response.
#[derive(Clone)]
pub struct BodyWriter {
    shared: Arc<Shared>,
}

impl BodyWriter {
    /// Appends bytes to the queue. Returns `false` when the client has
    /// disconnected and producing further data is pointless.
    pub fn push(&self, data: Bytes) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut state = self.shared.state.lock().unwrap();
            state.buffered += data.len();
            state.chunks.push_back(data);
        }
        self.shared.waker.wake();
        true
    }

    /// Marks the stream complete; the body ends once the queue drains.
    pub fn finish(&self) {
        self.shared.state.lock().unwrap().finished = true;
        self.shared.waker.wake();
    }

    /// Aborts the response; the client observes a broken transfer.
    pub fn abort(&self) {
        self.shared.state.lock().unwrap().aborted = true;
        self.shared.waker.wake();
    }

    /// Bytes queued but not yet taken by the consumer.
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().unwrap().buffered
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Waits until the consumer drains the queue below `watermark` bytes,
    /// or the client disconnects.
    pub async fn drained_below(&self, watermark: usize) {
        loop {
            if self.buffered() < watermark || self.is_closed() {
                return;
            }
            self.shared.drained.notified().await;
        }
    }
}

/// The hyper-facing body half.
pub struct ByteQueueBody {
    shared: Arc<Shared>,
    /// Exact content length when known, reported through `size_hint`.
    length: Option<u64>,
}

impl ByteQueueBody {
    /// Creates a connected `(body, writer)` pair.
    pub fn channel(length: Option<u64>) -> (ByteQueueBody, BodyWriter) {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            waker: AtomicWaker::new(),
            drained: Notify::new(),
            closed: AtomicBool::new(false),
        });
        (
            ByteQueueBody {
                shared: Arc::clone(&shared),
                length,
            },
            BodyWriter { shared },
        )
    }
}

impl Drop for ByteQueueBody {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        // Unpark a writer waiting on the watermark.
        self.shared.drained.notify_waiters();
    }
}

impl Body for ByteQueueBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut state = self.shared.state.lock().unwrap();
        if state.aborted {
            return Poll::Ready(Some(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "stream aborted",
            ))));
        }
        if !state.chunks.is_empty() {
            let data = if state.chunks[0].len() > MAX_FRAME {
                state.chunks[0].split_to(MAX_FRAME)
            } else {
                state.chunks.pop_front().unwrap()
            };
            state.buffered -= data.len();
            drop(state);
            self.shared.drained.notify_waiters();
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }
        if state.finished {
            return Poll::Ready(None);
        }
        // Suspended until the writer pushes, finishes or aborts.
        self.shared.waker.register(cx.waker());
        Poll::Pending
    }

    fn size_hint(&self) -> SizeHint {
        match self.length {
            Some(len) => SizeHint::with_exact(len),
            None => SizeHint::default(),
        }
    }
}
