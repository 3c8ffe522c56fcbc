//! Request handles.
//!
//! Every user-visible operation produces a [`RequestHandle`]: a cancellable,
//! joinable view of one pending multi-step operation. Exactly one of
//! success, error or abort resolves the completion, exactly once, and it is
//! delivered through the event loop. Subrequests run under child
//! cancellation tokens, so cancelling a parent recursively cancels its
//! whole subtree.

use std::sync::{Arc, Condvar, Mutex};

use cirrus_core::{CloudError, CloudResult};
use tokio_util::sync::CancellationToken;

use crate::event_loop::EventLoop;

struct DoneSignal {
    done: Mutex<bool>,
    cond: Condvar,
}

impl DoneSignal {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.done.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.cond.wait(done).unwrap();
        }
    }

    fn is_done(&self) -> bool {
        *self.done.lock().unwrap()
    }
}

/// Handle to one pending operation.
///
/// Cloneable and safe to use from any thread. `cancel` is idempotent;
/// `wait` blocks until the completion callback has been handed to the event
/// loop, which is the ordered join point the finish worker relies on.
#[derive(Clone)]
pub struct RequestHandle {
    cancel: CancellationToken,
    done: Arc<DoneSignal>,
}

impl RequestHandle {
    /// Spawns `op` on the runtime, racing it against cancellation, and
    /// delivers its single completion to `callback` via the event loop.
    pub fn spawn<T, F>(
        runtime: &tokio::runtime::Handle,
        event_loop: &EventLoop,
        cancel: CancellationToken,
        op: F,
        callback: impl FnOnce(CloudResult<T>) + Send + 'static,
    ) -> RequestHandle
    where
        T: Send + 'static,
        F: std::future::Future<Output = CloudResult<T>> + Send + 'static,
    {
        let done = Arc::new(DoneSignal::new());
        let handle = RequestHandle {
            cancel: cancel.clone(),
            done: Arc::clone(&done),
        };
        let event_loop = event_loop.clone();
        runtime.spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(CloudError::aborted()),
                result = op => result,
            };
            // Single-shot by construction: this task runs once and the
            // callback is consumed here.
            event_loop.invoke(move || callback(result));
            done.signal();
        });
        handle
    }

    /// Requests cancellation. Safe from any thread, idempotent, and a no-op
    /// once the completion has fired.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Blocks the calling thread until the completion has been enqueued.
    pub fn wait(&self) {
        self.done.wait();
    }

    pub fn is_done(&self) -> bool {
        self.done.is_done()
    }

    /// The cancellation token driving this request, for wiring subrequests.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn run_loop_until_idle(event_loop: &EventLoop) {
        event_loop.process_events();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn completion_fires_exactly_once() {
        let event_loop = EventLoop::new();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_cb = Arc::clone(&fired);
        let handle = RequestHandle::spawn(
            &tokio::runtime::Handle::current(),
            &event_loop,
            CancellationToken::new(),
            async { Ok(41) },
            move |result: CloudResult<i32>| {
                assert_eq!(result.unwrap(), 41);
                fired_cb.fetch_add(1, Ordering::SeqCst);
            },
        );
        tokio::task::spawn_blocking(move || handle.wait())
            .await
            .unwrap();
        run_loop_until_idle(&event_loop);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_resolves_as_aborted() {
        let event_loop = EventLoop::new();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_cb = Arc::clone(&fired);
        let handle = RequestHandle::spawn(
            &tokio::runtime::Handle::current(),
            &event_loop,
            CancellationToken::new(),
            async {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok(())
            },
            move |result: CloudResult<()>| {
                assert!(result.unwrap_err().is_aborted());
                fired_cb.fetch_add(1, Ordering::SeqCst);
            },
        );
        handle.cancel();
        handle.cancel(); // idempotent
        let waiter = handle.clone();
        tokio::task::spawn_blocking(move || waiter.wait())
            .await
            .unwrap();
        run_loop_until_idle(&event_loop);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn child_tokens_cancel_with_parent() {
        let event_loop = EventLoop::new();
        let parent = CancellationToken::new();
        let child = parent.child_token();
        let handle = RequestHandle::spawn(
            &tokio::runtime::Handle::current(),
            &event_loop,
            child,
            async {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok(())
            },
            |result: CloudResult<()>| {
                assert!(result.unwrap_err().is_aborted());
            },
        );
        parent.cancel();
        let waiter = handle.clone();
        tokio::task::spawn_blocking(move || waiter.wait())
            .await
            .unwrap();
        run_loop_until_idle(&event_loop);
        assert!(handle.is_done());
    }
}
