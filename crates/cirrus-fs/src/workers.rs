//! Background workers.
//!
//! Two dedicated threads per filesystem:
//! - the **finish worker** owns a FIFO of launched requests, drives each to
//!   completion and then drains the completion event queue, so user
//!   callbacks run here instead of on callers' threads;
//! - the **cancel worker** owns a FIFO of requests whose cancellation was
//!   requested from a thread where cancelling inline would be awkward
//!   (typically from inside a completion callback).
//!
//! Both exit when the filesystem stops running; whatever is still queued
//! for finishing at that point is cancelled instead, then joined, which
//! gives shutdown a deterministic order.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use cirrus_engine::{EventLoop, RequestHandle};
use tracing::debug;

struct QueueState {
    finish: VecDeque<RequestHandle>,
    cancelled: VecDeque<RequestHandle>,
    running: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    ready: Condvar,
    events: EventLoop,
}

/// Owns the finish and cancel workers.
pub struct WorkerQueues {
    inner: Arc<Inner>,
    finish_thread: Option<JoinHandle<()>>,
    cancel_thread: Option<JoinHandle<()>>,
}

impl WorkerQueues {
    /// Starts both workers; completions spawned against `events` are
    /// dispatched by the finish worker.
    pub fn start(events: EventLoop) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState {
                finish: VecDeque::new(),
                cancelled: VecDeque::new(),
                running: true,
            }),
            ready: Condvar::new(),
            events,
        });

        let finish_inner = Arc::clone(&inner);
        let finish_thread = std::thread::Builder::new()
            .name("fs-finish".into())
            .spawn(move || finish_loop(finish_inner))
            .expect("worker thread spawn");

        let cancel_inner = Arc::clone(&inner);
        let cancel_thread = std::thread::Builder::new()
            .name("fs-cancel".into())
            .spawn(move || cancel_loop(cancel_inner))
            .expect("worker thread spawn");

        Self {
            inner,
            finish_thread: Some(finish_thread),
            cancel_thread: Some(cancel_thread),
        }
    }

    /// Queues a launched request for the finish worker to drive.
    pub fn add(&self, handle: RequestHandle) {
        self.inner.state.lock().unwrap().finish.push_back(handle);
        self.inner.ready.notify_all();
    }

    /// Queues a request for cancellation on the cancel worker.
    pub fn cancel(&self, handle: RequestHandle) {
        self.inner.state.lock().unwrap().cancelled.push_back(handle);
        self.inner.ready.notify_all();
    }

    /// Stops both workers, cancelling everything still queued for
    /// finishing, and joins them.
    pub fn shutdown(&mut self) {
        self.inner.state.lock().unwrap().running = false;
        self.inner.ready.notify_all();
        if let Some(thread) = self.finish_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.cancel_thread.take() {
            let _ = thread.join();
        }
        // Run whatever completions were enqueued during the wind-down.
        self.inner.events.process_events();
    }
}

impl Drop for WorkerQueues {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn finish_loop(inner: Arc<Inner>) {
    loop {
        let (handle, running) = {
            let mut state = inner.state.lock().unwrap();
            while state.finish.is_empty() && state.running {
                state = inner.ready.wait(state).unwrap();
            }
            (state.finish.pop_front(), state.running)
        };
        match handle {
            Some(handle) => {
                if !running {
                    // Shutdown: cancel instead of letting it run out.
                    handle.cancel();
                }
                handle.wait();
                inner.events.process_events();
            }
            None if !running => {
                debug!("finish worker draining done");
                return;
            }
            None => {}
        }
    }
}

fn cancel_loop(inner: Arc<Inner>) {
    loop {
        let handle = {
            let mut state = inner.state.lock().unwrap();
            while state.cancelled.is_empty() && state.running {
                state = inner.ready.wait(state).unwrap();
            }
            state.cancelled.pop_front()
        };
        match handle {
            Some(handle) => {
                handle.cancel();
                handle.wait();
                inner.events.process_events();
            }
            None => {
                debug!("cancel worker draining done");
                return;
            }
        }
    }
}
