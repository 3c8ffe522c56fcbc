//! User-facing event loop.
//!
//! Every user-visible completion is enqueued as a closure and drained on
//! whatever thread the embedding application calls [`EventLoop::process_events`]
//! (or [`EventLoop::exec`]) from. This keeps callbacks off worker threads.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

type Event = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct LoopState {
    queue: VecDeque<Event>,
    quit: bool,
}

struct Inner {
    state: Mutex<LoopState>,
    ready: Condvar,
}

/// Single-threaded dispatch queue for user callbacks.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LoopState::default()),
                ready: Condvar::new(),
            }),
        }
    }

    /// Enqueues a closure for the next drain.
    pub fn invoke(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.state.lock().unwrap().queue.push_back(Box::new(f));
        self.inner.ready.notify_all();
    }

    /// Runs every queued closure on the calling thread.
    pub fn process_events(&self) {
        loop {
            let event = self.inner.state.lock().unwrap().queue.pop_front();
            match event {
                Some(event) => event(),
                None => return,
            }
        }
    }

    /// Blocks, draining events as they arrive, until [`EventLoop::quit`].
    /// Whatever is queued at quit time is still drained before returning.
    pub fn exec(&self) {
        loop {
            let quit = {
                let mut state = self.inner.state.lock().unwrap();
                while state.queue.is_empty() && !state.quit {
                    state = self.inner.ready.wait(state).unwrap();
                }
                if state.quit {
                    state.quit = false;
                    true
                } else {
                    false
                }
            };
            self.process_events();
            if quit {
                return;
            }
        }
    }

    /// Makes [`EventLoop::exec`] return after draining what is queued.
    pub fn quit(&self) {
        self.inner.state.lock().unwrap().quit = true;
        self.inner.ready.notify_all();
    }

    /// Number of events waiting to be processed.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }
}
