//! Inbox: a message queue for steering long-lived nodes mid-run.
//!
//! Producers `push`; consumers either wait (`pop`, `into_stream`) or take
//! what is queued (`drain`, `try_pop`). A push while a consumer is waiting
//! hands the message straight to the oldest waiter; otherwise it is queued
//! FIFO.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures_util::Stream;
use tokio::sync::oneshot;

struct InboxState<T> {
    queue: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
    closed: bool,
}

/// Cloneable handle to a shared queue.
pub struct Inbox<T> {
    state: Arc<Mutex<InboxState<T>>>,
}

impl<T> Clone for Inbox<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Default for Inbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Inbox<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(InboxState {
                queue: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// Deliver a message. Returns `false` if the inbox is closed.
    pub fn push(&self, mut message: T) -> bool {
        let mut state = self.state.lock().expect("inbox lock poisoned");
        if state.closed {
            return false;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(message) {
                Ok(()) => return true,
                // Waiter gave up; try the next one.
                Err(returned) => message = returned,
            }
        }
        state.queue.push_back(message);
        true
    }

    /// Wait for the next message. `None` once the inbox is closed and empty.
    pub async fn pop(&self) -> Option<T> {
        let rx = {
            let mut state = self.state.lock().expect("inbox lock poisoned");
            if let Some(message) = state.queue.pop_front() {
                return Some(message);
            }
            if state.closed {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };
        rx.await.ok()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.state
            .lock()
            .expect("inbox lock poisoned")
            .queue
            .pop_front()
    }

    /// Take every queued message without waiting.
    pub fn drain(&self) -> Vec<T> {
        self.state
            .lock()
            .expect("inbox lock poisoned")
            .queue
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("inbox lock poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting messages and wake every waiter with `None`.
    /// Already queued messages can still be consumed.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("inbox lock poisoned");
        state.closed = true;
        state.waiters.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("inbox lock poisoned").closed
    }

    /// Consume messages as an async stream that ends when the inbox closes.
    pub fn into_stream(self) -> impl Stream<Item = T>
    where
        T: Send + 'static,
    {
        async_stream::stream! {
            while let Some(message) = self.pop().await {
                yield message;
            }
        }
    }
}

impl<T: Clone> Inbox<T> {
    /// Copy of the queued messages, leaving them in place.
    pub fn pending(&self) -> Vec<T> {
        self.state
            .lock()
            .expect("inbox lock poisoned")
            .queue
            .iter()
            .cloned()
            .collect()
    }
}

impl<T> std::fmt::Debug for Inbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("inbox lock poisoned");
        f.debug_struct("Inbox")
            .field("queued", &state.queue.len())
            .field("waiters", &state.waiters.len())
            .field("closed", &state.closed)
            .finish()
    }
}
