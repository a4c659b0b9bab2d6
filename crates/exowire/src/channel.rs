//! # Channel
//!
//! An asynchronous FIFO queue, bounded or unbounded, with an explicit
//! terminal state.
//!
//! The same type serves as the internal buffer for generator results and as
//! the streaming primitive that callers pass into remote calls.
//!
//! ## Invariants
//!
//! - **Close is terminal and idempotent**: the first `close` wins, later ones are no-ops.
//! - **Drain before sentinel**: values buffered before the close are still
//!   delivered; only then does `recv` report the sentinel (or the close error).
//! - **Backpressure**: on a bounded channel `send` does not resolve until the
//!   value fits. An unbounded channel never blocks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use tokio::sync::Notify;

use crate::fault::RemoteError;

/// The value handed back by `send` when the channel is already closed.
#[derive(Debug, Clone, PartialEq)]
pub struct SendError<T>(pub T);

impl<T> std::fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "send on a closed channel")
    }
}

impl<T: std::fmt::Debug> std::error::Error for SendError<T> {}

/// Failure of a non-blocking send.
#[derive(Debug, Clone, PartialEq)]
pub enum TrySendError<T> {
    /// The channel is bounded and at capacity.
    Full(T),
    /// The channel has been closed.
    Closed(T),
}

impl<T> std::fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(_) => write!(f, "channel is full"),
            Self::Closed(_) => write!(f, "send on a closed channel"),
        }
    }
}

impl<T: std::fmt::Debug> std::error::Error for TrySendError<T> {}

/// A handle to an asynchronous queue. Clones share the same queue.
pub struct Channel<T, E = RemoteError> {
    inner: Arc<Inner<T, E>>,
}

struct Inner<T, E> {
    capacity: Option<usize>,
    state: Mutex<State<T, E>>,
    readable: Notify,
    writable: Notify,
}

struct State<T, E> {
    queue: VecDeque<T>,
    closed: Option<Option<E>>,
}

impl<T, E: Clone> Channel<T, E> {
    /// Creates a channel whose `send` never waits.
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// Creates a channel holding at most `capacity` undelivered values.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    closed: None,
                }),
                readable: Notify::new(),
                writable: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T, E>> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueues `value`, waiting for capacity on a bounded channel.
    pub async fn send(&self, mut value: T) -> Result<(), SendError<T>> {
        loop {
            let writable = self.inner.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();

            match self.try_send(value) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(v)) => return Err(SendError(v)),
                Err(TrySendError::Full(v)) => value = v,
            }

            writable.await;
        }
    }

    /// Enqueues `value` if there is room right now.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut state = self.lock();
        if state.closed.is_some() {
            return Err(TrySendError::Closed(value));
        }
        if let Some(capacity) = self.inner.capacity {
            if state.queue.len() >= capacity {
                return Err(TrySendError::Full(value));
            }
        }
        state.queue.push_back(value);
        drop(state);
        self.inner.readable.notify_one();
        Ok(())
    }

    /// Takes the next value.
    ///
    /// Returns `Ok(None)` once the channel is closed and drained, or the close
    /// error if it was closed with one.
    pub async fn recv(&self) -> Result<Option<T>, E> {
        loop {
            let readable = self.inner.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(value) = state.queue.pop_front() {
                    drop(state);
                    self.inner.writable.notify_one();
                    return Ok(Some(value));
                }
                if let Some(closed) = &state.closed {
                    return match closed {
                        Some(error) => Err(error.clone()),
                        None => Ok(None),
                    };
                }
            }

            readable.await;
        }
    }

    /// Marks the channel terminal. Pending and future receivers observe the
    /// sentinel, or `error` if one is given, after the buffered values.
    pub fn close(&self, error: Option<E>) {
        {
            let mut state = self.lock();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(error);
        }
        self.inner.readable.notify_waiters();
        self.inner.writable.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Number of values buffered and not yet received.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The bound, or `None` for an unbounded channel.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }
}

impl<T, E> Clone for Channel<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Two handles are equal when they refer to the same queue.
impl<T, E> PartialEq for Channel<T, E> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T, E> std::fmt::Debug for Channel<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}
