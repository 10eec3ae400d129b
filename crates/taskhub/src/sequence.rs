//! Push-to-pull bridge between a task and its single consumer.
//!
//! The producing task holds a [`SequenceSender`] and pushes values as they
//! arrive; the consumer iterates the [`AsyncEventSequence`] as a
//! [`Stream`]. The buffer is unbounded so producers never wait on a slow
//! consumer. Once finished or failed, no more values are accepted, but values
//! already buffered are still delivered before the end is observed.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use futures_util::Stream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

struct State<T, E> {
    buffer: VecDeque<T>,
    waiting: Option<Waker>,
    finished: bool,
    failure: Option<E>,
    /// Consumer dropped
    closed: bool,
}

struct Shared<T, E> {
    state: Mutex<State<T, E>>,
    token: CancellationToken,
    /// Live `SequenceSender`s; the sequence finishes when the last one drops.
    senders: AtomicUsize,
}

impl<T, E> Shared<T, E> {
    /// Accepts no more input once finished, closed or cancelled.
    fn accepting(&self, state: &State<T, E>) -> bool {
        !state.finished && !state.closed && !self.token.is_cancelled()
    }
}

/// Producer half. Cloneable; all clones feed the same sequence. Dropping
/// the last clone finishes the sequence.
pub struct SequenceSender<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for SequenceSender<T, E> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, E> Drop for SequenceSender<T, E> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            if !self.is_finished() {
                tracing::debug!("last sequence sender dropped, finishing sequence");
            }
            self.finish();
        }
    }
}

impl<T, E> SequenceSender<T, E> {
    /// Enqueue a value, waking the consumer if it is waiting.
    ///
    /// Returns false when the value was dropped because the sequence is
    /// finished, cancelled or its consumer is gone.
    pub fn send(&self, value: T) -> bool {
        let waker = {
            let Ok(mut state) = self.shared.state.lock() else {
                return false;
            };
            if !self.shared.accepting(&state) {
                tracing::trace!("sequence no longer accepting, value dropped");
                return false;
            }
            state.buffer.push_back(value);
            state.waiting.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// End the sequence normally after the buffer drains.
    pub fn finish(&self) {
        self.terminate(None);
    }

    /// End the sequence with `error`, surfaced after the buffer drains.
    pub fn fail(&self, error: E) {
        self.terminate(Some(error));
    }

    pub fn is_finished(&self) -> bool {
        self.shared
            .state
            .lock()
            .map(|state| state.finished)
            .unwrap_or(true)
    }

    fn terminate(&self, failure: Option<E>) {
        let waker = {
            let Ok(mut state) = self.shared.state.lock() else {
                return;
            };
            if state.finished || self.shared.token.is_cancelled() {
                return;
            }
            state.finished = true;
            state.failure = failure;
            state.waiting.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Consumer half: a single-consumer stream of `Ok(value)` items, optionally
/// followed by one `Err(failure)`, then the end.
///
/// Cancelling the bound token ends the sequence for the consumer once the
/// already-buffered values are drained.
pub struct AsyncEventSequence<T, E> {
    shared: Arc<Shared<T, E>>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    cancel_seen: bool,
    done: bool,
}

impl<T, E> AsyncEventSequence<T, E> {
    /// Create a sequence bound to `token`.
    pub fn channel(token: CancellationToken) -> (SequenceSender<T, E>, AsyncEventSequence<T, E>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                buffer: VecDeque::new(),
                waiting: None,
                finished: false,
                failure: None,
                closed: false,
            }),
            token: token.clone(),
            senders: AtomicUsize::new(1),
        });

        let sender = SequenceSender {
            shared: shared.clone(),
        };
        let sequence = AsyncEventSequence {
            shared,
            cancelled: Box::pin(token.cancelled_owned()),
            cancel_seen: false,
            done: false,
        };
        (sender, sequence)
    }

    /// Cancel the owning task.
    pub fn cancel(&self) {
        self.shared.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }
}

impl<T, E> Stream for AsyncEventSequence<T, E> {
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        let Ok(mut state) = this.shared.state.lock() else {
            this.done = true;
            return Poll::Ready(None);
        };

        if let Some(value) = state.buffer.pop_front() {
            return Poll::Ready(Some(Ok(value)));
        }

        if state.finished {
            this.done = true;
            return Poll::Ready(state.failure.take().map(Err));
        }

        if !this.cancel_seen && this.cancelled.as_mut().poll(cx).is_ready() {
            this.cancel_seen = true;
        }
        if this.cancel_seen {
            this.done = true;
            return Poll::Ready(None);
        }

        state.waiting = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T, E> Drop for AsyncEventSequence<T, E> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.closed = true;
            state.buffer.clear();
            state.waiting = None;
        }
    }
}
