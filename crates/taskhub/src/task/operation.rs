use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::capability::{Cancellable, Identifiable, ResultProducing, StreamProducing};
use super::dispatch::{publish_in_process, publish_result};
use super::TaskIdentity;
use crate::error::{Cancelled, Panicked};
use crate::event_bus::EventBus;
use crate::sequence::{AsyncEventSequence, SequenceSender};

type Outcome<S, E> = Option<Result<S, E>>;

/// Progress reporter handed to an operation's work.
///
/// Each report goes to the operation's sequence and is published as an
/// in-process envelope. Reports after the operation terminated are dropped.
pub struct Progress<R, I, E> {
    identity: TaskIdentity<R>,
    bus: EventBus,
    sender: SequenceSender<I, E>,
    terminated: Arc<Mutex<bool>>,
}

impl<R, I, E> Progress<R, I, E>
where
    R: Send + Sync + 'static,
    I: Clone + Send + Sync + 'static,
{
    pub fn report(&self, event: I) {
        let Ok(terminated) = self.terminated.lock() else {
            return;
        };
        if *terminated {
            tracing::trace!(task_id = %self.identity.id(), "progress after termination dropped");
            return;
        }
        self.sender.send(event.clone());
        publish_in_process(&self.bus, &self.identity, event);
    }
}

struct Pending<S, I, E> {
    sender: SequenceSender<I, E>,
    outcome: watch::Sender<Outcome<S, E>>,
}

/// One asynchronous operation observable through its result, its sequence,
/// the event bus, and cancellation.
///
/// `R` is the request, `S` the success value, `I` the in-process event and
/// `E` the failure.
pub struct Operation<R, S, I, E> {
    identity: TaskIdentity<R>,
    bus: EventBus,
    token: CancellationToken,
    outcome: watch::Receiver<Outcome<S, E>>,
    sequence: Mutex<Option<AsyncEventSequence<I, E>>>,
    pending: Mutex<Option<Pending<S, I, E>>>,
}

impl<R, S, I, E> Operation<R, S, I, E>
where
    R: Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
    I: Clone + Send + Sync + 'static,
    E: Clone + From<Cancelled> + From<Panicked> + Send + Sync + 'static,
{
    /// Create an operation that has not started yet.
    ///
    /// Listeners registered before [`start`](Self::start) are guaranteed to
    /// observe the result.
    pub fn new(bus: EventBus, identity: TaskIdentity<R>) -> Self {
        let token = CancellationToken::new();
        let (sender, sequence) = AsyncEventSequence::channel(token.clone());
        let (outcome_tx, outcome_rx) = watch::channel(None);

        Self {
            identity,
            bus,
            token,
            outcome: outcome_rx,
            sequence: Mutex::new(Some(sequence)),
            pending: Mutex::new(Some(Pending {
                sender,
                outcome: outcome_tx,
            })),
        }
    }

    /// Create and immediately start an operation.
    pub fn spawn<W, Fut>(bus: EventBus, identity: TaskIdentity<R>, work: W) -> Self
    where
        W: FnOnce(Progress<R, I, E>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<S, E>> + Send + 'static,
    {
        let operation = Self::new(bus, identity);
        operation.start(work);
        operation
    }

    /// Run `work` on the Tokio runtime. Only the first call has an effect.
    pub fn start<W, Fut>(&self, work: W)
    where
        W: FnOnce(Progress<R, I, E>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<S, E>> + Send + 'static,
    {
        let pending = self.pending.lock().ok().and_then(|mut p| p.take());
        let Some(Pending { sender, outcome }) = pending else {
            tracing::warn!(task_id = %self.identity.id(), "operation already started");
            return;
        };

        let terminated = Arc::new(Mutex::new(false));
        let progress = Progress {
            identity: self.identity.clone(),
            bus: self.bus.clone(),
            sender: sender.clone(),
            terminated: terminated.clone(),
        };
        let identity = self.identity.clone();
        let bus = self.bus.clone();
        let token = self.token.clone();

        tracing::debug!(
            task_id = %identity.id(),
            event_name = %identity.event_name(),
            "operation started"
        );

        tokio::spawn(async move {
            let work_token = token.clone();
            let running = AssertUnwindSafe(async move { work(progress, work_token).await }).catch_unwind();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(E::from(Cancelled)),
                caught = running => caught.unwrap_or_else(|payload| {
                    let panicked = Panicked::from_payload(payload.as_ref());
                    tracing::error!(task_id = %identity.id(), panic = %panicked.message, "operation work panicked");
                    Err(E::from(panicked))
                }),
            };

            let Ok(mut terminated) = terminated.lock() else {
                return;
            };
            *terminated = true;

            match &result {
                Ok(_) => sender.finish(),
                Err(e) => sender.fail(e.clone()),
            }
            outcome.send_replace(Some(result.clone()));
            publish_result(&bus, &identity, result);
        });
    }
}

impl<R, S, I, E> Identifiable for Operation<R, S, I, E>
where
    R: Send + Sync + 'static,
{
    type Request = R;

    fn identity(&self) -> &TaskIdentity<R> {
        &self.identity
    }

    fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn is_terminated(&self) -> bool {
        self.outcome.borrow().is_some()
    }
}

#[async_trait]
impl<R, S, I, E> ResultProducing for Operation<R, S, I, E>
where
    R: Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
    I: Send + Sync + 'static,
    E: Clone + From<Cancelled> + Send + Sync + 'static,
{
    type Success = S;
    type Failure = E;

    async fn result(&self) -> Result<S, E> {
        let mut outcome = self.outcome.clone();
        let resolved = match outcome.wait_for(Option::is_some).await {
            Ok(ready) => ready.clone(),
            // The driver went away without an outcome.
            Err(_) => None,
        };
        resolved.unwrap_or_else(|| Err(E::from(Cancelled)))
    }

    fn outcome(&self) -> Option<Result<S, E>> {
        self.outcome.borrow().clone()
    }
}

impl<R, S, I, E> StreamProducing for Operation<R, S, I, E>
where
    R: Send + Sync + 'static,
    I: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    type Element = I;
    type StreamError = E;

    fn sequence(&self) -> Option<AsyncEventSequence<I, E>> {
        self.sequence.lock().ok().and_then(|mut s| s.take())
    }
}

impl<R, S, I, E> Cancellable for Operation<R, S, I, E> {
    fn cancel(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::event_bus::Category;
    use crate::task::dispatch::{subscribe_in_process, subscribe_result};
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    type Op = Operation<String, u32, u32, ApiError>;

    fn identity() -> TaskIdentity<String> {
        TaskIdentity::new(Category::Api, "API.query", "query { count }".to_string())
    }

    #[tokio::test]
    async fn test_result_sequence_and_bus_agree() {
        let bus = EventBus::new();
        let op = Op::new(bus.clone(), identity());
        let progress = Arc::new(Mutex::new(Vec::new()));
        let result = Arc::new(Mutex::new(None));

        let sink = progress.clone();
        subscribe_in_process(&op, move |event: &u32| sink.lock().unwrap().push(*event));
        let slot = result.clone();
        subscribe_result(&op, move |outcome| *slot.lock().unwrap() = Some(outcome));
        let sequence = op.sequence().unwrap();
        assert!(op.sequence().is_none());

        op.start(|progress, _token| async move {
            progress.report(1);
            progress.report(2);
            Ok(42)
        });

        assert_eq!(op.result().await.unwrap(), 42);
        let items: Vec<_> = timeout(Duration::from_secs(1), sequence.collect::<Vec<_>>())
            .await
            .unwrap();
        assert_eq!(items.into_iter().map(|i| i.unwrap()).collect::<Vec<_>>(), vec![1, 2]);

        bus.flush().await;
        assert_eq!(*progress.lock().unwrap(), vec![1, 2]);
        assert!(matches!(*result.lock().unwrap(), Some(Ok(42))));
        assert_eq!(bus.listener_count(Category::Api), 0);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_surface() {
        let bus = EventBus::new();
        let op = Op::spawn(bus.clone(), identity(), |_progress, _token| async move {
            Err(ApiError::validation("empty document"))
        });
        let mut sequence = op.sequence().unwrap();

        assert!(matches!(op.result().await, Err(ApiError::Validation { .. })));
        assert!(matches!(sequence.next().await, Some(Err(ApiError::Validation { .. }))));
        assert!(sequence.next().await.is_none());
        assert!(op.is_terminated());
    }

    #[tokio::test]
    async fn test_cancel_resolves_as_cancelled() {
        let bus = EventBus::new();
        let op = Op::spawn(bus, identity(), |_progress, token| async move {
            token.cancelled().await;
            Ok(0)
        });

        op.cancel();
        let outcome = timeout(Duration::from_secs(1), op.value()).await.unwrap();
        assert!(matches!(outcome, Err(ApiError::Cancelled)));
    }

    #[tokio::test]
    async fn test_second_start_is_ignored() {
        let bus = EventBus::new();
        let op = Op::new(bus, identity());
        op.start(|_p, _t| async { Ok(1) });
        op.start(|_p, _t| async { Ok(2) });
        assert_eq!(op.result().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_panicking_work_fails_every_surface() {
        let bus = EventBus::new();
        let op = Op::new(bus.clone(), identity());
        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = progress.clone();
        subscribe_in_process(&op, move |event: &u32| sink.lock().unwrap().push(*event));
        subscribe_result(&op, |_| {});
        let sequence = op.sequence().unwrap();

        op.start(|progress, _token| async move {
            progress.report(1);
            let corrupted = true;
            if corrupted {
                panic!("index corrupted");
            }
            Ok(0)
        });

        let outcome = timeout(Duration::from_secs(1), op.result()).await.unwrap();
        assert!(matches!(outcome, Err(ApiError::Unknown { ref message, .. }) if message == "index corrupted"));

        let items = timeout(Duration::from_millis(500), sequence.collect::<Vec<_>>())
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Ok(1)));
        assert!(matches!(items[1], Err(ApiError::Unknown { .. })));

        bus.flush().await;
        assert_eq!(*progress.lock().unwrap(), vec![1]);
        assert_eq!(bus.listener_count(Category::Api), 0);
    }
}
