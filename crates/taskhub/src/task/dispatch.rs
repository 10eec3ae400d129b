//! Result and in-process delivery over the event bus.
//!
//! Listeners are scoped to one task id. A result listener fires at most once
//! and removes itself; an in-process listener removes itself when the task's
//! terminal result envelope arrives. Every task publishes exactly one result
//! envelope, so in-process listeners never outlive their task.

use std::sync::{Arc, Mutex};

use super::capability::{Identifiable, ResultProducing, StreamProducing};
use super::TaskIdentity;
use crate::event_bus::{EventBus, ListenerControl, ListenerToken, Payload};

/// Register `listener` for the task's terminal outcome.
///
/// If the task already ended, `listener` runs immediately with the stored
/// outcome and the returned token is inert.
pub fn subscribe_result<T, F>(task: &T, listener: F) -> ListenerToken
where
    T: ResultProducing + ?Sized,
    F: FnOnce(Result<T::Success, T::Failure>) + Send + 'static,
{
    let slot = Arc::new(Mutex::new(Some(listener)));
    let token = listen_with_slot(task.bus(), task.identity(), slot.clone());

    // The result envelope may already have been delivered before the listener
    // was registered. Whichever side takes the slot first delivers.
    if let Some(outcome) = task.outcome() {
        task.bus().remove_listener(&token);
        if let Some(listener) = take(&slot) {
            tracing::debug!(task_id = %task.identity().id(), "task already ended, delivering stored result");
            listener(outcome);
        }
    }
    token
}

/// Publish the task's terminal outcome. Each task calls this once.
pub fn dispatch_result<T>(task: &T, outcome: Result<T::Success, T::Failure>)
where
    T: ResultProducing + ?Sized,
{
    publish_result(task.bus(), task.identity(), outcome)
}

/// Register `listener` for the task's in-process events until it terminates.
pub fn subscribe_in_process<T, F>(task: &T, listener: F) -> ListenerToken
where
    T: StreamProducing + ?Sized,
    F: Fn(&T::Element) + Send + Sync + 'static,
{
    let token = listen_for_in_process(task.bus(), task.identity(), listener);
    if task.is_terminated() {
        tracing::debug!(task_id = %task.identity().id(), "task already ended, in-process listener dropped");
        task.bus().remove_listener(&token);
    }
    token
}

pub fn dispatch_in_process<T>(task: &T, event: T::Element)
where
    T: StreamProducing + ?Sized,
{
    publish_in_process(task.bus(), task.identity(), event)
}

/// Remove a listener registered for this task. Unknown tokens are ignored.
pub fn unsubscribe<T>(task: &T, token: &ListenerToken)
where
    T: Identifiable + ?Sized,
{
    task.bus().remove_listener(token);
}

// ============================================================================
// Bus-level helpers shared by tasks that publish before they exist as a value
// ============================================================================

type Slot<F> = Arc<Mutex<Option<F>>>;

fn take<F>(slot: &Slot<F>) -> Option<F> {
    slot.lock().ok().and_then(|mut slot| slot.take())
}

fn listen_with_slot<R, S, E, F>(bus: &EventBus, identity: &TaskIdentity<R>, slot: Slot<F>) -> ListenerToken
where
    R: Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    F: FnOnce(Result<S, E>) + Send + 'static,
{
    let task_id = identity.id();

    bus.listen_until(identity.channel(), identity.filter(), move |envelope| {
        let Some(outcome) = envelope.result::<S, E>() else {
            return ListenerControl::Keep;
        };
        match take(&slot) {
            Some(listener) => listener(outcome.clone()),
            None => tracing::debug!(task_id = %task_id, "result already delivered, ignoring"),
        }
        ListenerControl::Remove
    })
}

pub(crate) fn listen_for_in_process<R, I, F>(bus: &EventBus, identity: &TaskIdentity<R>, listener: F) -> ListenerToken
where
    R: Send + Sync + 'static,
    I: Send + Sync + 'static,
    F: Fn(&I) + Send + Sync + 'static,
{
    bus.listen_until(identity.channel(), identity.filter(), move |envelope| {
        if envelope.is_result() {
            return ListenerControl::Remove;
        }
        if let Some(event) = envelope.in_process::<I>() {
            listener(event);
        }
        ListenerControl::Keep
    })
}

pub(crate) fn publish_result<R, S, E>(bus: &EventBus, identity: &TaskIdentity<R>, outcome: Result<S, E>)
where
    R: Send + Sync + 'static,
    S: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    tracing::debug!(
        task_id = %identity.id(),
        event_name = %identity.event_name(),
        success = outcome.is_ok(),
        "publishing task result"
    );
    bus.dispatch(identity.channel(), identity.envelope(Payload::result(outcome)));
}

pub(crate) fn publish_in_process<R, I>(bus: &EventBus, identity: &TaskIdentity<R>, event: I)
where
    R: Send + Sync + 'static,
    I: Send + Sync + 'static,
{
    bus.dispatch(identity.channel(), identity.envelope(Payload::in_process(event)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::Category;

    type Outcome = Result<u32, String>;

    fn listen_for_result<F>(bus: &EventBus, identity: &TaskIdentity<()>, listener: F) -> ListenerToken
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        listen_with_slot(bus, identity, Arc::new(Mutex::new(Some(listener))))
    }

    #[tokio::test]
    async fn test_result_listener_fires_once() {
        let bus = EventBus::new();
        let identity = TaskIdentity::new(Category::Api, "API.query", ());
        let seen: Arc<Mutex<Vec<Outcome>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let token = listen_for_result(&bus, &identity, move |outcome: Outcome| {
            sink.lock().unwrap().push(outcome);
        });

        publish_result(&bus, &identity, Outcome::Ok(1));
        publish_result(&bus, &identity, Outcome::Ok(2));
        bus.flush().await;

        assert_eq!(*seen.lock().unwrap(), vec![Ok(1)]);
        assert!(!bus.remove_listener(&token));
    }

    #[tokio::test]
    async fn test_result_listener_ignores_other_tasks() {
        let bus = EventBus::new();
        let mine = TaskIdentity::new(Category::Api, "API.query", ());
        let other = TaskIdentity::new(Category::Api, "API.query", ());
        let seen = Arc::new(Mutex::new(None));

        let sink = seen.clone();
        listen_for_result(&bus, &mine, move |outcome: Outcome| {
            *sink.lock().unwrap() = Some(outcome);
        });

        publish_result(&bus, &other, Outcome::Err("theirs".to_string()));
        publish_in_process(&bus, &mine, 5u32);
        bus.flush().await;
        assert!(seen.lock().unwrap().is_none());

        publish_result(&bus, &mine, Outcome::Err("mine".to_string()));
        bus.flush().await;
        assert_eq!(*seen.lock().unwrap(), Some(Err("mine".to_string())));
    }

    #[tokio::test]
    async fn test_in_process_listener_stops_at_result() {
        let bus = EventBus::new();
        let identity = TaskIdentity::new(Category::Api, "API.subscribe", ());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let token = listen_for_in_process(&bus, &identity, move |event: &u32| {
            sink.lock().unwrap().push(*event);
        });

        publish_in_process(&bus, &identity, 1u32);
        publish_in_process(&bus, &identity, 2u32);
        publish_result(&bus, &identity, Outcome::Ok(0));
        publish_in_process(&bus, &identity, 3u32);
        bus.flush().await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert!(!bus.remove_listener(&token));
        assert_eq!(bus.listener_count(Category::Api), 0);
    }
}
