use super::{Channel, EventBus, Filter, ListenerToken};

/// Log every envelope published on `channel` at debug level.
pub fn attach_log_observer(bus: &EventBus, channel: impl Into<Channel>) -> ListenerToken {
    let channel = channel.into();
    let label = channel.clone();

    bus.listen(channel, Filter::any(), move |envelope| {
        tracing::debug!(
            channel = %label,
            cursor = envelope.cursor,
            event_name = %envelope.event_name,
            task_id = %envelope.task_id,
            payload = envelope.payload.kind(),
            "event published"
        );
    })
}
