//! Receiver group completion.
//!
//! Every time an event is stored the trigger asks the store which groups the
//! event's receiver now completes, and announces each of them on the bus.
//!
//! A group completes when every member receiver has at least one successful
//! event, ever. Later failures never undo a success, and nothing records that
//! a completion was already announced: each qualifying event announces again
//! under a fresh message id.

use std::sync::Arc;

use quorum_bus::TopicProducer;
use quorum_events::{Event, EventReceiverGroup, Message};
use quorum_id::EventReceiverGroupId;
use tracing::{debug, info, info_span, Span};

use crate::store::{EventStore, StoreResult};

pub struct GroupTrigger {
    store: Arc<dyn EventStore>,
    producer: TopicProducer,
    span: Span,
}

impl GroupTrigger {
    pub fn new(store: Arc<dyn EventStore>, producer: TopicProducer) -> Self {
        let span = info_span!("group_trigger", topic = %producer.topic());
        Self {
            store,
            producer,
            span,
        }
    }

    /// Groups completed relative to `event`.
    pub async fn find_triggered_groups(&self, event: &Event) -> StoreResult<Vec<EventReceiverGroup>> {
        self.store.find_triggered_event_receiver_groups(event).await
    }

    /// Announces every enabled group `event` completes, keyed by group id.
    ///
    /// Returns the ids of the groups announced.
    pub async fn publish_completions(&self, event: &Event) -> StoreResult<Vec<EventReceiverGroupId>> {
        let groups = self.find_triggered_groups(event).await?;
        let mut published = Vec::with_capacity(groups.len());

        for group in groups {
            if !group.enabled {
                debug!(
                    parent: &self.span,
                    group_id = %group.id,
                    "Skipping disabled event receiver group"
                );
                continue;
            }

            let message = Message::group_completed(&group, event);
            info!(
                parent: &self.span,
                group_id = %group.id,
                event_id = %event.id,
                message_id = %message.id,
                "Event receiver group complete"
            );
            self.producer.send_async_keyed(group.id.to_string(), message);
            published.push(group.id);
        }

        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use quorum_bus::MemoryTransport;
    use quorum_events::{message_types, NewEvent, NewEventReceiver, NewEventReceiverGroup};
    use quorum_id::EventReceiverId;

    const TOPIC: &str = "quorum.events";

    struct Harness {
        store: Arc<MemoryStore>,
        transport: Arc<MemoryTransport>,
        trigger: GroupTrigger,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let (producer, transport) = MemoryTransport::producer().unwrap();
        let trigger = GroupTrigger::new(
            Arc::clone(&store) as Arc<dyn EventStore>,
            TopicProducer::new(Arc::new(producer), TOPIC),
        );
        Harness {
            store,
            transport,
            trigger,
        }
    }

    impl Harness {
        async fn receiver(&self, name: &str) -> EventReceiverId {
            self.store
                .create_event_receiver(NewEventReceiver {
                    name: name.to_string(),
                    kind: "build".to_string(),
                    version: "1.0.0".to_string(),
                    description: String::new(),
                    schema: serde_json::json!({}),
                })
                .await
                .unwrap()
                .id
        }

        async fn group(&self, name: &str, members: Vec<EventReceiverId>) -> EventReceiverGroup {
            self.store
                .create_event_receiver_group(NewEventReceiverGroup {
                    name: name.to_string(),
                    kind: "gate".to_string(),
                    version: "1".to_string(),
                    description: String::new(),
                    event_receiver_ids: members,
                })
                .await
                .unwrap()
        }

        async fn event(&self, receiver: EventReceiverId, success: bool) -> Event {
            self.store
                .create_event(NewEvent {
                    name: "build.finished".to_string(),
                    version: "1.0.0".to_string(),
                    release: "2024.1".to_string(),
                    platform_id: "linux".to_string(),
                    package: "quorum".to_string(),
                    description: String::new(),
                    payload: serde_json::Value::Null,
                    success,
                    event_receiver_id: receiver,
                })
                .await
                .unwrap()
        }

        async fn triggered(&self, event: &Event) -> Vec<EventReceiverGroupId> {
            self.trigger
                .find_triggered_groups(event)
                .await
                .unwrap()
                .into_iter()
                .map(|g| g.id)
                .collect()
        }
    }

    #[tokio::test]
    async fn test_group_triggers_once_every_member_succeeded() {
        let h = harness();
        let r1 = h.receiver("unit").await;
        let r2 = h.receiver("integration").await;
        let group = h.group("release-gate", vec![r1, r2]).await;

        let first = h.event(r1, true).await;
        assert!(h.triggered(&first).await.is_empty());

        let second = h.event(r2, true).await;
        assert_eq!(h.triggered(&second).await, vec![group.id]);

        // Existence based: a later failure does not undo the earlier success.
        let failed = h.event(r1, false).await;
        assert_eq!(h.triggered(&failed).await, vec![group.id]);
    }

    #[tokio::test]
    async fn test_failed_events_do_not_satisfy_members() {
        let h = harness();
        let r1 = h.receiver("unit").await;
        let r2 = h.receiver("integration").await;
        h.group("release-gate", vec![r1, r2]).await;

        h.event(r1, true).await;
        let failed = h.event(r2, false).await;
        assert!(h.triggered(&failed).await.is_empty());
    }

    #[tokio::test]
    async fn test_group_requires_event_receiver_membership() {
        let h = harness();
        let r1 = h.receiver("unit").await;
        let outsider = h.receiver("docs").await;
        h.group("release-gate", vec![r1]).await;

        h.event(r1, true).await;
        let unrelated = h.event(outsider, true).await;
        assert!(h.triggered(&unrelated).await.is_empty());
    }

    #[tokio::test]
    async fn test_shared_receiver_triggers_sibling_groups() {
        let h = harness();
        let shared = h.receiver("unit").await;
        let other = h.receiver("lint").await;
        let solo = h.group("solo", vec![shared]).await;
        let pair = h.group("pair", vec![shared, other]).await;

        h.event(other, true).await;
        let event = h.event(shared, true).await;

        let published = h.trigger.publish_completions(&event).await.unwrap();
        assert_eq!(published, vec![solo.id, pair.id]);

        let records = h.transport.records_for(TOPIC);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key.as_deref(), Some(solo.id.to_string().as_str()));

        let message: Message = records[1].decode_json().unwrap();
        assert_eq!(message.message_type, message_types::EVENT_RECEIVER_GROUP_COMPLETE);
        assert_eq!(message.data.event_groups[0].id, pair.id);
        assert_eq!(message.release, event.release);
    }

    #[tokio::test]
    async fn test_completion_refires_with_fresh_message_ids() {
        let h = harness();
        let r1 = h.receiver("unit").await;
        h.group("solo", vec![r1]).await;

        let first = h.event(r1, true).await;
        let second = h.event(r1, true).await;
        h.trigger.publish_completions(&first).await.unwrap();
        h.trigger.publish_completions(&second).await.unwrap();

        let ids: Vec<_> = h
            .transport
            .records_for(TOPIC)
            .iter()
            .map(|r| r.decode_json::<Message>().unwrap().id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_disabled_group_is_not_published() {
        let h = harness();
        let r1 = h.receiver("unit").await;
        let mut group = h.group("solo", vec![r1]).await;
        group.enabled = false;

        // Drive the skip path directly with a store that reports the group
        // disabled.
        struct DisabledStore(EventReceiverGroup);

        #[async_trait::async_trait]
        impl EventStore for DisabledStore {
            async fn create_event(&self, _: NewEvent) -> StoreResult<Event> {
                unimplemented!()
            }
            async fn create_event_receiver(
                &self,
                _: NewEventReceiver,
            ) -> StoreResult<quorum_events::EventReceiver> {
                unimplemented!()
            }
            async fn create_event_receiver_group(
                &self,
                _: NewEventReceiverGroup,
            ) -> StoreResult<EventReceiverGroup> {
                unimplemented!()
            }
            async fn find_event(&self, _: &quorum_id::EventId) -> StoreResult<Option<Event>> {
                Ok(None)
            }
            async fn find_event_receiver(
                &self,
                _: &EventReceiverId,
            ) -> StoreResult<Option<quorum_events::EventReceiver>> {
                Ok(None)
            }
            async fn find_event_receiver_group(
                &self,
                _: &EventReceiverGroupId,
            ) -> StoreResult<Option<EventReceiverGroup>> {
                Ok(Some(self.0.clone()))
            }
            async fn find_triggered_event_receiver_groups(
                &self,
                _: &Event,
            ) -> StoreResult<Vec<EventReceiverGroup>> {
                Ok(vec![self.0.clone()])
            }
        }

        let (producer, transport) = MemoryTransport::producer().unwrap();
        let trigger = GroupTrigger::new(
            Arc::new(DisabledStore(group)),
            TopicProducer::new(Arc::new(producer), TOPIC),
        );

        let event = h.event(r1, true).await;
        assert!(trigger.publish_completions(&event).await.unwrap().is_empty());
        assert!(transport.records().is_empty());
    }
}
