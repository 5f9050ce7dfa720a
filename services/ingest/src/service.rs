//! Creation flows for events, receivers and receiver groups.
//!
//! Each flow validates references, persists through the store and announces
//! the new entity on the outbound topic. Creating an event additionally runs
//! the group trigger.

use std::sync::Arc;

use quorum_bus::TopicProducer;
use quorum_events::{
    Event, EventReceiver, EventReceiverGroup, Message, NewEvent, NewEventReceiver,
    NewEventReceiverGroup,
};
use quorum_id::EventReceiverGroupId;
use thiserror::Error;
use tracing::{info, instrument};

use crate::store::{EventStore, StoreError};
use crate::trigger::GroupTrigger;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request was rejected before anything was stored.
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Outcome of [`EventService::create_event`].
#[derive(Debug, Clone)]
pub struct CreatedEvent {
    pub event: Event,
    /// Groups whose completion was announced because of this event.
    pub completed_groups: Vec<EventReceiverGroupId>,
}

pub struct EventService {
    store: Arc<dyn EventStore>,
    producer: TopicProducer,
    trigger: GroupTrigger,
}

impl EventService {
    pub fn new(store: Arc<dyn EventStore>, producer: TopicProducer) -> Self {
        let trigger = GroupTrigger::new(Arc::clone(&store), producer.clone());
        Self {
            store,
            producer,
            trigger,
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    #[instrument(skip(self, new), fields(name = %new.name, version = %new.version))]
    pub async fn create_event_receiver(
        &self,
        new: NewEventReceiver,
    ) -> ServiceResult<EventReceiver> {
        if new.name.trim().is_empty() {
            return Err(ServiceError::Invalid("event receiver name is required".to_string()));
        }

        let receiver = self.store.create_event_receiver(new).await?;
        info!(receiver_id = %receiver.id, fingerprint = %receiver.fingerprint, "Event receiver created");

        self.producer
            .send_async_keyed(receiver.id.to_string(), Message::receiver_created(&receiver));
        Ok(receiver)
    }

    #[instrument(skip(self, new), fields(name = %new.name, members = new.event_receiver_ids.len()))]
    pub async fn create_event_receiver_group(
        &self,
        new: NewEventReceiverGroup,
    ) -> ServiceResult<EventReceiverGroup> {
        let members = new.members();
        if members.is_empty() {
            return Err(StoreError::EmptyGroup.into());
        }
        for id in &members {
            if self.store.find_event_receiver(id).await?.is_none() {
                return Err(StoreError::unknown_receiver(id).into());
            }
        }

        let group = self.store.create_event_receiver_group(new).await?;
        info!(group_id = %group.id, "Event receiver group created");

        self.producer
            .send_async_keyed(group.id.to_string(), Message::group_created(&group));
        Ok(group)
    }

    #[instrument(skip(self, new), fields(name = %new.name, receiver_id = %new.event_receiver_id))]
    pub async fn create_event(&self, new: NewEvent) -> ServiceResult<CreatedEvent> {
        if self
            .store
            .find_event_receiver(&new.event_receiver_id)
            .await?
            .is_none()
        {
            return Err(StoreError::unknown_receiver(&new.event_receiver_id).into());
        }

        let event = self.store.create_event(new).await?;
        info!(event_id = %event.id, success = event.success, "Event created");

        self.producer.send_async_keyed(
            event.event_receiver_id.to_string(),
            Message::event_created(&event),
        );

        let completed_groups = self.trigger.publish_completions(&event).await?;
        Ok(CreatedEvent {
            event,
            completed_groups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use quorum_bus::MemoryTransport;
    use quorum_events::message_types;
    use quorum_id::EventReceiverId;

    const TOPIC: &str = "quorum.events";

    fn service() -> (EventService, Arc<MemoryTransport>) {
        let (producer, transport) = MemoryTransport::producer().unwrap();
        let service = EventService::new(
            Arc::new(MemoryStore::new()),
            TopicProducer::new(Arc::new(producer), TOPIC),
        );
        (service, transport)
    }

    fn new_receiver(name: &str) -> NewEventReceiver {
        NewEventReceiver {
            name: name.to_string(),
            kind: "test".to_string(),
            version: "1.0.0".to_string(),
            description: "suite results".to_string(),
            schema: serde_json::json!({"type": "object"}),
        }
    }

    fn new_event(receiver: EventReceiverId, success: bool) -> NewEvent {
        NewEvent {
            name: "suite.finished".to_string(),
            version: "1.0.0".to_string(),
            release: "2024.2".to_string(),
            platform_id: "linux-amd64".to_string(),
            package: "quorum".to_string(),
            description: String::new(),
            payload: serde_json::json!({"passed": success}),
            success,
            event_receiver_id: receiver,
        }
    }

    fn messages(transport: &MemoryTransport) -> Vec<Message> {
        transport
            .records_for(TOPIC)
            .iter()
            .map(|r| r.decode_json().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_create_receiver_publishes_announcement() {
        let (service, transport) = service();
        let receiver = service
            .create_event_receiver(new_receiver("unit"))
            .await
            .unwrap();

        let published = messages(&transport);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message_type, message_types::EVENT_RECEIVER_CREATED);
        assert_eq!(published[0].data.event_receivers, vec![receiver]);
    }

    #[tokio::test]
    async fn test_blank_receiver_name_rejected() {
        let (service, transport) = service();
        let err = service
            .create_event_receiver(new_receiver("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Invalid(_)));
        assert!(transport.records().is_empty());
    }

    #[tokio::test]
    async fn test_group_with_unknown_receiver_rejected() {
        let (service, transport) = service();
        let err = service
            .create_event_receiver_group(NewEventReceiverGroup {
                name: "gate".to_string(),
                kind: "gate".to_string(),
                version: "1".to_string(),
                description: String::new(),
                event_receiver_ids: vec![EventReceiverId::new()],
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Store(ref e) if e.is_not_found()));
        assert!(transport.records().is_empty());
    }

    #[tokio::test]
    async fn test_create_event_announces_event_then_completion() {
        let (service, transport) = service();
        let unit = service.create_event_receiver(new_receiver("unit")).await.unwrap();
        let lint = service.create_event_receiver(new_receiver("lint")).await.unwrap();
        let group = service
            .create_event_receiver_group(NewEventReceiverGroup {
                name: "release-gate".to_string(),
                kind: "gate".to_string(),
                version: "1".to_string(),
                description: String::new(),
                event_receiver_ids: vec![unit.id, lint.id],
            })
            .await
            .unwrap();

        let first = service.create_event(new_event(unit.id, true)).await.unwrap();
        assert!(first.completed_groups.is_empty());

        let second = service.create_event(new_event(lint.id, true)).await.unwrap();
        assert_eq!(second.completed_groups, vec![group.id]);

        let published = messages(&transport);
        let types: Vec<&str> = published.iter().map(|m| m.message_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                message_types::EVENT_RECEIVER_CREATED,
                message_types::EVENT_RECEIVER_CREATED,
                message_types::EVENT_RECEIVER_GROUP_CREATED,
                "suite.finished",
                "suite.finished",
                message_types::EVENT_RECEIVER_GROUP_COMPLETE,
            ]
        );
        assert_eq!(published[4].data.events, vec![second.event]);
        assert_eq!(published[5].platform_id, "linux-amd64");
    }

    #[tokio::test]
    async fn test_event_for_unknown_receiver_rejected() {
        let (service, transport) = service();
        let err = service
            .create_event(new_event(EventReceiverId::new(), true))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Store(ref e) if e.is_not_found()));
        assert!(transport.records().is_empty());
    }
}
