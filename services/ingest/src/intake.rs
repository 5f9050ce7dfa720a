//! Creation commands consumed from the intake topic.
//!
//! Each record carries one JSON [`IntakeCommand`]:
//!
//! ```json
//! {"kind": "create_event_receiver", "data": {"name": "unit", "type": "test", "version": "1"}}
//! ```

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use quorum_bus::{Record, RecordHandler};
use quorum_events::{NewEvent, NewEventReceiver, NewEventReceiverGroup};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::service::EventService;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum IntakeCommand {
    CreateEvent(NewEvent),
    CreateEventReceiver(NewEventReceiver),
    CreateEventReceiverGroup(NewEventReceiverGroup),
}

impl IntakeCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            IntakeCommand::CreateEvent(_) => "create_event",
            IntakeCommand::CreateEventReceiver(_) => "create_event_receiver",
            IntakeCommand::CreateEventReceiverGroup(_) => "create_event_receiver_group",
        }
    }
}

/// Applies intake commands through the [`EventService`].
pub struct IntakeHandler {
    service: Arc<EventService>,
}

impl IntakeHandler {
    pub fn new(service: Arc<EventService>) -> Self {
        Self { service }
    }

    pub async fn apply(&self, command: IntakeCommand) -> anyhow::Result<()> {
        match command {
            IntakeCommand::CreateEvent(new) => {
                let created = self.service.create_event(new).await?;
                debug!(
                    event_id = %created.event.id,
                    completed = created.completed_groups.len(),
                    "Applied create_event"
                );
            }
            IntakeCommand::CreateEventReceiver(new) => {
                let receiver = self.service.create_event_receiver(new).await?;
                debug!(receiver_id = %receiver.id, "Applied create_event_receiver");
            }
            IntakeCommand::CreateEventReceiverGroup(new) => {
                let group = self.service.create_event_receiver_group(new).await?;
                debug!(group_id = %group.id, "Applied create_event_receiver_group");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RecordHandler for IntakeHandler {
    async fn handle(&self, record: &Record) -> anyhow::Result<()> {
        let command: IntakeCommand = record.decode_json().with_context(|| {
            format!(
                "undecodable intake command at {}/{}@{}",
                record.topic, record.partition, record.offset
            )
        })?;

        let kind = command.kind();
        self.apply(command)
            .await
            .with_context(|| format!("{kind} failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EventStore, MemoryStore};
    use quorum_bus::{MemoryTransport, TopicProducer};
    use quorum_events::{message_types, Message};
    use rstest::rstest;

    fn record(offset: i64, payload: serde_json::Value) -> Record {
        Record {
            topic: "quorum.intake".to_string(),
            partition: 0,
            offset,
            key: None,
            payload: Some(serde_json::to_vec(&payload).unwrap()),
            timestamp_ms: None,
        }
    }

    fn handler() -> (IntakeHandler, Arc<MemoryStore>, Arc<MemoryTransport>) {
        let store = Arc::new(MemoryStore::new());
        let (producer, transport) = MemoryTransport::producer().unwrap();
        let service = EventService::new(
            Arc::clone(&store) as Arc<dyn EventStore>,
            TopicProducer::new(Arc::new(producer), "quorum.events"),
        );
        (IntakeHandler::new(Arc::new(service)), store, transport)
    }

    #[tokio::test]
    async fn test_commands_round_trip_into_store_and_bus() {
        let (handler, store, transport) = handler();

        handler
            .handle(&record(
                0,
                serde_json::json!({
                    "kind": "create_event_receiver",
                    "data": {"name": "unit", "type": "test", "version": "1.0.0"}
                }),
            ))
            .await
            .unwrap();

        let announced: Message = transport.records()[0].decode_json().unwrap();
        let receiver = announced.data.event_receivers[0].clone();
        assert_eq!(
            store.find_event_receiver(&receiver.id).await.unwrap(),
            Some(receiver.clone())
        );

        handler
            .handle(&record(
                1,
                serde_json::json!({
                    "kind": "create_event_receiver_group",
                    "data": {
                        "name": "gate",
                        "type": "gate",
                        "version": "1",
                        "event_receiver_ids": [receiver.id]
                    }
                }),
            ))
            .await
            .unwrap();

        handler
            .handle(&record(
                2,
                serde_json::json!({
                    "kind": "create_event",
                    "data": {
                        "name": "unit.finished",
                        "version": "1.0.0",
                        "release": "2024.3",
                        "platform_id": "linux",
                        "package": "quorum",
                        "success": true,
                        "event_receiver_id": receiver.id
                    }
                }),
            ))
            .await
            .unwrap();

        assert_eq!(store.event_count(), 1);
        let types: Vec<String> = transport
            .records()
            .iter()
            .map(|r| r.decode_json::<Message>().unwrap().message_type)
            .collect();
        assert_eq!(
            types,
            vec![
                message_types::EVENT_RECEIVER_CREATED,
                message_types::EVENT_RECEIVER_GROUP_CREATED,
                "unit.finished",
                message_types::EVENT_RECEIVER_GROUP_COMPLETE,
            ]
        );
    }

    #[rstest]
    #[case::not_json(serde_json::json!("create everything"))]
    #[case::unknown_kind(serde_json::json!({"kind": "delete_event", "data": {}}))]
    #[case::missing_fields(serde_json::json!({"kind": "create_event", "data": {"name": "x"}}))]
    #[tokio::test]
    async fn test_malformed_commands_fail(#[case] payload: serde_json::Value) {
        let (handler, store, transport) = handler();
        let err = handler.handle(&record(9, payload)).await.unwrap_err();

        assert!(err.to_string().contains("quorum.intake/0@9"), "{err}");
        assert_eq!(store.event_count(), 0);
        assert!(transport.records().is_empty());
    }

    #[test]
    fn test_command_kind_matches_tag() {
        let command = IntakeCommand::CreateEventReceiver(NewEventReceiver {
            name: "unit".to_string(),
            kind: "test".to_string(),
            version: "1".to_string(),
            description: String::new(),
            schema: serde_json::Value::Null,
        });
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(value["kind"], command.kind());
        assert_eq!(value["data"]["type"], "test");
    }
}
