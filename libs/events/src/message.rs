//! The bus message envelope.
//!
//! Every record published by the service is a [`Message`]: a CloudEvents 1.0
//! compatible envelope whose `data` carries the entity that was created or
//! the group that completed. Field order in the struct is the field order on
//! the wire.

use quorum_id::MessageId;
use serde::{Deserialize, Serialize};

use crate::error::EventError;
use crate::model::{Event, EventReceiver, EventReceiverGroup};

/// CloudEvents specification version carried by every message.
pub const SPEC_VERSION: &str = "1.0";

/// Message API version extension carried by every message.
pub const API_VERSION: &str = "v1";

/// Message type values for the entities the service announces.
pub mod message_types {
    pub const EVENT_RECEIVER_CREATED: &str = "quorum.event.receiver.created";
    pub const EVENT_RECEIVER_GROUP_CREATED: &str = "quorum.event.receiver.group.created";
    pub const EVENT_RECEIVER_GROUP_COMPLETE: &str = "quorum.event.receiver.group.complete";
}

/// Payload of a [`Message`].
///
/// Exactly one list is populated per message in practice; the others are
/// present and empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub event_receivers: Vec<EventReceiver>,
    #[serde(default)]
    pub event_groups: Vec<EventReceiverGroup>,
}

/// CloudEvents compatible envelope published to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Extension: whether the announced fact represents success.
    pub success: bool,
    /// Opaque on decode; messages built here carry a `msg_` id.
    pub id: String,
    pub specversion: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub source: String,
    /// Extension: message API version.
    pub api_version: String,
    pub name: String,
    pub version: String,
    pub release: String,
    pub platform_id: String,
    pub package: String,
    pub data: MessageData,
}

impl Message {
    /// Creates a builder with the fixed spec and API versions already set.
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Announces a newly created event. The message type is the event name.
    pub fn event_created(event: &Event) -> Self {
        Message::builder()
            .success(event.success)
            .message_type(event.name.clone())
            .source(format!("quorum.event.receiver.{}", event.event_receiver_id))
            .name(event.name.clone())
            .version(event.version.clone())
            .release(event.release.clone())
            .platform_id(event.platform_id.clone())
            .package(event.package.clone())
            .data(MessageData {
                events: vec![event.clone()],
                ..MessageData::default()
            })
            .build()
    }

    /// Announces a newly created event receiver.
    pub fn receiver_created(receiver: &EventReceiver) -> Self {
        Message::builder()
            .success(true)
            .message_type(message_types::EVENT_RECEIVER_CREATED)
            .source(format!("quorum.event.receiver.{}", receiver.id))
            .name(receiver.name.clone())
            .version(receiver.version.clone())
            .data(MessageData {
                event_receivers: vec![receiver.clone()],
                ..MessageData::default()
            })
            .build()
    }

    /// Announces a newly created event receiver group.
    pub fn group_created(group: &EventReceiverGroup) -> Self {
        Message::builder()
            .success(true)
            .message_type(message_types::EVENT_RECEIVER_GROUP_CREATED)
            .source(format!("quorum.event.receiver.group.{}", group.id))
            .name(group.name.clone())
            .version(group.version.clone())
            .data(MessageData {
                event_groups: vec![group.clone()],
                ..MessageData::default()
            })
            .build()
    }

    /// Announces that every member of `group` has a successful event.
    ///
    /// Release, platform and package are taken from the event that completed
    /// the group.
    pub fn group_completed(group: &EventReceiverGroup, trigger: &Event) -> Self {
        Message::builder()
            .success(true)
            .message_type(message_types::EVENT_RECEIVER_GROUP_COMPLETE)
            .source(format!("quorum.event.receiver.group.{}", group.id))
            .name(group.name.clone())
            .version(group.version.clone())
            .release(trigger.release.clone())
            .platform_id(trigger.platform_id.clone())
            .package(trigger.package.clone())
            .data(MessageData {
                event_groups: vec![group.clone()],
                ..MessageData::default()
            })
            .build()
    }

    /// Compact JSON in declaration order.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_yaml(&self) -> Result<String, EventError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Inverse of [`Message::to_json`].
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Builder for [`Message`].
///
/// Performs no validation: fields that are never set are left empty.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message: Message,
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self {
            message: Message {
                success: false,
                id: MessageId::new().to_string(),
                specversion: SPEC_VERSION.to_string(),
                message_type: String::new(),
                source: String::new(),
                api_version: API_VERSION.to_string(),
                name: String::new(),
                version: String::new(),
                release: String::new(),
                platform_id: String::new(),
                package: String::new(),
                data: MessageData::default(),
            },
        }
    }
}

impl MessageBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.message.id = id.into();
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.message.success = success;
        self
    }

    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message.message_type = message_type.into();
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.message.source = source.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.message.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.message.version = version.into();
        self
    }

    pub fn release(mut self, release: impl Into<String>) -> Self {
        self.message.release = release.into();
        self
    }

    pub fn platform_id(mut self, platform_id: impl Into<String>) -> Self {
        self.message.platform_id = platform_id.into();
        self
    }

    pub fn package(mut self, package: impl Into<String>) -> Self {
        self.message.package = package.into();
        self
    }

    pub fn data(mut self, data: MessageData) -> Self {
        self.message.data = data;
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}
