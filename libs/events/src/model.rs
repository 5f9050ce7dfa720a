//! Events, receivers and receiver groups.
//!
//! Entities are created once by the store, which assigns the identifier and
//! creation timestamp. The `New*` inputs carry everything else.

use chrono::{DateTime, Utc};
use quorum_id::{EventId, EventReceiverGroupId, EventReceiverId};
use serde::{Deserialize, Serialize};

use crate::fingerprint::{fingerprint, FingerprintSeed};

/// An immutable fact recorded against one event receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub name: String,
    pub version: String,
    pub release: String,
    pub platform_id: String,
    pub package: String,
    pub description: String,
    pub payload: serde_json::Value,
    pub success: bool,
    pub event_receiver_id: EventReceiverId,
    pub created_at: DateTime<Utc>,
}

/// Input for creating an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub name: String,
    pub version: String,
    pub release: String,
    pub platform_id: String,
    pub package: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub success: bool,
    pub event_receiver_id: EventReceiverId,
}

impl NewEvent {
    /// Completes the input with the identity assigned by the store.
    pub fn into_event(self, id: EventId, created_at: DateTime<Utc>) -> Event {
        Event {
            id,
            name: self.name,
            version: self.version,
            release: self.release,
            platform_id: self.platform_id,
            package: self.package,
            description: self.description,
            payload: self.payload,
            success: self.success,
            event_receiver_id: self.event_receiver_id,
            created_at,
        }
    }
}

/// A named, versioned channel that events attach to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReceiver {
    pub id: EventReceiverId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    pub description: String,
    pub schema: serde_json::Value,
    pub fingerprint: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for creating an [`EventReceiver`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEventReceiver {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schema: serde_json::Value,
}

impl NewEventReceiver {
    /// Fingerprint input for this definition.
    ///
    /// The receiver type is the action and the canonical JSON of the schema is
    /// the only tag, so a schema change yields a new identity.
    pub fn fingerprint_seed(&self) -> FingerprintSeed {
        FingerprintSeed {
            action: self.kind.clone(),
            description: self.description.clone(),
            name: self.name.clone(),
            tags: vec![self.schema.to_string()],
            version: self.version.clone(),
        }
    }

    pub fn into_receiver(self, id: EventReceiverId, created_at: DateTime<Utc>) -> EventReceiver {
        let fingerprint = fingerprint(&self.fingerprint_seed());
        EventReceiver {
            id,
            name: self.name,
            kind: self.kind,
            version: self.version,
            description: self.description,
            schema: self.schema,
            fingerprint,
            enabled: true,
            created_at,
        }
    }
}

/// A named set of receivers whose joint success is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReceiverGroup {
    pub id: EventReceiverGroupId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    pub description: String,
    pub enabled: bool,
    pub event_receiver_ids: Vec<EventReceiverId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventReceiverGroup {
    /// Returns true if the receiver is a member of this group.
    pub fn contains(&self, receiver_id: &EventReceiverId) -> bool {
        self.event_receiver_ids.contains(receiver_id)
    }
}

/// Input for creating an [`EventReceiverGroup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEventReceiverGroup {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub event_receiver_ids: Vec<EventReceiverId>,
}

impl NewEventReceiverGroup {
    /// Member ids with duplicates removed, first occurrence wins.
    pub fn members(&self) -> Vec<EventReceiverId> {
        let mut members = Vec::with_capacity(self.event_receiver_ids.len());
        for id in &self.event_receiver_ids {
            if !members.contains(id) {
                members.push(*id);
            }
        }
        members
    }

    /// Fingerprint input: the group type is the action, member ids the tags.
    pub fn fingerprint_seed(&self) -> FingerprintSeed {
        FingerprintSeed {
            action: self.kind.clone(),
            description: self.description.clone(),
            name: self.name.clone(),
            tags: self.members().iter().map(ToString::to_string).collect(),
            version: self.version.clone(),
        }
    }

    pub fn into_group(
        self,
        id: EventReceiverGroupId,
        created_at: DateTime<Utc>,
    ) -> EventReceiverGroup {
        let event_receiver_ids = self.members();
        EventReceiverGroup {
            id,
            name: self.name,
            kind: self.kind,
            version: self.version,
            description: self.description,
            enabled: true,
            event_receiver_ids,
            created_at,
            updated_at: created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_receiver() -> NewEventReceiver {
        NewEventReceiver {
            name: "build".to_string(),
            kind: "ci".to_string(),
            version: "1.0.0".to_string(),
            description: "build results".to_string(),
            schema: serde_json::json!({"type": "object"}),
        }
    }

    #[test]
    fn test_receiver_serializes_kind_as_type() {
        let receiver = new_receiver().into_receiver(EventReceiverId::new(), Utc::now());
        let json = serde_json::to_value(&receiver).unwrap();
        assert_eq!(json["type"], "ci");
        assert!(json.get("kind").is_none());
    }

    #[test]
    fn test_receiver_fingerprint_tracks_schema() {
        let a = new_receiver();
        let mut b = new_receiver();
        b.schema = serde_json::json!({"type": "array"});
        assert_ne!(
            fingerprint(&a.fingerprint_seed()),
            fingerprint(&b.fingerprint_seed())
        );
    }

    #[test]
    fn test_new_receiver_is_enabled() {
        let receiver = new_receiver().into_receiver(EventReceiverId::new(), Utc::now());
        assert!(receiver.enabled);
        assert_eq!(receiver.fingerprint.len(), 64);
    }

    #[test]
    fn test_group_members_deduplicated() {
        let r1 = EventReceiverId::new();
        let r2 = EventReceiverId::new();
        let group = NewEventReceiverGroup {
            name: "release".to_string(),
            kind: "gate".to_string(),
            version: "1".to_string(),
            description: String::new(),
            event_receiver_ids: vec![r1, r2, r1],
        };
        assert_eq!(group.members(), vec![r1, r2]);

        let created = group.into_group(EventReceiverGroupId::new(), Utc::now());
        assert_eq!(created.event_receiver_ids, vec![r1, r2]);
        assert!(created.contains(&r2));
        assert_eq!(created.created_at, created.updated_at);
    }

    #[test]
    fn test_group_fingerprint_tags_are_members_in_order() {
        let r1 = EventReceiverId::new();
        let r2 = EventReceiverId::new();
        let group = |ids: Vec<EventReceiverId>| NewEventReceiverGroup {
            name: "release".to_string(),
            kind: "gate".to_string(),
            version: "1".to_string(),
            description: String::new(),
            event_receiver_ids: ids,
        };

        let seed = group(vec![r1, r2, r1]).fingerprint_seed();
        assert_eq!(seed.action, "gate");
        assert_eq!(seed.tags, vec![r1.to_string(), r2.to_string()]);
        assert_ne!(
            fingerprint(&seed),
            fingerprint(&group(vec![r2, r1]).fingerprint_seed())
        );
    }

    #[test]
    fn test_new_event_defaults() {
        let receiver = EventReceiverId::new();
        let json = serde_json::json!({
            "name": "build.finished",
            "version": "1.2.3",
            "release": "2024.1",
            "platform_id": "linux",
            "package": "quorum",
            "success": true,
            "event_receiver_id": receiver.to_string(),
        });
        let new: NewEvent = serde_json::from_value(json).unwrap();
        assert_eq!(new.description, "");
        assert!(new.payload.is_null());
        assert_eq!(new.event_receiver_id, receiver);
    }
}
