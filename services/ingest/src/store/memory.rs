//! In-memory [`EventStore`].

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use quorum_events::{
    Event, EventReceiver, EventReceiverGroup, NewEvent, NewEventReceiver, NewEventReceiverGroup,
};
use quorum_id::{EventId, EventReceiverGroupId, EventReceiverId};

use super::{EventStore, StoreError, StoreResult};

#[derive(Default)]
struct State {
    events: Vec<Event>,
    receivers: HashMap<EventReceiverId, EventReceiver>,
    /// Creation order.
    groups: Vec<EventReceiverGroup>,
}

impl State {
    fn has_success(&self, receiver_id: &EventReceiverId) -> bool {
        self.events
            .iter()
            .any(|e| e.success && e.event_receiver_id == *receiver_id)
    }
}

/// Keeps every entity in process memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn event_count(&self) -> usize {
        self.read().events.len()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn create_event(&self, event: NewEvent) -> StoreResult<Event> {
        let mut state = self.write();
        if !state.receivers.contains_key(&event.event_receiver_id) {
            return Err(StoreError::unknown_receiver(&event.event_receiver_id));
        }

        let event = event.into_event(EventId::new(), Utc::now());
        state.events.push(event.clone());
        Ok(event)
    }

    async fn create_event_receiver(&self, receiver: NewEventReceiver) -> StoreResult<EventReceiver> {
        let receiver = receiver.into_receiver(EventReceiverId::new(), Utc::now());
        self.write().receivers.insert(receiver.id, receiver.clone());
        Ok(receiver)
    }

    async fn create_event_receiver_group(
        &self,
        group: NewEventReceiverGroup,
    ) -> StoreResult<EventReceiverGroup> {
        let members = group.members();
        if members.is_empty() {
            return Err(StoreError::EmptyGroup);
        }

        let mut state = self.write();
        if let Some(unknown) = members.iter().find(|id| !state.receivers.contains_key(id)) {
            return Err(StoreError::unknown_receiver(unknown));
        }

        let group = group.into_group(EventReceiverGroupId::new(), Utc::now());
        state.groups.push(group.clone());
        Ok(group)
    }

    async fn find_event(&self, id: &EventId) -> StoreResult<Option<Event>> {
        Ok(self.read().events.iter().find(|e| e.id == *id).cloned())
    }

    async fn find_event_receiver(
        &self,
        id: &EventReceiverId,
    ) -> StoreResult<Option<EventReceiver>> {
        Ok(self.read().receivers.get(id).cloned())
    }

    async fn find_event_receiver_group(
        &self,
        id: &EventReceiverGroupId,
    ) -> StoreResult<Option<EventReceiverGroup>> {
        Ok(self.read().groups.iter().find(|g| g.id == *id).cloned())
    }

    async fn find_triggered_event_receiver_groups(
        &self,
        event: &Event,
    ) -> StoreResult<Vec<EventReceiverGroup>> {
        let state = self.read();
        Ok(state
            .groups
            .iter()
            .filter(|g| g.contains(&event.event_receiver_id))
            .filter(|g| {
                !g.event_receiver_ids.is_empty()
                    && g.event_receiver_ids.iter().all(|r| state.has_success(r))
            })
            .cloned()
            .collect())
    }
}
