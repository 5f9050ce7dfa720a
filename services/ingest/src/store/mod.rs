//! Persistence boundary for events, receivers and receiver groups.
//!
//! The service only talks to storage through [`EventStore`]. Two
//! implementations ship with the crate:
//! - [`PgStore`](crate::db::PgStore) backed by Postgres
//! - [`MemoryStore`] for tests and broker-less local runs

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use quorum_events::{
    Event, EventReceiver, EventReceiverGroup, NewEvent, NewEventReceiver, NewEventReceiverGroup,
};
use quorum_id::{EventId, EventReceiverGroupId, EventReceiverId};
use thiserror::Error;

use crate::db::DbError;

/// Errors returned by an [`EventStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A receiver group was created without members.
    #[error("event receiver group must reference at least one event receiver")]
    EmptyGroup,

    /// A stored row could not be mapped back to an entity.
    #[error("invalid stored {entity}: {reason}")]
    Corrupt { entity: &'static str, reason: String },

    #[error(transparent)]
    Db(#[from] DbError),
}

impl StoreError {
    pub fn unknown_receiver(id: &EventReceiverId) -> Self {
        StoreError::NotFound {
            entity: "event receiver",
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage for the quorum domain model.
///
/// Every `create_*` assigns a fresh identifier and creation timestamp.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn create_event(&self, event: NewEvent) -> StoreResult<Event>;

    async fn create_event_receiver(&self, receiver: NewEventReceiver) -> StoreResult<EventReceiver>;

    /// Rejects empty membership and unknown member receivers. Duplicate
    /// members are collapsed.
    async fn create_event_receiver_group(
        &self,
        group: NewEventReceiverGroup,
    ) -> StoreResult<EventReceiverGroup>;

    async fn find_event(&self, id: &EventId) -> StoreResult<Option<Event>>;

    async fn find_event_receiver(&self, id: &EventReceiverId)
        -> StoreResult<Option<EventReceiver>>;

    async fn find_event_receiver_group(
        &self,
        id: &EventReceiverGroupId,
    ) -> StoreResult<Option<EventReceiverGroup>>;

    /// Groups that contain `event`'s receiver and whose every member has at
    /// least one successful event, in creation order.
    async fn find_triggered_event_receiver_groups(
        &self,
        event: &Event,
    ) -> StoreResult<Vec<EventReceiverGroup>>;
}
