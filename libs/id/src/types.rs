//! ID types for every entity the service creates.

use crate::define_id;

define_id!(
    /// Identifies a persisted event.
    EventId,
    "evt"
);

define_id!(
    /// Identifies an event receiver.
    EventReceiverId,
    "rcv"
);

define_id!(
    /// Identifies an event receiver group.
    EventReceiverGroupId,
    "grp"
);

define_id!(
    /// Identifies a single message published to the bus.
    MessageId,
    "msg"
);
