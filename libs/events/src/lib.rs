//! # quorum-events
//!
//! Domain model and wire format for the quorum event correlation service.
//!
//! ## Entities
//!
//! - [`EventReceiver`]: a named, versioned channel that events attach to
//! - [`EventReceiverGroup`]: a set of receivers whose joint success matters
//! - [`Event`]: an immutable fact recorded against one receiver
//!
//! ## Wire format
//!
//! Everything published to the bus is wrapped in a [`Message`], a
//! CloudEvents 1.0 compatible envelope carrying the created entity or the
//! "group complete" fact.
//!
//! ## Identity
//!
//! Receivers and groups carry a content [`fingerprint`] derived from their
//! definition. The field order and separator of the fingerprint input are a
//! compatibility contract: changing either changes every stored fingerprint.

mod error;
pub mod fingerprint;
mod message;
mod model;

pub use error::EventError;
pub use fingerprint::{fingerprint, FingerprintSeed};
pub use message::*;
pub use model::*;
