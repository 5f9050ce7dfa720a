//! # quorum-id
//!
//! Typed identifiers for the quorum event correlation service.
//!
//! Every entity the store creates (events, receivers, receiver groups) and
//! every message published to the bus carries a prefixed ULID:
//!
//! - `evt_01HV4Z2WQXKJNM8GPQY6VBKC3D` for events
//! - `rcv_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for event receivers
//! - `grp_01HV4Z4NYPLTRS0JTUA8XDME5F` for event receiver groups
//! - `msg_01HV4Z5PZQMVST1KVVB9YENF6G` for bus messages
//!
//! The prefix keeps ids of different kinds from being mixed up, the ULID
//! keeps them sortable by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
