//! quorum ingest service library.
//!
//! This crate primarily ships a `quorum-ingest` binary, but we expose a small
//! library surface to enable integration testing and reuse.

pub mod config;
pub mod db;
pub mod intake;
pub mod service;
pub mod store;
pub mod trigger;
