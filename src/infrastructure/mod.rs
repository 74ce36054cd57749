//! Adapters implementing the domain ports.
//!
//! - `in_memory` and `rocksdb` hold the Event Recorder and delegations.
//! - `simulated` and `gateway` are the execution backends.

pub mod gateway;
pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod simulated;
