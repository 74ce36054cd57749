//! Adapters between the pipeline and the outside world.

pub mod csv;
pub mod delegation_file;
pub mod rpc;
