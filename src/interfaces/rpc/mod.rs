//! The `Redeem` RPC: JSON over HTTP.

pub mod client;
pub mod server;
