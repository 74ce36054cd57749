//! Domain types and the ports the pipeline is wired through.

pub mod address;
pub mod amount;
pub mod call;
pub mod delegation;
pub mod job;
pub mod network;
pub mod outcome;
pub mod ports;
pub mod redemption;
pub mod subscription;
