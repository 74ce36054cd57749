//! Application layer: the settlement state machine run by the Execution
//! Service and the bounded processor that feeds it from the Job Source.

pub mod processor;
pub mod settlement;
