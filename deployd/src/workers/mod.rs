//! Background workers of the orchestrator

pub mod dispatcher;
pub mod prober;
