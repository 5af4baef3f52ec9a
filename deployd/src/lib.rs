//! deployd
//!
//! Self-hosted deployment orchestration: a durable task queue, a bounded
//! dispatcher, a live telemetry relay and a privilege-separated execution
//! agent that builds releases and swaps them in atomically.

pub mod agent;
pub mod app;
pub mod errors;
pub mod logs;
pub mod models;
pub mod protocol;
pub mod queue;
pub mod secrets;
pub mod server;
pub mod telemetry;
pub mod utils;
pub mod workers;
