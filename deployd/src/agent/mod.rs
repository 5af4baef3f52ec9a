//! Execution agent
//!
//! The privileged half of deployd: it owns the web root, runs git and build
//! commands, and flips the `current` pointer. The orchestrator only ever
//! reaches it through the execution protocol.

pub mod build;
pub mod executor;
pub mod git;
pub mod jail;
pub mod options;
pub mod pipeline;
pub mod process;
pub mod release;
pub mod serve;
pub mod service;

pub use executor::Executor;
pub use options::AgentOptions;
