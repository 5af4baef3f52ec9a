//! Credential handling: encryption at rest, redaction in memory

pub mod codec;
pub mod env;

pub use codec::SecretCodec;
pub use env::DeployEnv;
