//! Business logic services.
//!
//! Services contain the gateway's core logic separated from HTTP handlers:
//! authorization, host selection, credential handling, procedure execution
//! and usage recording.

pub mod authorization;
pub mod directory;
pub mod host_resolver;
pub mod key_issuer;
pub mod pool_registry;
pub mod procedure_executor;
pub mod ttl_store;
pub mod usage_recorder;
pub mod vault;
