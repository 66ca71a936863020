//! HTTP middleware components.
//!
//! Middleware run around the procedure handlers. Layer order matters: usage
//! recording wraps authorization so denied requests are recorded too.

/// API key authorization middleware
pub mod auth;
/// Per-request usage recording
pub mod usage;
