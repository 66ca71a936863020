//! Data models representing database entities.
//!
//! Everything except [`usage`] is owned by the admin tooling and read-only here.

/// Endpoint-scoped API key model
pub mod api_key;
/// Application (tenant) model
pub mod application;
/// Role and permission model
pub mod role;
/// Service and connection models
pub mod service;
/// Usage audit record
pub mod usage;
