//! Shared application state handed to middleware and handlers.

use std::sync::Arc;

use crate::services::{
    authorization::Authorizer, directory::MetadataStore, host_resolver::HostResolver,
    procedure_executor::ProcedureRunner, usage_recorder::UsageRecorder, vault::CredentialVault,
};

/// Cloned per request by axum, so everything heavy sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MetadataStore>,
    pub authorizer: Authorizer,
    pub vault: Arc<CredentialVault>,
    pub host_resolver: HostResolver,
    pub runner: Arc<dyn ProcedureRunner>,
    pub usage: UsageRecorder,
}
