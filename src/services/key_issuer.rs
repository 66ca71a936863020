//! API key generation, hashing and verification.
//!
//! # Key Format
//!
//! Application keys are `identifier.secret`:
//! - `identifier`: `mk_` followed by 24 hex characters, stored in plaintext for lookup
//! - `secret`: 64 hex characters, never stored
//!
//! The stored hash is bcrypt over the hex SHA-256 digest of the full key string.
//! Pre-hashing keeps the bcrypt input at 64 bytes, under its 72-byte limit.
//!
//! Endpoint keys used on the public route are opaque `ek_` tokens stored as-is.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;
use crate::services::directory::MetadataStore;

pub const IDENTIFIER_PREFIX: &str = "mk_";
pub const ENDPOINT_KEY_PREFIX: &str = "ek_";

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("API key required")]
    MissingKey,

    #[error("API key must have the form identifier.secret")]
    MalformedKey,

    #[error("API key identifier not found")]
    KeyNotFound,

    #[error("API key hash mismatch")]
    KeyMismatch,

    #[error("API key hashing failed: {0}")]
    Hashing(String),
}

/// A freshly generated application key.
///
/// `full_key()` is shown to the client once; only the identifier and the hash
/// are persisted.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub identifier: String,
    pub secret: String,
}

impl GeneratedKey {
    pub fn full_key(&self) -> String {
        format!("{}.{}", self.identifier, self.secret)
    }
}

/// A presented key split into its two halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedKey<'a> {
    pub identifier: &'a str,
    pub secret: &'a str,
}

/// Issues and verifies API keys.
#[derive(Debug, Clone, Copy)]
pub struct ApiKeyIssuer {
    hash_cost: u32,
}

impl ApiKeyIssuer {
    pub fn new(hash_cost: u32) -> Self {
        Self { hash_cost }
    }

    /// Generate a new `identifier.secret` pair.
    pub fn generate(&self) -> GeneratedKey {
        let identifier_bytes: [u8; 12] = rand::random();
        let secret_bytes: [u8; 32] = rand::random();

        GeneratedKey {
            identifier: format!("{IDENTIFIER_PREFIX}{}", hex::encode(identifier_bytes)),
            secret: hex::encode(secret_bytes),
        }
    }

    /// Split a presented key on `.`.
    ///
    /// # Errors
    ///
    /// `MalformedKey` unless there are exactly two non-empty parts.
    pub fn parse(presented: &str) -> Result<ParsedKey<'_>, KeyError> {
        let mut parts = presented.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(identifier), Some(secret), None)
                if !identifier.is_empty() && !secret.is_empty() =>
            {
                Ok(ParsedKey { identifier, secret })
            }
            _ => Err(KeyError::MalformedKey),
        }
    }

    /// Produce the salted hash stored for `full_key`.
    ///
    /// Runs bcrypt on the blocking thread pool.
    pub async fn hash_key(&self, full_key: &str) -> Result<String, KeyError> {
        let digest = prehash(full_key);
        let cost = self.hash_cost;

        tokio::task::spawn_blocking(move || {
            bcrypt::hash(digest, cost).map_err(|e| KeyError::Hashing(e.to_string()))
        })
        .await
        .map_err(|e| KeyError::Hashing(format!("Task join error: {e}")))?
    }

    /// Check a presented key against its stored hash.
    ///
    /// # Errors
    ///
    /// `KeyMismatch` when the key does not match. A stored hash that bcrypt cannot
    /// parse is also reported as a mismatch, so corrupt records fail closed.
    pub async fn verify(&self, presented: &str, stored_hash: &str) -> Result<(), KeyError> {
        let digest = prehash(presented);
        let stored_hash = stored_hash.to_string();

        let matches = tokio::task::spawn_blocking(move || {
            bcrypt::verify(digest, &stored_hash).unwrap_or(false)
        })
        .await
        .map_err(|e| KeyError::Hashing(format!("Task join error: {e}")))?;

        if matches {
            Ok(())
        } else {
            Err(KeyError::KeyMismatch)
        }
    }

    /// Generate an opaque endpoint key.
    pub fn generate_endpoint_key(&self) -> String {
        let bytes: [u8; 32] = rand::random();
        format!("{ENDPOINT_KEY_PREFIX}{}", hex::encode(bytes))
    }

    /// Issue a new key for `endpoint_id`, deactivating the key it replaces.
    ///
    /// # Errors
    ///
    /// Propagates metadata store failures; the replacement is atomic, so on error
    /// the previous key stays active.
    pub async fn issue_endpoint_key(
        &self,
        store: &dyn MetadataStore,
        endpoint_id: Uuid,
    ) -> Result<String, AppError> {
        let key = self.generate_endpoint_key();
        store.replace_endpoint_key(endpoint_id, &key).await?;

        tracing::info!(%endpoint_id, "Issued endpoint API key");

        Ok(key)
    }
}

fn prehash(full_key: &str) -> String {
    hex::encode(Sha256::digest(full_key.as_bytes()))
}
