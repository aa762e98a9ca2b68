// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error taxonomy for the credentials vault.
//!
//! Every public operation returns [`Result<T>`]. Cipher and KDF failures are
//! surfaced unchanged so audit entries can record the real cause; access
//! checks short-circuit before any row I/O; `Conflict` covers both unique-
//! constraint violation paths: duplicate `(name, environment)` pairs, and
//! re-granted policies when the caller opted out of upsert semantics.

use thiserror::Error;

/// Result type alias for vault operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a decryption attempt failed to produce plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptionFailure {
    /// The AES-GCM authentication tag did not match — the envelope was
    /// tampered with or corrupted.
    Tampered,
    /// The envelope could not be parsed (missing/malformed fields).
    MalformedEnvelope,
    /// Decryption used the wrong master key.
    WrongMasterKey,
}

impl std::fmt::Display for DecryptionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Tampered => "tampered",
            Self::MalformedEnvelope => "malformed_envelope",
            Self::WrongMasterKey => "wrong_master_key",
        };
        f.write_str(s)
    }
}

/// Why an access check failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDenialReason {
    /// No policy row exists for `(credential, entity)`.
    NoPolicy,
    /// A policy exists but its `expires_at` is in the past.
    Expired,
    /// A policy exists but its `access_level` is below the required level.
    InsufficientLevel { granted: String, required: String },
    /// The credential is not `active`.
    CredentialNotActive,
}

impl std::fmt::Display for AccessDenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoPolicy => write!(f, "no access policy grants this entity access"),
            Self::Expired => write!(f, "access policy has expired"),
            Self::InsufficientLevel { granted, required } => write!(
                f,
                "access level '{}' is insufficient, '{}' required",
                granted, required
            ),
            Self::CredentialNotActive => write!(f, "credential is not active"),
        }
    }
}

/// Errors that can occur during vault operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption failed ({reason}): {detail}")]
    Decryption {
        reason: DecryptionFailure,
        detail: String,
    },

    #[error("access denied for entity {entity_id} ({entity_type}): {reason}")]
    AccessDenied {
        entity_id: String,
        entity_type: String,
        reason: AccessDenialReason,
    },

    #[error("credential not found: {0}")]
    CredentialNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Short, stable class name suitable for an audit entry's `error_message`
    /// prefix or for metrics cardinality.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Json(_) => "json",
            Self::Io(_) => "io",
            Self::Encryption(_) => "encryption",
            Self::Decryption { .. } => "decryption",
            Self::AccessDenied { .. } => "access_denied",
            Self::CredentialNotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation",
        }
    }
}
