// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! C1 — Master Key Provider.
//!
//! Rather than treating the master key as a process-environment global, the
//! vault injects a [`MasterKeySource`] capability into the components that
//! need it (the cipher and KDF, via [`crate::store`]'s free functions), and
//! never writes to the process environment itself. `EnvMasterKeySource` is
//! the production implementation; `StaticMasterKeySource` backs tests and
//! the scoped swap performed by the master-key rotation path.

use crate::error::{Error, Result};
use zeroize::Zeroizing;

/// Length in bytes of the master key (AES-256).
pub const MASTER_KEY_LENGTH: usize = 32;

/// A source of the 32-byte master key.
///
/// Implementations must not cache the key beyond the scope of a single
/// `load` call's return value, and callers must not retain the returned
/// buffer beyond a single encrypt/decrypt invocation.
pub trait MasterKeySource: Send + Sync {
    /// Load the current master key.
    fn load(&self) -> Result<Zeroizing<[u8; MASTER_KEY_LENGTH]>>;
}

/// Reads the master key from `MASTER_ENCRYPTION_KEY` (64 hex characters) on
/// every call — deliberately uncached, so a scoped swap of the environment
/// (or of a [`StaticMasterKeySource`] standing in for it) is observed
/// immediately by the next encrypt/decrypt.
#[derive(Debug, Clone, Default)]
pub struct EnvMasterKeySource {
    var_name: String,
}

impl EnvMasterKeySource {
    /// Use the default `MASTER_ENCRYPTION_KEY` environment variable.
    pub fn new() -> Self {
        Self {
            var_name: "MASTER_ENCRYPTION_KEY".to_string(),
        }
    }

    /// Use a custom environment variable name (primarily for tests that
    /// can't share `MASTER_ENCRYPTION_KEY` across parallel test threads).
    pub fn with_var_name(var_name: impl Into<String>) -> Self {
        Self {
            var_name: var_name.into(),
        }
    }
}

impl MasterKeySource for EnvMasterKeySource {
    fn load(&self) -> Result<Zeroizing<[u8; MASTER_KEY_LENGTH]>> {
        let hex_key = std::env::var(&self.var_name).map_err(|_| {
            Error::Encryption(format!("master key environment variable {} is not set", self.var_name))
        })?;
        decode_master_key(&hex_key)
    }
}

/// A fixed master key, used by tests and by the master-key rotation path to
/// stand in for the process environment during a scoped swap.
#[derive(Clone)]
pub struct StaticMasterKeySource {
    key: Zeroizing<[u8; MASTER_KEY_LENGTH]>,
}

impl StaticMasterKeySource {
    /// Build a source from raw 32-byte key material.
    pub fn new(key: [u8; MASTER_KEY_LENGTH]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Build a source from a 64-character hex string.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let key = decode_master_key(hex_key)?;
        Ok(Self { key })
    }
}

impl MasterKeySource for StaticMasterKeySource {
    fn load(&self) -> Result<Zeroizing<[u8; MASTER_KEY_LENGTH]>> {
        Ok(self.key.clone())
    }
}

fn decode_master_key(hex_key: &str) -> Result<Zeroizing<[u8; MASTER_KEY_LENGTH]>> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| Error::Encryption(format!("master key is not valid hex: {e}")))?;
    if bytes.len() != MASTER_KEY_LENGTH {
        return Err(Error::Encryption(format!(
            "master key must decode to {MASTER_KEY_LENGTH} bytes, got {}",
            bytes.len()
        )));
    }
    let mut key = [0u8; MASTER_KEY_LENGTH];
    key.copy_from_slice(&bytes);
    Ok(Zeroizing::new(key))
}

/// SHA-256 of the master key, used only as an identifying fingerprint for
/// the Master-Key record — the key material itself is never stored.
pub fn master_key_fingerprint(key: &[u8; MASTER_KEY_LENGTH]) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(key);
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_source_rejects_missing_variable() {
        let source = EnvMasterKeySource::with_var_name("AH_VAULT_TEST_MISSING_KEY_VAR");
        let err = source.load().unwrap_err();
        assert_eq!(err.class(), "encryption");
    }

    #[test]
    fn env_source_rejects_bad_length() {
        // SAFETY: test runs single-threaded with a dedicated var name.
        unsafe {
            std::env::set_var("AH_VAULT_TEST_SHORT_KEY_VAR", "abcd");
        }
        let source = EnvMasterKeySource::with_var_name("AH_VAULT_TEST_SHORT_KEY_VAR");
        let err = source.load().unwrap_err();
        assert_eq!(err.class(), "encryption");
        unsafe {
            std::env::remove_var("AH_VAULT_TEST_SHORT_KEY_VAR");
        }
    }

    #[test]
    fn static_source_round_trips_hex() {
        let hex_key = "00".repeat(MASTER_KEY_LENGTH);
        let source = StaticMasterKeySource::from_hex(&hex_key).unwrap();
        let key = source.load().unwrap();
        assert_eq!(*key, [0u8; MASTER_KEY_LENGTH]);
    }

    #[test]
    fn fingerprint_is_stable_and_does_not_leak_bytes() {
        let key = [7u8; MASTER_KEY_LENGTH];
        let fp1 = master_key_fingerprint(&key);
        let fp2 = master_key_fingerprint(&key);
        assert_eq!(fp1, fp2);
        assert_ne!(fp1, hex::encode(key));
    }
}
