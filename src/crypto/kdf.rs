// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! C2 — KDF Engine.
//!
//! Derives a 32-byte key from `(master key, salt, kdf config)`. Two families
//! are supported so a credential encrypted under one can be decrypted and,
//! at its next rotation, re-encrypted under the other — this is the
//! "algorithmic agility" the crate exists to provide.

use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use hmac::Hmac;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use zeroize::Zeroizing;

/// Length in bytes of every derived key (AES-256).
pub const KEY_LENGTH: usize = 32;

/// Minimum accepted salt length, per spec §4.2 ("salt >= 16 bytes").
pub const MIN_SALT_LENGTH: usize = 16;

/// Which KDF family produced (or should produce) a given envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KdfType {
    Pbkdf2,
    Argon2id,
}

impl KdfType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pbkdf2 => "pbkdf2",
            Self::Argon2id => "argon2id",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pbkdf2" => Some(Self::Pbkdf2),
            "argon2id" => Some(Self::Argon2id),
            _ => None,
        }
    }

    /// Default KDF for new credentials: `DEFAULT_KDF_TYPE` env override, or
    /// Argon2id if unset. Per spec §4.2 selection policy.
    pub fn from_env_default() -> Self {
        std::env::var("DEFAULT_KDF_TYPE")
            .ok()
            .and_then(|v| Self::parse(&v.to_lowercase()))
            .unwrap_or(Self::Argon2id)
    }
}

/// Hash function used under PBKDF2-HMAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pbkdf2Hash {
    Sha256,
    Sha512,
}

/// Parameters carried in an envelope's `kdfParameters` field. Only the
/// fields relevant to the envelope's `kdf_type` are populated; the others
/// are `None`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KdfParameters {
    // PBKDF2 parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<Pbkdf2Hash>,
    // Argon2id parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_kib: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_cost: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u32>,
}

/// PBKDF2-HMAC-SHA-256 default, per spec §4.2.
pub const PBKDF2_DEFAULT_ITERATIONS: u32 = 100_000;

/// Argon2id defaults, per spec §4.2.
pub const ARGON2_DEFAULT_MEMORY_KIB: u32 = 64 * 1024;
pub const ARGON2_DEFAULT_TIME_COST: u32 = 3;
pub const ARGON2_DEFAULT_PARALLELISM: u32 = 4;

impl KdfParameters {
    /// Default PBKDF2 parameters: 100,000 rounds of HMAC-SHA-256.
    pub fn pbkdf2_defaults() -> Self {
        Self {
            iterations: Some(PBKDF2_DEFAULT_ITERATIONS),
            hash: Some(Pbkdf2Hash::Sha256),
            memory_kib: None,
            time_cost: None,
            parallelism: None,
        }
    }

    /// Default Argon2id parameters: 64 MiB, t=3, p=4.
    pub fn argon2id_defaults() -> Self {
        Self {
            iterations: None,
            hash: None,
            memory_kib: Some(ARGON2_DEFAULT_MEMORY_KIB),
            time_cost: Some(ARGON2_DEFAULT_TIME_COST),
            parallelism: Some(ARGON2_DEFAULT_PARALLELISM),
        }
    }

    /// Defaults for a given KDF type.
    pub fn defaults_for(kdf_type: KdfType) -> Self {
        match kdf_type {
            KdfType::Pbkdf2 => Self::pbkdf2_defaults(),
            KdfType::Argon2id => Self::argon2id_defaults(),
        }
    }
}

/// The tunables a deployment can override: which KDF family new envelopes
/// use by default, and the parameters each family derives with when the
/// caller doesn't pin its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VaultConfig {
    pub default_kdf_type: KdfType,
    pub pbkdf2: KdfParameters,
    pub argon2id: KdfParameters,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            default_kdf_type: KdfType::Argon2id,
            pbkdf2: KdfParameters::pbkdf2_defaults(),
            argon2id: KdfParameters::argon2id_defaults(),
        }
    }
}

impl VaultConfig {
    /// Resolve from the environment: `DEFAULT_KDF_TYPE` picks the default
    /// family; the parameters themselves are not currently
    /// environment-tunable and always come from the family's compiled-in
    /// defaults.
    pub fn from_env() -> Self {
        Self {
            default_kdf_type: KdfType::from_env_default(),
            ..Self::default()
        }
    }

    /// The [`KdfParameters`] this config prescribes for `kdf_type`.
    pub fn parameters_for(&self, kdf_type: KdfType) -> &KdfParameters {
        match kdf_type {
            KdfType::Pbkdf2 => &self.pbkdf2,
            KdfType::Argon2id => &self.argon2id,
        }
    }
}

/// Derive a 32-byte key from `(master_key, salt, kdf_type, parameters)`.
pub fn derive_key(
    master_key: &[u8],
    salt: &[u8],
    kdf_type: KdfType,
    parameters: &KdfParameters,
) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
    if salt.len() < MIN_SALT_LENGTH {
        return Err(Error::Encryption(format!(
            "salt must be at least {MIN_SALT_LENGTH} bytes, got {}",
            salt.len()
        )));
    }

    match kdf_type {
        KdfType::Pbkdf2 => derive_pbkdf2(master_key, salt, parameters),
        KdfType::Argon2id => derive_argon2id(master_key, salt, parameters),
    }
}

fn derive_pbkdf2(
    master_key: &[u8],
    salt: &[u8],
    parameters: &KdfParameters,
) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
    let iterations = parameters.iterations.unwrap_or(PBKDF2_DEFAULT_ITERATIONS);
    let hash = parameters.hash.unwrap_or(Pbkdf2Hash::Sha256);

    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    match hash {
        Pbkdf2Hash::Sha256 => {
            pbkdf2::pbkdf2::<Hmac<Sha256>>(master_key, salt, iterations, key.as_mut())
                .map_err(|e| Error::Encryption(format!("pbkdf2 derivation failed: {e}")))?;
        }
        Pbkdf2Hash::Sha512 => {
            pbkdf2::pbkdf2::<Hmac<Sha512>>(master_key, salt, iterations, key.as_mut())
                .map_err(|e| Error::Encryption(format!("pbkdf2 derivation failed: {e}")))?;
        }
    }
    Ok(key)
}

fn derive_argon2id(
    master_key: &[u8],
    salt: &[u8],
    parameters: &KdfParameters,
) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
    let memory_kib = parameters.memory_kib.unwrap_or(ARGON2_DEFAULT_MEMORY_KIB);
    let time_cost = parameters.time_cost.unwrap_or(ARGON2_DEFAULT_TIME_COST);
    let parallelism = parameters
        .parallelism
        .unwrap_or(ARGON2_DEFAULT_PARALLELISM);

    let params = Params::new(memory_kib, time_cost, parallelism, Some(KEY_LENGTH))
        .map_err(|e| Error::Encryption(format!("invalid argon2 parameters: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    argon2
        .hash_password_into(master_key, salt, key.as_mut())
        .map_err(|e| Error::Encryption(format!("argon2 derivation failed: {e}")))?;
    Ok(key)
}

/// True iff a credential derived under `current` should be re-encrypted
/// under `target` at its next rotation. Per spec §4.2 upgrade rule: only
/// pbkdf2 -> argon2id is a recommended upgrade.
pub fn should_upgrade(current: KdfType, target: KdfType) -> bool {
    current == KdfType::Pbkdf2 && target == KdfType::Argon2id
}
