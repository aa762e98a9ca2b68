// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! C3 — Cipher.
//!
//! AES-256-GCM authenticated encryption plus the self-describing envelope
//! defined in spec §3/§6. The envelope carries everything needed to decrypt
//! given only the master key: no external catalog lookup required.
//!
//! Envelope wire format (the `encrypted_value` column, stored as JSON):
//! `{"encryptedValue", "iv", "authTag", "salt", "kdfType"?, "kdfParameters"?, "kdfVersion"?}`.
//! Absence of `kdfType` means legacy PBKDF2-HMAC-SHA256 with its default
//! parameters (spec §3, §6, §8 "envelope legacy tolerance").

use crate::crypto::kdf::{self, KdfParameters, KdfType};
use crate::error::{DecryptionFailure, Error, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Length in bytes of the AES-GCM nonce (96-bit, the NIST-recommended size).
pub const NONCE_LENGTH: usize = 12;
/// Length in bytes of the freshly-drawn salt for new envelopes.
pub const SALT_LENGTH: usize = 16;
/// Current envelope format revision, recorded in `kdfVersion` for forward
/// compatibility with future KDF metadata changes.
pub const KDF_VERSION: &str = "2.0";

/// Self-describing encryption envelope, serialized as the `encrypted_value`
/// column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "encryptedValue")]
    pub ciphertext: String,
    pub iv: String,
    #[serde(rename = "authTag")]
    pub auth_tag: String,
    pub salt: String,
    #[serde(rename = "kdfType", skip_serializing_if = "Option::is_none")]
    pub kdf_type: Option<KdfType>,
    #[serde(rename = "kdfParameters", skip_serializing_if = "Option::is_none")]
    pub kdf_parameters: Option<KdfParameters>,
    #[serde(rename = "kdfVersion", skip_serializing_if = "Option::is_none")]
    pub kdf_version: Option<String>,
}

impl Envelope {
    /// KDF type this envelope was encrypted under. Absent `kdfType` implies
    /// PBKDF2-HMAC-SHA256, for envelopes written before KDF agility existed.
    pub fn effective_kdf_type(&self) -> KdfType {
        self.kdf_type.unwrap_or(KdfType::Pbkdf2)
    }

    /// KDF parameters this envelope was encrypted under, falling back to
    /// the effective KDF type's defaults when absent.
    pub fn effective_kdf_parameters(&self) -> KdfParameters {
        self.kdf_parameters
            .clone()
            .unwrap_or_else(|| KdfParameters::defaults_for(self.effective_kdf_type()))
    }

    /// Serialize to the JSON form stored in the `encrypted_value` column.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from the JSON form stored in the `encrypted_value` column.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Decryption {
            reason: DecryptionFailure::MalformedEnvelope,
            detail: e.to_string(),
        })
    }
}

/// Encrypt a credential value (already JSON-encoded plaintext) and produce a
/// self-describing envelope. `kdf_type` picks the KDF family explicitly;
/// `None` uses [`KdfType::from_env_default`].
pub fn encrypt(
    plaintext_json: &Value,
    master_key: &[u8],
    kdf_type: Option<KdfType>,
) -> Result<Envelope> {
    let kdf_type = kdf_type.unwrap_or_else(KdfType::from_env_default);
    let kdf_parameters = KdfParameters::defaults_for(kdf_type);

    let mut salt = vec![0u8; SALT_LENGTH];
    OsRng.fill_bytes(&mut salt);

    let key = kdf::derive_key(master_key, &salt, kdf_type, &kdf_parameters)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|e| Error::Encryption(format!("invalid key material: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let plaintext = serde_json::to_vec(plaintext_json)?;
    let sealed = cipher
        .encrypt(nonce, Payload { msg: &plaintext, aad: &[] })
        .map_err(|e| Error::Encryption(format!("aes-gcm encryption failed: {e}")))?;

    // aes-gcm appends the 16-byte tag to the ciphertext; split it out so the
    // envelope carries the tag as its own field per spec §3.
    let tag_offset = sealed.len() - 16;
    let (ciphertext, auth_tag) = sealed.split_at(tag_offset);

    Ok(Envelope {
        ciphertext: STANDARD.encode(ciphertext),
        iv: STANDARD.encode(nonce_bytes),
        auth_tag: STANDARD.encode(auth_tag),
        salt: STANDARD.encode(&salt),
        kdf_type: Some(kdf_type),
        kdf_parameters: Some(kdf_parameters),
        kdf_version: Some(KDF_VERSION.to_string()),
    })
}

/// Decrypt an envelope with the given master key, returning the parsed
/// plaintext JSON value.
pub fn decrypt(envelope: &Envelope, master_key: &[u8]) -> Result<Value> {
    let kdf_type = envelope.effective_kdf_type();
    let kdf_parameters = envelope.effective_kdf_parameters();

    let salt = STANDARD.decode(&envelope.salt).map_err(|e| Error::Decryption {
        reason: DecryptionFailure::MalformedEnvelope,
        detail: format!("invalid base64 salt: {e}"),
    })?;
    let nonce_bytes = STANDARD.decode(&envelope.iv).map_err(|e| Error::Decryption {
        reason: DecryptionFailure::MalformedEnvelope,
        detail: format!("invalid base64 iv: {e}"),
    })?;
    if nonce_bytes.len() != NONCE_LENGTH {
        return Err(Error::Decryption {
            reason: DecryptionFailure::MalformedEnvelope,
            detail: format!("nonce must be {NONCE_LENGTH} bytes, got {}", nonce_bytes.len()),
        });
    }
    let ciphertext = STANDARD.decode(&envelope.ciphertext).map_err(|e| Error::Decryption {
        reason: DecryptionFailure::MalformedEnvelope,
        detail: format!("invalid base64 ciphertext: {e}"),
    })?;
    let auth_tag = STANDARD.decode(&envelope.auth_tag).map_err(|e| Error::Decryption {
        reason: DecryptionFailure::MalformedEnvelope,
        detail: format!("invalid base64 auth tag: {e}"),
    })?;

    let key = kdf::derive_key(master_key, &salt, kdf_type, &kdf_parameters).map_err(|e| {
        Error::Decryption {
            reason: DecryptionFailure::MalformedEnvelope,
            detail: e.to_string(),
        }
    })?;
    let cipher = Aes256Gcm::new_from_slice(key.as_ref()).map_err(|e| Error::Decryption {
        reason: DecryptionFailure::MalformedEnvelope,
        detail: format!("invalid key material: {e}"),
    })?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    // The auth tag is installed on the decryptor before decrypting by
    // reassembling ciphertext||tag, which is the layout `Aead::decrypt`
    // expects and verifies before releasing any plaintext.
    let mut sealed = ciphertext;
    sealed.extend_from_slice(&auth_tag);

    let plaintext = cipher
        .decrypt(nonce, Payload { msg: &sealed, aad: &[] })
        .map_err(|_| Error::Decryption {
            reason: DecryptionFailure::Tampered,
            detail: "authentication tag mismatch".to_string(),
        })?;

    serde_json::from_slice(&plaintext).map_err(|e| Error::Decryption {
        reason: DecryptionFailure::MalformedEnvelope,
        detail: e.to_string(),
    })
}

/// Re-encrypt an envelope's plaintext under a new master key (and, since
/// rotation always uses the currently-default KDF, potentially a new KDF
/// too). Used by the master-key rotation scenario in spec §8.
pub fn re_encrypt_with_new_key(
    envelope: &Envelope,
    old_master_key: &[u8],
    new_master_key: &[u8],
) -> Result<Envelope> {
    let plaintext = decrypt(envelope, old_master_key)?;
    encrypt(&plaintext, new_master_key, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn round_trips_for_both_kdf_families() {
        let value = json!({"key": "sk-live-abc", "secret": "s3cr3t"});
        for kdf_type in [KdfType::Pbkdf2, KdfType::Argon2id] {
            let envelope = encrypt(&value, &key(1), Some(kdf_type)).unwrap();
            let decrypted = decrypt(&envelope, &key(1)).unwrap();
            assert_eq!(decrypted, value);
        }
    }

    #[test]
    fn two_encryptions_never_reuse_iv_salt_or_ciphertext() {
        let value = json!({"key": "same-plaintext"});
        let a = encrypt(&value, &key(2), Some(KdfType::Argon2id)).unwrap();
        let b = encrypt(&value, &key(2), Some(KdfType::Argon2id)).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn envelope_without_kdf_type_is_treated_as_legacy_pbkdf2() {
        let value = json!({"key": "legacy"});
        let mut envelope = encrypt(&value, &key(3), Some(KdfType::Pbkdf2)).unwrap();
        envelope.kdf_type = None;
        envelope.kdf_parameters = None;
        envelope.kdf_version = None;

        let decrypted = decrypt(&envelope, &key(3)).unwrap();
        assert_eq!(decrypted, value);
    }

    #[test]
    fn tamper_in_any_field_is_detected() {
        let value = json!({"key": "tamper-me"});
        let base = encrypt(&value, &key(4), Some(KdfType::Argon2id)).unwrap();

        let mut tampered_ciphertext = base.clone();
        flip_one_byte(&mut tampered_ciphertext.ciphertext);
        assert!(matches!(
            decrypt(&tampered_ciphertext, &key(4)).unwrap_err(),
            Error::Decryption { reason: DecryptionFailure::Tampered, .. }
        ));

        let mut tampered_tag = base.clone();
        flip_one_byte(&mut tampered_tag.auth_tag);
        assert!(matches!(
            decrypt(&tampered_tag, &key(4)).unwrap_err(),
            Error::Decryption { reason: DecryptionFailure::Tampered, .. }
        ));

        let mut tampered_iv = base.clone();
        flip_one_byte(&mut tampered_iv.iv);
        assert!(decrypt(&tampered_iv, &key(4)).is_err());

        let mut tampered_salt = base;
        flip_one_byte(&mut tampered_salt.salt);
        assert!(decrypt(&tampered_salt, &key(4)).is_err());
    }

    fn flip_one_byte(base64_field: &mut String) {
        let mut bytes = STANDARD.decode(&base64_field).unwrap();
        bytes[0] ^= 0xFF;
        *base64_field = STANDARD.encode(bytes);
    }

    #[test]
    fn rotation_moves_an_envelope_to_a_new_master_key() {
        let value = json!({"key": "rotate-me"});
        let envelope = encrypt(&value, &key(5), Some(KdfType::Argon2id)).unwrap();

        let rotated = re_encrypt_with_new_key(&envelope, &key(5), &key(6)).unwrap();
        assert_eq!(decrypt(&rotated, &key(6)).unwrap(), value);
        assert!(decrypt(&rotated, &key(5)).is_err());
    }

    #[test]
    fn kdf_migration_changes_the_envelopes_kdf_type() {
        let value = json!({"key": "migrate-me"});
        let under_pbkdf2 = encrypt(&value, &key(7), Some(KdfType::Pbkdf2)).unwrap();
        assert_eq!(under_pbkdf2.kdf_type, Some(KdfType::Pbkdf2));

        let plaintext = decrypt(&under_pbkdf2, &key(7)).unwrap();
        let re_encrypted = encrypt(&plaintext, &key(7), Some(KdfType::Argon2id)).unwrap();
        assert_eq!(re_encrypted.kdf_type, Some(KdfType::Argon2id));
        assert_eq!(decrypt(&re_encrypted, &key(7)).unwrap(), value);
    }
}
