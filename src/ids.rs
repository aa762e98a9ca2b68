// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Opaque identifier minting.
//!
//! IDs are `<prefix>_<ms>_<16 hex>` (or `key_<ms>` for Master-Key records,
//! which are one-per-key-material and don't need the random suffix).
//! Uniqueness comes from the random suffix, not the timestamp: two IDs
//! minted within the same millisecond still collide only with negligible
//! probability, and a collision simply surfaces as an ordinary persistence
//! error on insert.

use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis()
}

fn random_suffix() -> String {
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn mint(prefix: &str) -> String {
    format!("{prefix}_{}_{}", now_millis(), random_suffix())
}

/// Mint a new `cred_<ms>_<16 hex>` credential ID.
pub fn new_credential_id() -> String {
    mint("cred")
}

/// Mint a new `policy_<ms>_<16 hex>` access-policy ID.
pub fn new_policy_id() -> String {
    mint("policy")
}

/// Mint a new `audit_<ms>_<16 hex>` audit-entry ID.
pub fn new_audit_id() -> String {
    mint("audit")
}

/// Mint a new `key_<ms>` master-key record ID.
pub fn new_key_id() -> String {
    format!("key_{}", now_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_the_right_prefix() {
        assert!(new_credential_id().starts_with("cred_"));
        assert!(new_policy_id().starts_with("policy_"));
        assert!(new_audit_id().starts_with("audit_"));
        assert!(new_key_id().starts_with("key_"));
    }

    #[test]
    fn minted_ids_are_unique() {
        let ids: std::collections::HashSet<_> =
            (0..1000).map(|_| new_credential_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
