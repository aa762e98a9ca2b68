// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Embedded, policy-gated, audited secret store.
//!
//! [`Vault`] is the single public entry point: it owns one `rusqlite`
//! connection and an injected [`crypto::MasterKeySource`], and composes the
//! crate's six components (master key provider, KDF engine, cipher,
//! credential store, access controller, audit logger) in the order the
//! spec's data flow requires — access check, then data access, then
//! cipher, then audit — for every operation that touches a credential.

pub mod access;
pub mod audit;
pub mod crypto;
pub mod error;
pub mod ids;
pub mod schema;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    AccessLevel, AccessPolicy, AuditEntry, CredentialMetadata, CredentialStatus, CredentialType,
    CredentialValue, DecryptedCredential, EntityType,
};

use crate::crypto::kdf::KdfType;
use crate::crypto::master_key::MasterKeySource;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Caller-supplied context for [`Vault::retrieve`], forwarded into the
/// resulting audit entry.
pub type RetrieveOptions<'a> = store::RetrieveOptions<'a>;
/// Narrowing filters for [`Vault::list`].
pub type ListFilters<'a> = store::ListFilters<'a>;
/// Narrowing filters for [`Vault::audit_query`].
pub type AuditQuery<'a> = audit::AuditQuery<'a>;
/// Aggregate counters returned by [`Vault::audit_summary`].
pub type AuditSummary = audit::AuditSummary;

/// The credentials vault. `Send + Sync`: the connection lives behind a
/// `Mutex` (per spec §5's "concurrent operations are serialized by the
/// underlying store's transactional semantics" — `rusqlite::Connection` is
/// not `Sync` on its own, so the mutex supplies that serialization without
/// pulling in a connection-pool crate).
pub struct Vault {
    conn: Mutex<Connection>,
    master_key: Mutex<Arc<dyn MasterKeySource>>,
}

impl Vault {
    /// Open (creating if absent) a SQLite file at `path` and initialize the
    /// schema if needed.
    pub fn open(path: impl AsRef<Path>, master_key_source: Arc<dyn MasterKeySource>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, master_key_source)
    }

    /// Open an in-memory database. Used by tests and by short-lived
    /// callers that don't need durability.
    pub fn open_in_memory(master_key_source: Arc<dyn MasterKeySource>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, master_key_source)
    }

    fn from_connection(conn: Connection, master_key_source: Arc<dyn MasterKeySource>) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            master_key: Mutex::new(master_key_source),
        })
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_master_key_source(&self) -> Arc<dyn MasterKeySource> {
        self.master_key
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Store a new credential. See [`store::store`].
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &self,
        name: &str,
        environment: &str,
        service: &str,
        value: &CredentialValue,
        metadata: Map<String, Value>,
        kdf_type: Option<KdfType>,
        created_by: Option<&str>,
    ) -> Result<String> {
        let conn = self.lock_conn();
        let source = self.current_master_key_source();
        store::store(&conn, source.as_ref(), name, environment, service, value, metadata, kdf_type, created_by)
    }

    /// Retrieve a credential's decrypted value, enforcing read access.
    pub fn retrieve(
        &self,
        credential_id: &str,
        entity_id: &str,
        entity_type: EntityType,
        opts: RetrieveOptions<'_>,
    ) -> Result<DecryptedCredential> {
        let conn = self.lock_conn();
        let source = self.current_master_key_source();
        store::retrieve(&conn, source.as_ref(), credential_id, entity_id, entity_type, opts)
    }

    /// List credential metadata matching `filters`.
    pub fn list(&self, filters: &ListFilters<'_>) -> Result<Vec<CredentialMetadata>> {
        let conn = self.lock_conn();
        store::list(&conn, filters)
    }

    /// Replace a credential's plaintext value and re-encrypt it.
    pub fn rotate(&self, credential_id: &str, new_value: &CredentialValue, rotated_by: Option<&str>) -> Result<()> {
        let conn = self.lock_conn();
        let source = self.current_master_key_source();
        store::rotate(&conn, source.as_ref(), credential_id, new_value, rotated_by)
    }

    /// Soft-delete (revoke) a credential.
    pub fn revoke(&self, credential_id: &str, reason: Option<&str>, revoked_by: Option<&str>) -> Result<()> {
        let conn = self.lock_conn();
        store::revoke(&conn, credential_id, reason, revoked_by)
    }

    /// Hard-delete a credential, cascading its policies and audit history.
    pub fn delete(&self, credential_id: &str) -> Result<()> {
        let conn = self.lock_conn();
        store::delete(&conn, credential_id)
    }

    /// `true` iff the credential exists and is `active`.
    pub fn is_valid(&self, credential_id: &str) -> Result<bool> {
        let conn = self.lock_conn();
        store::is_valid(&conn, credential_id)
    }

    /// Look up a credential's metadata by `(name, environment)`.
    pub fn get_by_name(&self, name: &str, environment: &str) -> Result<Option<CredentialMetadata>> {
        let conn = self.lock_conn();
        store::get_by_name(&conn, name, environment)
    }

    /// Count credentials matching `filters`.
    pub fn count(&self, filters: &ListFilters<'_>) -> Result<i64> {
        let conn = self.lock_conn();
        store::count(&conn, filters)
    }

    /// Grant (or replace) one entity's access level on one credential.
    #[allow(clippy::too_many_arguments)]
    pub fn grant_access(
        &self,
        credential_id: &str,
        entity_id: &str,
        entity_type: EntityType,
        access_level: AccessLevel,
        granted_by: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
        reason: Option<&str>,
    ) -> Result<String> {
        let conn = self.lock_conn();
        access::grant_access(&conn, credential_id, entity_id, entity_type, access_level, granted_by, expires_at, reason)
    }

    /// Revoke one entity's access to one credential.
    pub fn revoke_access(&self, credential_id: &str, entity_id: &str, entity_type: EntityType, revoked_by: Option<&str>) -> Result<bool> {
        let conn = self.lock_conn();
        access::revoke_access(&conn, credential_id, entity_id, entity_type, revoked_by)
    }

    /// Delete every policy granted on a credential.
    pub fn revoke_all_access(&self, credential_id: &str) -> Result<usize> {
        let conn = self.lock_conn();
        access::revoke_all_access(&conn, credential_id)
    }

    /// Pure predicate: does the entity hold at least `required` access?
    pub fn has_access(&self, credential_id: &str, entity_id: &str, entity_type: EntityType, required: AccessLevel) -> Result<bool> {
        let conn = self.lock_conn();
        access::has_access(&conn, credential_id, entity_id, entity_type, required)
    }

    /// Enforce `required` access, returning [`Error::AccessDenied`] on failure.
    pub fn assert_access(&self, credential_id: &str, entity_id: &str, entity_type: EntityType, required: AccessLevel) -> Result<()> {
        let conn = self.lock_conn();
        access::assert_access(&conn, credential_id, entity_id, entity_type, required)
    }

    /// All policies granted on a credential.
    pub fn get_access_policies(&self, credential_id: &str) -> Result<Vec<AccessPolicy>> {
        let conn = self.lock_conn();
        access::get_access_policies(&conn, credential_id)
    }

    /// All active credentials an entity currently holds access to.
    pub fn get_accessible_credentials(&self, entity_id: &str, entity_type: EntityType) -> Result<Vec<CredentialMetadata>> {
        let conn = self.lock_conn();
        access::get_accessible_credentials(&conn, entity_id, entity_type)
    }

    /// Replace the access level of an existing policy.
    pub fn update_access_level(&self, credential_id: &str, entity_id: &str, entity_type: EntityType, new_level: AccessLevel, updated_by: Option<&str>) -> Result<bool> {
        let conn = self.lock_conn();
        access::update_access_level(&conn, credential_id, entity_id, entity_type, new_level, updated_by)
    }

    /// Delete every policy whose `expires_at` has passed.
    pub fn cleanup_expired_policies(&self) -> Result<usize> {
        let conn = self.lock_conn();
        access::cleanup_expired_policies(&conn)
    }

    /// Policies expiring within the next `days` days.
    pub fn get_policies_expiring_soon(&self, days: i64) -> Result<Vec<AccessPolicy>> {
        let conn = self.lock_conn();
        access::get_policies_expiring_soon(&conn, days)
    }

    /// Parameterized audit query, ordered by `timestamp DESC`.
    pub fn audit_query(&self, filter: &AuditQuery<'_>) -> Result<Vec<AuditEntry>> {
        let conn = self.lock_conn();
        audit::query(&conn, filter)
    }

    /// Totals, per-credential/entity/action counts, and failed-access count.
    pub fn audit_summary(&self) -> Result<AuditSummary> {
        let conn = self.lock_conn();
        audit::summary(&conn)
    }

    /// Delete audit entries older than `older_than_days`.
    pub fn cleanup_old_audit_entries(&self, older_than_days: i64) -> Result<usize> {
        let conn = self.lock_conn();
        audit::cleanup_old_entries(&conn, older_than_days)
    }

    /// Re-encrypt every stored credential under `new_source`, then make it
    /// the vault's current master key source.
    ///
    /// The in-progress swap is guarded: on any failure (including a panic
    /// unwinding through this call) the vault's master key source is left
    /// exactly as it was before the call, per the scoped-restore contract
    /// in the crate's design notes. Only a full, successful pass over every
    /// credential commits the new source.
    pub fn rotate_master_key(&self, new_source: Arc<dyn MasterKeySource>) -> Result<()> {
        let conn = self.lock_conn();
        let old_source = self.current_master_key_source();
        let old_key = old_source.load()?;
        let new_key = new_source.load()?;

        let guard = MasterKeySourceGuard::swap(&self.master_key, new_source.clone());
        let result = Self::reencrypt_all(&conn, &old_key, &new_key);
        drop(guard);

        if result.is_ok() {
            *self.master_key.lock().unwrap_or_else(|p| p.into_inner()) = new_source;
        }
        result
    }

    fn reencrypt_all(conn: &Connection, old_key: &[u8; 32], new_key: &[u8; 32]) -> Result<()> {
        let tx = conn.unchecked_transaction()?;

        let rows: Vec<(String, String)> = {
            let mut stmt = tx.prepare("SELECT id, encrypted_value FROM credentials")?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for (id, envelope_json) in rows {
            let envelope = crypto::cipher::Envelope::from_json(&envelope_json)?;
            let rotated = crypto::cipher::re_encrypt_with_new_key(&envelope, old_key, new_key)?;
            let encryption_key_id = store::ensure_encryption_key_row(&tx, new_key)?;
            tx.execute(
                "UPDATE credentials SET encrypted_value = ?1, encryption_key_id = ?2 WHERE id = ?3",
                rusqlite::params![rotated.to_json()?, encryption_key_id, id],
            )?;
        }

        let old_fingerprint = crypto::master_key::master_key_fingerprint(old_key);
        tx.execute(
            "UPDATE encryption_keys SET status = 'rotated' WHERE key_hash = ?1 AND status = 'active'",
            rusqlite::params![old_fingerprint],
        )?;

        tx.commit()?;
        Ok(())
    }
}

/// Temporarily installs a different [`MasterKeySource`] into a shared slot,
/// restoring the previous value when dropped — on success, on error (an
/// early `?` return drops the guard before any explicit restore), and on
/// an unwinding panic alike.
struct MasterKeySourceGuard<'a> {
    slot: &'a Mutex<Arc<dyn MasterKeySource>>,
    previous: Option<Arc<dyn MasterKeySource>>,
}

impl<'a> MasterKeySourceGuard<'a> {
    fn swap(slot: &'a Mutex<Arc<dyn MasterKeySource>>, new_source: Arc<dyn MasterKeySource>) -> Self {
        let mut guard = slot.lock().unwrap_or_else(|p| p.into_inner());
        let previous = std::mem::replace(&mut *guard, new_source);
        drop(guard);
        Self {
            slot,
            previous: Some(previous),
        }
    }
}

impl<'a> Drop for MasterKeySourceGuard<'a> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let mut guard = self.slot.lock().unwrap_or_else(|p| p.into_inner());
            *guard = previous;
        }
    }
}
