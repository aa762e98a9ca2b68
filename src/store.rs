// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! C4 — Credential Store.
//!
//! Owns the `credentials` and `encryption_keys` tables and is the only
//! component that touches ciphertext. `store` and `rotate` each run inside
//! one transaction so a failure midway leaves no partial row; `retrieve`
//! writes exactly one audit entry on every path, success or failure, per
//! spec §4.4.

use crate::access;
use crate::audit::{self, LogEntry};
use crate::crypto::kdf::KdfType;
use crate::crypto::{cipher, master_key::MasterKeySource};
use crate::error::{Error, Result};
use crate::ids;
use crate::types::{
    AccessLevel, AuditAction, CredentialMetadata, CredentialRow, CredentialStatus, CredentialType,
    CredentialValue, DecryptedCredential, EntityType,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Caller-supplied context threaded into an audit entry on `retrieve`.
#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions<'a> {
    pub user_id: Option<&'a str>,
    pub ip_address: Option<&'a str>,
}

/// Narrowing filters for [`list`]. `None` fields are unconstrained.
#[derive(Debug, Clone, Default)]
pub struct ListFilters<'a> {
    pub service: Option<&'a str>,
    pub credential_type: Option<CredentialType>,
    pub status: Option<CredentialStatus>,
    pub environment: Option<&'a str>,
    pub name: Option<&'a str>,
}

/// Store a new credential. Encrypts `value` under the current master key
/// (optionally forcing a specific KDF family), inserts the credential row,
/// reuses or creates the matching `encryption_keys` record, and writes one
/// `create` audit entry — all inside a single transaction.
///
/// Returns [`Error::Conflict`] if `(name, environment)` already exists.
pub fn store(
    conn: &Connection,
    master_key_source: &dyn MasterKeySource,
    name: &str,
    environment: &str,
    service: &str,
    value: &CredentialValue,
    metadata: Map<String, Value>,
    kdf_type: Option<KdfType>,
    created_by: Option<&str>,
) -> Result<String> {
    let tx = conn.unchecked_transaction()?;

    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM credentials WHERE name = ?1 AND environment = ?2",
            params![name, environment],
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(Error::Conflict(format!(
            "a credential named '{name}' already exists in environment '{environment}'"
        )));
    }

    let master_key = master_key_source.load()?;
    let envelope = cipher::encrypt(&value.to_json_value()?, master_key.as_ref(), kdf_type)?;
    debug!(kdf_type = envelope.effective_kdf_type().as_str(), name, environment, "encrypting new credential");
    let encryption_key_id = ensure_encryption_key_row(&tx, &master_key)?;

    let id = ids::new_credential_id();
    let now = Utc::now();
    tx.execute(
        "INSERT INTO credentials (id, name, environment, type, service, encrypted_value, encryption_key_id, metadata, created_at, updated_at, last_rotated_at, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, NULL, ?10)",
        params![
            id,
            name,
            environment,
            value.credential_type().as_str(),
            service,
            envelope.to_json()?,
            encryption_key_id,
            serde_json::to_string(&metadata)?,
            now.to_rfc3339(),
            CredentialStatus::Active.as_str(),
        ],
    )?;

    audit::log(
        &tx,
        LogEntry {
            credential_id: &id,
            entity_id: created_by.unwrap_or("system"),
            entity_type: EntityType::Skill,
            user_id: created_by,
            action: AuditAction::Create,
            success: true,
            ip_address: None,
            error_message: None,
            metadata: None,
        },
    )?;

    tx.commit()?;
    Ok(id)
}

/// Retrieve a credential's decrypted value on behalf of `entity_id`,
/// enforcing read access first. Writes exactly one audit entry: success
/// once decryption completes, or a failure entry recording whichever step
/// (access check, row lookup, decryption) rejected the call.
pub fn retrieve(
    conn: &Connection,
    master_key_source: &dyn MasterKeySource,
    credential_id: &str,
    entity_id: &str,
    entity_type: EntityType,
    opts: RetrieveOptions<'_>,
) -> Result<DecryptedCredential> {
    let audit_failure = |conn: &Connection, err: &Error| {
        if let Err(audit_err) = audit::log(
            conn,
            LogEntry {
                credential_id,
                entity_id,
                entity_type,
                user_id: opts.user_id,
                action: AuditAction::Retrieve,
                success: false,
                ip_address: opts.ip_address,
                error_message: Some(err.to_string()),
                metadata: None,
            },
        ) {
            warn!(credential_id, entity_id, error = %audit_err, "failed to write audit entry for denied/failed retrieve");
        }
    };

    if let Err(err) = access::assert_access(conn, credential_id, entity_id, entity_type, AccessLevel::Read) {
        audit_failure(conn, &err);
        return Err(err);
    }

    let row = match fetch_active_row(conn, credential_id) {
        Ok(row) => row,
        Err(err) => {
            audit_failure(conn, &err);
            return Err(err);
        }
    };

    let master_key = match master_key_source.load() {
        Ok(k) => k,
        Err(err) => {
            audit_failure(conn, &err);
            return Err(err);
        }
    };

    let plaintext = match cipher::decrypt(&row.envelope, master_key.as_ref()) {
        Ok(p) => p,
        Err(err) => {
            audit_failure(conn, &err);
            return Err(err);
        }
    };

    let value = CredentialValue::from_json_value(plaintext)?;

    // A failing audit insert here must not turn a successful retrieve into
    // an error (spec §7: "the Vault's public API must not fail a successful
    // retrieve merely because the audit insert failed") — report it out of
    // band and still return the plaintext.
    if let Err(audit_err) = audit::log(
        conn,
        LogEntry {
            credential_id,
            entity_id,
            entity_type,
            user_id: opts.user_id,
            action: AuditAction::Retrieve,
            success: true,
            ip_address: opts.ip_address,
            error_message: None,
            metadata: None,
        },
    ) {
        warn!(credential_id, entity_id, error = %audit_err, "failed to write audit entry for successful retrieve");
    }

    Ok(DecryptedCredential {
        metadata: row.metadata,
        value,
    })
}

/// Retrieve without an access check or audit entry. Reachable only from
/// crate-internal callers (the rotation path, admin/test helpers) — never
/// exposed on the public API surface, per the Open Question resolution in
/// the crate's design notes.
pub(crate) fn retrieve_unchecked(
    conn: &Connection,
    master_key_source: &dyn MasterKeySource,
    credential_id: &str,
) -> Result<DecryptedCredential> {
    let row = fetch_row(conn, credential_id)?;
    let master_key = master_key_source.load()?;
    let plaintext = cipher::decrypt(&row.envelope, master_key.as_ref())?;
    let value = CredentialValue::from_json_value(plaintext)?;
    Ok(DecryptedCredential {
        metadata: row.metadata,
        value,
    })
}

/// List credential metadata (never decrypted values) matching `filters`.
pub fn list(conn: &Connection, filters: &ListFilters<'_>) -> Result<Vec<CredentialMetadata>> {
    let mut sql = String::from(
        "SELECT id, name, environment, type, service, encryption_key_id, metadata, created_at, updated_at, last_rotated_at, status FROM credentials WHERE 1=1",
    );
    let mut clauses = Vec::new();
    if filters.service.is_some() {
        clauses.push(" AND service = ?");
    }
    if filters.credential_type.is_some() {
        clauses.push(" AND type = ?");
    }
    if filters.status.is_some() {
        clauses.push(" AND status = ?");
    }
    if filters.environment.is_some() {
        clauses.push(" AND environment = ?");
    }
    if filters.name.is_some() {
        clauses.push(" AND name = ?");
    }
    for clause in &clauses {
        sql.push_str(clause);
    }
    sql.push_str(" ORDER BY created_at DESC");

    let mut stmt = conn.prepare(&sql)?;
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(v) = filters.service {
        values.push(Box::new(v.to_string()));
    }
    if let Some(v) = filters.credential_type {
        values.push(Box::new(v.as_str().to_string()));
    }
    if let Some(v) = filters.status {
        values.push(Box::new(v.as_str().to_string()));
    }
    if let Some(v) = filters.environment {
        values.push(Box::new(v.to_string()));
    }
    if let Some(v) = filters.name {
        values.push(Box::new(v.to_string()));
    }
    let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|b| b.as_ref()).collect();

    let rows = stmt.query_map(refs.as_slice(), row_to_metadata)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Replace a credential's plaintext value, re-encrypting under the current
/// default KDF (upgrading the KDF family when the existing envelope is due
/// for one, per [`crate::crypto::kdf::should_upgrade`]). Updates
/// `updated_at`/`last_rotated_at` and writes one `rotate` audit entry.
pub fn rotate(
    conn: &Connection,
    master_key_source: &dyn MasterKeySource,
    credential_id: &str,
    new_value: &CredentialValue,
    rotated_by: Option<&str>,
) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    let existing = fetch_row(&tx, credential_id)?;
    let target_kdf = KdfType::from_env_default();
    let kdf_type = if crate::crypto::kdf::should_upgrade(existing.envelope.effective_kdf_type(), target_kdf) {
        Some(target_kdf)
    } else {
        Some(existing.envelope.effective_kdf_type())
    };

    let master_key = master_key_source.load()?;
    let envelope = cipher::encrypt(&new_value.to_json_value()?, master_key.as_ref(), kdf_type)?;
    let encryption_key_id = ensure_encryption_key_row(&tx, &master_key)?;

    let now = Utc::now();
    tx.execute(
        "UPDATE credentials SET encrypted_value = ?1, encryption_key_id = ?2, type = ?3, updated_at = ?4, last_rotated_at = ?4 WHERE id = ?5",
        params![
            envelope.to_json()?,
            encryption_key_id,
            new_value.credential_type().as_str(),
            now.to_rfc3339(),
            credential_id,
        ],
    )?;

    audit::log(
        &tx,
        LogEntry {
            credential_id,
            entity_id: rotated_by.unwrap_or("system"),
            entity_type: EntityType::Skill,
            user_id: rotated_by,
            action: AuditAction::Rotate,
            success: true,
            ip_address: None,
            error_message: None,
            metadata: None,
        },
    )?;

    tx.commit()?;
    Ok(())
}

/// Soft-delete a credential: marks it `revoked` and merges `reason` into
/// its metadata under `revokedReason`. Does not touch existing policies —
/// callers that also want access torn down call [`crate::access::revoke_all_access`].
pub fn revoke(
    conn: &Connection,
    credential_id: &str,
    reason: Option<&str>,
    revoked_by: Option<&str>,
) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    let metadata_str: String = tx
        .query_row(
            "SELECT metadata FROM credentials WHERE id = ?1",
            params![credential_id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| Error::CredentialNotFound(credential_id.to_string()))?;

    let mut metadata: Map<String, Value> = serde_json::from_str(&metadata_str).unwrap_or_default();
    if let Some(reason) = reason {
        metadata.insert("revokedReason".to_string(), Value::String(reason.to_string()));
    }

    let now = Utc::now();
    tx.execute(
        "UPDATE credentials SET status = ?1, metadata = ?2, updated_at = ?3 WHERE id = ?4",
        params![
            CredentialStatus::Revoked.as_str(),
            serde_json::to_string(&metadata)?,
            now.to_rfc3339(),
            credential_id,
        ],
    )?;

    audit::log(
        &tx,
        LogEntry {
            credential_id,
            entity_id: revoked_by.unwrap_or("system"),
            entity_type: EntityType::Skill,
            user_id: revoked_by,
            action: AuditAction::Revoke,
            success: true,
            ip_address: None,
            error_message: None,
            metadata: None,
        },
    )?;

    tx.commit()?;
    Ok(())
}

/// Hard-delete a credential. Cascades to its policies (FK `ON DELETE
/// CASCADE`, requires `PRAGMA foreign_keys = ON`) and to its audit
/// history, which has no FK of its own — the pending row count is logged
/// before the cascade so the operational cost of the delete stays visible
/// even though the rows themselves are gone afterward.
pub fn delete(conn: &Connection, credential_id: &str) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    if fetch_row(&tx, credential_id).is_err() {
        return Err(Error::CredentialNotFound(credential_id.to_string()));
    }

    let audit_row_count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM audit_log WHERE credential_id = ?1",
        params![credential_id],
        |r| r.get(0),
    )?;
    if audit_row_count > 0 {
        warn!(
            credential_id,
            audit_row_count, "deleting credential: cascading audit history"
        );
    }
    tx.execute("DELETE FROM audit_log WHERE credential_id = ?1", params![credential_id])?;
    tx.execute("DELETE FROM credentials WHERE id = ?1", params![credential_id])?;

    tx.commit()?;
    Ok(())
}

/// `true` iff the credential exists and is `active`.
pub fn is_valid(conn: &Connection, credential_id: &str) -> Result<bool> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM credentials WHERE id = ?1",
            params![credential_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(status.as_deref() == Some(CredentialStatus::Active.as_str()))
}

/// Look up a credential's metadata by its `(name, environment)` key.
pub fn get_by_name(conn: &Connection, name: &str, environment: &str) -> Result<Option<CredentialMetadata>> {
    conn.query_row(
        "SELECT id, name, environment, type, service, encryption_key_id, metadata, created_at, updated_at, last_rotated_at, status
         FROM credentials WHERE name = ?1 AND environment = ?2",
        params![name, environment],
        row_to_metadata,
    )
    .optional()
    .map_err(Error::from)
}

/// Count credentials matching `filters`.
pub fn count(conn: &Connection, filters: &ListFilters<'_>) -> Result<i64> {
    Ok(list(conn, filters)?.len() as i64)
}

/// Cipher algorithm recorded on every `encryption_keys` row, per spec §3:
/// the Master-Key record's `algorithm` field names the cipher ("always
/// aes-256-gcm"), not the per-envelope KDF family — the KDF type is a
/// property of each envelope, not of the key material, and is already
/// carried there.
const MASTER_KEY_ALGORITHM: &str = "aes-256-gcm";

pub(crate) fn ensure_encryption_key_row(conn: &Connection, master_key: &[u8; 32]) -> Result<String> {
    let fingerprint = crate::crypto::master_key::master_key_fingerprint(master_key);

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM encryption_keys WHERE key_hash = ?1 AND status = 'active'",
            params![fingerprint],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let id = ids::new_key_id();
    conn.execute(
        "INSERT INTO encryption_keys (id, key_hash, algorithm, created_at, status) VALUES (?1, ?2, ?3, ?4, 'active')",
        params![id, fingerprint, MASTER_KEY_ALGORITHM, Utc::now().to_rfc3339()],
    )?;
    Ok(id)
}

pub(crate) fn fetch_row(conn: &Connection, credential_id: &str) -> Result<CredentialRow> {
    conn.query_row(
        "SELECT id, name, environment, type, service, encryption_key_id, metadata, created_at, updated_at, last_rotated_at, status, encrypted_value
         FROM credentials WHERE id = ?1",
        params![credential_id],
        row_to_credential_row,
    )
    .optional()?
    .ok_or_else(|| Error::CredentialNotFound(credential_id.to_string()))
}

fn fetch_active_row(conn: &Connection, credential_id: &str) -> Result<CredentialRow> {
    let row = fetch_row(conn, credential_id)?;
    if row.metadata.status != CredentialStatus::Active {
        return Err(Error::CredentialNotFound(credential_id.to_string()));
    }
    Ok(row)
}

fn row_to_credential_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CredentialRow> {
    let metadata = row_to_metadata(row)?;
    let envelope_json: String = row.get(11)?;
    let envelope = cipher::Envelope::from_json(&envelope_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e)))?;
    Ok(CredentialRow { metadata, envelope })
}

fn row_to_metadata(row: &rusqlite::Row<'_>) -> rusqlite::Result<CredentialMetadata> {
    let type_str: String = row.get(3)?;
    let metadata_str: String = row.get(6)?;
    let created_at_str: String = row.get(7)?;
    let updated_at_str: String = row.get(8)?;
    let last_rotated_str: Option<String> = row.get(9)?;
    let status_str: String = row.get(10)?;

    Ok(CredentialMetadata {
        id: row.get(0)?,
        name: row.get(1)?,
        environment: row.get(2)?,
        credential_type: CredentialType::parse(&type_str).unwrap_or(CredentialType::Custom),
        service: row.get(4)?,
        encryption_key_id: row.get(5)?,
        metadata: serde_json::from_str(&metadata_str).unwrap_or_default(),
        created_at: parse_dt(&created_at_str),
        updated_at: parse_dt(&updated_at_str),
        last_rotated_at: last_rotated_str.as_deref().map(parse_dt),
        status: CredentialStatus::parse(&status_str).unwrap_or(CredentialStatus::Active),
    })
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::master_key::StaticMasterKeySource;
    use crate::schema;

    fn setup() -> (Connection, StaticMasterKeySource) {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        schema::init(&conn).unwrap();
        let key = StaticMasterKeySource::new([42u8; 32]);
        (conn, key)
    }

    fn api_key(key: &str) -> CredentialValue {
        CredentialValue::ApiKey {
            key: key.to_string(),
            secret: None,
        }
    }

    #[test]
    fn store_then_retrieve_round_trips_with_access_granted() {
        let (conn, mk) = setup();
        let id = store(
            &conn,
            &mk,
            "stripe",
            "prod",
            "stripe",
            &api_key("sk-live-123"),
            Map::new(),
            None,
            Some("admin"),
        )
        .unwrap();

        access::grant_access(&conn, &id, "payment_skill", EntityType::Skill, AccessLevel::Read, Some("admin"), None, None).unwrap();

        let retrieved = retrieve(
            &conn,
            &mk,
            &id,
            "payment_skill",
            EntityType::Skill,
            RetrieveOptions {
                user_id: Some("payment_skill"),
                ip_address: None,
            },
        )
        .unwrap();
        assert_eq!(retrieved.value, api_key("sk-live-123"));
    }

    #[test]
    fn store_rejects_duplicate_name_environment() {
        let (conn, mk) = setup();
        store(&conn, &mk, "stripe", "prod", "stripe", &api_key("k1"), Map::new(), None, None).unwrap();
        let err = store(&conn, &mk, "stripe", "prod", "stripe", &api_key("k2"), Map::new(), None, None).unwrap_err();
        assert_eq!(err.class(), "conflict");
    }

    #[test]
    fn retrieve_without_policy_is_denied_and_audited() {
        let (conn, mk) = setup();
        let id = store(&conn, &mk, "stripe", "prod", "stripe", &api_key("k1"), Map::new(), None, None).unwrap();

        let err = retrieve(&conn, &mk, &id, "payment_skill", EntityType::Skill, RetrieveOptions::default()).unwrap_err();
        assert_eq!(err.class(), "access_denied");

        let entries = audit::query(&conn, &audit::AuditQuery::default()).unwrap();
        assert!(entries.iter().any(|e| e.action == AuditAction::Retrieve && !e.success));
    }

    #[test]
    fn rotate_replaces_the_value_and_stamps_last_rotated_at() {
        let (conn, mk) = setup();
        let id = store(&conn, &mk, "stripe", "prod", "stripe", &api_key("old"), Map::new(), None, None).unwrap();
        rotate(&conn, &mk, &id, &api_key("new"), Some("admin")).unwrap();

        let row = retrieve_unchecked(&conn, &mk, &id).unwrap();
        assert_eq!(row.value, api_key("new"));
        assert!(row.metadata.last_rotated_at.is_some());
    }

    #[test]
    fn revoke_soft_deletes_and_keeps_policies() {
        let (conn, mk) = setup();
        let id = store(&conn, &mk, "stripe", "prod", "stripe", &api_key("k1"), Map::new(), None, None).unwrap();
        access::grant_access(&conn, &id, "payment_skill", EntityType::Skill, AccessLevel::Read, None, None, None).unwrap();

        revoke(&conn, &id, Some("no longer needed"), Some("admin")).unwrap();

        assert!(!is_valid(&conn, &id).unwrap());
        assert_eq!(access::get_access_policies(&conn, &id).unwrap().len(), 1);
    }

    #[test]
    fn delete_cascades_policies_and_audit_history() {
        let (conn, mk) = setup();
        let id = store(&conn, &mk, "stripe", "prod", "stripe", &api_key("k1"), Map::new(), None, None).unwrap();
        access::grant_access(&conn, &id, "payment_skill", EntityType::Skill, AccessLevel::Read, None, None, None).unwrap();

        delete(&conn, &id).unwrap();

        assert!(get_by_name(&conn, "stripe", "prod").unwrap().is_none());
        assert_eq!(access::get_access_policies(&conn, &id).unwrap().len(), 0);
        assert_eq!(audit::query(&conn, &audit::AuditQuery { credential_id: Some(&id), ..Default::default() }).unwrap().len(), 0);
    }

    #[test]
    fn list_filters_by_service_and_status() {
        let (conn, mk) = setup();
        store(&conn, &mk, "stripe", "prod", "stripe", &api_key("k1"), Map::new(), None, None).unwrap();
        store(&conn, &mk, "github", "prod", "github", &api_key("k2"), Map::new(), None, None).unwrap();

        let results = list(&conn, &ListFilters { service: Some("stripe"), ..Default::default() }).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].service, "stripe");
    }
}
